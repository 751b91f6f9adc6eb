//! Domain Nodes/Inputs/Outputs: this publisher's view of entities *other*
//! publishers have announced via discovery, verified against a public-key
//! directory before being trusted.

use crate::address::Address;
use crate::crypto::Keypair;
use crate::envelope::{decode_message, PublicKeyLookup};
use crate::error::Result;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Mutex;

struct Entry<T> {
    publisher_id: String,
    entity: T,
}

/// Remote entities observed via discovery, keyed by the address they were
/// published under. An empty-payload discovery message tombstones the
/// entry, mirroring the owning publisher's dirty-set semantics.
struct DomainCollection<T> {
    entries: Mutex<HashMap<String, Entry<T>>>,
}

impl<T: Clone + DeserializeOwned> DomainCollection<T> {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Verify and decode a discovery message for `address`, upserting or
    /// tombstoning the entry. Returns `Ok(None)` for a tombstone (empty
    /// payload), `Ok(Some(entity))` otherwise.
    ///
    /// # Errors
    ///
    /// Propagates [`crate::error::PubSubError::SignerUnknown`],
    /// `SignatureInvalid`, or `Malformed` from [`decode_message`].
    fn handle_discovery(
        &self,
        address: &Address,
        raw_message: &[u8],
        keypair: Option<&Keypair>,
        keys: &dyn PublicKeyLookup,
    ) -> Result<Option<T>> {
        let publisher_id = address.publisher_id.clone();
        let key = address.to_string();

        if raw_message.is_empty() {
            self.entries.lock().expect("domain collection poisoned").remove(&key);
            return Ok(None);
        }

        let decoded = decode_message(raw_message, &publisher_id, keypair, keys)?;
        if decoded.payload.is_empty() {
            self.entries.lock().expect("domain collection poisoned").remove(&key);
            return Ok(None);
        }

        let entity: T = serde_json::from_slice(&decoded.payload)?;
        self.entries.lock().expect("domain collection poisoned").insert(
            key,
            Entry {
                publisher_id,
                entity: entity.clone(),
            },
        );
        Ok(Some(entity))
    }

    fn get(&self, address: &str) -> Option<T> {
        self.entries
            .lock()
            .expect("domain collection poisoned")
            .get(address)
            .map(|e| e.entity.clone())
    }

    fn for_publisher(&self, publisher_id: &str) -> Vec<T> {
        self.entries
            .lock()
            .expect("domain collection poisoned")
            .values()
            .filter(|e| e.publisher_id == publisher_id)
            .map(|e| e.entity.clone())
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.lock().expect("domain collection poisoned").len()
    }
}

/// Remote nodes observed via `$node` discovery.
#[derive(Default)]
pub struct DomainNodes {
    inner: DomainCollectionHolder<crate::entities::Node>,
}

/// Remote inputs observed via `$input` discovery.
#[derive(Default)]
pub struct DomainInputs {
    inner: DomainCollectionHolder<crate::entities::Input>,
}

/// Remote outputs observed via `$output` discovery.
#[derive(Default)]
pub struct DomainOutputs {
    inner: DomainCollectionHolder<crate::entities::Output>,
}

/// `DomainCollection` doesn't implement `Default` generically without
/// `T: Default`, so each public wrapper holds one through this shim.
struct DomainCollectionHolder<T>(DomainCollection<T>);

impl<T: Clone + DeserializeOwned> Default for DomainCollectionHolder<T> {
    fn default() -> Self {
        Self(DomainCollection::new())
    }
}

macro_rules! impl_domain_collection {
    ($name:ident, $entity:ty) => {
        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self::default()
            }

            /// # Errors
            ///
            /// See [`DomainCollection::handle_discovery`].
            pub fn handle_discovery(
                &self,
                address: &Address,
                raw_message: &[u8],
                keypair: Option<&Keypair>,
                keys: &dyn PublicKeyLookup,
            ) -> Result<Option<$entity>> {
                self.inner.0.handle_discovery(address, raw_message, keypair, keys)
            }

            #[must_use]
            pub fn get(&self, address: &str) -> Option<$entity> {
                self.inner.0.get(address)
            }

            #[must_use]
            pub fn for_publisher(&self, publisher_id: &str) -> Vec<$entity> {
                self.inner.0.for_publisher(publisher_id)
            }

            #[must_use]
            pub fn len(&self) -> usize {
                self.inner.0.len()
            }

            #[must_use]
            pub fn is_empty(&self) -> bool {
                self.len() == 0
            }
        }
    };
}

impl_domain_collection!(DomainNodes, crate::entities::Node);
impl_domain_collection!(DomainInputs, crate::entities::Input);
impl_domain_collection!(DomainOutputs, crate::entities::Output);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::MessageType;
    use crate::entities::Node;
    use crate::envelope::sign;
    use std::collections::HashMap as StdHashMap;

    struct TestKeys(StdHashMap<String, String>);

    impl PublicKeyLookup for TestKeys {
        fn public_key_pem(&self, sender: &str) -> Option<String> {
            self.0.get(sender).cloned()
        }
    }

    #[test]
    fn discovery_of_unsigned_message_is_accepted_and_stored() {
        let domain = DomainNodes::new();
        let address = Address::node("test", "pub2", "n1", MessageType::Node);
        let node = Node::new("hw-1", "thermostat");
        let payload = serde_json::to_string(&node).unwrap();
        let envelope = crate::envelope::Envelope {
            message: payload,
            signature: None,
        };
        let raw = serde_json::to_vec(&envelope).unwrap();
        let keys = TestKeys(StdHashMap::new());

        let result = domain
            .handle_discovery(&address, &raw, None, &keys)
            .unwrap()
            .unwrap();
        assert_eq!(result.hwid, "hw-1");
        assert_eq!(domain.len(), 1);
    }

    #[test]
    fn discovery_rejects_unknown_signer() {
        let kp = crate::crypto::Keypair::generate().unwrap();
        let domain = DomainNodes::new();
        let address = Address::node("test", "pub2", "n1", MessageType::Node);
        let node = Node::new("hw-1", "thermostat");
        let payload = serde_json::to_string(&node).unwrap();
        let envelope = sign(payload, &kp);
        let raw = serde_json::to_vec(&envelope).unwrap();
        let keys = TestKeys(StdHashMap::new());

        let err = domain.handle_discovery(&address, &raw, None, &keys).unwrap_err();
        assert!(matches!(err, crate::error::PubSubError::SignerUnknown { .. }));
    }

    #[test]
    fn empty_payload_tombstones_entry() {
        let domain = DomainNodes::new();
        let address = Address::node("test", "pub2", "n1", MessageType::Node);
        let node = Node::new("hw-1", "thermostat");
        let payload = serde_json::to_string(&node).unwrap();
        let envelope = crate::envelope::Envelope {
            message: payload,
            signature: None,
        };
        let raw = serde_json::to_vec(&envelope).unwrap();
        let keys = TestKeys(StdHashMap::new());

        domain.handle_discovery(&address, &raw, None, &keys).unwrap();
        assert_eq!(domain.len(), 1);

        domain.handle_discovery(&address, &[], None, &keys).unwrap();
        assert_eq!(domain.len(), 0);
    }

    #[test]
    fn for_publisher_filters_by_publisher_id() {
        let domain = DomainNodes::new();
        let keys = TestKeys(StdHashMap::new());
        for (publisher, node_id, hwid) in [("pub2", "n1", "hw-1"), ("pub3", "n2", "hw-2")] {
            let address = Address::node("test", publisher, node_id, MessageType::Node);
            let node = Node::new(hwid, "sensor");
            let envelope = crate::envelope::Envelope {
                message: serde_json::to_string(&node).unwrap(),
                signature: None,
            };
            let raw = serde_json::to_vec(&envelope).unwrap();
            domain.handle_discovery(&address, &raw, None, &keys).unwrap();
        }
        assert_eq!(domain.for_publisher("pub2").len(), 1);
        assert_eq!(domain.for_publisher("pub3").len(), 1);
    }
}
