//! `FromSetCommands`: the wildcard `$set` subscription every publisher
//! maintains to receive commands for its own inputs.

use crate::address::{Address, MessageType};
use crate::bus::BusAdapter;
use crate::crypto::Keypair;
use crate::envelope::{self, verify_signed_message, Envelope, PublicKeyLookup};
use crate::error::{PubSubError, Result};
use crate::registered::RegisteredInputs;
use crate::replay::ReplayTable;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Decrypted/verified payload of a `$set` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetInputMessage {
    pub address: String,
    pub timestamp: String,
    pub sender: String,
    pub value: String,
}

/// Subscribes to `<domain>/<publisherID>/+/+/+/$set` and routes commands to
/// the owning input's handler, enforcing encrypt-and-sign policy and replay
/// defence.
pub struct FromSetCommands {
    inputs: Arc<RegisteredInputs>,
    keypair: Arc<Keypair>,
    keys: Arc<dyn PublicKeyLookup>,
    replay: ReplayTable,
    domain: String,
    publisher_id: String,
}

impl FromSetCommands {
    #[must_use]
    pub fn new(
        domain: impl Into<String>,
        publisher_id: impl Into<String>,
        inputs: Arc<RegisteredInputs>,
        keypair: Arc<Keypair>,
        keys: Arc<dyn PublicKeyLookup>,
    ) -> Self {
        Self {
            inputs,
            keypair,
            keys,
            replay: ReplayTable::new(),
            domain: domain.into(),
            publisher_id: publisher_id.into(),
        }
    }

    /// One subscription covers every input this publisher owns.
    #[must_use]
    pub fn topic_filter(&self) -> String {
        format!("{}/{}/+/+/+/$set", self.domain, self.publisher_id)
    }

    /// Subscribe and dispatch inbound `$set` messages to background workers
    /// until the bus drops the subscription.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::BusUnavailable`] if the subscription cannot be
    /// established.
    pub async fn run(self: Arc<Self>, bus: Arc<dyn BusAdapter>) -> Result<()> {
        let topic_filter = self.topic_filter();
        let mut subscription = bus.subscribe(&topic_filter).await?;
        while let Some(message) = subscription.recv().await {
            let this = self.clone();
            tokio::spawn(async move {
                this.handle_message(&message.topic, &message.payload);
            });
        }
        Ok(())
    }

    /// Process a single `$set` delivery. Every failure mode is logged and
    /// dropped per §7 — incoming-message errors never propagate.
    pub fn handle_message(&self, topic: &str, payload: &[u8]) {
        let Some(address) = Address::parse(topic) else {
            tracing::warn!(%topic, "malformed set-command topic");
            return;
        };
        if address.message_type != MessageType::Set {
            return;
        }
        let input_address = address.with_message_type(MessageType::Input);

        let Some(input) = self.inputs.get_by_address(&input_address.to_string()) else {
            tracing::warn!(%topic, "set command for unregistered input");
            return;
        };

        let set_message = match decode_set_command(payload, &self.keypair, self.keys.as_ref()) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(%topic, error = %e, "dropping set command");
                return;
            }
        };

        if set_message.address != input_address.to_string() {
            tracing::warn!(%topic, "set-command payload address does not match topic");
            return;
        }

        if !self.replay.check_and_record(&set_message.sender, &set_message.timestamp) {
            tracing::warn!(sender = %set_message.sender, "dropping replayed set command");
            return;
        }

        self.inputs
            .notify_input_handler(&input.id(), &set_message.sender, &set_message.value);
    }
}

/// Decode a `$set` envelope, enforcing the "encrypted AND signed" policy.
/// The signer is not known until after decryption (it travels inside the
/// plaintext `sender` field), so this decrypts first and verifies the
/// signature over the still-encrypted wire bytes afterward.
///
/// # Errors
///
/// Returns [`PubSubError::NotEncrypted`] if the message is not a JWE
/// compact string, [`PubSubError::SignatureInvalid`] if unsigned or the
/// signature does not verify, or [`PubSubError::Malformed`]/
/// [`PubSubError::DecryptionFailed`] on a malformed envelope or ciphertext.
fn decode_set_command(
    raw: &[u8],
    keypair: &Keypair,
    keys: &dyn PublicKeyLookup,
) -> Result<SetInputMessage> {
    let envelope: Envelope =
        serde_json::from_slice(raw).map_err(|e| PubSubError::Malformed(e.to_string()))?;

    if !envelope::is_jwe_compact(&envelope.message) {
        return Err(PubSubError::NotEncrypted {
            address: "$set".to_string(),
        });
    }
    if envelope.signature.is_none() {
        return Err(PubSubError::SignatureInvalid {
            sender: "unknown".to_string(),
        });
    }

    let plaintext = keypair.decrypt(&envelope.message)?;
    let set_message: SetInputMessage =
        serde_json::from_slice(&plaintext).map_err(|e| PubSubError::Malformed(e.to_string()))?;

    let verified = verify_signed_message(&envelope, &set_message.sender, keys)?;
    if !verified.is_signed {
        return Err(PubSubError::SignatureInvalid {
            sender: set_message.sender,
        });
    }

    Ok(set_message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::MessageType;
    use crate::crypto::Keypair;
    use crate::entities::{DataType, Input};
    use crate::envelope::encrypt_and_sign;
    use crate::identity::IdentityDirectory;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn wire(sender_kp: &Keypair, recipient_pem: &str, message: &SetInputMessage) -> Vec<u8> {
        let payload = serde_json::to_vec(message).unwrap();
        let envelope = encrypt_and_sign(&payload, recipient_pem, sender_kp).unwrap();
        serde_json::to_vec(&envelope).unwrap()
    }

    fn setup() -> (Arc<FromSetCommands>, Keypair, Arc<Keypair>, Arc<IdentityDirectory>, Arc<AtomicUsize>) {
        let pub1 = Arc::new(Keypair::generate().unwrap());
        let pub2 = Keypair::generate().unwrap();
        let keys = Arc::new(IdentityDirectory::new());
        keys.observe("test/pub2/n2/$node", pub2.public_key_pem().unwrap());

        let inputs = Arc::new(RegisteredInputs::new("test", "pub1"));
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let input = Input::new("n1", "n1", "switch", "0", DataType::Bool);
        inputs
            .create(
                input,
                Some(Arc::new(move |_input, _sender, _value| {
                    count_clone.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();

        let from_set = Arc::new(FromSetCommands::new(
            "test",
            "pub1",
            inputs,
            pub1.clone(),
            keys.clone(),
        ));
        (from_set, pub2, pub1, keys, count)
    }

    #[test]
    fn scenario_s2_set_command_happy_path() {
        let (from_set, pub2, pub1, _keys, count) = setup();
        let message = SetInputMessage {
            address: "test/pub1/n1/switch/0/$input".to_string(),
            timestamp: "2024-01-01T00:00:00.000+0000".to_string(),
            sender: "test/pub2/n2/$node".to_string(),
            value: "on".to_string(),
        };
        let pub1_pem = pub1.public_key_pem().unwrap();
        let raw = wire(&pub2, &pub1_pem, &message);
        from_set.handle_message("test/pub1/n1/switch/0/$set", &raw);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn scenario_s3_identical_timestamp_replay_is_dropped() {
        let (from_set, pub2, pub1, _keys, count) = setup();
        let message = SetInputMessage {
            address: "test/pub1/n1/switch/0/$input".to_string(),
            timestamp: "2024-01-01T00:00:00.000+0000".to_string(),
            sender: "test/pub2/n2/$node".to_string(),
            value: "on".to_string(),
        };
        let pub1_pem = pub1.public_key_pem().unwrap();
        let raw = wire(&pub2, &pub1_pem, &message);
        from_set.handle_message("test/pub1/n1/switch/0/$set", &raw);
        from_set.handle_message("test/pub1/n1/switch/0/$set", &raw);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn set_command_from_unknown_signer_is_dropped() {
        let (from_set, _pub2, pub1, _keys, count) = setup();
        let impostor = Keypair::generate().unwrap();
        let message = SetInputMessage {
            address: "test/pub1/n1/switch/0/$input".to_string(),
            timestamp: "2024-01-01T00:00:00.000+0000".to_string(),
            sender: "test/pub3/n3/$node".to_string(),
            value: "on".to_string(),
        };
        let pub1_pem = pub1.public_key_pem().unwrap();
        let raw = wire(&impostor, &pub1_pem, &message);
        from_set.handle_message("test/pub1/n1/switch/0/$set", &raw);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unencrypted_but_signed_set_command_is_dropped() {
        let (from_set, pub2, _pub1, _keys, count) = setup();
        let message = SetInputMessage {
            address: "test/pub1/n1/switch/0/$input".to_string(),
            timestamp: "2024-01-01T00:00:00.000+0000".to_string(),
            sender: "test/pub2/n2/$node".to_string(),
            value: "on".to_string(),
        };
        let envelope = crate::envelope::sign(serde_json::to_string(&message).unwrap(), &pub2);
        let raw = serde_json::to_vec(&envelope).unwrap();
        from_set.handle_message("test/pub1/n1/switch/0/$set", &raw);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unregistered_input_is_a_no_op() {
        let (from_set, pub2, pub1, _keys, count) = setup();
        let message = SetInputMessage {
            address: "test/pub1/n1/other/0/$input".to_string(),
            timestamp: "2024-01-01T00:00:00.000+0000".to_string(),
            sender: "test/pub2/n2/$node".to_string(),
            value: "on".to_string(),
        };
        let pub1_pem = pub1.public_key_pem().unwrap();
        let raw = wire(&pub2, &pub1_pem, &message);
        from_set.handle_message("test/pub1/n1/other/0/$set", &raw);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn topic_filter_is_one_wildcard_subscription() {
        let (from_set, ..) = setup();
        assert_eq!(from_set.topic_filter(), "test/pub1/+/+/+/$set");
    }

    #[test]
    fn non_set_message_type_is_ignored() {
        let input_address = Address::node("test", "pub1", "n1", MessageType::Node);
        assert_eq!(input_address.message_type, MessageType::Node);
    }
}
