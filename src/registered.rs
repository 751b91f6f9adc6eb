//! Registered Nodes/Inputs/Outputs: the in-memory collections of entities a
//! publisher owns, their address indexes, handler map, and dirty-set
//! bookkeeping that drives discovery publication.

use crate::address::{Address, MessageType};
use crate::entities::{Input, Node, Output};
use crate::error::{PubSubError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// `inputID -> inputID`, empty string value signals deletion. Drained by
/// the publisher runtime's discovery tick.
type DirtySet = HashMap<String, String>;

/// Handler invoked by the input-source multiplexer:
/// `handler(input, sender, value)`.
pub type InputHandler = Arc<dyn Fn(&Input, &str, &str) + Send + Sync>;

struct Collection<T> {
    entries: HashMap<String, T>,
    address_index: HashMap<String, String>,
    dirty: DirtySet,
}

impl<T> Collection<T> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            address_index: HashMap::new(),
            dirty: HashMap::new(),
        }
    }
}

/// Nodes owned by this publisher, keyed by immutable HWID.
pub struct RegisteredNodes {
    inner: Mutex<Collection<Node>>,
    domain: String,
    publisher_id: String,
}

impl RegisteredNodes {
    #[must_use]
    pub fn new(domain: impl Into<String>, publisher_id: impl Into<String>) -> Self {
        Self {
            inner: Mutex::new(Collection::new()),
            domain: domain.into(),
            publisher_id: publisher_id.into(),
        }
    }

    /// Register a new node, enqueueing it to the dirty set.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::AlreadyExists`] if a node with this HWID is
    /// already registered.
    pub fn create(&self, node: Node) -> Result<Node> {
        let mut inner = self.inner.lock().expect("registered nodes poisoned");
        if inner.entries.contains_key(&node.hwid) {
            return Err(PubSubError::AlreadyExists(node.hwid.clone()));
        }
        let address = node.address(&self.domain, &self.publisher_id).to_string();
        inner.address_index.insert(address, node.hwid.clone());
        inner.dirty.insert(node.hwid.clone(), node.hwid.clone());
        inner.entries.insert(node.hwid.clone(), node.clone());
        Ok(node)
    }

    /// Update an existing node in place via `mutate`, re-enqueueing it to
    /// the dirty set. `node_id` is intentionally excluded from `mutate`'s
    /// reach — renames go through [`RegisteredEntities::set_node_id`].
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::NotFound`] if `hwid` is not registered.
    pub fn update(&self, hwid: &str, mutate: impl FnOnce(&mut Node)) -> Result<Node> {
        let mut inner = self.inner.lock().expect("registered nodes poisoned");
        let node = inner
            .entries
            .get_mut(hwid)
            .ok_or_else(|| PubSubError::NotFound(hwid.to_string()))?;
        mutate(node);
        let updated = node.clone();
        inner.dirty.insert(hwid.to_string(), hwid.to_string());
        Ok(updated)
    }

    /// Remove a node, writing a tombstone (`""`) into the dirty set.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::NotFound`] if `hwid` is not registered.
    pub fn delete(&self, hwid: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("registered nodes poisoned");
        let node = inner
            .entries
            .remove(hwid)
            .ok_or_else(|| PubSubError::NotFound(hwid.to_string()))?;
        let address = node.address(&self.domain, &self.publisher_id).to_string();
        inner.address_index.remove(&address);
        inner.dirty.insert(hwid.to_string(), String::new());
        Ok(())
    }

    #[must_use]
    pub fn get(&self, hwid: &str) -> Option<Node> {
        self.inner
            .lock()
            .expect("registered nodes poisoned")
            .entries
            .get(hwid)
            .cloned()
    }

    #[must_use]
    pub fn get_by_address(&self, address: &str) -> Option<Node> {
        let inner = self.inner.lock().expect("registered nodes poisoned");
        let hwid = inner.address_index.get(address)?;
        inner.entries.get(hwid).cloned()
    }

    /// Drain the dirty set. Present entries should be published as
    /// discovery; absent ones (the value is `""`) are tombstones.
    pub fn get_updated(&self, clear: bool) -> DirtySet {
        let mut inner = self.inner.lock().expect("registered nodes poisoned");
        if clear {
            std::mem::take(&mut inner.dirty)
        } else {
            inner.dirty.clone()
        }
    }
}

/// Shared behaviour for Inputs and Outputs, parameterised by message type
/// so the same implementation backs both `RegisteredInputs::$input` and
/// `RegisteredOutputs::$output` addressing.
struct IoCollection {
    inner: Mutex<Collection<crate::entities::IoPoint>>,
    domain: String,
    publisher_id: String,
    message_type: MessageType,
}

impl IoCollection {
    fn new(domain: &str, publisher_id: &str, message_type: MessageType) -> Self {
        Self {
            inner: Mutex::new(Collection::new()),
            domain: domain.to_string(),
            publisher_id: publisher_id.to_string(),
            message_type,
        }
    }

    fn create(&self, io: crate::entities::IoPoint) -> Result<crate::entities::IoPoint> {
        let mut inner = self.inner.lock().expect("io collection poisoned");
        let id = io.id();
        if inner.entries.contains_key(&id) {
            return Err(PubSubError::AlreadyExists(id));
        }
        let address = io.address(&self.domain, &self.publisher_id, self.message_type).to_string();
        inner.address_index.insert(address, id.clone());
        inner.dirty.insert(id.clone(), id.clone());
        inner.entries.insert(id, io.clone());
        Ok(io)
    }

    fn update(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut crate::entities::IoPoint),
    ) -> Result<crate::entities::IoPoint> {
        let mut inner = self.inner.lock().expect("io collection poisoned");
        let io = inner
            .entries
            .get_mut(id)
            .ok_or_else(|| PubSubError::NotFound(id.to_string()))?;
        mutate(io);
        let updated = io.clone();
        inner.dirty.insert(id.to_string(), id.to_string());
        Ok(updated)
    }

    fn delete(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("io collection poisoned");
        let io = inner
            .entries
            .remove(id)
            .ok_or_else(|| PubSubError::NotFound(id.to_string()))?;
        let address = io.address(&self.domain, &self.publisher_id, self.message_type).to_string();
        inner.address_index.remove(&address);
        inner.dirty.insert(id.to_string(), String::new());
        Ok(())
    }

    fn get(&self, id: &str) -> Option<crate::entities::IoPoint> {
        self.inner
            .lock()
            .expect("io collection poisoned")
            .entries
            .get(id)
            .cloned()
    }

    fn get_by_address(&self, address: &str) -> Option<crate::entities::IoPoint> {
        let inner = self.inner.lock().expect("io collection poisoned");
        let id = inner.address_index.get(address)?;
        inner.entries.get(id).cloned()
    }

    fn get_by_node_hwid(&self, hwid: &str, io_type: &str, instance: &str) -> Option<crate::entities::IoPoint> {
        let id = crate::address::io_id(hwid, io_type, instance);
        self.get(&id)
    }

    fn get_updated(&self, clear: bool) -> DirtySet {
        let mut inner = self.inner.lock().expect("io collection poisoned");
        if clear {
            std::mem::take(&mut inner.dirty)
        } else {
            inner.dirty.clone()
        }
    }

    /// Rewrite the address index and re-enqueue every entry belonging to
    /// `hwid` after its owning node's alias changed. Caller already holds
    /// whatever external ordering guarantee is required (Nodes -> Inputs ->
    /// Outputs); this only guards its own mutex.
    fn rewrite_node_id(&self, hwid: &str, new_node_id: &str) -> Vec<crate::entities::IoPoint> {
        let mut inner = self.inner.lock().expect("io collection poisoned");
        let ids: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, io)| io.hwid == hwid)
            .map(|(id, _)| id.clone())
            .collect();

        let mut rewritten = Vec::with_capacity(ids.len());
        for id in ids {
            let old_address = {
                let io = &inner.entries[&id];
                io.address(&self.domain, &self.publisher_id, self.message_type).to_string()
            };
            let io = inner.entries.get_mut(&id).expect("id came from entries");
            io.node_id = new_node_id.to_string();
            let new_address = io.address(&self.domain, &self.publisher_id, self.message_type).to_string();
            inner.address_index.remove(&old_address);
            inner.address_index.insert(new_address, id.clone());
            inner.dirty.insert(id.clone(), id.clone());
            rewritten.push(io.clone());
        }
        rewritten
    }
}

/// Inputs owned by this publisher, keyed by `HWID.ioType.instance`.
pub struct RegisteredInputs {
    io: IoCollection,
    handlers: Mutex<HashMap<String, InputHandler>>,
}

impl RegisteredInputs {
    #[must_use]
    pub fn new(domain: impl Into<String>, publisher_id: impl Into<String>) -> Self {
        let domain = domain.into();
        let publisher_id = publisher_id.into();
        Self {
            io: IoCollection::new(&domain, &publisher_id, MessageType::Input),
            handlers: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new input, optionally attaching its handler.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::AlreadyExists`] if an input with this ID
    /// already exists.
    pub fn create(&self, input: Input, handler: Option<InputHandler>) -> Result<Input> {
        let created = self.io.create(input)?;
        if let Some(handler) = handler {
            self.set_handler(&created.id(), handler);
        }
        Ok(created)
    }

    /// # Errors
    ///
    /// Returns [`PubSubError::NotFound`] if `id` is not registered.
    pub fn update(&self, id: &str, mutate: impl FnOnce(&mut Input)) -> Result<Input> {
        self.io.update(id, mutate)
    }

    /// # Errors
    ///
    /// Returns [`PubSubError::NotFound`] if `id` is not registered.
    pub fn delete(&self, id: &str) -> Result<()> {
        self.io.delete(id)?;
        self.handlers.lock().expect("handlers poisoned").remove(id);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Input> {
        self.io.get(id)
    }

    #[must_use]
    pub fn get_by_address(&self, address: &str) -> Option<Input> {
        self.io.get_by_address(address)
    }

    /// Per property 3 (alias transparency): look an input up by its
    /// owning node's immutable HWID, independent of the node's current
    /// alias.
    #[must_use]
    pub fn get_by_node_hwid(&self, hwid: &str, io_type: &str, instance: &str) -> Option<Input> {
        self.io.get_by_node_hwid(hwid, io_type, instance)
    }

    pub fn get_updated(&self, clear: bool) -> DirtySet {
        self.io.get_updated(clear)
    }

    /// Replace the handler for `input_id`. Handlers persist across input
    /// updates unless explicitly replaced via this call.
    pub fn set_handler(&self, input_id: &str, handler: InputHandler) {
        self.handlers
            .lock()
            .expect("handlers poisoned")
            .insert(input_id.to_string(), handler);
    }

    /// The multiplexer's single entry point: look up the handler for
    /// `input_id` and invoke it with `(input, sender, value)`. A delete
    /// racing with dispatch is safe — a missing handler or entity simply
    /// drops the event.
    pub fn notify_input_handler(&self, input_id: &str, sender: &str, value: &str) {
        let Some(input) = self.get(input_id) else {
            return;
        };
        let handler = self
            .handlers
            .lock()
            .expect("handlers poisoned")
            .get(input_id)
            .cloned();
        if let Some(handler) = handler {
            handler(&input, sender, value);
        }
    }
}

/// Outputs owned by this publisher, keyed by `HWID.ioType.instance`.
pub struct RegisteredOutputs {
    io: IoCollection,
}

impl RegisteredOutputs {
    #[must_use]
    pub fn new(domain: impl Into<String>, publisher_id: impl Into<String>) -> Self {
        let domain = domain.into();
        let publisher_id = publisher_id.into();
        Self {
            io: IoCollection::new(&domain, &publisher_id, MessageType::Output),
        }
    }

    /// # Errors
    ///
    /// Returns [`PubSubError::AlreadyExists`] if an output with this ID
    /// already exists.
    pub fn create(&self, output: Output) -> Result<Output> {
        self.io.create(output)
    }

    /// # Errors
    ///
    /// Returns [`PubSubError::NotFound`] if `id` is not registered.
    pub fn update(&self, id: &str, mutate: impl FnOnce(&mut Output)) -> Result<Output> {
        self.io.update(id, mutate)
    }

    /// # Errors
    ///
    /// Returns [`PubSubError::NotFound`] if `id` is not registered.
    pub fn delete(&self, id: &str) -> Result<()> {
        self.io.delete(id)
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Output> {
        self.io.get(id)
    }

    #[must_use]
    pub fn get_by_address(&self, address: &str) -> Option<Output> {
        self.io.get_by_address(address)
    }

    #[must_use]
    pub fn get_by_node_hwid(&self, hwid: &str, io_type: &str, instance: &str) -> Option<Output> {
        self.io.get_by_node_hwid(hwid, io_type, instance)
    }

    pub fn get_updated(&self, clear: bool) -> DirtySet {
        self.io.get_updated(clear)
    }
}

/// Aggregates the three registered collections so `set_node_id` can
/// acquire them in the fixed Nodes -> Inputs -> Outputs order the
/// concurrency model requires. Each collection is `Arc`-wrapped so the
/// runtime can hand the same instance to the input-source multiplexer and
/// output manager without duplicating state.
pub struct RegisteredEntities {
    pub nodes: Arc<RegisteredNodes>,
    pub inputs: Arc<RegisteredInputs>,
    pub outputs: Arc<RegisteredOutputs>,
}

impl RegisteredEntities {
    #[must_use]
    pub fn new(domain: impl Into<String>, publisher_id: impl Into<String>) -> Self {
        let domain = domain.into();
        let publisher_id = publisher_id.into();
        Self {
            nodes: Arc::new(RegisteredNodes::new(domain.clone(), publisher_id.clone())),
            inputs: Arc::new(RegisteredInputs::new(domain.clone(), publisher_id.clone())),
            outputs: Arc::new(RegisteredOutputs::new(domain, publisher_id)),
        }
    }

    /// Atomically rename a node: rewrites the node's own address plus the
    /// address of every input and output it owns, re-indexing
    /// address->HWID and enqueueing all rewritten entities to their
    /// collection's dirty set. Acquires Nodes, then Inputs, then Outputs,
    /// in that fixed order, so no caller observes a half-renamed set.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::NotFound`] if `hwid` is not a registered node.
    pub fn set_node_id(&self, hwid: &str, new_node_id: &str) -> Result<()> {
        self.nodes.update(hwid, |node| {
            node.node_id = new_node_id.to_string();
        })?;
        // Node's own address index entry must move too.
        {
            let mut inner = self.nodes.inner.lock().expect("registered nodes poisoned");
            let old_addresses: Vec<String> = inner
                .address_index
                .iter()
                .filter(|(_, v)| *v == hwid)
                .map(|(k, _)| k.clone())
                .collect();
            for old in old_addresses {
                inner.address_index.remove(&old);
            }
            let node = inner.entries[hwid].clone();
            let new_address = node.address(&self.nodes.domain, &self.nodes.publisher_id).to_string();
            inner.address_index.insert(new_address, hwid.to_string());
        }

        self.inputs.io.rewrite_node_id(hwid, new_node_id);
        self.outputs.io.rewrite_node_id(hwid, new_node_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::DataType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn create_registers_and_dirties_node() {
        let nodes = RegisteredNodes::new("test", "pub1");
        nodes.create(Node::new("hw-1", "switch-controller")).unwrap();
        let updated = nodes.get_updated(false);
        assert_eq!(updated.get("hw-1"), Some(&"hw-1".to_string()));
    }

    #[test]
    fn create_twice_fails_already_exists() {
        let nodes = RegisteredNodes::new("test", "pub1");
        nodes.create(Node::new("hw-1", "switch-controller")).unwrap();
        assert!(matches!(
            nodes.create(Node::new("hw-1", "switch-controller")),
            Err(PubSubError::AlreadyExists(_))
        ));
    }

    #[test]
    fn update_missing_node_fails_not_found() {
        let nodes = RegisteredNodes::new("test", "pub1");
        assert!(matches!(
            nodes.update("missing", |_| {}),
            Err(PubSubError::NotFound(_))
        ));
    }

    #[test]
    fn delete_writes_tombstone_into_dirty_set() {
        let nodes = RegisteredNodes::new("test", "pub1");
        nodes.create(Node::new("hw-1", "t")).unwrap();
        nodes.get_updated(true);
        nodes.delete("hw-1").unwrap();
        let updated = nodes.get_updated(true);
        assert_eq!(updated.get("hw-1"), Some(&String::new()));
        assert!(nodes.get("hw-1").is_none());
    }

    #[test]
    fn dirty_set_idempotence() {
        let nodes = RegisteredNodes::new("test", "pub1");
        nodes.create(Node::new("hw-1", "t")).unwrap();
        let first = nodes.get_updated(true);
        assert_eq!(first.len(), 1);
        let second = nodes.get_updated(true);
        assert!(second.is_empty());
    }

    #[test]
    fn input_handler_invoked_exactly_once() {
        let inputs = RegisteredInputs::new("test", "pub1");
        let input = Input::new("hw-1", "n1", "switch", "0", DataType::Bool);
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        inputs
            .create(
                input,
                Some(Arc::new(move |_input, _sender, _value| {
                    count_clone.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();
        inputs.notify_input_handler("hw-1.switch.0", "test/pub2/n2/$node", "on");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn notify_missing_input_is_a_no_op() {
        let inputs = RegisteredInputs::new("test", "pub1");
        inputs.notify_input_handler("nonexistent", "sender", "value");
    }

    #[test]
    fn delete_while_dispatching_drops_the_event() {
        let inputs = RegisteredInputs::new("test", "pub1");
        let input = Input::new("hw-1", "n1", "switch", "0", DataType::Bool);
        inputs.create(input, None).unwrap();
        inputs.delete("hw-1.switch.0").unwrap();
        // No handler, no entity: dispatch is a safe no-op.
        inputs.notify_input_handler("hw-1.switch.0", "sender", "value");
    }

    #[test]
    fn scenario_s4_alias_rewrite_preserves_input_id_and_moves_address() {
        let entities = RegisteredEntities::new("test", "pub1");
        entities.nodes.create(Node::new("n1", "lamp-controller")).unwrap();
        let input = Input::new("n1", "n1", "switch", "0", DataType::Bool);
        entities.inputs.create(input, None).unwrap();

        let before = entities
            .inputs
            .get_by_address("test/pub1/n1/switch/0/$input")
            .unwrap();
        assert_eq!(before.id(), "n1.switch.0");

        entities.set_node_id("n1", "lamp").unwrap();

        assert!(entities
            .inputs
            .get_by_address("test/pub1/n1/switch/0/$input")
            .is_none());
        let after = entities
            .inputs
            .get_by_address("test/pub1/lamp/switch/0/$input")
            .unwrap();
        assert_eq!(after.id(), "n1.switch.0");

        let by_hwid = entities.inputs.get_by_node_hwid("n1", "switch", "0").unwrap();
        assert_eq!(by_hwid.id(), "n1.switch.0");
    }

    #[test]
    fn set_node_id_rewrites_outputs_too() {
        let entities = RegisteredEntities::new("test", "pub1");
        entities.nodes.create(Node::new("n1", "t")).unwrap();
        entities
            .outputs
            .create(Output::new("n1", "n1", "image", "0", DataType::String))
            .unwrap();
        entities.set_node_id("n1", "cam").unwrap();
        assert!(entities
            .outputs
            .get_by_address("test/pub1/cam/image/0/$output")
            .is_some());
    }
}
