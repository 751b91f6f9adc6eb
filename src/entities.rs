//! Node, Input, and Output entity types shared by the registered and
//! domain collections.

use crate::address::{io_id, Address, MessageType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The datatype an input/output config attribute or I/O point carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Bool,
    Number,
    String,
    Enum,
    Bytes,
}

/// A single node configuration attribute: datatype plus optional bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigAttr {
    pub datatype: DataType,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub enum_values: Option<Vec<String>>,
    #[serde(default)]
    pub secret: bool,
}

/// An owned or observed device/service. `hwid` is immutable; `node_id`
/// defaults to `hwid` and may be rewritten via `set_node_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub hwid: String,
    pub node_id: String,
    pub node_type: String,
    #[serde(default)]
    pub attr: HashMap<String, String>,
    #[serde(default)]
    pub config: HashMap<String, ConfigAttr>,
    #[serde(default)]
    pub status: HashMap<String, String>,
}

impl Node {
    #[must_use]
    pub fn new(hwid: impl Into<String>, node_type: impl Into<String>) -> Self {
        let hwid = hwid.into();
        Self {
            node_id: hwid.clone(),
            hwid,
            node_type: node_type.into(),
            attr: HashMap::new(),
            config: HashMap::new(),
            status: HashMap::new(),
        }
    }

    /// The address this node publishes discovery under.
    #[must_use]
    pub fn address(&self, domain: &str, publisher_id: &str) -> Address {
        Address::node(domain, publisher_id, &self.node_id, MessageType::Node)
    }
}

/// A typed input or output port belonging to exactly one node. The same
/// shape serves both `RegisteredInputs`/`DomainInputs` and
/// `RegisteredOutputs`/`DomainOutputs` — see [`Input`] and [`Output`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoPoint {
    /// HWID of the owning node (immutable).
    pub hwid: String,
    pub io_type: String,
    pub instance: String,
    /// Current alias of the owning node, used to compute the publication
    /// address; kept in sync by `set_node_id`.
    pub node_id: String,
    pub datatype: DataType,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub enum_values: Option<Vec<String>>,
    #[serde(default)]
    pub unit: Option<String>,
    /// File path, URL, or remote output address feeding this input; unused
    /// for outputs.
    #[serde(default)]
    pub source: Option<String>,
}

impl IoPoint {
    #[must_use]
    pub fn new(
        hwid: impl Into<String>,
        node_id: impl Into<String>,
        io_type: impl Into<String>,
        instance: impl Into<String>,
        datatype: DataType,
    ) -> Self {
        Self {
            hwid: hwid.into(),
            node_id: node_id.into(),
            io_type: io_type.into(),
            instance: instance.into(),
            datatype,
            min: None,
            max: None,
            enum_values: None,
            unit: None,
            source: None,
        }
    }

    /// Stable internal ID: `HWID.<ioType>.<instance>`. Never contains the
    /// node's mutable alias.
    #[must_use]
    pub fn id(&self) -> String {
        io_id(&self.hwid, &self.io_type, &self.instance)
    }

    /// Publication address, derived from the *current* `node_id`.
    #[must_use]
    pub fn address(&self, domain: &str, publisher_id: &str, message_type: MessageType) -> Address {
        Address::io(
            domain,
            publisher_id,
            &self.node_id,
            &self.io_type,
            &self.instance,
            message_type,
        )
    }
}

/// An input port; accepts `$set` commands via one of the four trigger
/// sources in [`crate::sources`].
pub type Input = IoPoint;

/// An output port; emits `$latest`/`$raw`/`$event`/etc via
/// [`crate::output`].
pub type Output = IoPoint;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_defaults_node_id_to_hwid() {
        let node = Node::new("hw-1", "switch-controller");
        assert_eq!(node.node_id, "hw-1");
    }

    #[test]
    fn io_point_id_is_stable_and_alias_free() {
        let input = IoPoint::new("hw-1", "lamp", "switch", "0", DataType::Bool);
        assert_eq!(input.id(), "hw-1.switch.0");
    }

    #[test]
    fn io_point_address_uses_current_node_id_not_hwid() {
        let input = IoPoint::new("hw-1", "lamp", "switch", "0", DataType::Bool);
        let addr = input.address("test", "pub1", MessageType::Input);
        assert_eq!(addr.to_string(), "test/pub1/lamp/switch/0/$input");
    }
}
