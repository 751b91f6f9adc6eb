//! Publication address parsing and construction.
//!
//! Addresses are '/'-delimited paths of the form
//! `<domain>/<publisherID>/<nodeID>/<messageType>` (node-level) or
//! `<domain>/<publisherID>/<nodeID>/<ioType>/<instance>/<messageType>`
//! (io-level). Message types are always `$`-prefixed.

use std::fmt;

/// The fixed set of recognised message types, each carrying its `$` prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Node,
    Input,
    Output,
    Set,
    Configure,
    Latest,
    Raw,
    Event,
    History,
    Forecast,
    Batch,
    Alias,
    Identity,
    Lwt,
    Upgrade,
}

impl MessageType {
    /// The `$`-prefixed wire representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Node => "$node",
            MessageType::Input => "$input",
            MessageType::Output => "$output",
            MessageType::Set => "$set",
            MessageType::Configure => "$configure",
            MessageType::Latest => "$latest",
            MessageType::Raw => "$raw",
            MessageType::Event => "$event",
            MessageType::History => "$history",
            MessageType::Forecast => "$forecast",
            MessageType::Batch => "$batch",
            MessageType::Alias => "$alias",
            MessageType::Identity => "$identity",
            MessageType::Lwt => "$lwt",
            MessageType::Upgrade => "$upgrade",
        }
    }

    /// Parse a `$`-prefixed segment back into a [`MessageType`].
    #[must_use]
    pub fn parse(segment: &str) -> Option<Self> {
        Some(match segment {
            "$node" => MessageType::Node,
            "$input" => MessageType::Input,
            "$output" => MessageType::Output,
            "$set" => MessageType::Set,
            "$configure" => MessageType::Configure,
            "$latest" => MessageType::Latest,
            "$raw" => MessageType::Raw,
            "$event" => MessageType::Event,
            "$history" => MessageType::History,
            "$forecast" => MessageType::Forecast,
            "$batch" => MessageType::Batch,
            "$alias" => MessageType::Alias,
            "$identity" => MessageType::Identity,
            "$lwt" => MessageType::Lwt,
            "$upgrade" => MessageType::Upgrade,
            _ => return None,
        })
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed publication address, either node-level or io-level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub domain: String,
    pub publisher_id: String,
    pub node_id: String,
    /// `Some((io_type, instance))` for io-level addresses.
    pub io: Option<(String, String)>,
    pub message_type: MessageType,
}

impl Address {
    /// Build a node-level address: `<domain>/<publisherID>/<nodeID>/<messageType>`.
    #[must_use]
    pub fn node(domain: &str, publisher_id: &str, node_id: &str, message_type: MessageType) -> Self {
        Self {
            domain: domain.to_string(),
            publisher_id: publisher_id.to_string(),
            node_id: node_id.to_string(),
            io: None,
            message_type,
        }
    }

    /// Build an io-level address:
    /// `<domain>/<publisherID>/<nodeID>/<ioType>/<instance>/<messageType>`.
    #[must_use]
    pub fn io(
        domain: &str,
        publisher_id: &str,
        node_id: &str,
        io_type: &str,
        instance: &str,
        message_type: MessageType,
    ) -> Self {
        Self {
            domain: domain.to_string(),
            publisher_id: publisher_id.to_string(),
            node_id: node_id.to_string(),
            io: Some((io_type.to_string(), instance.to_string())),
            message_type,
        }
    }

    /// Parse a `/`-delimited address string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [domain, publisher_id, node_id, msg] => Some(Self {
                domain: (*domain).to_string(),
                publisher_id: (*publisher_id).to_string(),
                node_id: (*node_id).to_string(),
                io: None,
                message_type: MessageType::parse(msg)?,
            }),
            [domain, publisher_id, node_id, io_type, instance, msg] => Some(Self {
                domain: (*domain).to_string(),
                publisher_id: (*publisher_id).to_string(),
                node_id: (*node_id).to_string(),
                io: Some(((*io_type).to_string(), (*instance).to_string())),
                message_type: MessageType::parse(msg)?,
            }),
            _ => None,
        }
    }

    /// Return a copy of this address with the message type replaced.
    #[must_use]
    pub fn with_message_type(&self, message_type: MessageType) -> Self {
        Self {
            message_type,
            ..self.clone()
        }
    }

    /// Return a copy of this address with the node ID replaced, e.g. after
    /// `set_node_id` rewrites a node's alias.
    #[must_use]
    pub fn with_node_id(&self, node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            ..self.clone()
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.io {
            Some((io_type, instance)) => write!(
                f,
                "{}/{}/{}/{}/{}/{}",
                self.domain, self.publisher_id, self.node_id, io_type, instance, self.message_type
            ),
            None => write!(
                f,
                "{}/{}/{}/{}",
                self.domain, self.publisher_id, self.node_id, self.message_type
            ),
        }
    }
}

/// Build the stable internal input/output ID: `HWID.<ioType>.<instance>`.
/// Never contains the node's mutable alias.
#[must_use]
pub fn io_id(hwid: &str, io_type: &str, instance: &str) -> String {
    format!("{hwid}.{io_type}.{instance}")
}
