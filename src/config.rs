//! Structured configuration for a publisher, loadable from TOML.

use crate::error::{PubSubError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_discovery_interval_secs() -> u64 {
    3600
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_sign_messages() -> bool {
    true
}

fn default_persist_folder() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".iotpubsub")
}

fn default_bus_port() -> u16 {
    8883
}

fn default_use_tls() -> bool {
    true
}

/// Bus connection parameters.
#[derive(Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Hostname or IP address of the message bus.
    pub address: String,
    /// TCP port of the message bus.
    #[serde(default = "default_bus_port")]
    pub port: u16,
    /// Optional login for the bus connection.
    #[serde(default)]
    pub login: Option<String>,
    /// Optional password for the bus connection. Never logged.
    #[serde(default)]
    pub password: Option<String>,
    /// Whether to connect over TLS.
    #[serde(default = "default_use_tls")]
    pub use_tls: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            address: "localhost".to_string(),
            port: default_bus_port(),
            login: None,
            password: None,
            use_tls: default_use_tls(),
        }
    }
}

impl std::fmt::Debug for BusConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusConfig")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("login", &self.login)
            .field(
                "password",
                &self.password.as_ref().map(|_| "<REDACTED>"),
            )
            .field("use_tls", &self.use_tls)
            .finish()
    }
}

/// Top-level publisher configuration, mirroring the recognised options in
/// the external-interfaces spec: domain, publisherID, intervals, signing
/// policy, persistence folder, identity key path, and bus parameters.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Administrative domain; first segment of every publication address.
    pub domain: String,
    /// This publisher's stable ID; second segment of every publication address.
    pub publisher_id: String,
    /// Discovery-tick interval, in seconds.
    #[serde(default = "default_discovery_interval_secs")]
    pub discovery_interval_secs: u64,
    /// Poll-tick interval, in seconds.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Whether outgoing messages are signed. Off only makes sense in tests.
    #[serde(default = "default_sign_messages")]
    pub sign_messages: bool,
    /// Folder holding the identity record and private key files.
    #[serde(default = "default_persist_folder")]
    pub persist_folder: PathBuf,
    /// Optional explicit path to an existing private key PEM file. When
    /// absent, the key lives at `persist_folder/<publisher_id>-private.pem`.
    #[serde(default)]
    pub identity_private_key: Option<PathBuf>,
    /// PEM-encoded public key of this domain's Domain Security Service, if
    /// one is configured. When present, the runtime subscribes to
    /// `<domain>/$dss/<publisher_id>/$identity` for DSS-issued identity
    /// renewals (see [`crate::identity::Identity::renew`]).
    #[serde(default)]
    pub dss_public_key_pem: Option<String>,
    /// Message bus connection parameters.
    #[serde(default)]
    pub bus: BusConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            domain: String::new(),
            publisher_id: String::new(),
            discovery_interval_secs: default_discovery_interval_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            sign_messages: default_sign_messages(),
            persist_folder: default_persist_folder(),
            identity_private_key: None,
            dss_public_key_pem: None,
            bus: BusConfig::default(),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("domain", &self.domain)
            .field("publisher_id", &self.publisher_id)
            .field("discovery_interval_secs", &self.discovery_interval_secs)
            .field("poll_interval_secs", &self.poll_interval_secs)
            .field("sign_messages", &self.sign_messages)
            .field("persist_folder", &self.persist_folder)
            .field("identity_private_key", &self.identity_private_key)
            .field("dss_public_key_pem", &self.dss_public_key_pem)
            .field("bus", &self.bus)
            .finish()
    }
}

impl Config {
    /// Parse a [`Config`] from a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::Config`] if the document does not parse, or
    /// if `domain`/`publisher_id` are empty after parsing.
    pub fn from_toml(document: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(document).map_err(|e| PubSubError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a [`Config`] from a TOML file on disk.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::Io`] if the file cannot be read, or
    /// [`PubSubError::Config`] if it does not parse/validate.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let document = std::fs::read_to_string(path)?;
        Self::from_toml(&document)
    }

    fn validate(&self) -> Result<()> {
        if self.domain.is_empty() {
            return Err(PubSubError::Config("domain must not be empty".to_string()));
        }
        if self.publisher_id.is_empty() {
            return Err(PubSubError::Config(
                "publisher_id must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Path to the identity record JSON file.
    #[must_use]
    pub fn identity_path(&self) -> PathBuf {
        self.persist_folder
            .join(format!("{}-identity.json", self.publisher_id))
    }

    /// Path to the private key PEM file, honouring an explicit override.
    #[must_use]
    pub fn private_key_path(&self) -> PathBuf {
        self.identity_private_key.clone().unwrap_or_else(|| {
            self.persist_folder
                .join(format!("{}-private.pem", self.publisher_id))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config {
            domain: "test".to_string(),
            publisher_id: "pub1".to_string(),
            ..Config::default()
        };
        assert_eq!(cfg.discovery_interval_secs, 3600);
        assert_eq!(cfg.poll_interval_secs, 60);
        assert!(cfg.sign_messages);
        assert!(cfg.bus.use_tls);
    }

    #[test]
    fn from_toml_fills_in_defaults() {
        let doc = r#"
            domain = "test"
            publisher_id = "pub1"

            [bus]
            address = "broker.local"
        "#;
        let cfg = Config::from_toml(doc).unwrap();
        assert_eq!(cfg.domain, "test");
        assert_eq!(cfg.bus.address, "broker.local");
        assert_eq!(cfg.bus.port, 8883);
        assert_eq!(cfg.discovery_interval_secs, 3600);
    }

    #[test]
    fn from_toml_rejects_empty_domain() {
        let doc = r#"
            domain = ""
            publisher_id = "pub1"
        "#;
        assert!(Config::from_toml(doc).is_err());
    }

    #[test]
    fn debug_redacts_bus_password() {
        let cfg = Config {
            domain: "test".to_string(),
            publisher_id: "pub1".to_string(),
            bus: BusConfig {
                password: Some("hunter2".to_string()),
                ..BusConfig::default()
            },
            ..Config::default()
        };
        let rendered = format!("{:?}", cfg);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("REDACTED"));
    }

    #[test]
    fn identity_and_key_paths_derive_from_publisher_id() {
        let cfg = Config {
            domain: "test".to_string(),
            publisher_id: "pub1".to_string(),
            persist_folder: PathBuf::from("/tmp/pubsub"),
            ..Config::default()
        };
        assert_eq!(
            cfg.identity_path(),
            PathBuf::from("/tmp/pubsub/pub1-identity.json")
        );
        assert_eq!(
            cfg.private_key_path(),
            PathBuf::from("/tmp/pubsub/pub1-private.pem")
        );
    }

    #[test]
    fn explicit_private_key_path_overrides_default() {
        let cfg = Config {
            domain: "test".to_string(),
            publisher_id: "pub1".to_string(),
            persist_folder: PathBuf::from("/tmp/pubsub"),
            identity_private_key: Some(PathBuf::from("/etc/pubsub/custom.pem")),
            ..Config::default()
        };
        assert_eq!(
            cfg.private_key_path(),
            PathBuf::from("/etc/pubsub/custom.pem")
        );
    }
}
