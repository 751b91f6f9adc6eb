//! # iotpubsub
//!
//! A convention-based pub/sub library for IoT devices over an MQTT-like
//! bus. Publishers expose nodes, inputs, and outputs under a fixed topic
//! convention; discovery, configuration, and data flow are all ordinary
//! signed messages on well-known `$`-prefixed topics.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use iotpubsub::{Config, Publisher};
//! use iotpubsub::bus::MqttBus;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::from_file("iotpubsub.toml")?;
//! let (lwt_topic, lwt_payload) = iotpubsub::runtime::last_will(&config.domain, &config.publisher_id)?;
//! let bus = MqttBus::connect_mqtt(
//!     &config.publisher_id,
//!     &config.bus.address,
//!     config.bus.port,
//!     config.bus.login.as_deref(),
//!     config.bus.password.as_deref(),
//!     config.bus.use_tls,
//!     &lwt_topic,
//!     &lwt_payload,
//! )
//! .await?;
//! let publisher = Publisher::builder(config, bus).build()?;
//! publisher.start().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Topic Convention
//!
//! `<domain>/<publisherID>/<nodeID>/<messageType>` for node-level messages,
//! or `<domain>/<publisherID>/<nodeID>/<ioType>/<instance>/<messageType>`
//! for input/output messages. See [`address`] for the full grammar.

/// Publication and subscription addressing (§4.1).
pub mod address;

/// Topic pub/sub bus abstraction, with an in-process test double and an
/// MQTT-backed adapter.
pub mod bus;

/// TOML-backed runtime configuration.
pub mod config;

/// ECDSA keypairs and ECIES-style (JWE compact) encryption.
pub mod crypto;

/// In-memory maps of remote entities observed via discovery subscriptions.
pub mod domain;

/// Node, input, and output entity types shared across registered and
/// domain collections.
pub mod entities;

/// Signed/encrypted message envelope: canonicalisation, sign, verify,
/// encrypt, decrypt.
pub mod envelope;

/// The crate's error type and `Result` alias.
pub mod error;

/// Publisher identity: keypair load/create, DSS-signed identity record,
/// per-publisher public key directory.
pub mod identity;

/// `$raw`/`$latest`/`$event`/`$history`/`$forecast`/`$batch` output
/// publication.
pub mod output;

/// In-memory maps of owned entities keyed by stable hardware ID, with the
/// dirty set that drives discovery publication.
pub mod registered;

/// Per-sender monotonic timestamp replay protection.
pub mod replay;

/// The input-source multiplexer: `FromSetCommands`, `FromHttp`,
/// `FromFiles`, `FromOutputs`, unified behind one handler contract.
pub mod sources;

/// The Publisher Runtime: lifecycle, tickers, discovery fan-out.
pub mod runtime;

pub use config::Config;
pub use error::{PubSubError, Result};
pub use runtime::{Publisher, PublisherBuilder, RuntimeState};
