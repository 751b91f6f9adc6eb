//! Error types for the publish/subscribe core.
//!
//! Every fallible operation in this crate returns a [`Result<T>`], an alias
//! for `std::result::Result<T, PubSubError>`. Incoming-message errors
//! (signature, encryption, replay, malformed payload) are caught at the
//! message-handling boundary and logged rather than returned to user
//! handlers — see the crate-level docs for the propagation rules.

use thiserror::Error;

/// Comprehensive error type covering the messaging core and its ambient
/// plumbing (configuration, identity storage, serialization).
#[derive(Error, Debug)]
pub enum PubSubError {
    /// Payload could not be parsed as the expected JSON shape.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Signature present but did not verify against the claimed sender's key.
    #[error("signature invalid for sender {sender}")]
    SignatureInvalid {
        /// Publisher ID that supposedly signed the message.
        sender: String,
    },

    /// Policy required encryption but the message arrived in the clear.
    #[error("message on {address} was not encrypted")]
    NotEncrypted {
        /// Publication address the message was received on.
        address: String,
    },

    /// JWE decompaction or content decryption failed.
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    /// No public key is known for the claimed sender.
    #[error("no known public key for signer {sender}")]
    SignerUnknown {
        /// Publisher ID claiming to be the sender.
        sender: String,
    },

    /// Message timestamp was not strictly greater than the last accepted one.
    #[error("replayed or stale message from {sender} (timestamp {timestamp})")]
    Replay {
        /// Sender address or publisher ID the replay table is keyed on.
        sender: String,
        /// Timestamp carried by the rejected message.
        timestamp: String,
    },

    /// Lookup against a registered or domain collection found nothing.
    #[error("not found: {0}")]
    NotFound(String),

    /// A create operation targeted an identity that already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The bus connection is down or a publish/subscribe call failed.
    #[error("bus unavailable: {0}")]
    BusUnavailable(String),

    /// An input source (HTTP endpoint, watched file) could not be reached.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// An operation exceeded its deadline.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Identity or config file I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration document failed to parse or validate.
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON (de)serialization failure outside the message-handling path.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Cryptographic key material was malformed or the wrong size.
    #[error("invalid key material: {0}")]
    InvalidKey(String),
}

/// Standard result type for this crate.
pub type Result<T> = std::result::Result<T, PubSubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_invalid_display_includes_sender() {
        let err = PubSubError::SignatureInvalid {
            sender: "test/pub2".to_string(),
        };
        assert_eq!(err.to_string(), "signature invalid for sender test/pub2");
    }

    #[test]
    fn replay_display_includes_timestamp() {
        let err = PubSubError::Replay {
            sender: "test/pub2/n2".to_string(),
            timestamp: "2024-01-01T00:00:00.000+0000".to_string(),
        };
        assert!(err.to_string().contains("2024-01-01T00:00:00.000+0000"));
    }

    #[test]
    fn io_error_converts_via_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: PubSubError = io_err.into();
        assert!(matches!(err, PubSubError::Io(_)));
    }

    #[test]
    fn serde_error_converts_via_from() {
        let bad: std::result::Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: PubSubError = bad.unwrap_err().into();
        assert!(matches!(err, PubSubError::Serialization(_)));
    }

    #[test]
    fn not_found_display() {
        let err = PubSubError::NotFound("hwid-123".to_string());
        assert_eq!(err.to_string(), "not found: hwid-123");
    }
}
