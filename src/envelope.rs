//! The `{message, signature}` envelope wrapping every published message.

use crate::crypto::{self, Keypair};
use crate::error::{PubSubError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Wire representation of a signed (and optionally encrypted) message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Canonical JSON payload, or a JWE compact string when encrypted.
    pub message: String,
    /// `base64(ECDSA-P256(SHA256(message)))`, present only if signed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// Looks up the PEM-encoded public key published for a given sender
/// (publisher ID). Backed by an identity store in the runtime.
pub trait PublicKeyLookup {
    /// Return the sender's published public key, if known.
    fn public_key_pem(&self, sender: &str) -> Option<String>;
}

/// Sign `message` (the exact bytes to be transmitted) and wrap it in an
/// [`Envelope`]. `message` is carried through unmodified — callers must not
/// re-serialise it before sending.
#[must_use]
pub fn sign(message: String, keypair: &Keypair) -> Envelope {
    let digest = Sha256::digest(message.as_bytes());
    match keypair.sign(&digest) {
        Ok(signature) => Envelope {
            message,
            signature: Some(base64_encode(&signature)),
        },
        Err(_) => Envelope {
            message,
            signature: None,
        },
    }
}

/// Encrypt `plaintext` to `recipient_public_key_pem` and sign the resulting
/// JWE compact string, implementing the spec's "sign-then-encrypt" framing
/// (the transmitted `message` is the ciphertext; the signature covers it).
///
/// # Errors
///
/// Returns [`PubSubError::InvalidKey`] if the recipient key does not parse.
pub fn encrypt_and_sign(
    plaintext: &[u8],
    recipient_public_key_pem: &str,
    keypair: &Keypair,
) -> Result<Envelope> {
    let jwe = crypto::encrypt_to(plaintext, recipient_public_key_pem)?;
    Ok(sign(jwe, keypair))
}

/// Result of verifying an [`Envelope`].
pub struct Verified {
    /// The exact `message` bytes that were verified (still the raw wire
    /// string — may be a JWE compact string if encrypted).
    pub message: String,
    /// Whether a signature was present and verified.
    pub is_signed: bool,
}

/// Verify a signed envelope per §4.1: `SignatureInvalid` if the signature
/// does not match, `SignerUnknown` if no public key is on file for
/// `sender`, `Malformed` if the signature is not valid base64. A missing
/// signature is not an error — callers decide whether the topic allows it.
///
/// # Errors
///
/// See variant docs above.
pub fn verify_signed_message(
    envelope: &Envelope,
    sender: &str,
    keys: &dyn PublicKeyLookup,
) -> Result<Verified> {
    let Some(signature_b64) = &envelope.signature else {
        return Ok(Verified {
            message: envelope.message.clone(),
            is_signed: false,
        });
    };

    let signature = base64_decode(signature_b64)
        .map_err(|e| PubSubError::Malformed(format!("invalid signature encoding: {e}")))?;

    let public_key_pem = keys.public_key_pem(sender).ok_or_else(|| PubSubError::SignerUnknown {
        sender: sender.to_string(),
    })?;

    let digest = Sha256::digest(envelope.message.as_bytes());
    crypto::verify(&digest, &signature, &public_key_pem, sender)?;

    Ok(Verified {
        message: envelope.message.clone(),
        is_signed: true,
    })
}

/// Result of decoding a raw envelope without necessarily enforcing policy,
/// used by set-command handling (§4.1's decode contract) where the caller
/// applies its own encryption/signature policy afterwards.
pub struct Decoded {
    pub payload: Vec<u8>,
    pub is_encrypted: bool,
    pub is_signed: bool,
}

/// Decode a raw envelope, decrypting the inner message with `keypair` if it
/// looks like a JWE compact string (three periods, five segments), and
/// verifying the signature if present. Does not enforce any
/// encrypted-and-signed policy — see [`crate::sources::from_set`] for that.
///
/// # Errors
///
/// Returns [`PubSubError::Malformed`] if `raw` is not valid envelope JSON,
/// [`PubSubError::DecryptionFailed`] if it looks encrypted but does not
/// decrypt, or the verification errors from [`verify_signed_message`].
pub fn decode_message(
    raw: &[u8],
    sender: &str,
    keypair: Option<&Keypair>,
    keys: &dyn PublicKeyLookup,
) -> Result<Decoded> {
    let envelope: Envelope =
        serde_json::from_slice(raw).map_err(|e| PubSubError::Malformed(e.to_string()))?;

    let is_encrypted = is_jwe_compact(&envelope.message);

    let verified = verify_signed_message(&envelope, sender, keys)?;
    let is_signed = verified.is_signed;

    let payload = if is_encrypted {
        let keypair = keypair.ok_or_else(|| {
            PubSubError::DecryptionFailed("no local keypair to decrypt with".to_string())
        })?;
        keypair.decrypt(&verified.message)?
    } else {
        verified.message.into_bytes()
    };

    Ok(Decoded {
        payload,
        is_encrypted,
        is_signed,
    })
}

pub(crate) fn is_jwe_compact(s: &str) -> bool {
    s.split('.').count() == 5
}

pub(crate) fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub(crate) fn base64_decode(s: &str) -> std::result::Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct TestKeys(HashMap<String, String>);

    impl PublicKeyLookup for TestKeys {
        fn public_key_pem(&self, sender: &str) -> Option<String> {
            self.0.get(sender).cloned()
        }
    }

    #[test]
    fn envelope_round_trip_verifies() {
        let kp = Keypair::generate().unwrap();
        let envelope = sign("{\"value\":1}".to_string(), &kp);
        let mut keys = HashMap::new();
        keys.insert("pub1".to_string(), kp.public_key_pem().unwrap());
        let verified = verify_signed_message(&envelope, "pub1", &TestKeys(keys)).unwrap();
        assert!(verified.is_signed);
        assert_eq!(verified.message, "{\"value\":1}");
    }

    #[test]
    fn unsigned_envelope_is_accepted_without_error() {
        let envelope = Envelope {
            message: "{}".to_string(),
            signature: None,
        };
        let verified = verify_signed_message(&envelope, "pub1", &TestKeys(HashMap::new())).unwrap();
        assert!(!verified.is_signed);
    }

    #[test]
    fn unknown_signer_is_rejected() {
        let kp = Keypair::generate().unwrap();
        let envelope = sign("{}".to_string(), &kp);
        let err = verify_signed_message(&envelope, "pub1", &TestKeys(HashMap::new())).unwrap_err();
        assert!(matches!(err, PubSubError::SignerUnknown { .. }));
    }

    #[test]
    fn tampered_message_fails_signature_check() {
        let kp = Keypair::generate().unwrap();
        let mut envelope = sign("{}".to_string(), &kp);
        envelope.message = "{\"tampered\":true}".to_string();
        let mut keys = HashMap::new();
        keys.insert("pub1".to_string(), kp.public_key_pem().unwrap());
        let err = verify_signed_message(&envelope, "pub1", &TestKeys(keys)).unwrap_err();
        assert!(matches!(err, PubSubError::SignatureInvalid { .. }));
    }

    #[test]
    fn decode_message_decrypts_and_verifies() {
        let kp = Keypair::generate().unwrap();
        let pem = kp.public_key_pem().unwrap();
        let envelope = encrypt_and_sign(b"{\"value\":\"on\"}", &pem, &kp).unwrap();
        let raw = serde_json::to_vec(&envelope).unwrap();
        let mut keys = HashMap::new();
        keys.insert("pub1".to_string(), pem);
        let decoded = decode_message(&raw, "pub1", Some(&kp), &TestKeys(keys)).unwrap();
        assert!(decoded.is_encrypted);
        assert!(decoded.is_signed);
        assert_eq!(decoded.payload, b"{\"value\":\"on\"}");
    }
}
