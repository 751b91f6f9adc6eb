//! ECDSA P-256 keypairs and ECIES-style encryption (JWE compact form).
//!
//! Signing digests the exact transmitted message bytes with SHA-256 and
//! signs with ECDSA over P-256 — no re-serialisation between signing and
//! sending. Encryption wraps a payload in JWE compact form using
//! ECDH-ES+A128KW key agreement and A128CBC-HS256 content encryption,
//! targeting the recipient's public key.

use crate::error::{PubSubError, Result};
use picky::jose::jwe::{Jwe, JweAlg, JweEnc};
use picky::key::{PrivateKey, PublicKey};
use picky::signature::SignatureAlgorithm;

/// An ECDSA P-256 keypair used both to sign outgoing publications and to
/// decrypt messages encrypted to this publisher.
pub struct Keypair {
    private_key: PrivateKey,
    public_key: PublicKey,
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("private_key", &"<REDACTED>")
            .field("public_key", &self.public_key_pem().unwrap_or_default())
            .finish()
    }
}

impl Keypair {
    /// Generate a fresh ECDSA P-256 keypair.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::InvalidKey`] if key generation fails.
    pub fn generate() -> Result<Self> {
        let private_key = PrivateKey::generate_ec(picky::ec::EcCurve::NistP256)
            .map_err(|e| PubSubError::InvalidKey(e.to_string()))?;
        let public_key = private_key
            .to_public_key()
            .map_err(|e| PubSubError::InvalidKey(e.to_string()))?;
        Ok(Self {
            private_key,
            public_key,
        })
    }

    /// Load a keypair from a PEM-encoded PKCS#8 private key.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::InvalidKey`] if the PEM does not parse.
    pub fn from_private_pem(pem: &str) -> Result<Self> {
        let private_key =
            PrivateKey::from_pem_str(pem).map_err(|e| PubSubError::InvalidKey(e.to_string()))?;
        let public_key = private_key
            .to_public_key()
            .map_err(|e| PubSubError::InvalidKey(e.to_string()))?;
        Ok(Self {
            private_key,
            public_key,
        })
    }

    /// PEM-encode the private key for persistence.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::InvalidKey`] if encoding fails.
    pub fn private_key_pem(&self) -> Result<String> {
        self.private_key
            .to_pem()
            .map(|pem| pem.to_string())
            .map_err(|e| PubSubError::InvalidKey(e.to_string()))
    }

    /// PEM-encode the public key for publication in an identity record.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::InvalidKey`] if encoding fails.
    pub fn public_key_pem(&self) -> Result<String> {
        self.public_key
            .to_pem()
            .map(|pem| pem.to_string())
            .map_err(|e| PubSubError::InvalidKey(e.to_string()))
    }

    /// Borrow the public key, e.g. to encrypt a message to this keypair's owner.
    #[must_use]
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Sign `message` (the exact bytes that will be transmitted) with
    /// ECDSA-P256-SHA256, returning the raw signature bytes.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::InvalidKey`] if signing fails.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        self.private_key
            .sign(message, SignatureAlgorithm::EcdsaSha2(picky::hash::HashAlgorithm::SHA2_256))
            .map_err(|e| PubSubError::InvalidKey(e.to_string()))
    }

    /// Decrypt a JWE compact-form payload addressed to this keypair.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::DecryptionFailed`] if the token does not
    /// decode or decrypt against this private key.
    pub fn decrypt(&self, jwe_compact: &str) -> Result<Vec<u8>> {
        let jwe = Jwe::decode(jwe_compact, &self.private_key)
            .map_err(|e| PubSubError::DecryptionFailed(e.to_string()))?;
        Ok(jwe.payload)
    }
}

/// Verify `signature` over `message` against `public_key_pem`.
///
/// # Errors
///
/// Returns [`PubSubError::InvalidKey`] if `public_key_pem` does not parse,
/// or [`PubSubError::SignatureInvalid`] if the signature does not verify.
pub fn verify(message: &[u8], signature: &[u8], public_key_pem: &str, sender: &str) -> Result<()> {
    let public_key =
        PublicKey::from_pem_str(public_key_pem).map_err(|e| PubSubError::InvalidKey(e.to_string()))?;
    public_key
        .verify(
            message,
            signature,
            SignatureAlgorithm::EcdsaSha2(picky::hash::HashAlgorithm::SHA2_256),
        )
        .map_err(|_| PubSubError::SignatureInvalid {
            sender: sender.to_string(),
        })
}

/// Encrypt `payload` to `recipient_public_key_pem` as a JWE compact string
/// (ECDH-ES+A128KW key wrap, A128CBC-HS256 content encryption).
///
/// # Errors
///
/// Returns [`PubSubError::InvalidKey`] if the recipient key does not parse
/// or encryption fails.
pub fn encrypt_to(payload: &[u8], recipient_public_key_pem: &str) -> Result<String> {
    let recipient = PublicKey::from_pem_str(recipient_public_key_pem)
        .map_err(|e| PubSubError::InvalidKey(e.to_string()))?;
    let jwe = Jwe::new(JweAlg::EcdhEsA128kw, JweEnc::Aes128CbcHmacSha256, payload.to_vec());
    jwe.encode(&recipient)
        .map_err(|e| PubSubError::InvalidKey(e.to_string()))
}
