//! Publisher identity: keypair load/create, the published identity record,
//! and per-publisher public-key lookup for signature verification.

use crate::config::Config;
use crate::crypto::Keypair;
use crate::envelope::PublicKeyLookup;
use crate::error::{PubSubError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::sync::RwLock;

/// The public identity record published (retained) under
/// `<domain>/<publisherID>/$identity`.
///
/// Self-issued at first start; re-issued by a Domain Security Service (DSS)
/// on renewal, at which point `issuer` names the DSS's publisher ID and
/// `signature` is the DSS's signature rather than a self-signature.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityRecord {
    pub domain: String,
    pub publisher_id: String,
    pub public_key_pem: String,
    /// Publisher ID that issued this record (self, or a DSS).
    pub issuer: String,
    pub valid_from: String,
    pub valid_until: String,
    /// Base64 ECDSA signature over the canonical bytes built by
    /// [`IdentityRecord::signing_payload`].
    pub signature: String,
}

impl IdentityRecord {
    /// Bytes covered by `signature`: every field except the signature
    /// itself, concatenated with `|` separators so issuer and validity
    /// window are tamper-evident along with the key.
    #[must_use]
    pub fn signing_payload(&self) -> Vec<u8> {
        format!(
            "{}|{}|{}|{}|{}|{}",
            self.domain,
            self.publisher_id,
            self.public_key_pem,
            self.issuer,
            self.valid_from,
            self.valid_until
        )
        .into_bytes()
    }
}

/// The private, never-published half of a publisher's identity: the
/// keypair and the currently-valid published record.
pub struct Identity {
    keypair: Keypair,
    record: RwLock<IdentityRecord>,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("keypair", &self.keypair)
            .field("record", &self.record.read().expect("identity record poisoned"))
            .finish()
    }
}

impl Identity {
    /// Load an existing identity from `config`'s persist folder, or
    /// generate and persist a fresh self-signed one if the files are
    /// absent. Missing files are the normal first-start path; a present
    /// but corrupt file is a fatal [`PubSubError`] per the error design.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::Io`] on filesystem failure, or
    /// [`PubSubError::InvalidKey`]/[`PubSubError::Serialization`] if an
    /// existing file is corrupt.
    pub fn load_or_create(config: &Config) -> Result<Self> {
        let identity_path = config.identity_path();
        let key_path = config.private_key_path();

        if key_path.exists() && identity_path.exists() {
            let pem = fs::read_to_string(&key_path)?;
            let keypair = Keypair::from_private_pem(&pem)?;
            let record_json = fs::read_to_string(&identity_path)?;
            let record: IdentityRecord = serde_json::from_str(&record_json)?;
            return Ok(Self {
                keypair,
                record: RwLock::new(record),
            });
        }

        let keypair = Keypair::generate()?;
        let now = now_iso8601();
        let mut record = IdentityRecord {
            domain: config.domain.clone(),
            publisher_id: config.publisher_id.clone(),
            public_key_pem: keypair.public_key_pem()?,
            issuer: config.publisher_id.clone(),
            valid_from: now.clone(),
            valid_until: String::new(),
            signature: String::new(),
        };
        let signature = keypair.sign(&record.signing_payload())?;
        record.signature = base64_encode(&signature);

        let identity = Self {
            keypair,
            record: RwLock::new(record),
        };
        identity.persist(config)?;
        Ok(identity)
    }

    fn persist(&self, config: &Config) -> Result<()> {
        fs::create_dir_all(&config.persist_folder)?;

        let key_path = config.private_key_path();
        atomic_write(&key_path, self.keypair.private_key_pem()?.as_bytes())?;

        let identity_path = config.identity_path();
        let record = self.record.read().expect("identity record poisoned");
        let json = serde_json::to_vec_pretty(&*record)?;
        atomic_write(&identity_path, &json)?;
        Ok(())
    }

    /// The keypair backing this identity, used to sign outgoing
    /// publications and decrypt messages addressed to this publisher.
    #[must_use]
    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    /// A snapshot of the currently-valid identity record.
    #[must_use]
    pub fn record(&self) -> IdentityRecord {
        self.record.read().expect("identity record poisoned").clone()
    }

    /// Accept a DSS-issued replacement record, verifying it was signed by
    /// `dss_public_key_pem` and covers this publisher's own key before
    /// swapping it in.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::SignatureInvalid`] if the DSS signature does
    /// not verify, or [`PubSubError::Malformed`] if the record's public key
    /// does not match this identity's own key (a DSS cannot reassign a
    /// publisher's keypair, only re-attest it).
    pub fn renew(&self, new_record: IdentityRecord, dss_public_key_pem: &str) -> Result<()> {
        let signature = base64_decode(&new_record.signature)
            .map_err(|e| PubSubError::Malformed(format!("invalid DSS signature encoding: {e}")))?;
        crate::crypto::verify(
            &new_record.signing_payload(),
            &signature,
            dss_public_key_pem,
            &new_record.issuer,
        )?;

        let our_key = self.keypair.public_key_pem()?;
        if new_record.public_key_pem != our_key {
            return Err(PubSubError::Malformed(
                "DSS-issued record targets a different public key".to_string(),
            ));
        }

        *self.record.write().expect("identity record poisoned") = new_record;
        Ok(())
    }
}

/// Maps a publisher ID to the public key from its last-seen `$identity`
/// record, backing signature verification for both discovery messages and
/// the input-source multiplexer.
#[derive(Debug, Default)]
pub struct IdentityDirectory {
    keys: RwLock<HashMap<String, String>>,
}

impl IdentityDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or replace) the public key published by `publisher_id`.
    pub fn observe(&self, publisher_id: &str, public_key_pem: String) {
        self.keys
            .write()
            .expect("identity directory poisoned")
            .insert(publisher_id.to_string(), public_key_pem);
    }

    /// Remove a publisher's key, e.g. after its identity is revoked.
    pub fn forget(&self, publisher_id: &str) {
        self.keys
            .write()
            .expect("identity directory poisoned")
            .remove(publisher_id);
    }
}

impl PublicKeyLookup for IdentityDirectory {
    fn public_key_pem(&self, sender: &str) -> Option<String> {
        self.keys
            .read()
            .expect("identity directory poisoned")
            .get(sender)
            .cloned()
    }
}

pub(crate) fn now_iso8601() -> String {
    // Duration::from(SystemTime) gives seconds/millis since epoch without
    // chrono; formatted as the wire's fixed-width ISO-8601 with a literal
    // UTC offset, matching the `%Y-%m-%dT%H:%M:%S%.3f%z` shape other
    // timestamps on the wire use.
    let since_epoch = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let total_millis = since_epoch.as_millis();
    let secs = total_millis / 1000;
    let millis = total_millis % 1000;
    let days = secs / 86400;
    let time_of_day = secs % 86400;
    let (hours, minutes, seconds) = (time_of_day / 3600, (time_of_day % 3600) / 60, time_of_day % 60);
    let (year, month, day) = civil_from_days(days as i64);
    format!(
        "{year:04}-{month:02}-{day:02}T{hours:02}:{minutes:02}:{seconds:02}.{millis:03}+0000"
    )
}

/// Howard Hinnant's `civil_from_days` algorithm, avoiding a chrono
/// dependency for the one place this crate needs epoch-days -> Y/M/D.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

fn atomic_write(path: &std::path::Path, contents: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, contents)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn base64_decode(s: &str) -> std::result::Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            domain: "test".to_string(),
            publisher_id: "pub1".to_string(),
            persist_folder: dir.to_path_buf(),
            ..Config::default()
        }
    }

    #[test]
    fn load_or_create_generates_fresh_identity_on_first_start() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let identity = Identity::load_or_create(&config).unwrap();
        let record = identity.record();
        assert_eq!(record.publisher_id, "pub1");
        assert_eq!(record.issuer, "pub1");
        assert!(config.identity_path().exists());
        assert!(config.private_key_path().exists());
    }

    #[test]
    fn self_signed_record_verifies_against_its_own_key() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let identity = Identity::load_or_create(&config).unwrap();
        let record = identity.record();
        let signature = base64_decode(&record.signature).unwrap();
        assert!(crate::crypto::verify(
            &record.signing_payload(),
            &signature,
            &record.public_key_pem,
            &record.issuer
        )
        .is_ok());
    }

    #[test]
    fn load_or_create_reloads_persisted_identity_on_second_start() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let first = Identity::load_or_create(&config).unwrap();
        let second = Identity::load_or_create(&config).unwrap();
        assert_eq!(
            first.keypair().public_key_pem().unwrap(),
            second.keypair().public_key_pem().unwrap()
        );
    }

    #[test]
    fn renew_rejects_record_for_a_different_key() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let identity = Identity::load_or_create(&config).unwrap();

        let dss = Keypair::generate().unwrap();
        let impostor_key = Keypair::generate().unwrap();
        let mut bogus_record = identity.record();
        bogus_record.public_key_pem = impostor_key.public_key_pem().unwrap();
        bogus_record.issuer = "dss".to_string();
        let signature = dss.sign(&bogus_record.signing_payload()).unwrap();
        bogus_record.signature = base64_encode(&signature);

        let dss_pem = dss.public_key_pem().unwrap();
        assert!(identity.renew(bogus_record, &dss_pem).is_err());
    }

    #[test]
    fn renew_accepts_properly_signed_matching_record() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let identity = Identity::load_or_create(&config).unwrap();

        let dss = Keypair::generate().unwrap();
        let mut record = identity.record();
        record.issuer = "dss".to_string();
        record.valid_until = "2030-01-01T00:00:00.000+0000".to_string();
        let signature = dss.sign(&record.signing_payload()).unwrap();
        record.signature = base64_encode(&signature);

        let dss_pem = dss.public_key_pem().unwrap();
        identity.renew(record.clone(), &dss_pem).unwrap();
        assert_eq!(identity.record().issuer, "dss");
    }

    #[test]
    fn identity_directory_round_trips_observed_keys() {
        let directory = IdentityDirectory::new();
        directory.observe("pub1", "pem-data".to_string());
        assert_eq!(
            PublicKeyLookup::public_key_pem(&directory, "pub1"),
            Some("pem-data".to_string())
        );
        directory.forget("pub1");
        assert_eq!(PublicKeyLookup::public_key_pem(&directory, "pub1"), None);
    }

    #[test]
    fn civil_from_days_matches_known_epoch_date() {
        // Day 0 since the Unix epoch is 1970-01-01.
        assert_eq!(civil_from_days(0), (1970, 1, 1));
    }
}
