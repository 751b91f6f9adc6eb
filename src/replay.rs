//! Per-sender monotonic timestamp table used for replay defence.
//!
//! Every signed message carries an ISO-8601 timestamp. For a given sender
//! (or sender-address, depending on the caller), only messages with a
//! strictly greater timestamp than the last accepted one are let through.

use std::collections::HashMap;
use std::sync::Mutex;

/// Timestamp format used on the wire: ISO-8601 with milliseconds and a
/// signed offset, e.g. `2006-01-02T15:04:05.000-0700`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f%z";

/// Tracks the latest accepted timestamp per sender key.
#[derive(Debug, Default)]
pub struct ReplayTable {
    last_accepted: Mutex<HashMap<String, String>>,
}

impl ReplayTable {
    /// Create an empty replay table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Check and record `timestamp` for `key`. Returns `true` if the
    /// message should be accepted (timestamp strictly greater than the
    /// last one recorded for this key), recording it as the new high-water
    /// mark in that case. Returns `false` without recording otherwise.
    ///
    /// Timestamps compare lexicographically against the fixed-width
    /// ISO-8601 wire format, which sorts identically to chronological
    /// order for a fixed offset; see [`TIMESTAMP_FORMAT`].
    pub fn check_and_record(&self, key: &str, timestamp: &str) -> bool {
        let mut table = self.last_accepted.lock().expect("replay table poisoned");
        match table.get(key) {
            Some(last) if timestamp.as_bytes() <= last.as_bytes() => false,
            _ => {
                table.insert(key.to_string(), timestamp.to_string());
                true
            }
        }
    }

    /// The last accepted timestamp for `key`, if any.
    #[must_use]
    pub fn last_accepted(&self, key: &str) -> Option<String> {
        self.last_accepted
            .lock()
            .expect("replay table poisoned")
            .get(key)
            .cloned()
    }

    /// Drop the recorded timestamp for `key`, e.g. when a sender's
    /// identity is revoked and its history should no longer gate anything.
    pub fn forget(&self, key: &str) {
        self.last_accepted
            .lock()
            .expect("replay table poisoned")
            .remove(key);
    }
}
