//! Output publication (§4.7): `update_output_value` maintains a bounded
//! history ring and enqueues `$latest`; `$history`/`$forecast`/`$batch` are
//! shaped from the ring or adapter-supplied lists — this module only
//! handles framing, signing, and publication.

use crate::address::MessageType;
use crate::bus::BusAdapter;
use crate::crypto::Keypair;
use crate::envelope;
use crate::error::{PubSubError, Result};
use crate::identity::now_iso8601;
use crate::registered::RegisteredOutputs;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Default capacity of the per-output history ring.
pub const DEFAULT_HISTORY_CAPACITY: usize = 24;

/// One recorded value in an output's history ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub timestamp: String,
    pub value: String,
    /// Unix epoch seconds, redundant with `timestamp` but convenient for
    /// consumers that don't want to parse ISO-8601.
    pub epoch: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LatestMessage {
    address: String,
    timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit: Option<String>,
    value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EventMessage {
    address: String,
    timestamp: String,
    value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HistoryMessage {
    address: String,
    duration: String,
    history: Vec<HistoryPoint>,
    timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ForecastMessage {
    address: String,
    duration: String,
    forecast: Vec<HistoryPoint>,
    timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BatchMessage {
    address: String,
    batch: Vec<HistoryPoint>,
    timestamp: String,
}

/// Owns every registered output's history ring and publishes `$latest`,
/// `$event`, `$history`, `$forecast`, and `$batch` messages on their behalf.
pub struct OutputManager {
    outputs: Arc<RegisteredOutputs>,
    bus: Arc<dyn BusAdapter>,
    keypair: Arc<Keypair>,
    domain: String,
    publisher_id: String,
    history: Mutex<HashMap<String, VecDeque<HistoryPoint>>>,
    capacity: usize,
}

impl OutputManager {
    #[must_use]
    pub fn new(
        domain: impl Into<String>,
        publisher_id: impl Into<String>,
        outputs: Arc<RegisteredOutputs>,
        bus: Arc<dyn BusAdapter>,
        keypair: Arc<Keypair>,
    ) -> Self {
        Self::with_capacity(domain, publisher_id, outputs, bus, keypair, DEFAULT_HISTORY_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(
        domain: impl Into<String>,
        publisher_id: impl Into<String>,
        outputs: Arc<RegisteredOutputs>,
        bus: Arc<dyn BusAdapter>,
        keypair: Arc<Keypair>,
        capacity: usize,
    ) -> Self {
        Self {
            outputs,
            bus,
            keypair,
            domain: domain.into(),
            publisher_id: publisher_id.into(),
            history: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Record `value` into `output_id`'s history ring and publish a signed,
    /// retained `$latest` message.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::NotFound`] if `output_id` is not registered,
    /// or [`PubSubError::BusUnavailable`] if publication fails.
    pub async fn update_output_value(&self, output_id: &str, value: &str, unit: Option<&str>) -> Result<()> {
        let output = self
            .outputs
            .get(output_id)
            .ok_or_else(|| PubSubError::NotFound(output_id.to_string()))?;
        let timestamp = now_iso8601();

        self.push_history(output_id, value, &timestamp);

        let address = output.address(&self.domain, &self.publisher_id, MessageType::Latest);
        let message = LatestMessage {
            address: address.to_string(),
            timestamp,
            unit: unit.map(str::to_string),
            value: value.to_string(),
        };
        self.publish_signed(&address.to_string(), &message, true).await
    }

    /// Publish a signed, non-retained `$event` message without touching the
    /// history ring.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::NotFound`] if `output_id` is not registered,
    /// or [`PubSubError::BusUnavailable`] if publication fails.
    pub async fn publish_event(&self, output_id: &str, value: &str) -> Result<()> {
        let output = self
            .outputs
            .get(output_id)
            .ok_or_else(|| PubSubError::NotFound(output_id.to_string()))?;
        let address = output.address(&self.domain, &self.publisher_id, MessageType::Event);
        let message = EventMessage {
            address: address.to_string(),
            timestamp: now_iso8601(),
            value: value.to_string(),
        };
        self.publish_signed(&address.to_string(), &message, false).await
    }

    /// A snapshot of `output_id`'s current history ring, oldest first.
    #[must_use]
    pub fn get_history(&self, output_id: &str) -> Vec<HistoryPoint> {
        self.history
            .lock()
            .expect("history poisoned")
            .get(output_id)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Publish the current history ring as a signed `$history` message.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::NotFound`] if `output_id` is not registered,
    /// or [`PubSubError::BusUnavailable`] if publication fails.
    pub async fn publish_history(&self, output_id: &str, duration: &str) -> Result<()> {
        let output = self
            .outputs
            .get(output_id)
            .ok_or_else(|| PubSubError::NotFound(output_id.to_string()))?;
        let address = output.address(&self.domain, &self.publisher_id, MessageType::History);
        let message = HistoryMessage {
            address: address.to_string(),
            duration: duration.to_string(),
            history: self.get_history(output_id),
            timestamp: now_iso8601(),
            unit: output.unit.clone(),
        };
        self.publish_signed(&address.to_string(), &message, false).await
    }

    /// Publish an adapter-supplied forecast as a signed `$forecast` message.
    /// This module only frames, signs, and publishes — the forecast values
    /// themselves come from the caller.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::NotFound`] if `output_id` is not registered,
    /// or [`PubSubError::BusUnavailable`] if publication fails.
    pub async fn publish_forecast(
        &self,
        output_id: &str,
        duration: &str,
        forecast: Vec<HistoryPoint>,
    ) -> Result<()> {
        let output = self
            .outputs
            .get(output_id)
            .ok_or_else(|| PubSubError::NotFound(output_id.to_string()))?;
        let address = output.address(&self.domain, &self.publisher_id, MessageType::Forecast);
        let message = ForecastMessage {
            address: address.to_string(),
            duration: duration.to_string(),
            forecast,
            timestamp: now_iso8601(),
            unit: output.unit.clone(),
        };
        self.publish_signed(&address.to_string(), &message, false).await
    }

    /// Publish an adapter-supplied batch as a signed `$batch` message.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::NotFound`] if `output_id` is not registered,
    /// or [`PubSubError::BusUnavailable`] if publication fails.
    pub async fn publish_batch(&self, output_id: &str, batch: Vec<HistoryPoint>) -> Result<()> {
        let output = self
            .outputs
            .get(output_id)
            .ok_or_else(|| PubSubError::NotFound(output_id.to_string()))?;
        let address = output.address(&self.domain, &self.publisher_id, MessageType::Batch);
        let message = BatchMessage {
            address: address.to_string(),
            batch,
            timestamp: now_iso8601(),
        };
        self.publish_signed(&address.to_string(), &message, false).await
    }

    fn push_history(&self, output_id: &str, value: &str, timestamp: &str) {
        let epoch = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let mut history = self.history.lock().expect("history poisoned");
        let ring = history.entry(output_id.to_string()).or_default();
        ring.push_back(HistoryPoint {
            timestamp: timestamp.to_string(),
            value: value.to_string(),
            epoch,
        });
        while ring.len() > self.capacity {
            ring.pop_front();
        }
    }

    async fn publish_signed(
        &self,
        address: &str,
        message: &impl Serialize,
        retained: bool,
    ) -> Result<()> {
        let json = serde_json::to_string(message)?;
        let envelope = envelope::sign(json, &self.keypair);
        let payload = serde_json::to_vec(&envelope)?;
        self.bus.publish(address, retained, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::entities::{DataType, Output};

    fn setup() -> (OutputManager, Arc<InMemoryBus>) {
        let outputs = Arc::new(RegisteredOutputs::new("test", "pub1"));
        outputs
            .create(Output::new("n1", "n1", "temp", "0", DataType::Number))
            .unwrap();
        let bus = InMemoryBus::new();
        let keypair = Arc::new(Keypair::generate().unwrap());
        let manager = OutputManager::with_capacity("test", "pub1", outputs, bus.clone(), keypair, 3);
        (manager, bus)
    }

    #[tokio::test]
    async fn update_output_value_publishes_retained_latest() {
        let (manager, bus) = setup();
        let mut sub = bus.clone().subscribe("test/pub1/n1/temp/0/$latest").await.unwrap();
        manager.update_output_value("n1.temp.0", "21.5", Some("C")).await.unwrap();
        let msg = sub.recv().await.unwrap();
        assert!(msg.retained);
        let envelope: crate::envelope::Envelope = serde_json::from_slice(&msg.payload).unwrap();
        let latest: LatestMessage = serde_json::from_str(&envelope.message).unwrap();
        assert_eq!(latest.value, "21.5");
        assert_eq!(latest.unit, Some("C".to_string()));
    }

    #[tokio::test]
    async fn history_ring_respects_capacity() {
        let (manager, _bus) = setup();
        for v in ["1", "2", "3", "4"] {
            manager.update_output_value("n1.temp.0", v, None).await.unwrap();
        }
        let history = manager.get_history("n1.temp.0");
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].value, "2");
        assert_eq!(history[2].value, "4");
    }

    #[tokio::test]
    async fn update_unknown_output_fails_not_found() {
        let (manager, _bus) = setup();
        let err = manager.update_output_value("missing", "1", None).await.unwrap_err();
        assert!(matches!(err, PubSubError::NotFound(_)));
    }

    #[tokio::test]
    async fn publish_history_frames_current_ring() {
        let (manager, bus) = setup();
        let mut sub = bus.clone().subscribe("test/pub1/n1/temp/0/$history").await.unwrap();
        manager.update_output_value("n1.temp.0", "21.5", None).await.unwrap();
        manager.publish_history("n1.temp.0", "1h").await.unwrap();
        let msg = sub.recv().await.unwrap();
        let envelope: crate::envelope::Envelope = serde_json::from_slice(&msg.payload).unwrap();
        let history: HistoryMessage = serde_json::from_str(&envelope.message).unwrap();
        assert_eq!(history.history.len(), 1);
        assert_eq!(history.duration, "1h");
    }
}
