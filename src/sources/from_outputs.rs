//! `FromOutputs`: an input fed by another publisher's output, either via a
//! verbatim `$raw` pass-through or a verified `$latest` message.

use crate::address::Address;
use crate::bus::BusAdapter;
use crate::envelope::{verify_signed_message, Envelope, PublicKeyLookup};
use crate::error::Result;
use crate::registered::RegisteredInputs;
use crate::replay::ReplayTable;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Decoded `$latest` payload published by an output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputLatestMessage {
    pub address: String,
    pub timestamp: String,
    #[serde(default)]
    pub unit: Option<String>,
    pub value: String,
}

/// Subscribes one input to another publisher's output address.
pub struct FromOutputs {
    inputs: Arc<RegisteredInputs>,
    keys: Arc<dyn PublicKeyLookup>,
    replay: ReplayTable,
}

impl FromOutputs {
    #[must_use]
    pub fn new(inputs: Arc<RegisteredInputs>, keys: Arc<dyn PublicKeyLookup>) -> Arc<Self> {
        Arc::new(Self {
            inputs,
            keys,
            replay: ReplayTable::new(),
        })
    }

    /// Subscribe `input_id` to `output_address` (a full publication address
    /// ending in `$raw` or `$latest`), dispatching on a background worker.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::PubSubError::BusUnavailable`] if the
    /// subscription cannot be established.
    pub async fn subscribe(
        self: &Arc<Self>,
        bus: Arc<dyn BusAdapter>,
        input_id: String,
        output_address: String,
    ) -> Result<()> {
        let mut subscription = bus.subscribe(&output_address).await?;
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(message) = subscription.recv().await {
                this.handle_message(&input_id, &output_address, &message.payload);
            }
        });
        Ok(())
    }

    /// Process a single delivery from a subscribed output address.
    pub fn handle_message(&self, input_id: &str, output_address: &str, payload: &[u8]) {
        if output_address.ends_with("$raw") {
            let value = String::from_utf8_lossy(payload).to_string();
            self.inputs.notify_input_handler(input_id, output_address, &value);
            return;
        }

        if !output_address.ends_with("$latest") {
            return;
        }

        let Some(address) = Address::parse(output_address) else {
            tracing::warn!(output_address, "malformed output address");
            return;
        };

        let envelope: Envelope = match serde_json::from_slice(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(output_address, error = %e, "malformed latest envelope");
                return;
            }
        };

        let verified = match verify_signed_message(&envelope, &address.publisher_id, self.keys.as_ref()) {
            Ok(verified) => verified,
            Err(e) => {
                tracing::warn!(output_address, error = %e, "dropping unverifiable latest message");
                return;
            }
        };
        if !verified.is_signed {
            tracing::warn!(output_address, "dropping unsigned latest message");
            return;
        }

        let latest: OutputLatestMessage = match serde_json::from_str(&verified.message) {
            Ok(latest) => latest,
            Err(e) => {
                tracing::warn!(output_address, error = %e, "malformed latest payload");
                return;
            }
        };

        if !self.replay.check_and_record(output_address, &latest.timestamp) {
            tracing::warn!(output_address, "dropping replayed latest message");
            return;
        }

        self.inputs.notify_input_handler(input_id, output_address, &latest.value);
    }
}
