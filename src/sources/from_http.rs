//! `FromHTTP`: per-input poll sources fed by a single 1-second ticker.

use crate::registered::RegisteredInputs;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One input's HTTP polling configuration.
#[derive(Debug, Clone)]
pub struct HttpSource {
    pub url: String,
    /// HTTP Basic credentials. Never logged.
    pub basic_auth: Option<(String, String)>,
    pub poll_interval_secs: u64,
}

struct Countdown {
    source: HttpSource,
    remaining_secs: u64,
}

/// Drives every registered HTTP input from one 1-second ticker, spawning a
/// short-lived worker per expired countdown rather than one task per input.
pub struct FromHttp {
    inputs: Arc<RegisteredInputs>,
    client: reqwest::Client,
    records: Mutex<HashMap<String, Countdown>>,
}

impl FromHttp {
    #[must_use]
    pub fn new(inputs: Arc<RegisteredInputs>) -> Arc<Self> {
        Arc::new(Self {
            inputs,
            client: reqwest::Client::new(),
            records: Mutex::new(HashMap::new()),
        })
    }

    /// Register (or replace) the HTTP source for `input_id`.
    pub fn register(&self, input_id: &str, source: HttpSource) {
        let remaining_secs = source.poll_interval_secs.max(1);
        self.records
            .lock()
            .expect("http records poisoned")
            .insert(input_id.to_string(), Countdown { source, remaining_secs });
    }

    pub fn unregister(&self, input_id: &str) {
        self.records.lock().expect("http records poisoned").remove(input_id);
    }

    /// Advance every countdown by one second; any that reach zero are reset
    /// and polled on a background worker.
    fn tick(&self) {
        let due: Vec<(String, HttpSource)> = {
            let mut records = self.records.lock().expect("http records poisoned");
            let mut due = Vec::new();
            for (input_id, countdown) in records.iter_mut() {
                if countdown.remaining_secs == 0 {
                    due.push((input_id.clone(), countdown.source.clone()));
                    countdown.remaining_secs = countdown.source.poll_interval_secs.max(1);
                } else {
                    countdown.remaining_secs -= 1;
                }
            }
            due
        };

        for (input_id, source) in due {
            let inputs = self.inputs.clone();
            let client = self.client.clone();
            tokio::spawn(async move {
                Self::poll_once(&inputs, &client, &input_id, &source).await;
            });
        }
    }

    async fn poll_once(
        inputs: &RegisteredInputs,
        client: &reqwest::Client,
        input_id: &str,
        source: &HttpSource,
    ) {
        let mut request = client.get(&source.url);
        if let Some((user, password)) = &source.basic_auth {
            request = request.basic_auth(user, Some(password));
        }

        let started = std::time::Instant::now();
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(input_id, error = %e, "http source request failed");
                return;
            }
        };

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(input_id, %status, "http source returned non-2xx");
            return;
        }

        match response.text().await {
            Ok(body) => {
                tracing::debug!(input_id, latency_ms = started.elapsed().as_millis() as u64, "http source polled");
                inputs.notify_input_handler(input_id, "", &body);
            }
            Err(e) => tracing::warn!(input_id, error = %e, "http source body read failed"),
        }
    }

    /// Run the 1-second ticker until the runtime drops this source.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            self.tick();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{DataType, Input};

    #[test]
    fn register_and_unregister_round_trip() {
        let inputs = Arc::new(RegisteredInputs::new("test", "pub1"));
        inputs
            .create(Input::new("n1", "n1", "temp", "0", DataType::Number), None)
            .unwrap();
        let source = FromHttp::new(inputs);
        source.register(
            "n1.temp.0",
            HttpSource {
                url: "http://example.invalid/temp".to_string(),
                basic_auth: None,
                poll_interval_secs: 30,
            },
        );
        assert_eq!(source.records.lock().unwrap().len(), 1);
        source.unregister("n1.temp.0");
        assert_eq!(source.records.lock().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn tick_decrements_and_resets_expired_countdowns() {
        let inputs = Arc::new(RegisteredInputs::new("test", "pub1"));
        let source = FromHttp::new(inputs);
        source.register(
            "n1.temp.0",
            HttpSource {
                url: "http://example.invalid/temp".to_string(),
                basic_auth: None,
                poll_interval_secs: 2,
            },
        );
        source.tick();
        assert_eq!(
            source.records.lock().unwrap().get("n1.temp.0").unwrap().remaining_secs,
            1
        );
        source.tick();
        // Reset to poll_interval_secs and a poll worker was spawned.
        assert_eq!(
            source.records.lock().unwrap().get("n1.temp.0").unwrap().remaining_secs,
            2
        );
    }
}
