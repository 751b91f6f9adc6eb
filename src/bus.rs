//! The message-bus adapter boundary.
//!
//! Any bus that offers topic-filter subscription with `+`/`#` wildcards and
//! retained-message semantics (as in MQTT v3.1) satisfies this interface.
//! [`MqttBus`] adapts a real broker connection via `rumqttc`; [`InMemoryBus`]
//! is an in-process test double used throughout this crate's test suite so
//! it does not need a running broker.

use crate::error::{PubSubError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

/// A single message delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retained: bool,
}

/// A live subscription. Dropping it unsubscribes from the underlying bus.
pub struct Subscription {
    pub topic_filter: String,
    receiver: mpsc::Receiver<BusMessage>,
    bus: Arc<dyn BusAdapter>,
}

impl Subscription {
    /// Await the next message on this subscription.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.receiver.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let bus = self.bus.clone();
        let topic_filter = self.topic_filter.clone();
        tokio::spawn(async move {
            let _ = bus.unsubscribe(&topic_filter).await;
        });
    }
}

/// Minimum bus-adapter interface: connect with a last-will, publish with an
/// optional retained flag, and subscribe/unsubscribe to wildcard topic
/// filters (`+` for a single segment, `#` for a trailing multi-segment
/// match).
#[async_trait]
pub trait BusAdapter: Send + Sync {
    /// Mark the start of this client's session. For adapters whose
    /// underlying protocol requires the last-will to be registered before
    /// the transport handshake (MQTT), `last_will_topic`/`last_will_payload`
    /// are accepted for signature symmetry but the true registration
    /// already happened at construction time — see
    /// [`MqttBus::connect_mqtt`]. Adapters without that constraint (e.g.
    /// [`InMemoryBus`]) may ignore both arguments.
    async fn connect(&self, last_will_topic: &str, last_will_payload: &[u8]) -> Result<()>;

    /// Disconnect cleanly. Does not publish the last-will message.
    async fn disconnect(&self) -> Result<()>;

    /// Publish `payload` to `topic`, optionally retained.
    async fn publish(&self, topic: &str, retained: bool, payload: Vec<u8>) -> Result<()>;

    /// Subscribe to a topic filter, returning a [`Subscription`] that
    /// yields matching messages until dropped.
    async fn subscribe(self: Arc<Self>, topic_filter: &str) -> Result<Subscription>;

    /// Unsubscribe a topic filter. Idempotent.
    async fn unsubscribe(&self, topic_filter: &str) -> Result<()>;
}

/// Returns `true` if `topic` matches the MQTT-style `topic_filter`
/// (`+` matches exactly one segment, a trailing `#` matches the remainder).
#[must_use]
pub fn topic_matches(topic_filter: &str, topic: &str) -> bool {
    let filter_segments: Vec<&str> = topic_filter.split('/').collect();
    let topic_segments: Vec<&str> = topic.split('/').collect();

    for (i, filter_segment) in filter_segments.iter().enumerate() {
        if *filter_segment == "#" {
            return true;
        }
        let Some(topic_segment) = topic_segments.get(i) else {
            return false;
        };
        if *filter_segment != "+" && *filter_segment != *topic_segment {
            return false;
        }
    }
    filter_segments.len() == topic_segments.len()
}

type Registry = Arc<AsyncMutex<HashMap<String, Vec<mpsc::Sender<BusMessage>>>>>;

/// In-process bus used by tests and by synchronous-mode examples. Publishing
/// fans a message out to every subscription whose filter matches, exactly
/// like a real broker would, without needing a network connection.
#[derive(Default)]
pub struct InMemoryBus {
    subscriptions: Registry,
    retained: AsyncMutex<HashMap<String, BusMessage>>,
}

impl InMemoryBus {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl BusAdapter for InMemoryBus {
    async fn connect(&self, _last_will_topic: &str, _last_will_payload: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn publish(&self, topic: &str, retained: bool, payload: Vec<u8>) -> Result<()> {
        let message = BusMessage {
            topic: topic.to_string(),
            payload,
            retained,
        };
        if retained {
            self.retained
                .lock()
                .await
                .insert(topic.to_string(), message.clone());
        }
        let subscriptions = self.subscriptions.lock().await;
        for (filter, senders) in subscriptions.iter() {
            if topic_matches(filter, topic) {
                for sender in senders {
                    let _ = sender.send(message.clone()).await;
                }
            }
        }
        Ok(())
    }

    async fn subscribe(self: Arc<Self>, topic_filter: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(64);
        {
            let mut subscriptions = self.subscriptions.lock().await;
            subscriptions
                .entry(topic_filter.to_string())
                .or_default()
                .push(tx.clone());
        }
        let retained = self.retained.lock().await;
        for (topic, message) in retained.iter() {
            if topic_matches(topic_filter, topic) {
                let _ = tx.send(message.clone()).await;
            }
        }
        drop(retained);
        Ok(Subscription {
            topic_filter: topic_filter.to_string(),
            receiver: rx,
            bus: self,
        })
    }

    async fn unsubscribe(&self, topic_filter: &str) -> Result<()> {
        self.subscriptions.lock().await.remove(topic_filter);
        Ok(())
    }
}

/// Adapter over a real MQTT broker connection via `rumqttc`.
pub struct MqttBus {
    client: rumqttc::AsyncClient,
    subscriptions: Registry,
}

impl MqttBus {
    /// Connect to `host:port` as `client_id`, spawning a background task
    /// that drains the `rumqttc` event loop and fans incoming publishes out
    /// to matching subscriptions. Registers `last_will_topic`/
    /// `last_will_payload` as a genuine broker-side last will, so the
    /// broker publishes it (retained) if this client disconnects
    /// uncleanly — `rumqttc` requires this to be set before the CONNECT
    /// handshake, hence before [`Self::connect`] is ever called.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::BusUnavailable`] if the initial connection
    /// cannot be established.
    pub async fn connect_mqtt(
        client_id: &str,
        host: &str,
        port: u16,
        login: Option<&str>,
        password: Option<&str>,
        use_tls: bool,
        last_will_topic: &str,
        last_will_payload: &[u8],
    ) -> Result<Arc<Self>> {
        let mut options = rumqttc::MqttOptions::new(client_id, host, port);
        options.set_keep_alive(std::time::Duration::from_secs(30));
        if let (Some(login), Some(password)) = (login, password) {
            options.set_credentials(login, password);
        }
        if use_tls {
            options.set_transport(rumqttc::Transport::Tls(rumqttc::TlsConfiguration::Native));
        }
        options.set_last_will(rumqttc::LastWill::new(
            last_will_topic,
            last_will_payload.to_vec(),
            rumqttc::QoS::AtLeastOnce,
            true,
        ));

        let (client, mut event_loop) = rumqttc::AsyncClient::new(options, 64);
        let subscriptions: Registry = Arc::new(AsyncMutex::new(HashMap::new()));

        let loop_subscriptions = subscriptions.clone();
        tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(rumqttc::Event::Incoming(rumqttc::Packet::Publish(publish))) => {
                        let message = BusMessage {
                            topic: publish.topic.clone(),
                            payload: publish.payload.to_vec(),
                            retained: publish.retain,
                        };
                        let subs = loop_subscriptions.lock().await;
                        for (filter, senders) in subs.iter() {
                            if topic_matches(filter, &message.topic) {
                                for sender in senders {
                                    let _ = sender.send(message.clone()).await;
                                }
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "mqtt event loop error, retrying");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok(Arc::new(Self {
            client,
            subscriptions,
        }))
    }
}

#[async_trait]
impl BusAdapter for MqttBus {
    async fn connect(&self, _last_will_topic: &str, _last_will_payload: &[u8]) -> Result<()> {
        // The broker-side last will was already registered in
        // `connect_mqtt` via `MqttOptions::set_last_will`, before the
        // CONNECT handshake. Nothing left to do here.
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.client
            .disconnect()
            .await
            .map_err(|e| PubSubError::BusUnavailable(e.to_string()))
    }

    async fn publish(&self, topic: &str, retained: bool, payload: Vec<u8>) -> Result<()> {
        self.client
            .publish(topic, rumqttc::QoS::AtLeastOnce, retained, payload)
            .await
            .map_err(|e| PubSubError::BusUnavailable(e.to_string()))
    }

    async fn subscribe(self: Arc<Self>, topic_filter: &str) -> Result<Subscription> {
        self.client
            .subscribe(topic_filter, rumqttc::QoS::AtLeastOnce)
            .await
            .map_err(|e| PubSubError::BusUnavailable(e.to_string()))?;
        let (tx, rx) = mpsc::channel(64);
        self.subscriptions
            .lock()
            .await
            .entry(topic_filter.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription {
            topic_filter: topic_filter.to_string(),
            receiver: rx,
            bus: self,
        })
    }

    async fn unsubscribe(&self, topic_filter: &str) -> Result<()> {
        self.subscriptions.lock().await.remove(topic_filter);
        self.client
            .unsubscribe(topic_filter)
            .await
            .map_err(|e| PubSubError::BusUnavailable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plus_matches_single_segment() {
        assert!(topic_matches("test/pub1/+/$node", "test/pub1/n1/$node"));
        assert!(!topic_matches("test/pub1/+/$node", "test/pub1/n1/x/$node"));
    }

    #[test]
    fn hash_matches_trailing_segments() {
        assert!(topic_matches("test/pub1/#", "test/pub1/n1/switch/0/$set"));
        assert!(topic_matches("test/pub1/#", "test/pub1/n1"));
    }

    #[test]
    fn exact_match_requires_equal_length() {
        assert!(!topic_matches("test/pub1/n1/$node", "test/pub1/n1/$node/extra"));
    }

    #[tokio::test]
    async fn in_memory_bus_delivers_to_matching_subscriber() {
        let bus = InMemoryBus::new();
        let mut sub = bus.clone().subscribe("test/pub1/+/$node").await.unwrap();
        bus.publish("test/pub1/n1/$node", false, b"hello".to_vec())
            .await
            .unwrap();
        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.topic, "test/pub1/n1/$node");
        assert_eq!(msg.payload, b"hello");
    }

    #[tokio::test]
    async fn in_memory_bus_replays_retained_message_to_new_subscriber() {
        let bus = InMemoryBus::new();
        bus.publish("test/pub1/$lwt", true, b"connected".to_vec())
            .await
            .unwrap();
        let mut sub = bus.clone().subscribe("test/pub1/$lwt").await.unwrap();
        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.payload, b"connected");
        assert!(msg.retained);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = InMemoryBus::new();
        bus.unsubscribe("test/pub1/+/$node").await.unwrap();
        bus.publish("test/pub1/n1/$node", false, b"x".to_vec())
            .await
            .unwrap();
        // No subscriber registered; publish should simply be a no-op.
    }
}
