//! The Publisher Runtime (§4.6): state machine, discovery/poll tickers, and
//! the `Start`/`Stop` lifecycle tying every other module together.

use crate::address::{Address, MessageType};
use crate::bus::BusAdapter;
use crate::config::Config;
use crate::domain::{DomainInputs, DomainNodes, DomainOutputs};
use crate::entities::{ConfigAttr, DataType, Node};
use crate::envelope;
use crate::error::Result;
use crate::identity::{now_iso8601, Identity, IdentityDirectory, IdentityRecord};
use crate::output::OutputManager;
use crate::registered::RegisteredEntities;
use crate::sources::{FromFiles, FromHttp, FromOutputs, FromSetCommands};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};

/// Publisher lifecycle state (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Created,
    Initializing,
    Running,
    Reconfiguring,
    Stopping,
    Stopped,
}

type Hook = Arc<dyn Fn() + Send + Sync>;

/// Builds a [`Publisher`], wiring identity, registered/domain collections,
/// the input-source multiplexer, and output publication over a chosen bus.
pub struct PublisherBuilder {
    config: Config,
    bus: Arc<dyn BusAdapter>,
    synchronous: bool,
    on_discover: Option<Hook>,
    on_poll: Option<Hook>,
}

impl PublisherBuilder {
    #[must_use]
    pub fn new(config: Config, bus: Arc<dyn BusAdapter>) -> Self {
        Self {
            config,
            bus,
            synchronous: false,
            on_discover: None,
            on_poll: None,
        }
    }

    /// In synchronous mode the discovery/poll tickers are not spawned;
    /// callers drive [`Publisher::flush_discovery`] explicitly. Intended for
    /// tests and for adapters that want deterministic publication timing.
    #[must_use]
    pub fn synchronous(mut self, synchronous: bool) -> Self {
        self.synchronous = synchronous;
        self
    }

    #[must_use]
    pub fn on_discover(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_discover = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn on_poll(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_poll = Some(Arc::new(hook));
        self
    }

    /// Load or create this publisher's identity and wire every collection.
    /// Does not connect to the bus or publish anything — see
    /// [`Publisher::start`].
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::PubSubError::Io`]/`InvalidKey`/`Serialization`
    /// if the identity cannot be loaded or generated.
    pub fn build(self) -> Result<Arc<Publisher>> {
        let identity = Arc::new(Identity::load_or_create(&self.config)?);
        let keys = Arc::new(IdentityDirectory::new());
        // Identity owns a bare Keypair, not an Arc<Keypair>; the
        // input-source multiplexer and output manager both need shared
        // ownership, so this reloads it from its own PEM rather than
        // restructuring Identity's storage.
        let keypair = Arc::new(
            crate::crypto::Keypair::from_private_pem(&identity.keypair().private_key_pem()?)?,
        );

        let registered = Arc::new(RegisteredEntities::new(
            self.config.domain.clone(),
            self.config.publisher_id.clone(),
        ));

        let from_set = Arc::new(FromSetCommands::new(
            self.config.domain.clone(),
            self.config.publisher_id.clone(),
            registered.inputs.clone(),
            keypair.clone(),
            keys.clone(),
        ));
        let from_http = FromHttp::new(registered.inputs.clone());
        let from_files = FromFiles::new(registered.inputs.clone());
        let from_outputs = FromOutputs::new(registered.inputs.clone(), keys.clone());

        let output_manager = Arc::new(OutputManager::new(
            self.config.domain.clone(),
            self.config.publisher_id.clone(),
            registered.outputs.clone(),
            self.bus.clone(),
            keypair.clone(),
        ));

        Ok(Arc::new(Publisher {
            config: self.config,
            identity,
            keys,
            bus: self.bus,
            registered,
            domain_nodes: Arc::new(DomainNodes::new()),
            domain_inputs: Arc::new(DomainInputs::new()),
            domain_outputs: Arc::new(DomainOutputs::new()),
            from_set,
            from_http,
            from_files,
            from_outputs,
            outputs: output_manager,
            state: Mutex::new(RuntimeState::Created),
            running: Arc::new(AtomicBool::new(false)),
            synchronous: self.synchronous,
            on_discover: self.on_discover,
            on_poll: self.on_poll,
            tasks: Mutex::new(Vec::new()),
        }))
    }
}

#[derive(Serialize)]
struct NodeDiscoveryMessage<'a> {
    address: String,
    attr: &'a HashMap<String, String>,
    config: &'a HashMap<String, ConfigAttr>,
    status: &'a HashMap<String, String>,
    hwid: &'a str,
    node_id: &'a str,
    timestamp: String,
}

#[derive(Serialize)]
struct IoDiscoveryMessage {
    address: String,
    datatype: DataType,
    #[serde(skip_serializing_if = "Option::is_none")]
    enum_values: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<String>,
    timestamp: String,
}

#[derive(Serialize)]
struct LwtMessage {
    address: String,
    status: &'static str,
}

/// Topic and "lost" payload for a publisher's broker-registered last will,
/// computed before any [`Publisher`] exists so callers can hand it to
/// [`crate::bus::MqttBus::connect_mqtt`], which must register the last
/// will before the broker handshake.
///
/// # Errors
///
/// Returns [`crate::error::PubSubError::Serialization`] if payload
/// serialization fails, which cannot happen for this message shape.
pub fn last_will(domain: &str, publisher_id: &str) -> Result<(String, Vec<u8>)> {
    let topic = format!("{domain}/{publisher_id}/$lwt");
    let payload = serde_json::to_vec(&LwtMessage {
        address: topic.clone(),
        status: "lost",
    })?;
    Ok((topic, payload))
}

/// A running (or not-yet-started) publisher: identity, registered and
/// domain collections, the input-source multiplexer, and output
/// publication, all sharing one bus connection.
pub struct Publisher {
    config: Config,
    identity: Arc<Identity>,
    keys: Arc<IdentityDirectory>,
    bus: Arc<dyn BusAdapter>,
    pub registered: Arc<RegisteredEntities>,
    pub domain_nodes: Arc<DomainNodes>,
    pub domain_inputs: Arc<DomainInputs>,
    pub domain_outputs: Arc<DomainOutputs>,
    from_set: Arc<FromSetCommands>,
    pub from_http: Arc<FromHttp>,
    pub from_files: Arc<FromFiles>,
    pub from_outputs: Arc<FromOutputs>,
    pub outputs: Arc<OutputManager>,
    state: Mutex<RuntimeState>,
    running: Arc<AtomicBool>,
    synchronous: bool,
    on_discover: Option<Hook>,
    on_poll: Option<Hook>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Publisher {
    #[must_use]
    pub fn builder(config: Config, bus: Arc<dyn BusAdapter>) -> PublisherBuilder {
        PublisherBuilder::new(config, bus)
    }

    #[must_use]
    pub fn state(&self) -> RuntimeState {
        *self.state.lock().expect("runtime state poisoned")
    }

    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    fn lwt_topic(&self) -> String {
        format!("{}/{}/$lwt", self.config.domain, self.config.publisher_id)
    }

    /// Run the Start sequence: register a bus-level last-will, publish
    /// `$identity` and `$lwt=connected` (both retained), subscribe the
    /// input-source multiplexer's bus-facing components, and begin the
    /// discovery and poll tickers.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::PubSubError::BusUnavailable`] if the initial
    /// connect or publishes fail.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        *self.state.lock().expect("runtime state poisoned") = RuntimeState::Initializing;

        let (lwt_topic, lost) = last_will(&self.config.domain, &self.config.publisher_id)?;
        self.bus.connect(&lwt_topic, &lost).await?;

        self.keys
            .observe(&self.config.publisher_id, self.identity.keypair().public_key_pem()?);
        self.publish_identity().await?;
        self.publish_lwt("connected").await?;

        self.running.store(true, Ordering::SeqCst);

        let mut tasks = self.tasks.lock().expect("tasks poisoned");

        let from_set = self.from_set.clone();
        let bus = self.bus.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = from_set.run(bus).await {
                tracing::warn!(error = %e, "from_set multiplexer stopped");
            }
        }));

        let from_http = self.from_http.clone();
        tasks.push(tokio::spawn(async move {
            from_http.run().await;
        }));

        let this = self.clone();
        let bus = self.bus.clone();
        tasks.push(tokio::spawn(async move {
            this.run_node_discovery(bus).await;
        }));

        let this = self.clone();
        let bus = self.bus.clone();
        tasks.push(tokio::spawn(async move {
            this.run_input_discovery(bus).await;
        }));

        let this = self.clone();
        let bus = self.bus.clone();
        tasks.push(tokio::spawn(async move {
            this.run_output_discovery(bus).await;
        }));

        let this = self.clone();
        let bus = self.bus.clone();
        tasks.push(tokio::spawn(async move {
            this.run_identity_discovery(bus).await;
        }));

        if let Some(dss_public_key_pem) = self.config.dss_public_key_pem.clone() {
            let this = self.clone();
            let bus = self.bus.clone();
            tasks.push(tokio::spawn(async move {
                this.run_dss_renewal(bus, dss_public_key_pem).await;
            }));
        }

        if !self.synchronous {
            let this = self.clone();
            tasks.push(tokio::spawn(async move {
                this.run_discovery_ticker().await;
            }));

            let this = self.clone();
            tasks.push(tokio::spawn(async move {
                this.run_poll_ticker().await;
            }));
        }

        drop(tasks);
        *self.state.lock().expect("runtime state poisoned") = RuntimeState::Running;
        Ok(())
    }

    /// Stop sequence: publish `$lwt=disconnected` (retained), cancel every
    /// background task, and disconnect the bus. Safe to call more than
    /// once; a second call is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::PubSubError::BusUnavailable`] if the final
    /// publish or disconnect fails.
    pub async fn stop(&self) -> Result<()> {
        if self.state() == RuntimeState::Stopped {
            return Ok(());
        }
        *self.state.lock().expect("runtime state poisoned") = RuntimeState::Stopping;
        self.running.store(false, Ordering::SeqCst);

        self.publish_lwt("disconnected").await?;

        for task in self.tasks.lock().expect("tasks poisoned").drain(..) {
            task.abort();
        }

        self.bus.disconnect().await?;
        *self.state.lock().expect("runtime state poisoned") = RuntimeState::Stopped;
        Ok(())
    }

    /// Drain every dirty set and publish discovery/tombstone messages.
    /// Called automatically by the discovery ticker, or directly by callers
    /// that built the publisher in synchronous mode.
    ///
    /// # Errors
    ///
    /// Individual publish failures are logged and the dirty-set entry
    /// survives for the next tick rather than aborting the whole flush; this
    /// returns `Err` only if discovery-message serialization itself fails,
    /// which cannot happen for these message shapes.
    pub async fn flush_discovery(&self) -> Result<()> {
        if let Some(hook) = &self.on_discover {
            hook();
        }

        for (id, marker) in self.registered.nodes.get_updated(true) {
            if marker.is_empty() {
                let address = Address::node(&self.config.domain, &self.config.publisher_id, &id, MessageType::Node);
                self.publish_tombstone(&address.to_string()).await;
                continue;
            }
            let Some(node) = self.registered.nodes.get(&id) else { continue };
            self.publish_node_discovery(&node).await;
        }

        for (id, marker) in self.registered.inputs.get_updated(true) {
            self.flush_io_discovery(&id, &marker, MessageType::Input).await;
        }

        for (id, marker) in self.registered.outputs.get_updated(true) {
            self.flush_io_discovery(&id, &marker, MessageType::Output).await;
        }

        Ok(())
    }

    async fn flush_io_discovery(&self, id: &str, marker: &str, message_type: MessageType) {
        if marker.is_empty() {
            // The entity is already gone; reconstruct its address from the
            // stable ID alone (hwid.ioType.instance). This only matches the
            // last-published topic when the owning node was never renamed —
            // a known gap, see DESIGN.md.
            let parts: Vec<&str> = id.splitn(3, '.').collect();
            if let [hwid, io_type, instance] = parts.as_slice() {
                let address = Address::io(&self.config.domain, &self.config.publisher_id, hwid, io_type, instance, message_type);
                self.publish_tombstone(&address.to_string()).await;
            }
            return;
        }

        let entity = match message_type {
            MessageType::Input => self.registered.inputs.get(id),
            _ => self.registered.outputs.get(id),
        };
        let Some(entity) = entity else { return };
        self.publish_io_discovery(&entity, message_type).await;
    }

    async fn publish_node_discovery(&self, node: &Node) {
        let address = node.address(&self.config.domain, &self.config.publisher_id);
        let message = NodeDiscoveryMessage {
            address: address.to_string(),
            attr: &node.attr,
            config: &node.config,
            status: &node.status,
            hwid: &node.hwid,
            node_id: &node.node_id,
            timestamp: now_iso8601(),
        };
        self.publish_signed(&address.to_string(), &message).await;
    }

    async fn publish_io_discovery(&self, io: &crate::entities::IoPoint, message_type: MessageType) {
        let address = io.address(&self.config.domain, &self.config.publisher_id, message_type);
        let message = IoDiscoveryMessage {
            address: address.to_string(),
            datatype: io.datatype,
            enum_values: io.enum_values.clone(),
            min: io.min,
            max: io.max,
            unit: io.unit.clone(),
            source: io.source.clone(),
            timestamp: now_iso8601(),
        };
        self.publish_signed(&address.to_string(), &message).await;
    }

    async fn publish_signed(&self, address: &str, message: &impl Serialize) {
        let json = match serde_json::to_string(message) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(address, error = %e, "failed to serialize discovery message");
                return;
            }
        };
        let envelope = envelope::sign(json, self.identity.keypair());
        let Ok(payload) = serde_json::to_vec(&envelope) else {
            return;
        };
        if let Err(e) = self.bus.publish(address, true, payload).await {
            tracing::warn!(address, error = %e, "discovery publish failed, will retry next tick");
        }
    }

    async fn publish_tombstone(&self, address: &str) {
        if let Err(e) = self.bus.publish(address, true, Vec::new()).await {
            tracing::warn!(address, error = %e, "tombstone publish failed, will retry next tick");
        }
    }

    async fn publish_identity(&self) -> Result<()> {
        let record = self.identity.record();
        let topic = format!("{}/{}/$identity", self.config.domain, self.config.publisher_id);
        let json = serde_json::to_vec(&record)?;
        self.bus.publish(&topic, true, json).await
    }

    async fn publish_lwt(&self, status: &'static str) -> Result<()> {
        let topic = self.lwt_topic();
        let message = LwtMessage {
            address: topic.clone(),
            status,
        };
        let json = serde_json::to_vec(&message)?;
        self.bus.publish(&topic, true, json).await
    }

    async fn run_discovery_ticker(self: Arc<Self>) {
        let mut ticker = interval(Duration::from_secs(self.config.discovery_interval_secs.max(1)));
        loop {
            ticker.tick().await;
            if !self.running.load(Ordering::SeqCst) {
                return;
            }
            if let Err(e) = self.flush_discovery().await {
                tracing::warn!(error = %e, "discovery flush failed");
            }
        }
    }

    async fn run_poll_ticker(self: Arc<Self>) {
        let mut ticker = interval(Duration::from_secs(self.config.poll_interval_secs.max(1)));
        loop {
            ticker.tick().await;
            if !self.running.load(Ordering::SeqCst) {
                return;
            }
            if let Some(hook) = &self.on_poll {
                hook();
            }
        }
    }

    /// Subscribe to `<domain>/+/+/$node` and feed verified announcements
    /// into [`Self::domain_nodes`] until the bus drops the subscription.
    async fn run_node_discovery(self: Arc<Self>, bus: Arc<dyn BusAdapter>) {
        let topic_filter = format!("{}/+/+/$node", self.config.domain);
        let Ok(mut subscription) = bus.subscribe(&topic_filter).await else {
            tracing::warn!(topic_filter, "node discovery subscription failed");
            return;
        };
        while let Some(message) = subscription.recv().await {
            let Some(address) = Address::parse(&message.topic) else {
                tracing::warn!(topic = %message.topic, "malformed node discovery topic");
                continue;
            };
            if address.publisher_id == self.config.publisher_id {
                continue;
            }
            if let Err(e) = self.domain_nodes.handle_discovery(
                &address,
                &message.payload,
                Some(self.identity.keypair()),
                self.keys.as_ref(),
            ) {
                tracing::warn!(topic = %message.topic, error = %e, "dropping node discovery message");
            }
        }
    }

    /// Subscribe to `<domain>/+/+/+/+/$input` and feed verified
    /// announcements into [`Self::domain_inputs`].
    async fn run_input_discovery(self: Arc<Self>, bus: Arc<dyn BusAdapter>) {
        let topic_filter = format!("{}/+/+/+/+/$input", self.config.domain);
        let Ok(mut subscription) = bus.subscribe(&topic_filter).await else {
            tracing::warn!(topic_filter, "input discovery subscription failed");
            return;
        };
        while let Some(message) = subscription.recv().await {
            let Some(address) = Address::parse(&message.topic) else {
                tracing::warn!(topic = %message.topic, "malformed input discovery topic");
                continue;
            };
            if address.publisher_id == self.config.publisher_id {
                continue;
            }
            if let Err(e) = self.domain_inputs.handle_discovery(
                &address,
                &message.payload,
                Some(self.identity.keypair()),
                self.keys.as_ref(),
            ) {
                tracing::warn!(topic = %message.topic, error = %e, "dropping input discovery message");
            }
        }
    }

    /// Subscribe to `<domain>/+/+/+/+/$output` and feed verified
    /// announcements into [`Self::domain_outputs`].
    async fn run_output_discovery(self: Arc<Self>, bus: Arc<dyn BusAdapter>) {
        let topic_filter = format!("{}/+/+/+/+/$output", self.config.domain);
        let Ok(mut subscription) = bus.subscribe(&topic_filter).await else {
            tracing::warn!(topic_filter, "output discovery subscription failed");
            return;
        };
        while let Some(message) = subscription.recv().await {
            let Some(address) = Address::parse(&message.topic) else {
                tracing::warn!(topic = %message.topic, "malformed output discovery topic");
                continue;
            };
            if address.publisher_id == self.config.publisher_id {
                continue;
            }
            if let Err(e) = self.domain_outputs.handle_discovery(
                &address,
                &message.payload,
                Some(self.identity.keypair()),
                self.keys.as_ref(),
            ) {
                tracing::warn!(topic = %message.topic, error = %e, "dropping output discovery message");
            }
        }
    }

    /// Subscribe to `<domain>/+/$identity` and populate [`Self::keys`] from
    /// self-signed identity announcements, so remote publishers' signed
    /// discovery and `$set` messages can later be verified. DSS-issued
    /// records observed on another publisher's `$identity` topic are not
    /// admitted here — this publisher has no general way to discover an
    /// arbitrary DSS's public key, only the one (if any) configured for its
    /// own renewal.
    async fn run_identity_discovery(self: Arc<Self>, bus: Arc<dyn BusAdapter>) {
        let topic_filter = format!("{}/+/$identity", self.config.domain);
        let Ok(mut subscription) = bus.subscribe(&topic_filter).await else {
            tracing::warn!(topic_filter, "identity discovery subscription failed");
            return;
        };
        while let Some(message) = subscription.recv().await {
            self.handle_identity_announcement(&message.topic, &message.payload);
        }
    }

    fn handle_identity_announcement(&self, topic: &str, payload: &[u8]) {
        let Some(publisher_id) = parse_identity_publisher(topic, &self.config.domain) else {
            tracing::warn!(%topic, "malformed identity discovery topic");
            return;
        };
        if publisher_id == self.config.publisher_id {
            return;
        }
        if payload.is_empty() {
            self.keys.forget(&publisher_id);
            return;
        }

        let record: IdentityRecord = match serde_json::from_slice(payload) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(%topic, error = %e, "dropping malformed identity announcement");
                return;
            }
        };
        if record.issuer != record.publisher_id {
            return;
        }

        let signature = {
            use base64::Engine;
            match base64::engine::general_purpose::STANDARD.decode(&record.signature) {
                Ok(signature) => signature,
                Err(e) => {
                    tracing::warn!(%topic, error = %e, "dropping identity announcement with malformed signature");
                    return;
                }
            }
        };
        if let Err(e) = crate::crypto::verify(
            &record.signing_payload(),
            &signature,
            &record.public_key_pem,
            &record.issuer,
        ) {
            tracing::warn!(%topic, error = %e, "dropping identity announcement with invalid signature");
            return;
        }

        self.keys.observe(&record.publisher_id, record.public_key_pem);
    }

    /// Subscribe to `<domain>/$dss/<publisherID>/$identity` and accept
    /// DSS-issued identity renewals, delegating verification to
    /// [`Identity::renew`].
    async fn run_dss_renewal(self: Arc<Self>, bus: Arc<dyn BusAdapter>, dss_public_key_pem: String) {
        let topic_filter = format!("{}/$dss/{}/$identity", self.config.domain, self.config.publisher_id);
        let Ok(mut subscription) = bus.subscribe(&topic_filter).await else {
            tracing::warn!(topic_filter, "DSS renewal subscription failed");
            return;
        };
        while let Some(message) = subscription.recv().await {
            if let Err(e) = self.handle_dss_renewal(&message.payload, &dss_public_key_pem) {
                tracing::warn!(error = %e, "dropping DSS renewal message");
            }
        }
    }

    fn handle_dss_renewal(&self, payload: &[u8], dss_public_key_pem: &str) -> Result<()> {
        let envelope: envelope::Envelope = serde_json::from_slice(payload)?;
        let plaintext = self.identity.keypair().decrypt(&envelope.message)?;
        let record: IdentityRecord = serde_json::from_slice(&plaintext)?;
        self.identity.renew(record, dss_public_key_pem)
    }
}

/// Parse `<domain>/<publisherID>/$identity` into its publisher ID,
/// rejecting any topic outside `domain` or with a different shape (the
/// general [`Address`] grammar only covers node- and io-level addresses).
fn parse_identity_publisher(topic: &str, domain: &str) -> Option<String> {
    let parts: Vec<&str> = topic.split('/').collect();
    match parts.as_slice() {
        [d, publisher_id, "$identity"] if *d == domain => Some((*publisher_id).to_string()),
        _ => None,
    }
}
