// Advertising role: hosts the topic server and arbitrates comparisons
//
// Each registered topic is exposed as one write-only slot. A central writes
// `value:peer_id` to a slot; the advertiser compares the value with its own,
// reports same/different to the attached consumer, and queues the slot for a
// later notification. The consumer answers with notify_status()/notify_same().
//
// Slot contents are only ever refreshed by a full stop+start cycle.

use super::gatt::{ClientConfiguration, GattStatus, PeripheralRadio, ServerEvent};
use crate::message::codec::{decode_comparison, encode_credentials, FramingError, SAME_SENTINEL};
use crate::message::types::NetworkCredentials;
use crate::topic::{InsertOutcome, ServiceId, TopicError, TopicId, TopicRegistry};
use crate::transport::abstraction::{LinkState, PeerAddress, RadioError};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdvertiserError {
    #[error("No outcome consumer attached")]
    NoConsumer,
    #[error("Advertiser not started")]
    NotStarted,
    #[error("Radio error: {0}")]
    Radio(#[from] RadioError),
    #[error("Topic error: {0}")]
    Topic(#[from] TopicError),
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),
}

// ============================================================================
// OUTCOMES
// ============================================================================

/// Result of one comparison, reported to the consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvertisingOutcome {
    /// The central holds the same value for this topic
    SameStatus { topic: String },
    /// The central holds a different value
    DifferentStatus {
        topic: String,
        /// Raw comparison payload as written by the central
        payload: Vec<u8>,
        peer_id: String,
    },
}

/// Serializable snapshot of the advertiser
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertiserStatus {
    pub started: bool,
    pub service_name: Option<String>,
    pub topics: Vec<String>,
    pub connected_peers: usize,
    pub pending_notifications: usize,
    pub restarts: u64,
}

// ============================================================================
// ADVERTISER
// ============================================================================

#[derive(Default)]
struct RunState {
    started: bool,
    service_name: Option<String>,
    peer_info: String,
    event_task: Option<JoinHandle<()>>,
    restarts: u64,
}

struct Inner {
    radio: Arc<dyn PeripheralRadio>,
    registry: TopicRegistry,
    pending: Mutex<Vec<TopicId>>,
    peers: DashMap<PeerAddress, ClientConfiguration>,
    consumer: RwLock<Option<mpsc::UnboundedSender<AdvertisingOutcome>>>,
    passphrase: RwLock<Option<String>>,
    state: tokio::sync::Mutex<RunState>,
}

/// Handle to the advertising role. Cheap to clone; all clones drive the
/// same topic server.
#[derive(Clone)]
pub struct Advertiser {
    inner: Arc<Inner>,
}

impl Advertiser {
    pub fn new(radio: Arc<dyn PeripheralRadio>) -> Self {
        Self {
            inner: Arc::new(Inner {
                radio,
                registry: TopicRegistry::new(),
                pending: Mutex::new(Vec::new()),
                peers: DashMap::new(),
                consumer: RwLock::new(None),
                passphrase: RwLock::new(None),
                state: tokio::sync::Mutex::new(RunState::default()),
            }),
        }
    }

    /// Attach the comparison consumer. Replaces any previous consumer.
    pub fn attach_consumer(&self) -> mpsc::UnboundedReceiver<AdvertisingOutcome> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.consumer.write() = Some(tx);
        rx
    }

    /// Encrypt credential notifications with `passphrase` (None sends plaintext)
    pub fn set_passphrase(&self, passphrase: Option<String>) {
        *self.inner.passphrase.write() = passphrase;
    }

    pub fn registry(&self) -> &TopicRegistry {
        &self.inner.registry
    }

    /// Start advertising `service_name` and open the topic server with one
    /// slot per registered topic.
    pub async fn start(&self, service_name: &str, peer_info: &str) -> Result<(), AdvertiserError> {
        let mut state = self.inner.state.lock().await;
        if self.inner.consumer.read().is_none() {
            error!("No outcome consumer attached; advertiser not started");
            return Err(AdvertiserError::NoConsumer);
        }
        if state.started {
            debug!("Advertiser already started");
            return Ok(());
        }

        state.service_name = Some(service_name.to_string());
        state.peer_info = peer_info.to_string();
        self.start_locked(&mut state).await
    }

    /// Halt advertising and close the topic server. Safe to call when stopped.
    pub async fn stop(&self) -> Result<(), AdvertiserError> {
        let mut state = self.inner.state.lock().await;
        self.stop_locked(&mut state).await
    }

    /// Insert or update a topic value. A changed value while started forces a
    /// full restart so the hosted slots are rebuilt.
    pub async fn add_topic(&self, name: &str, value: &[u8]) -> Result<InsertOutcome, AdvertiserError> {
        let outcome = self.inner.registry.insert(name, value)?;
        if !outcome.changed() {
            debug!("Topic '{}' unchanged; no restart", name);
            return Ok(outcome);
        }

        let mut state = self.inner.state.lock().await;
        if state.started {
            info!("Topic '{}' changed; restarting advertiser", name);
            if let Err(e) = self.stop_locked(&mut state).await {
                warn!("Error while stopping for restart: {}", e);
            }
            self.start_locked(&mut state).await?;
            state.restarts += 1;
        }
        Ok(outcome)
    }

    /// Send the credentials triple on every pending slot. `peer_info` falls
    /// back to the value given to [`Advertiser::start`]. Returns how many
    /// notifications were delivered.
    pub async fn notify_status(
        &self,
        network: &str,
        secret: &str,
        peer_info: Option<&str>,
    ) -> Result<usize, AdvertiserError> {
        let peer_info = {
            let state = self.inner.state.lock().await;
            if !state.started {
                return Err(AdvertiserError::NotStarted);
            }
            peer_info.map(str::to_string).unwrap_or_else(|| state.peer_info.clone())
        };

        let credentials = NetworkCredentials::new(network, secret, peer_info);
        let passphrase = self.inner.passphrase.read().clone();
        let payload = encode_credentials(&credentials, passphrase.as_deref())?;
        Ok(self.notify_pending(&payload).await)
    }

    /// Send the "no difference" sentinel on every pending slot
    pub async fn notify_same(&self) -> Result<usize, AdvertiserError> {
        if !self.inner.state.lock().await.started {
            return Err(AdvertiserError::NotStarted);
        }
        Ok(self.notify_pending(&SAME_SENTINEL).await)
    }

    pub async fn is_started(&self) -> bool {
        self.inner.state.lock().await.started
    }

    pub fn pending_notifications(&self) -> Vec<TopicId> {
        self.inner.pending.lock().clone()
    }

    pub fn connected_peers(&self) -> Vec<PeerAddress> {
        self.inner.peers.iter().map(|e| e.key().clone()).collect()
    }

    pub async fn status(&self) -> AdvertiserStatus {
        let state = self.inner.state.lock().await;
        AdvertiserStatus {
            started: state.started,
            service_name: state.service_name.clone(),
            topics: self
                .inner
                .registry
                .snapshot()
                .into_iter()
                .map(|(_, entry)| entry.name)
                .collect(),
            connected_peers: self.inner.peers.len(),
            pending_notifications: self.inner.pending.lock().len(),
            restarts: state.restarts,
        }
    }

    // ------------------------------------------------------------------------

    async fn start_locked(&self, state: &mut RunState) -> Result<(), AdvertiserError> {
        let service_name = state.service_name.clone().ok_or(AdvertiserError::NotStarted)?;
        let service = ServiceId::from_name(&service_name);
        let topics = self.inner.registry.ids();

        self.inner.radio.advertise(service).await?;
        let events = match self.inner.radio.open_topic_server(service, &topics).await {
            Ok(events) => events,
            Err(e) => {
                if let Err(stop_err) = self.inner.radio.stop_advertise().await {
                    warn!("Failed to stop advertising after server error: {}", stop_err);
                }
                return Err(e.into());
            }
        };

        let inner = Arc::clone(&self.inner);
        state.event_task = Some(tokio::spawn(run_event_loop(inner, events)));
        state.started = true;
        info!(
            "Advertising service '{}' ({}) with {} topic slots",
            service_name,
            service,
            topics.len()
        );
        Ok(())
    }

    async fn stop_locked(&self, state: &mut RunState) -> Result<(), AdvertiserError> {
        if !state.started {
            return Ok(());
        }
        state.started = false;
        if let Some(task) = state.event_task.take() {
            task.abort();
        }
        self.inner.peers.clear();

        let advertise_result = self.inner.radio.stop_advertise().await;
        let server_result = self.inner.radio.close_topic_server().await;
        info!("Advertiser stopped");
        advertise_result?;
        server_result?;
        Ok(())
    }

    async fn notify_pending(&self, payload: &[u8]) -> usize {
        let queued = std::mem::take(&mut *self.inner.pending.lock());
        let mut topics: Vec<TopicId> = Vec::with_capacity(queued.len());
        for topic in queued {
            if !topics.contains(&topic) {
                topics.push(topic);
            }
        }

        let mut delivered = 0;
        for topic in topics {
            let targets: Vec<PeerAddress> = self
                .inner
                .peers
                .iter()
                .filter(|entry| entry.value().is_subscribed(&topic))
                .map(|entry| entry.key().clone())
                .collect();

            if targets.is_empty() {
                debug!("No subscribed peer for slot {}", topic);
            }
            for peer in targets {
                match self.inner.radio.notify(&peer, topic, payload).await {
                    Ok(()) => delivered += 1,
                    Err(e) => warn!("Notify to {} on {} failed: {}", peer, topic, e),
                }
            }
        }
        delivered
    }
}

async fn run_event_loop(inner: Arc<Inner>, mut events: mpsc::Receiver<ServerEvent>) {
    while let Some(event) = events.recv().await {
        inner.handle_server_event(event).await;
    }
    debug!("Topic server event channel closed");
}

impl Inner {
    async fn handle_server_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::ConnectionChanged { peer, state } => match state {
                LinkState::Connected => {
                    debug!("Peer {} connected", peer);
                    self.peers.entry(peer).or_default();
                }
                LinkState::Disconnected => {
                    debug!("Peer {} disconnected", peer);
                    self.peers.remove(&peer);
                }
            },
            ServerEvent::SubscriptionChanged {
                peer,
                topic,
                enabled,
            } => {
                debug!("Peer {} notifications on {}: {}", peer, topic, enabled);
                self.peers.entry(peer).or_default().set(topic, enabled);
            }
            ServerEvent::ReadRequest {
                peer, request_id, ..
            } => {
                // slots are write-only
                self.respond(&peer, request_id, GattStatus::Failure).await;
            }
            ServerEvent::WriteRequest {
                peer,
                request_id,
                topic,
                payload,
                response_needed,
            } => {
                self.handle_write(peer, request_id, topic, payload, response_needed)
                    .await;
            }
        }
    }

    async fn handle_write(
        &self,
        peer: PeerAddress,
        request_id: u32,
        topic: TopicId,
        payload: Vec<u8>,
        response_needed: bool,
    ) {
        let Some(local_value) = self.registry.value(&topic) else {
            debug!("Write from {} to unknown slot {} ignored", peer, topic);
            return;
        };
        if response_needed {
            self.respond(&peer, request_id, GattStatus::Success).await;
        }

        let comparison = match decode_comparison(&payload) {
            Ok(comparison) => comparison,
            Err(e) => {
                warn!("Malformed comparison from {} on {}: {}", peer, topic, e);
                return;
            }
        };

        self.pending.lock().push(topic);
        let name = self
            .registry
            .name_of(&topic)
            .unwrap_or_else(|| topic.to_string());

        let outcome = if comparison.claimed_value == local_value {
            debug!("Same status on '{}' from {}", name, comparison.peer_id);
            AdvertisingOutcome::SameStatus { topic: name }
        } else {
            info!("Different status on '{}' from {}", name, comparison.peer_id);
            AdvertisingOutcome::DifferentStatus {
                topic: name,
                payload,
                peer_id: comparison.peer_id,
            }
        };
        self.emit(outcome);
    }

    async fn respond(&self, peer: &PeerAddress, request_id: u32, status: GattStatus) {
        if let Err(e) = self.radio.send_response(peer, request_id, status).await {
            warn!("Response to {} failed: {}", peer, e);
        }
    }

    fn emit(&self, outcome: AdvertisingOutcome) {
        match self.consumer.read().as_ref() {
            Some(tx) => {
                if tx.send(outcome).is_err() {
                    warn!("Outcome consumer dropped");
                }
            }
            None => warn!("No outcome consumer; dropping {:?}", outcome),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
