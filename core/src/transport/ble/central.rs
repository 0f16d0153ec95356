// Discovery role: duty-cycled scanning and topic writes
//
// Cycle: open a scan window, collect candidates, try one connection, idle,
// repeat until stopped. A connection runs as its own session task:
//
//   connect -> discover services -> enable notifications on matching slots
//   -> negotiate transfer unit -> sequential writes (write worker)
//
// Each written slot is answered by one notification. The zero-byte sentinel
// means "same"; a credentials triple means "different" and ends the session.
// The session disconnects once every slot is answered or given up on.
//
// Only one connection may be pending or active at a time.

use super::gatt::{CentralRadio, ClientEvent, MAX_CHARACTERISTIC_SIZE};
use super::retry::RetryError;
use super::scanner::{BleScanner, DutyCycle, ScanEvent, ScanWindow, ScannerState};
use crate::message::codec::{decode_notification, encode_comparison};
use crate::message::types::{NetworkCredentials, Notification};
use crate::platform::settings::{ExchangeSettings, SettingsError};
use crate::topic::{InsertOutcome, TopicError, TopicId, TopicRegistry};
use crate::transport::abstraction::{LinkState, PeerAddress, RadioError};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("No outcome consumer attached")]
    NoConsumer,
    #[error("A connection is already pending or active")]
    ConnectionBusy,
    #[error("Radio error: {0}")]
    Radio(#[from] RadioError),
    #[error("Topic error: {0}")]
    Topic(#[from] TopicError),
    #[error("Invalid settings: {0}")]
    Settings(#[from] SettingsError),
}

// ============================================================================
// STATE & OUTCOMES
// ============================================================================

/// State of the single client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Result of one topic exchange, reported to the consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    SameStatus {
        peer: PeerAddress,
        topic: String,
    },
    DifferentStatus {
        peer: PeerAddress,
        topic: String,
        credentials: NetworkCredentials,
    },
}

impl DiscoveryOutcome {
    pub fn peer(&self) -> &PeerAddress {
        match self {
            DiscoveryOutcome::SameStatus { peer, .. } => peer,
            DiscoveryOutcome::DifferentStatus { peer, .. } => peer,
        }
    }
}

/// Serializable snapshot of the discovery role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryStatus {
    pub running: bool,
    pub scanner: ScannerState,
    pub scan_windows: u64,
    pub connection: ConnectionState,
    pub peer: Option<PeerAddress>,
    pub candidates: usize,
    pub topics: Vec<String>,
}

struct ConnectionSlot {
    state: ConnectionState,
    peer: Option<PeerAddress>,
    session: Option<JoinHandle<()>>,
}

impl Default for ConnectionSlot {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            peer: None,
            session: None,
        }
    }
}

/// Signals from the session to its write worker
#[derive(Debug, Clone, Copy)]
enum WriteSignal {
    Written { topic: TopicId, success: bool },
    Answered(TopicId),
}

/// Reports from the write worker back to the session
#[derive(Debug, Clone, Copy)]
enum WorkerReport {
    /// Slot given up on (write exhausted or no answer)
    Skipped(TopicId),
    Cancelled,
    Finished,
}

enum Step {
    Continue,
    Close,
}

struct Session {
    peer: PeerAddress,
    linked: bool,
    slots: Vec<TopicId>,
    outstanding: HashSet<TopicId>,
    signals: Option<mpsc::UnboundedSender<WriteSignal>>,
    worker: Option<JoinHandle<()>>,
}

impl Session {
    fn new(peer: PeerAddress) -> Self {
        Self {
            peer,
            linked: false,
            slots: Vec::new(),
            outstanding: HashSet::new(),
            signals: None,
            worker: None,
        }
    }

    fn signal(&self, signal: WriteSignal) {
        if let Some(tx) = &self.signals {
            let _ = tx.send(signal);
        }
    }
}

// ============================================================================
// DISCOVERY
// ============================================================================

struct Inner {
    radio: Arc<dyn CentralRadio>,
    settings: RwLock<ExchangeSettings>,
    registry: TopicRegistry,
    started: AtomicBool,
    exit: AtomicBool,
    wake: Notify,
    scanner: Mutex<BleScanner>,
    candidates: Mutex<ScanWindow>,
    connection: Mutex<ConnectionSlot>,
    consumer: RwLock<Option<mpsc::UnboundedSender<DiscoveryOutcome>>>,
    cycle_task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the discovery role. Cheap to clone.
#[derive(Clone)]
pub struct Discovery {
    inner: Arc<Inner>,
}

impl Discovery {
    pub fn new(radio: Arc<dyn CentralRadio>, settings: ExchangeSettings) -> Result<Self, DiscoveryError> {
        settings.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                radio,
                settings: RwLock::new(settings),
                registry: TopicRegistry::new(),
                started: AtomicBool::new(false),
                exit: AtomicBool::new(false),
                wake: Notify::new(),
                scanner: Mutex::new(BleScanner::new()),
                candidates: Mutex::new(ScanWindow::new()),
                connection: Mutex::new(ConnectionSlot::default()),
                consumer: RwLock::new(None),
                cycle_task: Mutex::new(None),
            }),
        })
    }

    /// Attach the outcome consumer. Replaces any previous consumer.
    pub fn attach_consumer(&self) -> mpsc::UnboundedReceiver<DiscoveryOutcome> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.consumer.write() = Some(tx);
        rx
    }

    /// Passphrase used to decrypt credential notifications
    pub fn set_passphrase(&self, passphrase: Option<String>) {
        self.inner.settings.write().passphrase = passphrase;
    }

    pub fn registry(&self) -> &TopicRegistry {
        &self.inner.registry
    }

    /// Update the value offered for `name`. Takes effect on the next write
    /// phase; no restart needed.
    pub fn add_topic(&self, name: &str, value: &[u8]) -> Result<InsertOutcome, DiscoveryError> {
        Ok(self.inner.registry.insert(name, value)?)
    }

    /// Enter the scan/idle duty cycle for `service_name`. Calls while already
    /// running are ignored.
    pub fn start(&self, service_name: &str, scan: Duration, idle: Duration) -> Result<(), DiscoveryError> {
        if self.inner.consumer.read().is_none() {
            error!("No outcome consumer attached; discovery not started");
            return Err(DiscoveryError::NoConsumer);
        }

        if self.inner.started.load(Ordering::SeqCst) {
            debug!("Discovery already running; start ignored");
            return Ok(());
        }

        let mut settings = self.inner.settings.read().clone();
        settings.service_name = service_name.to_string();
        settings.scan_duration_ms = scan.as_millis() as u64;
        settings.idle_duration_ms = idle.as_millis() as u64;
        settings.validate()?;

        if self
            .inner
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Discovery already running; start ignored");
            return Ok(());
        }
        *self.inner.settings.write() = settings;
        self.inner.exit.store(false, Ordering::SeqCst);

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(run_duty_cycle(inner));
        if let Some(previous) = self.inner.cycle_task.lock().replace(task) {
            previous.abort();
        }
        let cycle = DutyCycle::new(scan, idle);
        info!(
            "Discovery started for '{}' (scan {:?}, idle {:?}, {}% duty)",
            service_name,
            scan,
            idle,
            cycle.duty_percent()
        );
        Ok(())
    }

    /// Ask the duty cycle to exit. The current phase completes; an idle
    /// phase is cut short.
    pub fn stop(&self) {
        if !self.inner.started.swap(false, Ordering::SeqCst) {
            debug!("Discovery not running");
        }
        self.inner.exit.store(true, Ordering::SeqCst);
        // wakes only a cycle already parked in idle; no permit is left behind
        // for the next start
        self.inner.wake.notify_waiters();
        info!("Discovery stopping");
    }

    /// Wait for the duty cycle task to exit after [`Discovery::stop`]
    pub async fn join(&self) {
        let task = self.inner.cycle_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.lock().state
    }

    /// Try to connect to the first candidate of the current window
    pub async fn try_connection(&self) -> Result<Option<PeerAddress>, DiscoveryError> {
        self.inner.try_connection().await
    }

    pub fn status(&self) -> DiscoveryStatus {
        let scanner = self.inner.scanner.lock();
        let connection = self.inner.connection.lock();
        DiscoveryStatus {
            running: self.is_running(),
            scanner: scanner.state(),
            scan_windows: scanner.windows(),
            connection: connection.state,
            peer: connection.peer.clone(),
            candidates: self.inner.candidates.lock().len(),
            topics: self
                .inner
                .registry
                .snapshot()
                .into_iter()
                .map(|(_, entry)| entry.name)
                .collect(),
        }
    }
}

async fn run_duty_cycle(inner: Arc<Inner>) {
    while !inner.exit.load(Ordering::SeqCst) {
        inner.scan_window().await;
        if inner.exit.load(Ordering::SeqCst) {
            break;
        }

        match inner.try_connection().await {
            Ok(Some(peer)) => debug!("Connecting to {}", peer),
            Ok(None) => debug!("No candidate this window"),
            Err(e) => debug!("No connection this window: {}", e),
        }

        // registered before the exit check so a stop in between still wakes us
        let woken = inner.wake.notified();
        if inner.exit.load(Ordering::SeqCst) {
            break;
        }

        let idle = inner.settings.read().idle_duration();
        tokio::select! {
            _ = tokio::time::sleep(idle) => {}
            _ = woken => {}
        }
    }
    inner.scanner.lock().stop_scanning();
    info!("Discovery duty cycle exited");
}

impl Inner {
    async fn scan_window(&self) {
        let settings = self.settings.read().clone();
        let service = settings.service_id();
        let deadline = Instant::now() + settings.scan_duration();

        self.candidates.lock().clear();
        if let Err(e) = self.scanner.lock().start_scanning() {
            debug!("Scanner state: {}", e);
        }

        'window: while Instant::now() < deadline {
            let mut events = match self.radio.start_scan(service).await {
                Ok(events) => events,
                Err(RadioError::ScanFailed(code)) => {
                    self.recover_scan(code, &settings, deadline).await;
                    continue 'window;
                }
                Err(e) => {
                    warn!("Scan could not start: {}", e);
                    tokio::time::sleep_until(deadline).await;
                    break 'window;
                }
            };

            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break 'window,
                    event = events.recv() => match event {
                        Some(ScanEvent::PeerFound(peer)) => {
                            if self.candidates.lock().observe(peer.clone()) {
                                debug!("Candidate {}", peer);
                            }
                        }
                        Some(ScanEvent::ScanFailed { code }) => {
                            self.recover_scan(code, &settings, deadline).await;
                            continue 'window;
                        }
                        None => {
                            debug!("Scan event channel closed");
                            tokio::time::sleep_until(deadline).await;
                            break 'window;
                        }
                    }
                }
            }
        }

        if let Err(e) = self.radio.stop_scan().await {
            debug!("Stop scan: {}", e);
        }
        let _ = self.scanner.lock().pause_scanning();
    }

    async fn recover_scan(&self, code: i32, settings: &ExchangeSettings, deadline: Instant) {
        warn!("Scan failed with code {}", code);
        if let Err(e) = self.radio.stop_scan().await {
            debug!("Stop scan after failure: {}", e);
        }
        if code == settings.transient_scan_error_code {
            info!("Power-cycling radio after scan failure {}", code);
            if let Err(e) = self.radio.power_cycle().await {
                warn!("Radio power-cycle failed: {}", e);
            }
        }

        let retry_at = (Instant::now() + settings.scan_retry_delay()).min(deadline);
        tokio::time::sleep_until(retry_at).await;
        if !self.started.load(Ordering::SeqCst) {
            debug!("Not rescanning; discovery stopped");
            tokio::time::sleep_until(deadline).await;
        }
    }

    async fn try_connection(self: &Arc<Self>) -> Result<Option<PeerAddress>, DiscoveryError> {
        let next = self.candidates.lock().take_next();
        let Some(peer) = next else {
            return Ok(None);
        };
        let unexplored = self.candidates.lock().len();
        if unexplored > 0 {
            debug!("{} candidates left unexplored this window", unexplored);
        }

        {
            let mut connection = self.connection.lock();
            if connection.state != ConnectionState::Disconnected {
                debug!("Connection busy; skipping {}", peer);
                return Err(DiscoveryError::ConnectionBusy);
            }
            connection.state = ConnectionState::Connecting;
            connection.peer = Some(peer.clone());
        }

        let events = match self.radio.connect(&peer).await {
            Ok(events) => events,
            Err(e) => {
                warn!("Connect to {} failed: {}", peer, e);
                self.reset_connection();
                return Err(e.into());
            }
        };

        let inner = Arc::clone(self);
        let session_peer = peer.clone();
        let session = tokio::spawn(async move { inner.run_session(session_peer, events).await });
        self.connection.lock().session = Some(session);
        Ok(Some(peer))
    }

    fn reset_connection(&self) {
        let mut connection = self.connection.lock();
        connection.state = ConnectionState::Disconnected;
        connection.peer = None;
        connection.session = None;
    }

    fn emit(&self, outcome: DiscoveryOutcome) {
        match self.consumer.read().as_ref() {
            Some(tx) => {
                if tx.send(outcome).is_err() {
                    warn!("Outcome consumer dropped");
                }
            }
            None => warn!("No outcome consumer; dropping {:?}", outcome),
        }
    }

    // ------------------------------------------------------------------------
    // Session
    // ------------------------------------------------------------------------

    async fn run_session(self: Arc<Self>, peer: PeerAddress, mut events: mpsc::Receiver<ClientEvent>) {
        let settings = self.settings.read().clone();
        let (report_tx, mut reports) = mpsc::unbounded_channel();
        let mut session = Session::new(peer.clone());

        // each setup phase (link, services, transfer unit) must make progress
        // within the write budget; the write worker bounds itself
        let phase_budget = settings.write_retry.budget();
        let mut phase_deadline = Instant::now() + phase_budget;
        let mut stalled = false;

        loop {
            let step = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        phase_deadline = Instant::now() + phase_budget;
                        self.on_client_event(&mut session, event, &settings, &report_tx).await
                    }
                    None => {
                        session.linked = false;
                        Step::Close
                    }
                },
                Some(report) = reports.recv() => self.on_worker_report(&mut session, report),
                _ = tokio::time::sleep_until(phase_deadline), if session.worker.is_none() => {
                    warn!("No progress from {} within {:?}; abandoning connection", peer, phase_budget);
                    stalled = true;
                    Step::Close
                }
            };
            if let Step::Close = step {
                break;
            }
        }

        if let Some(worker) = session.worker.take() {
            worker.abort();
        }
        if session.linked || stalled {
            if let Err(e) = self.radio.disconnect(&peer).await {
                warn!("Disconnect from {} failed: {}", peer, e);
            }
        }
        self.reset_connection();
        info!("Session with {} closed", peer);
    }

    async fn on_client_event(
        self: &Arc<Self>,
        session: &mut Session,
        event: ClientEvent,
        settings: &ExchangeSettings,
        reports: &mpsc::UnboundedSender<WorkerReport>,
    ) -> Step {
        let peer = session.peer.clone();
        match event {
            ClientEvent::ConnectionChanged(LinkState::Connected) => {
                if session.linked {
                    return Step::Continue;
                }
                session.linked = true;
                self.connection.lock().state = ConnectionState::Connected;
                info!("Connected to {}", peer);
                if let Err(e) = self
                    .radio
                    .discover_services(&peer, settings.service_id())
                    .await
                {
                    warn!("Service discovery on {} failed: {}", peer, e);
                    return Step::Close;
                }
                Step::Continue
            }
            ClientEvent::ConnectionChanged(LinkState::Disconnected) => {
                info!("Disconnected from {}", peer);
                session.linked = false;
                Step::Close
            }
            ClientEvent::ServicesDiscovered { success: false, .. } => {
                warn!("Service discovery on {} unsuccessful", peer);
                Step::Close
            }
            ClientEvent::ServicesDiscovered {
                success: true,
                topics,
            } => {
                let slots: Vec<TopicId> = self
                    .registry
                    .ids()
                    .into_iter()
                    .filter(|id| topics.contains(id))
                    .collect();
                if slots.is_empty() {
                    info!("No matching topic slots on {}", peer);
                    return Step::Close;
                }

                for slot in &slots {
                    if let Err(e) = self.radio.enable_notifications(&peer, *slot).await {
                        warn!("Enabling notifications on {} failed: {}", slot, e);
                    }
                }
                debug!("Found {} matching slots on {}", slots.len(), peer);
                session.slots = slots;

                if let Err(e) = self
                    .radio
                    .request_transfer_unit(&peer, settings.transfer_unit)
                    .await
                {
                    warn!("Transfer unit request failed: {}; writing anyway", e);
                    self.begin_writes(session, settings, reports);
                }
                Step::Continue
            }
            ClientEvent::TransferUnitChanged { mtu, success } => {
                if success {
                    debug!("Transfer unit {} negotiated with {}", mtu, peer);
                } else {
                    warn!("Transfer unit negotiation with {} failed", peer);
                }
                self.begin_writes(session, settings, reports);
                Step::Continue
            }
            ClientEvent::WriteResult { topic, success } => {
                session.signal(WriteSignal::Written { topic, success });
                Step::Continue
            }
            ClientEvent::Notification { topic, payload } => {
                session.signal(WriteSignal::Answered(topic));
                session.outstanding.remove(&topic);
                let name = self
                    .registry
                    .name_of(&topic)
                    .unwrap_or_else(|| topic.to_string());

                match decode_notification(&payload, settings.passphrase.as_deref()) {
                    Notification::Same => {
                        debug!("Same status on '{}' with {}", name, peer);
                        self.emit(DiscoveryOutcome::SameStatus { peer, topic: name });
                        if session.outstanding.is_empty() {
                            Step::Close
                        } else {
                            Step::Continue
                        }
                    }
                    Notification::Different(credentials) => {
                        info!("Different status on '{}' with {}", name, peer);
                        self.emit(DiscoveryOutcome::DifferentStatus {
                            peer,
                            topic: name,
                            credentials,
                        });
                        Step::Close
                    }
                }
            }
        }
    }

    fn on_worker_report(&self, session: &mut Session, report: WorkerReport) -> Step {
        match report {
            WorkerReport::Skipped(topic) => {
                session.outstanding.remove(&topic);
                if session.outstanding.is_empty() {
                    Step::Close
                } else {
                    Step::Continue
                }
            }
            WorkerReport::Cancelled => Step::Close,
            WorkerReport::Finished if session.outstanding.is_empty() => Step::Close,
            WorkerReport::Finished => Step::Continue,
        }
    }

    fn begin_writes(
        self: &Arc<Self>,
        session: &mut Session,
        settings: &ExchangeSettings,
        reports: &mpsc::UnboundedSender<WorkerReport>,
    ) {
        if session.worker.is_some() || session.slots.is_empty() {
            return;
        }
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        session.outstanding = session.slots.iter().copied().collect();
        session.signals = Some(signal_tx);

        let worker = tokio::spawn(write_slots(
            Arc::clone(self),
            session.peer.clone(),
            session.slots.clone(),
            settings.clone(),
            signal_rx,
            reports.clone(),
        ));
        session.worker = Some(worker);
    }

    /// Dispatch one write and wait for its result. Returns true if the slot's
    /// answer arrived already.
    async fn write_once(
        &self,
        peer: &PeerAddress,
        topic: TopicId,
        payload: &[u8],
        signals: &tokio::sync::Mutex<mpsc::UnboundedReceiver<WriteSignal>>,
        wait: Duration,
    ) -> Result<bool, RadioError> {
        self.radio.write(peer, topic, payload).await?;

        let mut signals = signals.lock().await;
        let deadline = Instant::now() + wait;
        loop {
            match tokio::time::timeout_at(deadline, signals.recv()).await {
                Ok(Some(WriteSignal::Written { topic: t, success })) if t == topic => {
                    return if success {
                        Ok(false)
                    } else {
                        Err(RadioError::WriteFailed)
                    };
                }
                Ok(Some(WriteSignal::Answered(t))) if t == topic => return Ok(true),
                Ok(Some(_)) => continue,
                Ok(None) => return Err(RadioError::ChannelClosed),
                Err(_) => return Err(RadioError::WriteFailed),
            }
        }
    }
}

/// Serialized write loop: one slot at a time, each with bounded retry
async fn write_slots(
    inner: Arc<Inner>,
    peer: PeerAddress,
    slots: Vec<TopicId>,
    settings: ExchangeSettings,
    signals: mpsc::UnboundedReceiver<WriteSignal>,
    reports: mpsc::UnboundedSender<WorkerReport>,
) {
    let signals = tokio::sync::Mutex::new(signals);
    let policy = settings.write_retry;
    let wait = policy.budget();

    for topic in slots {
        if !inner.started.load(Ordering::SeqCst) {
            debug!("Discovery stopped; abandoning writes to {}", peer);
            let _ = reports.send(WorkerReport::Cancelled);
            return;
        }

        let Some(value) = inner.registry.value(&topic) else {
            let _ = reports.send(WorkerReport::Skipped(topic));
            continue;
        };
        let payload = match encode_comparison(&value, &settings.local_peer_id) {
            Ok(payload) if payload.len() <= MAX_CHARACTERISTIC_SIZE => payload,
            Ok(payload) => {
                warn!("Payload for {} too large ({} bytes)", topic, payload.len());
                let _ = reports.send(WorkerReport::Skipped(topic));
                continue;
            }
            Err(e) => {
                warn!("Cannot frame value for {}: {}", topic, e);
                let _ = reports.send(WorkerReport::Skipped(topic));
                continue;
            }
        };

        let (inner_ref, peer_ref, payload_ref, signals_ref) = (&inner, &peer, &payload, &signals);
        let result = policy
            .run(&inner.started, |attempt| async move {
                debug!("Writing slot {} to {} (attempt {})", topic, peer_ref, attempt);
                inner_ref
                    .write_once(peer_ref, topic, payload_ref, signals_ref, wait)
                    .await
            })
            .await;

        match result {
            Ok(true) => {}
            Ok(false) => {
                if !wait_for_answer(&signals, topic, wait).await {
                    warn!("No answer on slot {} from {}", topic, peer);
                    let _ = reports.send(WorkerReport::Skipped(topic));
                }
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                warn!(
                    "Giving up on slot {} after {} attempts: {}",
                    topic, attempts, last
                );
                let _ = reports.send(WorkerReport::Skipped(topic));
            }
            Err(RetryError::Cancelled { .. }) => {
                let _ = reports.send(WorkerReport::Cancelled);
                return;
            }
        }
    }
    let _ = reports.send(WorkerReport::Finished);
}

async fn wait_for_answer(
    signals: &tokio::sync::Mutex<mpsc::UnboundedReceiver<WriteSignal>>,
    topic: TopicId,
    wait: Duration,
) -> bool {
    let mut signals = signals.lock().await;
    let deadline = Instant::now() + wait;
    loop {
        match tokio::time::timeout_at(deadline, signals.recv()).await {
            Ok(Some(WriteSignal::Answered(t))) if t == topic => return true,
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return false,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::codec::{encode_credentials, SAME_SENTINEL};
    use crate::topic::ServiceId;
    use crate::transport::ble::retry::RetryPolicy;
    use async_trait::async_trait;

    /// Scripted central radio: every peer hosts the configured slots and
    /// answers each write with the configured reply.
    struct ScriptedRadio {
        peers: Vec<PeerAddress>,
        slots: Vec<TopicId>,
        reply: Vec<u8>,
        write_failures: Mutex<u32>,
        silent_connect: Mutex<bool>,
        scan_failure: Mutex<Option<i32>>,
        client: Mutex<Option<mpsc::Sender<ClientEvent>>>,
        connects: Mutex<Vec<PeerAddress>>,
        writes: Mutex<Vec<(TopicId, Vec<u8>)>>,
        subscriptions: Mutex<Vec<TopicId>>,
        transfer_units: Mutex<Vec<u16>>,
        power_cycles: Mutex<u32>,
        scans: Mutex<u32>,
        disconnects: Mutex<u32>,
    }

    impl ScriptedRadio {
        fn new(peers: &[&str], slots: &[&str], reply: Vec<u8>) -> Self {
            Self {
                peers: peers.iter().map(|p| PeerAddress::new(*p)).collect(),
                slots: slots.iter().map(|s| TopicId::from_name(s)).collect(),
                reply,
                write_failures: Mutex::new(0),
                silent_connect: Mutex::new(false),
                scan_failure: Mutex::new(None),
                client: Mutex::new(None),
                connects: Mutex::new(Vec::new()),
                writes: Mutex::new(Vec::new()),
                subscriptions: Mutex::new(Vec::new()),
                transfer_units: Mutex::new(Vec::new()),
                power_cycles: Mutex::new(0),
                scans: Mutex::new(0),
                disconnects: Mutex::new(0),
            }
        }

        fn send(&self, event: ClientEvent) {
            if let Some(tx) = self.client.lock().as_ref() {
                let _ = tx.try_send(event);
            }
        }
    }

    #[async_trait]
    impl CentralRadio for ScriptedRadio {
        async fn start_scan(&self, _service: ServiceId) -> Result<mpsc::Receiver<ScanEvent>, RadioError> {
            *self.scans.lock() += 1;
            let (tx, rx) = mpsc::channel(16);
            if let Some(code) = self.scan_failure.lock().take() {
                let _ = tx.try_send(ScanEvent::ScanFailed { code });
            } else {
                for peer in &self.peers {
                    let _ = tx.try_send(ScanEvent::PeerFound(peer.clone()));
                }
            }
            // keep the channel open for the rest of the window
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                drop(tx);
            });
            Ok(rx)
        }

        async fn stop_scan(&self) -> Result<(), RadioError> {
            Ok(())
        }

        async fn power_cycle(&self) -> Result<(), RadioError> {
            *self.power_cycles.lock() += 1;
            Ok(())
        }

        async fn connect(&self, peer: &PeerAddress) -> Result<mpsc::Receiver<ClientEvent>, RadioError> {
            self.connects.lock().push(peer.clone());
            let (tx, rx) = mpsc::channel(64);
            if !*self.silent_connect.lock() {
                let _ = tx.try_send(ClientEvent::ConnectionChanged(LinkState::Connected));
            }
            *self.client.lock() = Some(tx);
            Ok(rx)
        }

        async fn discover_services(&self, _peer: &PeerAddress, _service: ServiceId) -> Result<(), RadioError> {
            self.send(ClientEvent::ServicesDiscovered {
                success: true,
                topics: self.slots.clone(),
            });
            Ok(())
        }

        async fn enable_notifications(&self, _peer: &PeerAddress, topic: TopicId) -> Result<(), RadioError> {
            self.subscriptions.lock().push(topic);
            Ok(())
        }

        async fn request_transfer_unit(&self, _peer: &PeerAddress, mtu: u16) -> Result<(), RadioError> {
            self.transfer_units.lock().push(mtu);
            self.send(ClientEvent::TransferUnitChanged { mtu, success: true });
            Ok(())
        }

        async fn write(&self, _peer: &PeerAddress, topic: TopicId, payload: &[u8]) -> Result<(), RadioError> {
            self.writes.lock().push((topic, payload.to_vec()));
            {
                let mut failures = self.write_failures.lock();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(RadioError::WriteFailed);
                }
            }
            self.send(ClientEvent::WriteResult { topic, success: true });
            self.send(ClientEvent::Notification {
                topic,
                payload: self.reply.clone(),
            });
            Ok(())
        }

        async fn disconnect(&self, _peer: &PeerAddress) -> Result<(), RadioError> {
            *self.disconnects.lock() += 1;
            *self.client.lock() = None;
            Ok(())
        }
    }

    fn test_settings() -> ExchangeSettings {
        ExchangeSettings {
            local_peer_id: "central-peer".to_string(),
            write_retry: RetryPolicy::new(5, Duration::from_millis(100)),
            ..Default::default()
        }
    }

    fn discovery(radio: &Arc<ScriptedRadio>) -> Discovery {
        Discovery::new(radio.clone(), test_settings()).unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_without_consumer_fails() {
        let radio = Arc::new(ScriptedRadio::new(&["a"], &["files"], SAME_SENTINEL.to_vec()));
        let discovery = discovery(&radio);
        assert_eq!(
            discovery.start("svc", Duration::from_secs(1), Duration::from_secs(1)),
            Err(DiscoveryError::NoConsumer)
        );
        assert!(!discovery.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_scan_duration_rejected() {
        let radio = Arc::new(ScriptedRadio::new(&["a"], &["files"], SAME_SENTINEL.to_vec()));
        let discovery = discovery(&radio);
        let _outcomes = discovery.attach_consumer();
        assert_eq!(
            discovery.start("svc", Duration::ZERO, Duration::from_secs(1)),
            Err(DiscoveryError::Settings(SettingsError::InvalidScanDuration))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_status_disconnects_after_all_answers() {
        let radio = Arc::new(ScriptedRadio::new(
            &["peer-1"],
            &["files", "photos"],
            SAME_SENTINEL.to_vec(),
        ));
        let discovery = discovery(&radio);
        let mut outcomes = discovery.attach_consumer();
        discovery.add_topic("files", b"v1").unwrap();
        discovery.add_topic("photos", b"p1").unwrap();

        discovery
            .start("svc", Duration::from_secs(1), Duration::from_secs(60))
            .unwrap();

        let first = outcomes.recv().await.unwrap();
        let second = outcomes.recv().await.unwrap();
        assert!(matches!(first, DiscoveryOutcome::SameStatus { .. }));
        assert!(matches!(second, DiscoveryOutcome::SameStatus { .. }));
        assert_eq!(first.peer(), &PeerAddress::new("peer-1"));
        settle().await;

        assert_eq!(*radio.disconnects.lock(), 1);
        assert_eq!(discovery.connection_state(), ConnectionState::Disconnected);
        assert_eq!(radio.subscriptions.lock().len(), 2);
        assert_eq!(radio.transfer_units.lock().clone(), vec![512]);

        let writes = radio.writes.lock().clone();
        assert_eq!(writes.len(), 2);
        assert!(writes
            .iter()
            .any(|(_, payload)| payload == b"v1:central-peer"));

        discovery.stop();
        discovery.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_status_reports_credentials_and_disconnects() {
        let reply = encode_credentials(&NetworkCredentials::new("net", "pw", "info"), None).unwrap();
        let radio = Arc::new(ScriptedRadio::new(&["peer-1"], &["files", "photos"], reply));
        let discovery = discovery(&radio);
        let mut outcomes = discovery.attach_consumer();
        discovery.add_topic("files", b"v1").unwrap();
        discovery.add_topic("photos", b"p1").unwrap();

        discovery
            .start("svc", Duration::from_secs(1), Duration::from_secs(60))
            .unwrap();

        match outcomes.recv().await.unwrap() {
            DiscoveryOutcome::DifferentStatus { credentials, .. } => {
                assert_eq!(credentials, NetworkCredentials::new("net", "pw", "info"));
            }
            other => panic!("expected different status, got {:?}", other),
        }
        settle().await;

        // terminal for the connection: the second slot is never written
        assert_eq!(radio.writes.lock().len(), 1);
        assert_eq!(*radio.disconnects.lock(), 1);
        assert!(outcomes.try_recv().is_err());

        discovery.stop();
        discovery.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_encrypted_notification_needs_passphrase() {
        let reply =
            encode_credentials(&NetworkCredentials::new("net", "pw", "info"), Some("pass")).unwrap();
        let radio = Arc::new(ScriptedRadio::new(&["peer-1"], &["files"], reply));
        let discovery = discovery(&radio);
        discovery.set_passphrase(Some("pass".to_string()));
        let mut outcomes = discovery.attach_consumer();
        discovery.add_topic("files", b"v1").unwrap();

        discovery
            .start("svc", Duration::from_secs(1), Duration::from_secs(60))
            .unwrap();

        assert!(matches!(
            outcomes.recv().await.unwrap(),
            DiscoveryOutcome::DifferentStatus { .. }
        ));
        discovery.stop();
        discovery.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_triple_degrades_to_same() {
        let radio = Arc::new(ScriptedRadio::new(&["peer-1"], &["files"], b"net:pw".to_vec()));
        let discovery = discovery(&radio);
        let mut outcomes = discovery.attach_consumer();
        discovery.add_topic("files", b"v1").unwrap();

        discovery
            .start("svc", Duration::from_secs(1), Duration::from_secs(60))
            .unwrap();

        assert_eq!(
            outcomes.recv().await.unwrap(),
            DiscoveryOutcome::SameStatus {
                peer: PeerAddress::new("peer-1"),
                topic: "files".to_string(),
            }
        );
        discovery.stop();
        discovery.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_retries_then_succeeds() {
        let radio = Arc::new(ScriptedRadio::new(&["peer-1"], &["files"], SAME_SENTINEL.to_vec()));
        *radio.write_failures.lock() = 3;
        let discovery = discovery(&radio);
        let mut outcomes = discovery.attach_consumer();
        discovery.add_topic("files", b"v1").unwrap();

        discovery
            .start("svc", Duration::from_secs(1), Duration::from_secs(60))
            .unwrap();

        assert!(matches!(
            outcomes.recv().await.unwrap(),
            DiscoveryOutcome::SameStatus { .. }
        ));
        assert_eq!(radio.writes.lock().len(), 4);
        discovery.stop();
        discovery.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_slot_skipped_without_aborting_others() {
        let radio = Arc::new(ScriptedRadio::new(
            &["peer-1"],
            &["files", "photos"],
            SAME_SENTINEL.to_vec(),
        ));
        // all five attempts on the first slot fail
        *radio.write_failures.lock() = 5;
        let discovery = discovery(&radio);
        let mut outcomes = discovery.attach_consumer();
        discovery.add_topic("files", b"v1").unwrap();
        discovery.add_topic("photos", b"p1").unwrap();

        discovery
            .start("svc", Duration::from_secs(1), Duration::from_secs(60))
            .unwrap();

        let outcome = outcomes.recv().await.unwrap();
        assert!(matches!(outcome, DiscoveryOutcome::SameStatus { .. }));
        settle().await;

        let writes = radio.writes.lock().clone();
        assert_eq!(writes.len(), 6);
        let first_slot = writes[0].0;
        assert!(writes[..5].iter().all(|(topic, _)| *topic == first_slot));
        assert_ne!(writes[5].0, first_slot);
        assert_eq!(*radio.disconnects.lock(), 1);

        discovery.stop();
        discovery.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_candidate_per_cycle() {
        let radio = Arc::new(ScriptedRadio::new(
            &["peer-1", "peer-2", "peer-3"],
            &["files"],
            SAME_SENTINEL.to_vec(),
        ));
        let discovery = discovery(&radio);
        let mut outcomes = discovery.attach_consumer();
        discovery.add_topic("files", b"v1").unwrap();

        discovery
            .start("svc", Duration::from_secs(1), Duration::from_secs(60))
            .unwrap();
        outcomes.recv().await.unwrap();
        settle().await;

        assert_eq!(radio.connects.lock().clone(), vec![PeerAddress::new("peer-1")]);
        discovery.stop();
        discovery.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reentrant_start_ignored() {
        let radio = Arc::new(ScriptedRadio::new(&[], &["files"], SAME_SENTINEL.to_vec()));
        let discovery = discovery(&radio);
        let _outcomes = discovery.attach_consumer();

        discovery
            .start("svc", Duration::from_secs(1), Duration::from_secs(1))
            .unwrap();
        discovery
            .start("svc", Duration::from_secs(1), Duration::from_secs(1))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;

        // a single cycle: windows at t=0 and t=2s
        assert_eq!(discovery.status().scan_windows, 2);
        discovery.stop();
        discovery.join().await;
        assert!(!discovery.is_running());
        assert_eq!(discovery.status().scanner, ScannerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_write_retries() {
        let radio = Arc::new(ScriptedRadio::new(&["peer-1"], &["files"], SAME_SENTINEL.to_vec()));
        *radio.write_failures.lock() = 5;
        let discovery = discovery(&radio);
        let mut outcomes = discovery.attach_consumer();
        discovery.add_topic("files", b"v1").unwrap();

        discovery
            .start("svc", Duration::from_secs(1), Duration::from_secs(60))
            .unwrap();

        // window closes at 1s; the first write fails and the retry waits 100ms
        tokio::time::sleep(Duration::from_millis(1_050)).await;
        assert_eq!(radio.writes.lock().len(), 1);
        discovery.stop();
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(radio.writes.lock().len() < 5);
        assert_eq!(*radio.disconnects.lock(), 1);
        assert_eq!(discovery.connection_state(), ConnectionState::Disconnected);
        assert!(outcomes.try_recv().is_err());
        discovery.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_connection_is_abandoned() {
        let radio = Arc::new(ScriptedRadio::new(&["peer-1"], &["files"], SAME_SENTINEL.to_vec()));
        *radio.silent_connect.lock() = true;
        let discovery = discovery(&radio);
        let mut outcomes = discovery.attach_consumer();
        discovery.add_topic("files", b"v1").unwrap();

        discovery
            .start("svc", Duration::from_secs(1), Duration::from_secs(1))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(20)).await;

        // the link never comes up, yet later cycles still try again
        let connects = radio.connects.lock().len();
        assert!(connects > 1, "connects: {}", connects);
        assert!(*radio.disconnects.lock() >= 1);
        assert!(outcomes.try_recv().is_err());

        discovery.stop();
        discovery.join().await;
        assert_eq!(discovery.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_start_keeps_idle_phase() {
        let radio = Arc::new(ScriptedRadio::new(&[], &["files"], SAME_SENTINEL.to_vec()));
        let discovery = discovery(&radio);
        let _outcomes = discovery.attach_consumer();

        discovery.stop();
        discovery
            .start("svc", Duration::from_secs(1), Duration::from_secs(60))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        assert_eq!(discovery.status().scan_windows, 1);
        discovery.stop();
        discovery.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reentrant_start_skips_validation() {
        let radio = Arc::new(ScriptedRadio::new(&[], &["files"], SAME_SENTINEL.to_vec()));
        let discovery = discovery(&radio);
        let _outcomes = discovery.attach_consumer();

        discovery
            .start("svc", Duration::from_secs(1), Duration::from_secs(1))
            .unwrap();
        assert_eq!(
            discovery.start("svc", Duration::ZERO, Duration::from_secs(1)),
            Ok(())
        );
        assert!(discovery.is_running());

        discovery.stop();
        discovery.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_scan_failure_power_cycles() {
        let radio = Arc::new(ScriptedRadio::new(&["peer-1"], &["files"], SAME_SENTINEL.to_vec()));
        *radio.scan_failure.lock() = Some(2);
        let discovery = discovery(&radio);
        let mut outcomes = discovery.attach_consumer();
        discovery.add_topic("files", b"v1").unwrap();

        discovery
            .start("svc", Duration::from_secs(5), Duration::from_secs(60))
            .unwrap();
        outcomes.recv().await.unwrap();

        assert_eq!(*radio.power_cycles.lock(), 1);
        assert_eq!(*radio.scans.lock(), 2);
        discovery.stop();
        discovery.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_scan_failure_rescans_without_power_cycle() {
        let radio = Arc::new(ScriptedRadio::new(&["peer-1"], &["files"], SAME_SENTINEL.to_vec()));
        *radio.scan_failure.lock() = Some(1);
        let discovery = discovery(&radio);
        let mut outcomes = discovery.attach_consumer();
        discovery.add_topic("files", b"v1").unwrap();

        discovery
            .start("svc", Duration::from_secs(5), Duration::from_secs(60))
            .unwrap();
        outcomes.recv().await.unwrap();

        assert_eq!(*radio.power_cycles.lock(), 0);
        assert_eq!(*radio.scans.lock(), 2);
        discovery.stop();
        discovery.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_busy_refused() {
        let radio = Arc::new(ScriptedRadio::new(&["peer-1"], &["files"], SAME_SENTINEL.to_vec()));
        let discovery = discovery(&radio);
        let _outcomes = discovery.attach_consumer();
        discovery.inner.candidates.lock().observe(PeerAddress::new("peer-1"));
        discovery.inner.connection.lock().state = ConnectionState::Connecting;

        assert_eq!(
            discovery.try_connection().await,
            Err(DiscoveryError::ConnectionBusy)
        );
        assert!(radio.connects.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_matching_slots_disconnects() {
        let radio = Arc::new(ScriptedRadio::new(&["peer-1"], &["other"], SAME_SENTINEL.to_vec()));
        let discovery = discovery(&radio);
        let mut outcomes = discovery.attach_consumer();
        discovery.add_topic("files", b"v1").unwrap();

        discovery
            .start("svc", Duration::from_secs(1), Duration::from_secs(60))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(*radio.disconnects.lock(), 1);
        assert!(radio.writes.lock().is_empty());
        assert!(outcomes.try_recv().is_err());
        discovery.stop();
        discovery.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_topic_without_restart() {
        let radio = Arc::new(ScriptedRadio::new(&[], &["files"], SAME_SENTINEL.to_vec()));
        let discovery = discovery(&radio);
        let _outcomes = discovery.attach_consumer();
        discovery
            .start("svc", Duration::from_secs(1), Duration::from_secs(1))
            .unwrap();

        discovery.add_topic("files", b"v1").unwrap();
        assert_eq!(discovery.add_topic("files", b"v2"), Ok(InsertOutcome::Updated));
        assert!(discovery.is_running());
        assert_eq!(discovery.status().topics, vec!["files".to_string()]);

        discovery.stop();
        discovery.join().await;
    }
}
