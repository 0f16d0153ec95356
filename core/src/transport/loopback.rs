//! In-memory loopback radio
//!
//! A shared "air" that any number of peripherals and centrals attach to.
//! Advertisements, scans, connections, writes and notifications are routed
//! through tokio channels exactly as a platform radio would deliver its
//! callbacks, so both roles can be exercised end to end in one process.
//!
//! A peripheral and a central created with the same address model the two
//! roles of one device: the central never finds its own advertisement.
//!
//! Fault injection covers the transient failures the roles must absorb:
//! failed write dispatches and scan failures with a given code.

use crate::topic::{ServiceId, TopicId};
use crate::transport::abstraction::{LinkState, PeerAddress, RadioError};
use crate::transport::ble::gatt::{
    CentralRadio, ClientEvent, GattStatus, PeripheralRadio, ServerEvent, EVENT_CHANNEL_CAPACITY,
};
use crate::transport::ble::scanner::ScanEvent;
use crate::platform::settings::MAX_TRANSFER_UNIT;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

struct HostedServer {
    service: ServiceId,
    topics: Vec<TopicId>,
    events: mpsc::Sender<ServerEvent>,
}

struct Link {
    peripheral: PeerAddress,
    client: mpsc::Sender<ClientEvent>,
}

struct ActiveScan {
    service: ServiceId,
    events: mpsc::Sender<ScanEvent>,
}

#[derive(Default)]
struct Faults {
    write_failures: u32,
    scan_failure: Option<i32>,
}

#[derive(Default)]
struct Counters {
    servers_opened: AtomicU64,
    servers_closed: AtomicU64,
    power_cycles: AtomicU64,
    writes: AtomicU64,
    notifications: AtomicU64,
}

#[derive(Default)]
struct AirInner {
    advertising: Mutex<HashMap<PeerAddress, ServiceId>>,
    servers: Mutex<HashMap<PeerAddress, HostedServer>>,
    /// Keyed by central address; a central holds at most one link
    links: Mutex<HashMap<PeerAddress, Link>>,
    scans: Mutex<HashMap<PeerAddress, ActiveScan>>,
    /// request id -> (central, topic)
    requests: Mutex<HashMap<u32, (PeerAddress, TopicId)>>,
    next_request: AtomicU32,
    faults: Mutex<Faults>,
    counters: Counters,
}

/// Shared radio medium
#[derive(Clone, Default)]
pub struct LoopbackAir {
    inner: Arc<AirInner>,
}

impl LoopbackAir {
    pub fn new() -> Self {
        Self::default()
    }

    /// A peripheral radio at `address`
    pub fn peripheral(&self, address: impl Into<String>) -> LoopbackPeripheral {
        LoopbackPeripheral {
            address: PeerAddress::new(address),
            air: Arc::clone(&self.inner),
        }
    }

    /// A central radio at `address`
    pub fn central(&self, address: impl Into<String>) -> LoopbackCentral {
        LoopbackCentral {
            address: PeerAddress::new(address),
            air: Arc::clone(&self.inner),
        }
    }

    /// Make the next `count` write dispatches fail
    pub fn fail_writes(&self, count: u32) {
        self.inner.faults.lock().write_failures = count;
    }

    /// Make the next scan report a failure with `code`
    pub fn fail_next_scan(&self, code: i32) {
        self.inner.faults.lock().scan_failure = Some(code);
    }

    pub fn servers_opened(&self) -> u64 {
        self.inner.counters.servers_opened.load(Ordering::SeqCst)
    }

    pub fn servers_closed(&self) -> u64 {
        self.inner.counters.servers_closed.load(Ordering::SeqCst)
    }

    pub fn power_cycles(&self) -> u64 {
        self.inner.counters.power_cycles.load(Ordering::SeqCst)
    }

    /// Write dispatches attempted, failed ones included
    pub fn writes(&self) -> u64 {
        self.inner.counters.writes.load(Ordering::SeqCst)
    }

    pub fn notifications(&self) -> u64 {
        self.inner.counters.notifications.load(Ordering::SeqCst)
    }

    /// Number of open central-to-peripheral links
    pub fn links(&self) -> usize {
        self.inner.links.lock().len()
    }

    pub fn is_advertising(&self, address: &str) -> bool {
        self.inner
            .advertising
            .lock()
            .contains_key(&PeerAddress::new(address))
    }
}

impl AirInner {
    fn server_event(&self, peripheral: &PeerAddress, event: ServerEvent) {
        let servers = self.servers.lock();
        match servers.get(peripheral) {
            Some(server) => {
                if let Err(e) = server.events.try_send(event) {
                    warn!("Loopback server {} dropped event: {}", peripheral, e);
                }
            }
            None => trace!("No server at {}", peripheral),
        }
    }

    fn client_event(&self, central: &PeerAddress, event: ClientEvent) -> Result<(), RadioError> {
        let links = self.links.lock();
        let link = links
            .get(central)
            .ok_or_else(|| RadioError::NotConnected(central.clone()))?;
        link.client
            .try_send(event)
            .map_err(|_| RadioError::ChannelClosed)
    }

    fn link_to(&self, central: &PeerAddress, peripheral: &PeerAddress) -> Result<(), RadioError> {
        match self.links.lock().get(central) {
            Some(link) if &link.peripheral == peripheral => Ok(()),
            _ => Err(RadioError::NotConnected(peripheral.clone())),
        }
    }
}

// ============================================================================
// PERIPHERAL
// ============================================================================

pub struct LoopbackPeripheral {
    address: PeerAddress,
    air: Arc<AirInner>,
}

impl LoopbackPeripheral {
    pub fn address(&self) -> &PeerAddress {
        &self.address
    }
}

#[async_trait]
impl PeripheralRadio for LoopbackPeripheral {
    async fn advertise(&self, service: ServiceId) -> Result<(), RadioError> {
        self.air
            .advertising
            .lock()
            .insert(self.address.clone(), service);

        for (central, scan) in self.air.scans.lock().iter() {
            // a device never hears its own advertisement
            if scan.service == service && central != &self.address {
                let _ = scan
                    .events
                    .try_send(ScanEvent::PeerFound(self.address.clone()));
            }
        }
        debug!("{} advertising {}", self.address, service);
        Ok(())
    }

    async fn stop_advertise(&self) -> Result<(), RadioError> {
        self.air.advertising.lock().remove(&self.address);
        Ok(())
    }

    async fn open_topic_server(
        &self,
        service: ServiceId,
        topics: &[TopicId],
    ) -> Result<mpsc::Receiver<ServerEvent>, RadioError> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.air.servers.lock().insert(
            self.address.clone(),
            HostedServer {
                service,
                topics: topics.to_vec(),
                events: tx,
            },
        );
        self.air
            .counters
            .servers_opened
            .fetch_add(1, Ordering::SeqCst);
        Ok(rx)
    }

    async fn close_topic_server(&self) -> Result<(), RadioError> {
        if self.air.servers.lock().remove(&self.address).is_none() {
            return Ok(());
        }
        self.air
            .counters
            .servers_closed
            .fetch_add(1, Ordering::SeqCst);

        // closing the server drops every link to it
        let mut links = self.air.links.lock();
        let dropped: Vec<PeerAddress> = links
            .iter()
            .filter(|(_, link)| link.peripheral == self.address)
            .map(|(central, _)| central.clone())
            .collect();
        for central in dropped {
            if let Some(link) = links.remove(&central) {
                let _ = link
                    .client
                    .try_send(ClientEvent::ConnectionChanged(LinkState::Disconnected));
                debug!("Link {} -> {} dropped by server close", central, self.address);
            }
        }
        Ok(())
    }

    async fn send_response(
        &self,
        peer: &PeerAddress,
        request_id: u32,
        status: GattStatus,
    ) -> Result<(), RadioError> {
        let request = self.air.requests.lock().remove(&request_id);
        match request {
            Some((central, topic)) if &central == peer => self.air.client_event(
                &central,
                ClientEvent::WriteResult {
                    topic,
                    success: status == GattStatus::Success,
                },
            ),
            // responses to reads carry nothing back
            _ => Ok(()),
        }
    }

    async fn notify(
        &self,
        peer: &PeerAddress,
        topic: TopicId,
        payload: &[u8],
    ) -> Result<(), RadioError> {
        self.air.link_to(peer, &self.address)?;
        self.air.client_event(
            peer,
            ClientEvent::Notification {
                topic,
                payload: payload.to_vec(),
            },
        )?;
        self.air
            .counters
            .notifications
            .fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// CENTRAL
// ============================================================================

pub struct LoopbackCentral {
    address: PeerAddress,
    air: Arc<AirInner>,
}

impl LoopbackCentral {
    pub fn address(&self) -> &PeerAddress {
        &self.address
    }
}

#[async_trait]
impl CentralRadio for LoopbackCentral {
    async fn start_scan(&self, service: ServiceId) -> Result<mpsc::Receiver<ScanEvent>, RadioError> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let failure = self.air.faults.lock().scan_failure.take();
        if let Some(code) = failure {
            let _ = tx.try_send(ScanEvent::ScanFailed { code });
            return Ok(rx);
        }

        for (peripheral, advertised) in self.air.advertising.lock().iter() {
            if *advertised == service && peripheral != &self.address {
                let _ = tx.try_send(ScanEvent::PeerFound(peripheral.clone()));
            }
        }
        self.air.scans.lock().insert(
            self.address.clone(),
            ActiveScan {
                service,
                events: tx,
            },
        );
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<(), RadioError> {
        self.air.scans.lock().remove(&self.address);
        Ok(())
    }

    async fn power_cycle(&self) -> Result<(), RadioError> {
        self.air.scans.lock().remove(&self.address);
        self.air
            .counters
            .power_cycles
            .fetch_add(1, Ordering::SeqCst);
        debug!("{} radio power-cycled", self.address);
        Ok(())
    }

    async fn connect(&self, peer: &PeerAddress) -> Result<mpsc::Receiver<ClientEvent>, RadioError> {
        if !self.air.servers.lock().contains_key(peer) {
            return Err(RadioError::ConnectFailed(peer.clone()));
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let _ = tx.try_send(ClientEvent::ConnectionChanged(LinkState::Connected));
        self.air.links.lock().insert(
            self.address.clone(),
            Link {
                peripheral: peer.clone(),
                client: tx,
            },
        );
        self.air.server_event(
            peer,
            ServerEvent::ConnectionChanged {
                peer: self.address.clone(),
                state: LinkState::Connected,
            },
        );
        Ok(rx)
    }

    async fn discover_services(
        &self,
        peer: &PeerAddress,
        service: ServiceId,
    ) -> Result<(), RadioError> {
        self.air.link_to(&self.address, peer)?;
        let topics = match self.air.servers.lock().get(peer) {
            Some(server) if server.service == service => server.topics.clone(),
            Some(_) => Vec::new(),
            None => return Err(RadioError::NotConnected(peer.clone())),
        };
        self.air.client_event(
            &self.address,
            ClientEvent::ServicesDiscovered {
                success: true,
                topics,
            },
        )
    }

    async fn enable_notifications(
        &self,
        peer: &PeerAddress,
        topic: TopicId,
    ) -> Result<(), RadioError> {
        self.air.link_to(&self.address, peer)?;
        self.air.server_event(
            peer,
            ServerEvent::SubscriptionChanged {
                peer: self.address.clone(),
                topic,
                enabled: true,
            },
        );
        Ok(())
    }

    async fn request_transfer_unit(
        &self,
        peer: &PeerAddress,
        mtu: u16,
    ) -> Result<(), RadioError> {
        self.air.link_to(&self.address, peer)?;
        self.air.client_event(
            &self.address,
            ClientEvent::TransferUnitChanged {
                mtu: mtu.min(MAX_TRANSFER_UNIT),
                success: true,
            },
        )
    }

    async fn write(
        &self,
        peer: &PeerAddress,
        topic: TopicId,
        payload: &[u8],
    ) -> Result<(), RadioError> {
        self.air.counters.writes.fetch_add(1, Ordering::SeqCst);
        {
            let mut faults = self.air.faults.lock();
            if faults.write_failures > 0 {
                faults.write_failures -= 1;
                return Err(RadioError::WriteFailed);
            }
        }
        self.air.link_to(&self.address, peer)?;

        let request_id = self.air.next_request.fetch_add(1, Ordering::SeqCst);
        self.air
            .requests
            .lock()
            .insert(request_id, (self.address.clone(), topic));
        self.air.server_event(
            peer,
            ServerEvent::WriteRequest {
                peer: self.address.clone(),
                request_id,
                topic,
                payload: payload.to_vec(),
                response_needed: true,
            },
        );
        Ok(())
    }

    async fn disconnect(&self, peer: &PeerAddress) -> Result<(), RadioError> {
        let link = self.air.links.lock().remove(&self.address);
        if link.is_some() {
            self.air.server_event(
                peer,
                ServerEvent::ConnectionChanged {
                    peer: self.address.clone(),
                    state: LinkState::Disconnected,
                },
            );
        }
        Ok(())
    }
}
