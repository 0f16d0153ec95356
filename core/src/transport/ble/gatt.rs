/// GATT service definition for the status exchange
///
/// The advertising side hosts one primary service whose id is derived from
/// the service name. Every registered topic becomes one write-only
/// characteristic (a "topic slot") with a client configuration descriptor, so
/// centrals can subscribe to the notification that answers their write.
///
/// The platform radio stack is driven through two traits: [`PeripheralRadio`]
/// for the hosting side and [`CentralRadio`] for the connecting side. Radio
/// callbacks are delivered as events over tokio channels.

use super::scanner::ScanEvent;
use crate::topic::{ServiceId, TopicId};
use crate::transport::abstraction::{LinkState, PeerAddress, RadioError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::sync::mpsc;

/// Maximum GATT characteristic write size (protocol limitation)
pub const MAX_CHARACTERISTIC_SIZE: usize = 512;

/// Capacity of the event channels radios hand back to the roles
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Status sent back in response to a read or write request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GattStatus {
    Success,
    Failure,
}

/// Per-peer notification subscriptions (the client configuration descriptor
/// value of every slot the peer enabled).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientConfiguration {
    subscriptions: HashSet<TopicId>,
}

impl ClientConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, topic: TopicId, enabled: bool) {
        if enabled {
            self.subscriptions.insert(topic);
        } else {
            self.subscriptions.remove(&topic);
        }
    }

    pub fn is_subscribed(&self, topic: &TopicId) -> bool {
        self.subscriptions.contains(topic)
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}

// ============================================================================
// EVENTS
// ============================================================================

/// Events a hosted topic server delivers to the advertising role
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// A central connected or disconnected
    ConnectionChanged { peer: PeerAddress, state: LinkState },
    /// A central wrote to a characteristic
    WriteRequest {
        peer: PeerAddress,
        request_id: u32,
        topic: TopicId,
        payload: Vec<u8>,
        response_needed: bool,
    },
    /// A central tried to read a characteristic
    ReadRequest {
        peer: PeerAddress,
        request_id: u32,
        topic: TopicId,
    },
    /// A central wrote the client configuration descriptor of a slot
    SubscriptionChanged {
        peer: PeerAddress,
        topic: TopicId,
        enabled: bool,
    },
}

/// Events a client connection delivers to the discovery role
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    ConnectionChanged(LinkState),
    /// Service discovery finished; `topics` lists the slots found in the
    /// requested service
    ServicesDiscovered { success: bool, topics: Vec<TopicId> },
    TransferUnitChanged { mtu: u16, success: bool },
    WriteResult { topic: TopicId, success: bool },
    Notification { topic: TopicId, payload: Vec<u8> },
}

// ============================================================================
// RADIO TRAITS
// ============================================================================

/// Platform operations needed by the advertising side
#[async_trait]
pub trait PeripheralRadio: Send + Sync + 'static {
    /// Start advertising the service id
    async fn advertise(&self, service: ServiceId) -> Result<(), RadioError>;

    async fn stop_advertise(&self) -> Result<(), RadioError>;

    /// Host the service with one write-only slot per topic. Server callbacks
    /// arrive on the returned channel until the server is closed.
    async fn open_topic_server(
        &self,
        service: ServiceId,
        topics: &[TopicId],
    ) -> Result<mpsc::Receiver<ServerEvent>, RadioError>;

    async fn close_topic_server(&self) -> Result<(), RadioError>;

    async fn send_response(
        &self,
        peer: &PeerAddress,
        request_id: u32,
        status: GattStatus,
    ) -> Result<(), RadioError>;

    /// Push a notification on a slot to one connected central
    async fn notify(
        &self,
        peer: &PeerAddress,
        topic: TopicId,
        payload: &[u8],
    ) -> Result<(), RadioError>;
}

/// Platform operations needed by the discovery side
#[async_trait]
pub trait CentralRadio: Send + Sync + 'static {
    /// Scan for peers advertising `service`
    async fn start_scan(&self, service: ServiceId)
        -> Result<mpsc::Receiver<ScanEvent>, RadioError>;

    async fn stop_scan(&self) -> Result<(), RadioError>;

    /// Disable and re-enable the adapter
    async fn power_cycle(&self) -> Result<(), RadioError>;

    /// Open a client connection; connection callbacks arrive on the returned
    /// channel until the link is closed.
    async fn connect(&self, peer: &PeerAddress)
        -> Result<mpsc::Receiver<ClientEvent>, RadioError>;

    async fn discover_services(
        &self,
        peer: &PeerAddress,
        service: ServiceId,
    ) -> Result<(), RadioError>;

    /// Write the client configuration descriptor of a slot
    async fn enable_notifications(
        &self,
        peer: &PeerAddress,
        topic: TopicId,
    ) -> Result<(), RadioError>;

    async fn request_transfer_unit(&self, peer: &PeerAddress, mtu: u16)
        -> Result<(), RadioError>;

    /// Dispatch a characteristic write. Completion arrives later as
    /// [`ClientEvent::WriteResult`].
    async fn write(
        &self,
        peer: &PeerAddress,
        topic: TopicId,
        payload: &[u8],
    ) -> Result<(), RadioError>;

    async fn disconnect(&self, peer: &PeerAddress) -> Result<(), RadioError>;
}
