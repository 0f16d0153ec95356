// StatusBeacon Core: status-topic exchange over short-range radio
//
// Two devices compare a handful of named status values. Only when a value
// differs does the advertising side hand over network credentials, optionally
// encrypted with a shared passphrase.

pub mod crypto;
pub mod message;
pub mod platform;
pub mod topic;
pub mod transport;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

pub use crypto::{decrypt, encrypt, CryptoError, DerivedKey};
pub use message::{NetworkCredentials, Notification};
pub use platform::{ExchangeSettings, SettingsError};
pub use topic::{ServiceId, TopicId, TopicRegistry};
pub use transport::ble::{AdvertiserStatus, DiscoveryStatus};
pub use transport::{
    Advertiser, AdvertiserError, AdvertisingOutcome, CentralRadio, Discovery, DiscoveryError,
    DiscoveryOutcome, PeerAddress, PeripheralRadio,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NodeError {
    #[error("Invalid settings: {0}")]
    Settings(#[from] SettingsError),
    #[error("Advertiser: {0}")]
    Advertiser(#[from] AdvertiserError),
    #[error("Discovery: {0}")]
    Discovery(#[from] DiscoveryError),
}

// ============================================================================
// NODE
// ============================================================================

/// Combined status of both roles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub advertiser: AdvertiserStatus,
    pub discovery: DiscoveryStatus,
}

/// Both exchange roles of one device, configured from one set of settings.
///
/// Each role keeps its own topic registry; [`StatusNode::add_topic`] updates
/// both. Attach consumers through [`StatusNode::advertiser`] and
/// [`StatusNode::discovery`] before calling [`StatusNode::start`].
pub struct StatusNode {
    settings: ExchangeSettings,
    advertiser: Advertiser,
    discovery: Discovery,
}

impl StatusNode {
    pub fn new(
        peripheral: Arc<dyn PeripheralRadio>,
        central: Arc<dyn CentralRadio>,
        settings: ExchangeSettings,
    ) -> Result<Self, NodeError> {
        settings.validate()?;

        let advertiser = Advertiser::new(peripheral);
        advertiser.set_passphrase(settings.passphrase.clone());
        let discovery = Discovery::new(central, settings.clone())?;

        Ok(Self {
            settings,
            advertiser,
            discovery,
        })
    }

    pub fn settings(&self) -> &ExchangeSettings {
        &self.settings
    }

    pub fn advertiser(&self) -> &Advertiser {
        &self.advertiser
    }

    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    /// Set the local value for a topic on both roles
    pub async fn add_topic(&self, name: &str, value: &[u8]) -> Result<(), NodeError> {
        self.advertiser.add_topic(name, value).await?;
        self.discovery.add_topic(name, value)?;
        Ok(())
    }

    pub async fn start(&self) -> Result<(), NodeError> {
        self.advertiser
            .start(&self.settings.service_name, &self.settings.peer_info)
            .await?;
        if let Err(e) = self.discovery.start(
            &self.settings.service_name,
            self.settings.scan_duration(),
            self.settings.idle_duration(),
        ) {
            self.advertiser.stop().await?;
            return Err(e.into());
        }
        info!(
            "Node '{}' started on service '{}'",
            self.settings.local_peer_id, self.settings.service_name
        );
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), NodeError> {
        self.discovery.stop();
        self.advertiser.stop().await?;
        self.discovery.join().await;
        Ok(())
    }

    pub async fn status(&self) -> NodeStatus {
        NodeStatus {
            advertiser: self.advertiser.status().await,
            discovery: self.discovery.status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackAir;

    fn node(air: &LoopbackAir, name: &str) -> StatusNode {
        let settings = ExchangeSettings {
            local_peer_id: name.to_string(),
            ..Default::default()
        };
        StatusNode::new(
            Arc::new(air.peripheral(format!("{}-p", name))),
            Arc::new(air.central(format!("{}-c", name))),
            settings,
        )
        .unwrap()
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let air = LoopbackAir::new();
        let settings = ExchangeSettings {
            service_name: String::new(),
            ..Default::default()
        };
        let result = StatusNode::new(
            Arc::new(air.peripheral("p")),
            Arc::new(air.central("c")),
            settings,
        );
        assert!(matches!(
            result,
            Err(NodeError::Settings(SettingsError::EmptyServiceName))
        ));
    }

    #[tokio::test]
    async fn test_add_topic_updates_both_roles() {
        let air = LoopbackAir::new();
        let node = node(&air, "alpha");
        node.add_topic("files", b"v1").await.unwrap();

        let id = TopicId::from_name("files");
        assert_eq!(node.advertiser().registry().value(&id), Some(b"v1".to_vec()));
        assert_eq!(node.discovery().registry().value(&id), Some(b"v1".to_vec()));
    }

    #[tokio::test]
    async fn test_start_requires_consumers() {
        let air = LoopbackAir::new();
        let node = node(&air, "alpha");
        assert_eq!(
            node.start().await,
            Err(NodeError::Advertiser(AdvertiserError::NoConsumer))
        );
    }

    #[tokio::test]
    async fn test_start_rolls_back_advertiser_when_discovery_fails() {
        let air = LoopbackAir::new();
        let node = node(&air, "alpha");
        let _adv = node.advertiser().attach_consumer();

        assert_eq!(
            node.start().await,
            Err(NodeError::Discovery(DiscoveryError::NoConsumer))
        );
        assert!(!node.advertiser().is_started().await);
        assert!(!air.is_advertising("alpha-p"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop_status() {
        let air = LoopbackAir::new();
        let node = node(&air, "alpha");
        let _adv = node.advertiser().attach_consumer();
        let _disc = node.discovery().attach_consumer();
        node.add_topic("files", b"v1").await.unwrap();

        node.start().await.unwrap();
        let status = node.status().await;
        assert!(status.advertiser.started);
        assert!(status.discovery.running);
        assert!(air.is_advertising("alpha-p"));

        node.stop().await.unwrap();
        let status = node.status().await;
        assert!(!status.advertiser.started);
        assert!(!status.discovery.running);
    }
}
