// Message types: what travels through a topic slot

use serde::{Deserialize, Serialize};

/// A central's claim about its status for one topic.
///
/// On the wire: `claimed_value ":" peer_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComparisonPayload {
    /// The status value the writing peer holds for the topic
    pub claimed_value: Vec<u8>,
    /// Identifier of the writing peer
    pub peer_id: String,
}

/// Connection details handed to a peer whose status differs.
///
/// On the wire: `network ":" secret ":" peer_info`. Only `peer_info` may
/// itself contain ':'.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkCredentials {
    /// Network identifier (e.g. an SSID)
    pub network: String,
    /// Secret needed to join the network
    pub secret: String,
    /// Auxiliary information about the advertising peer
    pub peer_info: String,
}

impl NetworkCredentials {
    pub fn new(
        network: impl Into<String>,
        secret: impl Into<String>,
        peer_info: impl Into<String>,
    ) -> Self {
        Self {
            network: network.into(),
            secret: secret.into(),
            peer_info: peer_info.into(),
        }
    }
}

/// Notification pushed back to the central after a comparison
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// No status difference detected (single zero byte on the wire)
    Same,
    /// Status differs; here is how to join
    Different(NetworkCredentials),
}

impl Notification {
    pub fn is_same(&self) -> bool {
        matches!(self, Notification::Same)
    }
}
