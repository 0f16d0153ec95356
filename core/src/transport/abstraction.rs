//! Transport abstraction layer for the status exchange
//!
//! Defines the radio-independent types shared by both roles: peer addresses,
//! link states and the error type every radio collaborator reports.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Address of a remote radio, as reported by the platform (a MAC address on
/// Android, an opaque handle elsewhere).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddress(String);

impl PeerAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerAddress {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

/// Link-level connection state reported by the radio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Connected,
    Disconnected,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Connected => write!(f, "connected"),
            LinkState::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Errors reported by a radio collaborator.
///
/// All of these are transient from the protocol's point of view: the roles
/// log them and retry or move on to the next cycle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RadioError {
    #[error("Radio unavailable")]
    Unavailable,
    #[error("Advertising failed: {0}")]
    AdvertiseFailed(String),
    #[error("Scan failed with code {0}")]
    ScanFailed(i32),
    #[error("Connection to {0} failed")]
    ConnectFailed(PeerAddress),
    #[error("Not connected to {0}")]
    NotConnected(PeerAddress),
    #[error("Write dispatch failed")]
    WriteFailed,
    #[error("Unknown topic slot")]
    UnknownSlot,
    #[error("Radio event channel closed")]
    ChannelClosed,
    #[error("Platform error: {0}")]
    Platform(String),
}
