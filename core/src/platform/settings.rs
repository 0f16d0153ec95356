//! User-configurable exchange settings
//!
//! Settings that control both protocol roles:
//! - Service name and local identity strings
//! - Optional passphrase for credential notifications
//! - Scan/idle duty cycle windows
//! - Write retry policy and transfer unit negotiation

use crate::transport::ble::retry::RetryPolicy;
use crate::topic::{ServiceId, FIELD_SEPARATOR};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Smallest transfer unit every radio supports
pub const MIN_TRANSFER_UNIT: u16 = 23;

/// Largest transfer unit a radio may negotiate
pub const MAX_TRANSFER_UNIT: u16 = 517;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Errors that can occur during settings validation
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettingsError {
    #[error("Service name must not be empty")]
    EmptyServiceName,

    #[error("Local peer id must not be empty or contain ':', got {0:?}")]
    InvalidPeerId(String),

    #[error("Invalid scan duration: must be > 0 ms")]
    InvalidScanDuration,

    #[error("Invalid transfer unit: must be 23-517, got {0}")]
    InvalidTransferUnit(u16),

    #[error("Invalid retry policy: max attempts must be >= 1")]
    InvalidRetryAttempts,

    #[error("Passphrase must not be empty when set")]
    EmptyPassphrase,
}

// ============================================================================
// EXCHANGE SETTINGS
// ============================================================================

/// Settings shared by the advertising and discovery roles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeSettings {
    /// Human-readable service name; the advertised id is derived from it
    pub service_name: String,

    /// Identifier this node puts in its comparison writes
    pub local_peer_id: String,

    /// Auxiliary info appended to credential notifications
    pub peer_info: String,

    /// Encrypt credential notifications with this passphrase
    pub passphrase: Option<String>,

    /// Length of each scan window (milliseconds)
    pub scan_duration_ms: u64,

    /// Pause between scan windows (milliseconds)
    pub idle_duration_ms: u64,

    /// Retry policy for topic writes
    pub write_retry: RetryPolicy,

    /// Transfer unit requested after service discovery
    pub transfer_unit: u16,

    /// Delay before rescanning after a scan failure (milliseconds)
    pub scan_retry_delay_ms: u64,

    /// Scan failure code that requires a radio power-cycle
    pub transient_scan_error_code: i32,
}

impl ExchangeSettings {
    /// Validate settings
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.service_name.is_empty() {
            return Err(SettingsError::EmptyServiceName);
        }

        if self.local_peer_id.is_empty()
            || self.local_peer_id.as_bytes().contains(&FIELD_SEPARATOR)
        {
            return Err(SettingsError::InvalidPeerId(self.local_peer_id.clone()));
        }

        if self.scan_duration_ms == 0 {
            return Err(SettingsError::InvalidScanDuration);
        }

        if !(MIN_TRANSFER_UNIT..=MAX_TRANSFER_UNIT).contains(&self.transfer_unit) {
            return Err(SettingsError::InvalidTransferUnit(self.transfer_unit));
        }

        if self.write_retry.max_attempts == 0 {
            return Err(SettingsError::InvalidRetryAttempts);
        }

        if matches!(self.passphrase.as_deref(), Some("")) {
            return Err(SettingsError::EmptyPassphrase);
        }

        Ok(())
    }

    pub fn service_id(&self) -> ServiceId {
        ServiceId::from_name(&self.service_name)
    }

    pub fn scan_duration(&self) -> Duration {
        Duration::from_millis(self.scan_duration_ms)
    }

    pub fn idle_duration(&self) -> Duration {
        Duration::from_millis(self.idle_duration_ms)
    }

    pub fn scan_retry_delay(&self) -> Duration {
        Duration::from_millis(self.scan_retry_delay_ms)
    }
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            service_name: "statusbeacon".to_string(),
            local_peer_id: "anonymous".to_string(),
            peer_info: String::new(),
            passphrase: None,
            scan_duration_ms: 10_000,
            idle_duration_ms: 20_000,
            write_retry: RetryPolicy::default(),
            transfer_unit: 512,
            scan_retry_delay_ms: 1_000,
            // SCAN_FAILED_APPLICATION_REGISTRATION_FAILED on Android
            transient_scan_error_code: 2,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
