/// BLE scanner state and duty cycle windows
///
/// The discovery role alternates between a scan window and an idle window.
/// Peers seen during a scan window are collected in a [`ScanWindow`]; the set
/// is cleared when the next window opens, so candidates never carry over.

use crate::transport::abstraction::PeerAddress;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Events delivered while a scan is running
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    /// A peer advertising the requested service was seen
    PeerFound(PeerAddress),
    /// The platform reported a scan failure
    ScanFailed { code: i32 },
}

/// Scanner state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScannerState {
    /// Not started, or stopped
    Idle,
    /// Inside a scan window
    Scanning,
    /// Between scan windows (duty cycle)
    Paused,
}

/// Errors for scanner state transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScannerError {
    #[error("Scanner already scanning")]
    AlreadyScanning,
    #[error("Scanner not scanning")]
    NotScanning,
}

/// Scan/idle duty cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DutyCycle {
    pub scan: Duration,
    pub idle: Duration,
}

impl DutyCycle {
    pub fn new(scan: Duration, idle: Duration) -> Self {
        Self { scan, idle }
    }

    /// Length of one full scan + idle period
    pub fn period(&self) -> Duration {
        self.scan + self.idle
    }

    /// Share of the period spent scanning, in percent
    pub fn duty_percent(&self) -> u8 {
        let period = self.period().as_millis();
        if period == 0 {
            return 0;
        }
        ((self.scan.as_millis() * 100) / period) as u8
    }
}

/// Scanner state tracker
#[derive(Debug)]
pub struct BleScanner {
    state: ScannerState,
    windows: u64,
}

impl Default for BleScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl BleScanner {
    pub fn new() -> Self {
        Self {
            state: ScannerState::Idle,
            windows: 0,
        }
    }

    pub fn state(&self) -> ScannerState {
        self.state
    }

    /// Number of scan windows opened so far
    pub fn windows(&self) -> u64 {
        self.windows
    }

    /// Open a scan window
    pub fn start_scanning(&mut self) -> Result<(), ScannerError> {
        match self.state {
            ScannerState::Idle | ScannerState::Paused => {
                self.state = ScannerState::Scanning;
                self.windows += 1;
                Ok(())
            }
            ScannerState::Scanning => Err(ScannerError::AlreadyScanning),
        }
    }

    /// Close the scan window and enter the idle part of the cycle
    pub fn pause_scanning(&mut self) -> Result<(), ScannerError> {
        match self.state {
            ScannerState::Scanning => {
                self.state = ScannerState::Paused;
                Ok(())
            }
            _ => Err(ScannerError::NotScanning),
        }
    }

    pub fn stop_scanning(&mut self) {
        self.state = ScannerState::Idle;
    }
}

/// Candidate peers observed during the current scan window.
///
/// Insertion order is kept so the first peer seen is the first one tried.
#[derive(Debug, Clone, Default)]
pub struct ScanWindow {
    candidates: Vec<PeerAddress>,
}

impl ScanWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sighting; returns false if the peer was already seen
    pub fn observe(&mut self, peer: PeerAddress) -> bool {
        if self.candidates.contains(&peer) {
            return false;
        }
        self.candidates.push(peer);
        true
    }

    /// Remove and return the first candidate
    pub fn take_next(&mut self) -> Option<PeerAddress> {
        if self.candidates.is_empty() {
            None
        } else {
            Some(self.candidates.remove(0))
        }
    }

    pub fn clear(&mut self) {
        self.candidates.clear();
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}
