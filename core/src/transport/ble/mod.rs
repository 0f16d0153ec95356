/// BLE (Bluetooth Low Energy) Transport Module
///
/// Protocol-level logic of the status exchange over BLE:
///
/// - **gatt**: topic-slot service definition, radio events and the platform traits
/// - **scanner**: scanner state and per-window candidate tracking
/// - **retry**: bounded retry used by the write phase
/// - **peripheral**: the advertising role (topic server)
/// - **central**: the discovery role (topic client)
///
/// Platform implementations (Kotlin/Swift, or the in-memory loopback radio)
/// handle the actual hardware; everything here is testable without it.

pub mod central;
pub mod gatt;
pub mod peripheral;
pub mod retry;
pub mod scanner;

pub use central::{ConnectionState, Discovery, DiscoveryError, DiscoveryOutcome, DiscoveryStatus};
pub use gatt::{
    CentralRadio, ClientConfiguration, ClientEvent, GattStatus, PeripheralRadio, ServerEvent,
    EVENT_CHANNEL_CAPACITY, MAX_CHARACTERISTIC_SIZE,
};
pub use peripheral::{Advertiser, AdvertiserError, AdvertiserStatus, AdvertisingOutcome};
pub use retry::{RetryError, RetryPolicy};
pub use scanner::{BleScanner, DutyCycle, ScanEvent, ScanWindow, ScannerError, ScannerState};
