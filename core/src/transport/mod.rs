// Transport module: radio abstraction, BLE exchange roles, loopback medium

pub mod abstraction;
pub mod ble;
pub mod loopback;

pub use abstraction::{LinkState, PeerAddress, RadioError};
pub use ble::{
    Advertiser, AdvertiserError, AdvertisingOutcome, CentralRadio, ClientEvent, ConnectionState,
    Discovery, DiscoveryError, DiscoveryOutcome, PeripheralRadio, RetryPolicy, ScanEvent,
    ServerEvent,
};
pub use loopback::{LoopbackAir, LoopbackCentral, LoopbackPeripheral};
