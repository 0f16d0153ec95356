//! Platform integration layer
//!
//! Settings persistence and validation for both exchange roles.

pub mod settings;

pub use settings::{ExchangeSettings, SettingsError, MAX_TRANSFER_UNIT, MIN_TRANSFER_UNIT};
