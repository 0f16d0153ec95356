// Message module: delimited payloads exchanged through topic slots

pub mod types;
pub mod codec;

pub use types::{ComparisonPayload, NetworkCredentials, Notification};
pub use codec::{
    decode_comparison, decode_notification, encode_comparison, encode_credentials,
    encode_notification, parse_notification, FramingError, SAME_SENTINEL,
};
