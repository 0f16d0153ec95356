// Message codec: delimited framing of comparison and notification payloads
//
// There is no escaping: the ':' separator must not appear inside a claimed
// value, a peer id, a network id or a secret. Only the trailing peer-info
// field of a notification may contain it, which is why notifications are
// split into at most three fields.

use super::types::{ComparisonPayload, NetworkCredentials, Notification};
use crate::crypto::{self, CryptoError};
use crate::topic::FIELD_SEPARATOR;
use thiserror::Error;
use tracing::{debug, warn};

/// The "no difference" notification
pub const SAME_SENTINEL: [u8; 1] = [0x00];

const SEPARATOR: char = FIELD_SEPARATOR as char;

/// Errors for payload framing
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("Payload has no ':' separator")]
    MissingSeparator,
    #[error("Field '{0}' must not contain ':'")]
    SeparatorInField(&'static str),
    #[error("Payload is not valid UTF-8")]
    InvalidUtf8,
    #[error("Expected 3 fields in notification, got {0}")]
    MalformedTriple(usize),
    #[error("Notification decryption failed: {0}")]
    Crypto(#[from] CryptoError),
}

/// Frame a comparison payload: `value ":" peer_id`
pub fn encode_comparison(value: &[u8], peer_id: &str) -> Result<Vec<u8>, FramingError> {
    if value.contains(&FIELD_SEPARATOR) {
        return Err(FramingError::SeparatorInField("value"));
    }
    if peer_id.contains(SEPARATOR) {
        return Err(FramingError::SeparatorInField("peer_id"));
    }
    let mut bytes = Vec::with_capacity(value.len() + 1 + peer_id.len());
    bytes.extend_from_slice(value);
    bytes.push(FIELD_SEPARATOR);
    bytes.extend_from_slice(peer_id.as_bytes());
    Ok(bytes)
}

/// Parse a comparison payload. The claimed value is everything before the
/// first ':', the peer id is the second field.
pub fn decode_comparison(bytes: &[u8]) -> Result<ComparisonPayload, FramingError> {
    let mut fields = bytes.split(|b| *b == FIELD_SEPARATOR);
    let claimed_value = fields.next().unwrap_or_default().to_vec();
    let peer_id = fields.next().ok_or(FramingError::MissingSeparator)?;
    let peer_id = std::str::from_utf8(peer_id)
        .map_err(|_| FramingError::InvalidUtf8)?
        .to_string();
    Ok(ComparisonPayload {
        claimed_value,
        peer_id,
    })
}

/// Frame the credentials triple, encrypting it when a passphrase is set.
pub fn encode_credentials(
    credentials: &NetworkCredentials,
    passphrase: Option<&str>,
) -> Result<Vec<u8>, FramingError> {
    if credentials.network.contains(SEPARATOR) {
        return Err(FramingError::SeparatorInField("network"));
    }
    if credentials.secret.contains(SEPARATOR) {
        return Err(FramingError::SeparatorInField("secret"));
    }
    let triple = format!(
        "{}{SEPARATOR}{}{SEPARATOR}{}",
        credentials.network, credentials.secret, credentials.peer_info
    );
    match passphrase {
        Some(passphrase) => Ok(crypto::encrypt(&triple, passphrase)?.into_bytes()),
        None => Ok(triple.into_bytes()),
    }
}

/// Frame any notification
pub fn encode_notification(
    notification: &Notification,
    passphrase: Option<&str>,
) -> Result<Vec<u8>, FramingError> {
    match notification {
        Notification::Same => Ok(SAME_SENTINEL.to_vec()),
        Notification::Different(credentials) => encode_credentials(credentials, passphrase),
    }
}

/// Strictly parse a notification payload.
pub fn parse_notification(
    bytes: &[u8],
    passphrase: Option<&str>,
) -> Result<Notification, FramingError> {
    if bytes == SAME_SENTINEL {
        return Ok(Notification::Same);
    }
    let text = std::str::from_utf8(bytes).map_err(|_| FramingError::InvalidUtf8)?;
    let plaintext = match passphrase {
        Some(passphrase) => crypto::decrypt(text, passphrase)?,
        None => text.to_string(),
    };

    let fields: Vec<&str> = plaintext.splitn(3, SEPARATOR).collect();
    if fields.len() != 3 {
        return Err(FramingError::MalformedTriple(fields.len()));
    }
    Ok(Notification::Different(NetworkCredentials::new(
        fields[0], fields[1], fields[2],
    )))
}

/// Decode a notification, degrading anything unparseable to
/// [`Notification::Same`].
pub fn decode_notification(bytes: &[u8], passphrase: Option<&str>) -> Notification {
    match parse_notification(bytes, passphrase) {
        Ok(notification) => notification,
        Err(FramingError::MalformedTriple(n)) => {
            debug!("Notification with {} fields treated as same status", n);
            Notification::Same
        }
        Err(e) => {
            warn!("Unreadable notification treated as same status: {}", e);
            Notification::Same
        }
    }
}
