/// Name-derived identifiers for services and topic slots
///
/// Both roles derive wire-level identifiers from human-readable names without
/// any prior coordination. The derivation is MD5 over the raw UTF-8 name with
/// the RFC 4122 version-3 and variant bits applied, which is the scheme
/// deployed Android peers use, so a Rust node and a phone agree on every id.

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Derive a name-based UUID (no namespace) from raw bytes.
pub fn name_uuid(name: &[u8]) -> Uuid {
    let hash = Md5::digest(name);
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash);
    uuid::Builder::from_md5_bytes(bytes).into_uuid()
}

/// Identifier of a single topic slot (one writable characteristic)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicId(Uuid);

impl TopicId {
    /// Derive the slot id for a topic name
    pub fn from_name(name: &str) -> Self {
        Self(name_uuid(name.as_bytes()))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for TopicId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identifier of the advertised service that hosts the topic slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceId(Uuid);

impl ServiceId {
    /// Derive the advertised service id for a service name
    pub fn from_name(name: &str) -> Self {
        Self(name_uuid(name.as_bytes()))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}
