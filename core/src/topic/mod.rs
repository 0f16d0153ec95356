// Topics: named status slots and their derived wire identifiers

mod id;
mod registry;

pub use id::{name_uuid, ServiceId, TopicId};
pub use registry::{InsertOutcome, TopicEntry, TopicError, TopicRegistry, FIELD_SEPARATOR};
