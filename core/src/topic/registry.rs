/// In-memory topic registry shared between a role and its event tasks
///
/// Maps slot ids back to the topic names callers registered, so outcomes can
/// be reported by name. Each role owns its own registry.

use super::id::TopicId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Field separator of the comparison and notification payloads
pub const FIELD_SEPARATOR: u8 = b':';

/// Errors for registry updates
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopicError {
    #[error("Topic name must not be empty")]
    EmptyName,
    #[error("Value for topic '{0}' contains the ':' separator")]
    SeparatorInValue(String),
}

/// A registered topic with its current status value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicEntry {
    pub name: String,
    pub value: Vec<u8>,
}

/// Result of an insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Topic was not registered before
    Inserted,
    /// Topic existed with a different value
    Updated,
    /// Topic already held this exact value
    Unchanged,
}

impl InsertOutcome {
    pub fn changed(&self) -> bool {
        !matches!(self, InsertOutcome::Unchanged)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TopicRegistry {
    entries: Arc<RwLock<BTreeMap<TopicId, TopicEntry>>>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the value for `name`.
    pub fn insert(&self, name: &str, value: &[u8]) -> Result<InsertOutcome, TopicError> {
        if name.is_empty() {
            return Err(TopicError::EmptyName);
        }
        if value.contains(&FIELD_SEPARATOR) {
            return Err(TopicError::SeparatorInValue(name.to_string()));
        }

        let id = TopicId::from_name(name);
        let mut entries = self.entries.write();
        match entries.get_mut(&id) {
            Some(existing) if existing.value == value => Ok(InsertOutcome::Unchanged),
            Some(existing) => {
                existing.value = value.to_vec();
                Ok(InsertOutcome::Updated)
            }
            None => {
                entries.insert(
                    id,
                    TopicEntry {
                        name: name.to_string(),
                        value: value.to_vec(),
                    },
                );
                Ok(InsertOutcome::Inserted)
            }
        }
    }

    pub fn value(&self, id: &TopicId) -> Option<Vec<u8>> {
        self.entries.read().get(id).map(|e| e.value.clone())
    }

    /// Original topic name for a slot id
    pub fn name_of(&self, id: &TopicId) -> Option<String> {
        self.entries.read().get(id).map(|e| e.name.clone())
    }

    pub fn contains(&self, id: &TopicId) -> bool {
        self.entries.read().contains_key(id)
    }

    /// All registered slot ids, in stable order
    pub fn ids(&self) -> Vec<TopicId> {
        self.entries.read().keys().copied().collect()
    }

    pub fn snapshot(&self) -> Vec<(TopicId, TopicEntry)> {
        self.entries
            .read()
            .iter()
            .map(|(id, entry)| (*id, entry.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_then_update() {
        let registry = TopicRegistry::new();
        assert_eq!(
            registry.insert("files", b"v1").unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            registry.insert("files", b"v1").unwrap(),
            InsertOutcome::Unchanged
        );
        assert_eq!(
            registry.insert("files", b"v2").unwrap(),
            InsertOutcome::Updated
        );

        let id = TopicId::from_name("files");
        assert_eq!(registry.value(&id), Some(b"v2".to_vec()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_name_of_inverts_id() {
        let registry = TopicRegistry::new();
        registry.insert("wifi", b"abc").unwrap();
        assert_eq!(
            registry.name_of(&TopicId::from_name("wifi")).as_deref(),
            Some("wifi")
        );
        assert!(registry.name_of(&TopicId::from_name("other")).is_none());
    }

    #[test]
    fn test_rejects_separator_in_value() {
        let registry = TopicRegistry::new();
        let err = registry.insert("files", b"a:b").unwrap_err();
        assert_eq!(err, TopicError::SeparatorInValue("files".to_string()));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_rejects_empty_name() {
        let registry = TopicRegistry::new();
        assert_eq!(registry.insert("", b"x"), Err(TopicError::EmptyName));
    }

    #[test]
    fn test_clones_share_state() {
        let registry = TopicRegistry::new();
        let handle = registry.clone();
        handle.insert("a", b"1").unwrap();
        assert!(registry.contains(&TopicId::from_name("a")));
    }

    #[test]
    fn test_ids_are_stable() {
        let registry = TopicRegistry::new();
        for name in ["c", "a", "b"] {
            registry.insert(name, b"x").unwrap();
        }
        assert_eq!(registry.ids(), registry.ids());
        assert_eq!(registry.snapshot().len(), 3);
    }
}
