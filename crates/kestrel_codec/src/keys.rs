//! Key dictionary shared by the parts of one file.

use crate::error::{CodecError, CodecResult};
use std::collections::{BTreeMap, HashMap};

/// Bidirectional dictionary of string keys and compact integer ids.
///
/// Parts identified by names (attribute keys, locale codes and similar)
/// translate them to small ids so the derived primary keys stay compact.
/// The dictionary is persisted with every descriptor of the file that owns
/// it; [`is_dirty`](Self::is_dirty) tells whether it changed since the last
/// snapshot was taken.
#[derive(Debug, Clone, Default)]
pub struct KeyCompressor {
    by_id: BTreeMap<i32, String>,
    by_key: HashMap<String, i32>,
    dirty: bool,
}

impl KeyCompressor {
    /// Creates an empty dictionary.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores a dictionary from a persisted snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidKeyDictionary`] if a key appears under
    /// two ids.
    pub fn from_dictionary(dictionary: BTreeMap<i32, String>) -> CodecResult<Self> {
        let mut by_key = HashMap::with_capacity(dictionary.len());
        for (id, key) in &dictionary {
            if let Some(previous) = by_key.insert(key.clone(), *id) {
                return Err(CodecError::InvalidKeyDictionary {
                    message: format!("key `{key}` mapped to both {previous} and {id}"),
                });
            }
        }
        Ok(Self {
            by_id: dictionary,
            by_key,
            dirty: false,
        })
    }

    /// Returns the id of `key`, assigning the next free one if it is new.
    pub fn get_or_assign(&mut self, key: &str) -> i32 {
        if let Some(id) = self.by_key.get(key) {
            return *id;
        }
        let id = self.by_id.keys().next_back().map_or(1, |last| last + 1);
        self.by_id.insert(id, key.to_string());
        self.by_key.insert(key.to_string(), id);
        self.dirty = true;
        id
    }

    /// Looks up the id of an already known key.
    #[must_use]
    pub fn id_of(&self, key: &str) -> Option<i32> {
        self.by_key.get(key).copied()
    }

    /// Looks up the key registered under `id`.
    #[must_use]
    pub fn key_of(&self, id: i32) -> Option<&str> {
        self.by_id.get(&id).map(String::as_str)
    }

    /// Number of known keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Returns `true` if no keys are known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Returns `true` if keys were assigned since the last [`snapshot`](Self::snapshot).
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Copies the dictionary for persistence and clears the dirty flag.
    pub fn snapshot(&mut self) -> BTreeMap<i32, String> {
        self.dirty = false;
        self.by_id.clone()
    }

    /// Borrows the dictionary without touching the dirty flag.
    #[must_use]
    pub fn dictionary(&self) -> &BTreeMap<i32, String> {
        &self.by_id
    }
}

/// Packs two 32-bit ids into one 64-bit primary key.
///
/// The high half holds `major`, the low half `minor`, so keys sharing a
/// `major` sort together.
#[must_use]
pub const fn compose_pk(major: i32, minor: i32) -> i64 {
    ((major as i64) << 32) | (minor as u32 as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assigns_sequential_ids() {
        let mut keys = KeyCompressor::new();
        assert_eq!(keys.get_or_assign("name"), 1);
        assert_eq!(keys.get_or_assign("code"), 2);
        assert_eq!(keys.get_or_assign("name"), 1);
        assert_eq!(keys.key_of(2), Some("code"));
        assert_eq!(keys.id_of("missing"), None);
    }

    #[test]
    fn snapshot_clears_dirty_flag() {
        let mut keys = KeyCompressor::new();
        assert!(!keys.is_dirty());
        keys.get_or_assign("locale:en");
        assert!(keys.is_dirty());

        let snapshot = keys.snapshot();
        assert!(!keys.is_dirty());
        assert_eq!(snapshot.len(), 1);

        keys.get_or_assign("locale:en");
        assert!(!keys.is_dirty());
    }

    #[test]
    fn restored_dictionary_continues_numbering() {
        let mut dictionary = BTreeMap::new();
        dictionary.insert(7, "a".to_string());
        let mut keys = KeyCompressor::from_dictionary(dictionary).unwrap();
        assert_eq!(keys.get_or_assign("b"), 8);
    }

    #[test]
    fn duplicate_key_rejected() {
        let mut dictionary = BTreeMap::new();
        dictionary.insert(1, "a".to_string());
        dictionary.insert(2, "a".to_string());
        assert!(matches!(
            KeyCompressor::from_dictionary(dictionary),
            Err(CodecError::InvalidKeyDictionary { .. })
        ));
    }

    #[test]
    fn compose_pk_keeps_halves_apart() {
        assert_eq!(compose_pk(1, 0), 1 << 32);
        assert_eq!(compose_pk(0, -1), 0xFFFF_FFFF);
        assert!(compose_pk(1, -1) < compose_pk(2, 0));
    }
}
