//! Record type registry.

use crate::error::{CodecError, CodecResult};
use crate::part::StoragePart;
use std::collections::BTreeMap;

/// First id handed out to registered storage part types.
///
/// Ids below it belong to the engine's own records (index chunks and
/// headers) and are registered with [`RecordTypeRegistry::reserve`].
pub const FIRST_PART_TYPE_ID: u8 = 16;

/// Maps record type names to the one-byte ids stored on disk.
///
/// Ids are assigned in registration order, so every process opening the
/// same catalog must register its part types in the same order, or pin the
/// ids explicitly with [`register_as`](Self::register_as).
#[derive(Debug, Clone, Default)]
pub struct RecordTypeRegistry {
    by_name: BTreeMap<&'static str, u8>,
    by_id: BTreeMap<u8, &'static str>,
}

impl RecordTypeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` under the next free id.
    ///
    /// # Errors
    ///
    /// Fails if `T::RECORD_TYPE` is already registered or no id is left.
    pub fn register<T: StoragePart>(&mut self) -> CodecResult<u8> {
        let next = self
            .by_id
            .keys()
            .next_back()
            .map_or(FIRST_PART_TYPE_ID, |last| last.saturating_add(1))
            .max(FIRST_PART_TYPE_ID);
        if self.by_id.contains_key(&next) {
            return Err(CodecError::TypeIdsExhausted);
        }
        self.insert(T::RECORD_TYPE, next)
    }

    /// Registers `T` under an explicit id.
    ///
    /// # Errors
    ///
    /// Fails if the id is reserved for engine records or already taken.
    pub fn register_as<T: StoragePart>(&mut self, id: u8) -> CodecResult<u8> {
        if id < FIRST_PART_TYPE_ID {
            return Err(CodecError::DuplicateRecordType {
                name: T::RECORD_TYPE.to_string(),
                id,
            });
        }
        self.insert(T::RECORD_TYPE, id)
    }

    /// Registers an engine record type below [`FIRST_PART_TYPE_ID`].
    ///
    /// # Errors
    ///
    /// Fails if the id is outside the reserved range or already taken.
    pub fn reserve(&mut self, name: &'static str, id: u8) -> CodecResult<u8> {
        if id == 0 || id >= FIRST_PART_TYPE_ID {
            return Err(CodecError::DuplicateRecordType {
                name: name.to_string(),
                id,
            });
        }
        self.insert(name, id)
    }

    fn insert(&mut self, name: &'static str, id: u8) -> CodecResult<u8> {
        if let Some(existing) = self.by_name.get(name) {
            return Err(CodecError::DuplicateRecordType {
                name: name.to_string(),
                id: *existing,
            });
        }
        if self.by_id.contains_key(&id) {
            return Err(CodecError::DuplicateRecordType {
                name: name.to_string(),
                id,
            });
        }
        self.by_name.insert(name, id);
        self.by_id.insert(id, name);
        Ok(id)
    }

    /// Returns the id registered for `T`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnknownRecordType`] if `T` was never registered.
    pub fn id_of<T: StoragePart>(&self) -> CodecResult<u8> {
        self.id_for_name(T::RECORD_TYPE)
    }

    /// Returns the id registered for a record type name.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnknownRecordType`] if the name is unknown.
    pub fn id_for_name(&self, name: &str) -> CodecResult<u8> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| CodecError::UnknownRecordType {
                name: name.to_string(),
            })
    }

    /// Returns the name registered under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnknownRecordTypeId`] if the id is unknown.
    pub fn name_of(&self, id: u8) -> CodecResult<&'static str> {
        self.by_id
            .get(&id)
            .copied()
            .ok_or(CodecError::UnknownRecordTypeId { id })
    }

    /// Iterates over `(id, name)` pairs in id order.
    pub fn iter(&self) -> impl Iterator<Item = (u8, &'static str)> + '_ {
        self.by_id.iter().map(|(id, name)| (*id, *name))
    }
}
