//! Explicit serialization context.

use crate::cbor::{from_cbor, to_cbor};
use crate::error::CodecResult;
use crate::part::StoragePart;
use crate::registry::RecordTypeRegistry;
use std::sync::Arc;

/// Everything needed to turn storage parts into payload bytes and back.
///
/// A context is built once by whoever opens a catalog and shared through an
/// `Arc` with every service that reads or writes parts. There is no global
/// registry; two catalogs in one process may use different contexts.
///
/// # Example
///
/// ```rust
/// use kestrel_codec::{SerializationContext, StoragePart};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, PartialEq, Serialize, Deserialize)]
/// struct Counter {
///     id: i64,
///     value: u64,
/// }
///
/// impl StoragePart for Counter {
///     const RECORD_TYPE: &'static str = "counter";
///     fn storage_part_pk(&self) -> Option<i64> {
///         Some(self.id)
///     }
/// }
///
/// let ctx = SerializationContext::builder()
///     .register::<Counter>()
///     .unwrap()
///     .build();
/// let bytes = ctx.encode(&Counter { id: 1, value: 9 }).unwrap();
/// assert_eq!(ctx.decode::<Counter>(&bytes).unwrap().value, 9);
/// ```
#[derive(Debug, Clone)]
pub struct SerializationContext {
    registry: RecordTypeRegistry,
}

impl SerializationContext {
    /// Starts building a context.
    #[must_use]
    pub fn builder() -> SerializationContextBuilder {
        SerializationContextBuilder {
            registry: RecordTypeRegistry::new(),
        }
    }

    /// Wraps an already populated registry.
    #[must_use]
    pub fn from_registry(registry: RecordTypeRegistry) -> Self {
        Self { registry }
    }

    /// Returns the registry.
    #[must_use]
    pub fn registry(&self) -> &RecordTypeRegistry {
        &self.registry
    }

    /// Returns the on-disk type id of `T`.
    ///
    /// # Errors
    ///
    /// Fails if `T` was not registered.
    pub fn type_id<T: StoragePart>(&self) -> CodecResult<u8> {
        self.registry.id_of::<T>()
    }

    /// Encodes a part. The part type must be registered.
    ///
    /// # Errors
    ///
    /// Fails if `T` is unknown or serialization fails.
    pub fn encode<T: StoragePart>(&self, part: &T) -> CodecResult<Vec<u8>> {
        self.registry.id_of::<T>()?;
        to_cbor(part)
    }

    /// Decodes a part of type `T`.
    ///
    /// # Errors
    ///
    /// Fails if `T` is unknown or the payload is not a valid `T`.
    pub fn decode<T: StoragePart>(&self, payload: &[u8]) -> CodecResult<T> {
        self.registry.id_of::<T>()?;
        from_cbor(payload)
    }

    /// Moves the context behind an `Arc` for sharing between services.
    #[must_use]
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

/// Builder for [`SerializationContext`].
#[derive(Debug)]
pub struct SerializationContextBuilder {
    registry: RecordTypeRegistry,
}

impl SerializationContextBuilder {
    /// Registers a part type under the next free id.
    ///
    /// # Errors
    ///
    /// Fails on duplicate registration.
    pub fn register<T: StoragePart>(mut self) -> CodecResult<Self> {
        self.registry.register::<T>()?;
        Ok(self)
    }

    /// Registers a part type under an explicit id.
    ///
    /// # Errors
    ///
    /// Fails on duplicate or reserved ids.
    pub fn register_as<T: StoragePart>(mut self, id: u8) -> CodecResult<Self> {
        self.registry.register_as::<T>(id)?;
        Ok(self)
    }

    /// Finishes the context.
    #[must_use]
    pub fn build(self) -> SerializationContext {
        SerializationContext {
            registry: self.registry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CodecError;
    use proptest::prelude::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Attribute {
        id: i64,
        name: String,
        values: Vec<u32>,
    }

    impl StoragePart for Attribute {
        const RECORD_TYPE: &'static str = "attribute";
        fn storage_part_pk(&self) -> Option<i64> {
            Some(self.id)
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Unregistered;

    impl StoragePart for Unregistered {
        const RECORD_TYPE: &'static str = "unregistered";
        fn storage_part_pk(&self) -> Option<i64> {
            None
        }
    }

    fn context() -> SerializationContext {
        SerializationContext::builder()
            .register::<Attribute>()
            .unwrap()
            .build()
    }

    #[test]
    fn unregistered_part_is_rejected() {
        let ctx = context();
        assert!(matches!(
            ctx.encode(&Unregistered),
            Err(CodecError::UnknownRecordType { .. })
        ));
    }

    #[test]
    fn default_pk_derivation_fails() {
        let mut keys = crate::KeyCompressor::new();
        assert!(matches!(
            Unregistered.resolve_pk(&mut keys),
            Err(CodecError::MissingPrimaryKey { .. })
        ));
    }

    proptest! {
        #[test]
        fn encode_decode_preserves_part(id in any::<i64>(), name in ".{0,24}", values in prop::collection::vec(any::<u32>(), 0..16)) {
            let ctx = context();
            let part = Attribute { id, name, values };
            let bytes = ctx.encode(&part).unwrap();
            prop_assert_eq!(ctx.decode::<Attribute>(&bytes).unwrap(), part);
        }
    }
}
