//! The storage part contract.

use crate::error::{CodecError, CodecResult};
use crate::keys::KeyCompressor;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// An opaque, typed unit of persisted state.
///
/// A storage part is addressed by its record type and a 64-bit primary key
/// unique within that type. Parts either know their key up front
/// ([`storage_part_pk`](Self::storage_part_pk)) or derive a stable one from
/// composite string keys through the catalog's [`KeyCompressor`].
///
/// # Example
///
/// ```rust
/// use kestrel_codec::StoragePart;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct PriceList {
///     id: i64,
///     currency: String,
/// }
///
/// impl StoragePart for PriceList {
///     const RECORD_TYPE: &'static str = "price_list";
///
///     fn storage_part_pk(&self) -> Option<i64> {
///         Some(self.id)
///     }
/// }
/// ```
pub trait StoragePart: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable record type name. Changing it orphans persisted data.
    const RECORD_TYPE: &'static str;

    /// Returns the primary key when the part carries one.
    fn storage_part_pk(&self) -> Option<i64>;

    /// Derives a primary key for parts without an intrinsic one.
    ///
    /// The default refuses; parts keyed by composite names override this and
    /// register the names they need in `keys`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::MissingPrimaryKey`] unless overridden.
    fn compute_unique_part_id(&self, keys: &mut KeyCompressor) -> CodecResult<i64> {
        let _ = keys;
        Err(CodecError::MissingPrimaryKey {
            record_type: Self::RECORD_TYPE.to_string(),
        })
    }

    /// Returns the stored key, deriving one if necessary.
    ///
    /// # Errors
    ///
    /// Propagates the error of [`compute_unique_part_id`](Self::compute_unique_part_id).
    fn resolve_pk(&self, keys: &mut KeyCompressor) -> CodecResult<i64> {
        match self.storage_part_pk() {
            Some(pk) => Ok(pk),
            None => self.compute_unique_part_id(keys),
        }
    }
}
