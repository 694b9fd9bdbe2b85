//! # Kestrel Codec
//!
//! The storage part contract and the serialization context shared by all
//! Kestrel persistence services.
//!
//! - [`StoragePart`] - the trait every persisted unit implements
//! - [`RecordTypeRegistry`] - stable one-byte ids for record type names
//! - [`KeyCompressor`] - the per-file dictionary for composite keys
//! - [`SerializationContext`] - registry plus payload codec, passed
//!   explicitly instead of living in a global
//!
//! Payloads are CBOR, produced through `serde` and `ciborium`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cbor;
mod context;
mod error;
mod keys;
mod part;
mod registry;

pub use cbor::{from_cbor, to_cbor};
pub use context::{SerializationContext, SerializationContextBuilder};
pub use error::{CodecError, CodecResult};
pub use keys::{compose_pk, KeyCompressor};
pub use part::StoragePart;
pub use registry::{RecordTypeRegistry, FIRST_PART_TYPE_ID};
