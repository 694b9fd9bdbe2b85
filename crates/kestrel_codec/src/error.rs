//! Error types for the codec crate.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors raised while registering, encoding or decoding storage parts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Failed to encode a payload.
    #[error("encoding failed: {message}")]
    EncodingFailed {
        /// Description of the encoding error.
        message: String,
    },

    /// Failed to decode a payload.
    #[error("decoding failed: {message}")]
    DecodingFailed {
        /// Description of the decoding error.
        message: String,
    },

    /// The record type was never registered with the context.
    #[error("record type `{name}` is not registered")]
    UnknownRecordType {
        /// Record type name.
        name: String,
    },

    /// A stored record carries a type id the context does not know.
    #[error("record type id {id} is not registered")]
    UnknownRecordTypeId {
        /// The numeric type id.
        id: u8,
    },

    /// The same name or id was registered twice.
    #[error("record type `{name}` conflicts with an existing registration (id {id})")]
    DuplicateRecordType {
        /// Record type name.
        name: String,
        /// The id involved in the conflict.
        id: u8,
    },

    /// Every available type id is taken.
    #[error("record type id space exhausted")]
    TypeIdsExhausted,

    /// A part has no primary key and cannot derive one.
    #[error("storage part `{record_type}` has no primary key")]
    MissingPrimaryKey {
        /// Record type name.
        record_type: String,
    },

    /// The key dictionary contains the same key or id twice.
    #[error("invalid key dictionary: {message}")]
    InvalidKeyDictionary {
        /// Description of the problem.
        message: String,
    },
}

impl CodecError {
    /// Create an encoding failed error.
    pub fn encoding_failed(message: impl Into<String>) -> Self {
        Self::EncodingFailed {
            message: message.into(),
        }
    }

    /// Create a decoding failed error.
    pub fn decoding_failed(message: impl Into<String>) -> Self {
        Self::DecodingFailed {
            message: message.into(),
        }
    }
}
