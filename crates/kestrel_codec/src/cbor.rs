//! CBOR payload encoding backed by `ciborium`.

use crate::error::{CodecError, CodecResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes any serde value as CBOR bytes.
///
/// # Errors
///
/// Returns [`CodecError::EncodingFailed`] if serialization fails.
pub fn to_cbor<T: Serialize + ?Sized>(value: &T) -> CodecResult<Vec<u8>> {
    let mut buffer = Vec::with_capacity(64);
    ciborium::into_writer(value, &mut buffer)
        .map_err(|e| CodecError::encoding_failed(e.to_string()))?;
    Ok(buffer)
}

/// Decodes a serde value from CBOR bytes.
///
/// # Errors
///
/// Returns [`CodecError::DecodingFailed`] if the bytes are not a valid
/// encoding of `T`.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    ciborium::from_reader(bytes).map_err(|e| CodecError::decoding_failed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::collections::BTreeMap;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u64,
        tags: BTreeMap<i32, String>,
    }

    #[test]
    fn struct_roundtrip() {
        let mut tags = BTreeMap::new();
        tags.insert(1, "red".to_string());
        let value = Sample {
            name: "product".into(),
            count: 3,
            tags,
        };
        let bytes = to_cbor(&value).unwrap();
        assert_eq!(from_cbor::<Sample>(&bytes).unwrap(), value);
    }

    #[test]
    fn garbage_fails_to_decode() {
        let err = from_cbor::<Sample>(&[0xFF, 0x00, 0x13]).unwrap_err();
        assert!(matches!(err, CodecError::DecodingFailed { .. }));
    }
}
