//! JSON payload encoding.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Errors from encoding or decoding a payload.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The payload could not be serialized
    #[error("Failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),

    /// The payload could not be deserialized
    #[error("Failed to decode payload: {0}")]
    Decode(#[source] serde_json::Error),

    /// A custom decoder rejected the payload
    #[error("Invalid payload: {0}")]
    Invalid(String),
}

/// Serialize a value to JSON bytes.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(value).map_err(CodecError::Encode)
}

/// Deserialize a value from JSON bytes.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, CodecError> {
    serde_json::from_slice(payload).map_err(CodecError::Decode)
}
