//! JSON text-frame encoding for the `ChatSync` wire protocol.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::event::{ClientEvent, ServerEvent};

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// A binary frame did not contain UTF-8 text.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

/// Encodes any protocol value into a JSON text frame.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the value cannot be serialized.
pub fn encode<T: Serialize>(value: &T) -> Result<String, CodecError> {
    Ok(serde_json::to_string(value)?)
}

/// Decodes a protocol value from a JSON text frame.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the text is not a valid frame.
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T, CodecError> {
    Ok(serde_json::from_str(text)?)
}

/// Decodes a protocol value from a binary frame carrying UTF-8 JSON.
///
/// # Errors
///
/// Returns `CodecError::InvalidFrame` if the bytes are not UTF-8, or
/// `CodecError::Serialization` if they are not a valid frame.
pub fn decode_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    let text = std::str::from_utf8(bytes).map_err(|e| CodecError::InvalidFrame(e.to_string()))?;
    decode(text)
}

/// Encodes a [`ClientEvent`].
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the event cannot be serialized.
pub fn encode_client(event: &ClientEvent) -> Result<String, CodecError> {
    encode(event)
}

/// Decodes a [`ServerEvent`].
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the text is not a server event.
pub fn decode_server(text: &str) -> Result<ServerEvent, CodecError> {
    decode(text)
}
