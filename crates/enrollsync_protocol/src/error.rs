//! Error types for protocol encoding.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding or decoding protocol messages.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The message could not be serialized.
    #[error("failed to encode {message}: {source}")]
    Encode {
        /// Message type being encoded.
        message: &'static str,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// The bytes did not form a valid message.
    #[error("failed to decode {message}: {source}")]
    Decode {
        /// Message type being decoded.
        message: &'static str,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

pub(crate) fn encode<T: serde::Serialize>(message: &'static str, value: &T) -> ProtocolResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|source| ProtocolError::Encode { message, source })
}

pub(crate) fn decode<T: serde::de::DeserializeOwned>(
    message: &'static str,
    bytes: &[u8],
) -> ProtocolResult<T> {
    serde_json::from_slice(bytes).map_err(|source| ProtocolError::Decode { message, source })
}
