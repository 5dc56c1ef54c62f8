//! Codec error type.

use thiserror::Error;

use crate::payload::ProtocolKind;

/// Errors raised while encoding or decoding protocol payloads.
///
/// Decode failures are structural: a payload that fails to decode was either
/// corrupted or produced by a peer speaking a different dialect, and the
/// engine treats the carrying message as unrecoverable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// CBOR serialization failed.
    #[error("encode error: {0}")]
    Encode(String),

    /// CBOR deserialization failed.
    #[error("decode error: {0}")]
    Decode(String),

    /// The message discriminant is not defined for the protocol kind.
    #[error("unknown message id {message_id} for protocol kind {kind:?}")]
    UnknownMessage {
        /// Protocol kind the payload declared.
        kind: ProtocolKind,
        /// Discriminant that failed to resolve.
        message_id: u16,
    },
}

/// Encode a value to CBOR bytes.
pub(crate) fn to_cbor<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Decode a value from CBOR bytes.
pub(crate) fn from_cbor<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    ciborium::from_reader(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}
