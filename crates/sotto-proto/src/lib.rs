//! Message and identifier types for the Sotto protocol engine.
//!
//! This crate defines the in-process boundary contract between the engine and
//! its collaborators: typed identifiers, the protocol payload envelope,
//! envelope descriptors handed to the decryption layer, and interactive
//! dialog messages. It contains no engine logic and no I/O.
//!
//! Payload bodies are CBOR. The `(kind, message_id)` pair in
//! [`ProtocolPayload`] determines the body type, so bodies carry no variant
//! tag of their own - a peer cannot send a mismatched discriminant/body pair
//! without the decode failing.

pub mod dialog;
pub mod envelope;
mod error;
mod ids;
mod outbound;
mod payload;
pub mod payloads;

pub use dialog::{DialogKind, DialogMessage};
pub use envelope::EnvelopeDescriptor;
pub use error::CodecError;
pub use ids::{ChannelTarget, CryptoIdentity, DeviceUid, InstanceUid, MessageId, Uid};
pub use outbound::{OutboundMessage, Recipient};
pub use payload::{ProtocolKind, ProtocolPayload, ReceptionChannel};

/// Result alias for codec operations.
pub type Result<T> = std::result::Result<T, CodecError>;
