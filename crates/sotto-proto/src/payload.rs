//! Protocol payload envelope.
//!
//! A [`ProtocolPayload`] is what travels between devices for protocol (as
//! opposed to application) traffic, and what the message store persists for
//! each unconsumed received message. The `kind` tag plus the per-kind
//! `message_id` discriminant determine the CBOR body type; the body itself
//! carries no variant tag.
//!
//! # Invariants
//!
//! - The correlation `instance_uid` is recovered from the payload itself,
//!   never from a pre-existing instance, so the engine can create instances
//!   just in time for the first message of a new run.
//! - Encoding a payload and decoding the result yields an equal value.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    CodecError, Result,
    error::{from_cbor, to_cbor},
    ids::{CryptoIdentity, DeviceUid, InstanceUid},
};

/// The closed set of protocol kinds the engine can run.
///
/// Each kind owns its state enumeration and step table in the engine crate;
/// this tag is all the store and the wire ever see.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProtocolKind {
    /// Establish a device channel with a contact's device.
    ChannelCreationContactDevice,
    /// Establish a device channel with another device of the same owned
    /// identity.
    ChannelCreationOwnedDevice,
    /// Ask the server for the current device list of a remote identity.
    DeviceDiscovery,
    /// Assert shared group membership towards another member device.
    GroupMembershipPing,
    /// Move an owned identity to a new device, driven by user dialogs.
    IdentityTransfer,
}

impl ProtocolKind {
    /// All kinds, in discriminant order. Useful for exhaustive sweeps.
    pub const ALL: [Self; 5] = [
        Self::ChannelCreationContactDevice,
        Self::ChannelCreationOwnedDevice,
        Self::DeviceDiscovery,
        Self::GroupMembershipPing,
        Self::IdentityTransfer,
    ];
}

/// How a received message reached this device.
///
/// Steps declare the channel they expect; a message arriving over the wrong
/// channel (e.g. an allegedly local bootstrap message that actually came over
/// the network) must not match any step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceptionChannel {
    /// Posted locally by this device (bootstrap, user action, server reply).
    Local,
    /// Received through an established device channel.
    Device {
        /// Remote identity at the other end.
        remote_identity: CryptoIdentity,
        /// Remote device at the other end.
        remote_device: DeviceUid,
    },
    /// Received outside any channel (the pre-channel handshake path).
    Asynchronous {
        /// Claimed sender, unauthenticated at this layer.
        remote_identity: CryptoIdentity,
    },
}

/// One protocol message: kind tag, correlation uid, and a typed CBOR body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolPayload {
    /// Which protocol this message belongs to.
    pub kind: ProtocolKind,
    /// Correlation key: the instance this message addresses.
    pub instance_uid: InstanceUid,
    /// Per-kind message discriminant; selects the body type.
    pub message_id: u16,
    /// CBOR body, interpreted per `(kind, message_id)`.
    pub body: Bytes,
}

impl ProtocolPayload {
    /// Build a payload from a typed body.
    pub fn from_body<T: Serialize>(
        kind: ProtocolKind,
        instance_uid: InstanceUid,
        message_id: u16,
        body: &T,
    ) -> Result<Self> {
        Ok(Self { kind, instance_uid, message_id, body: Bytes::from(to_cbor(body)?) })
    }

    /// Decode the body as `T`.
    ///
    /// # Errors
    ///
    /// `CodecError::Decode` if the body is not a valid CBOR encoding of `T`.
    pub fn decode_body<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        from_cbor(&self.body)
    }

    /// Encode the whole payload (for persistence or the wire).
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(to_cbor(self)?))
    }

    /// Decode a whole payload.
    ///
    /// # Errors
    ///
    /// `CodecError::Decode` on malformed input.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        from_cbor(bytes)
    }
}

/// Fail with an unknown-message error; helper for per-kind decoders.
pub(crate) fn unknown_message<T>(kind: ProtocolKind, message_id: u16) -> Result<T> {
    Err(CodecError::UnknownMessage { kind, message_id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ID_LEN;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Body {
        n: u32,
        label: String,
    }

    #[test]
    fn payload_round_trips() {
        let body = Body { n: 7, label: "k1".to_string() };
        let payload = ProtocolPayload::from_body(
            ProtocolKind::ChannelCreationContactDevice,
            InstanceUid::from_bytes([9; ID_LEN]),
            3,
            &body,
        )
        .unwrap();

        let encoded = payload.encode().unwrap();
        let decoded = ProtocolPayload::decode(&encoded).unwrap();
        assert_eq!(decoded, payload);
        assert_eq!(decoded.decode_body::<Body>().unwrap(), body);
    }

    #[test]
    fn body_of_wrong_shape_fails_to_decode() {
        let payload = ProtocolPayload::from_body(
            ProtocolKind::DeviceDiscovery,
            InstanceUid::from_bytes([0; ID_LEN]),
            0,
            &42u8,
        )
        .unwrap();

        assert!(payload.decode_body::<Body>().is_err());
    }
}
