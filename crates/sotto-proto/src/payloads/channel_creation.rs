//! Channel-creation messages.
//!
//! Shared by the contact-device and owned-device variants; the payload's
//! `kind` tag keeps the two protocols' instances apart. The flow is a signed
//! ping followed by an ephemeral key exchange: ping proves "I trust you and
//! have no channel to you", the k1/k2 exchange seeds the channel, the ack
//! confirms it.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    Result,
    error::from_cbor,
    ids::{CryptoIdentity, DeviceUid, InstanceUid},
    payload::{ProtocolKind, ProtocolPayload, unknown_message},
};

/// Discriminant for [`Message::Initiate`].
pub const MSG_INITIATE: u16 = 0;
/// Discriminant for [`Message::Ping`].
pub const MSG_PING: u16 = 1;
/// Discriminant for [`Message::EphemeralKey`].
pub const MSG_EPHEMERAL_KEY: u16 = 2;
/// Discriminant for [`Message::KeyConfirmation`].
pub const MSG_KEY_CONFIRMATION: u16 = 3;
/// Discriminant for [`Message::Ack`].
pub const MSG_ACK: u16 = 4;

/// Local kick-off: start (or restart) channel creation towards one device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Initiate {
    /// Identity owning the target device.
    pub remote_identity: CryptoIdentity,
    /// Device to establish the channel with.
    pub remote_device: DeviceUid,
}

/// Signed ping: "I trust you, I have no channel to you."
///
/// The signature covers both device uids and both identities; the identity
/// collaborator verifies it before any key material is exchanged.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    /// Identity that sent the ping.
    pub sender_identity: CryptoIdentity,
    /// Device that sent the ping.
    pub sender_device: DeviceUid,
    /// Challenge signature over the (device, identity) pairs.
    pub signature: Bytes,
}

/// First half of the key exchange (k1).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EphemeralKey {
    /// Device sending its ephemeral public key.
    pub sender_device: DeviceUid,
    /// Ephemeral public key, opaque to the engine.
    pub public_key: Bytes,
}

/// Second half of the key exchange (k2) plus confirmation of k1.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyConfirmation {
    /// Device replying with its own ephemeral key.
    pub sender_device: DeviceUid,
    /// Responder's ephemeral public key.
    pub public_key: Bytes,
    /// Ciphertext proving possession of the derived secret.
    pub confirmation: Bytes,
}

/// Final confirmation; on reception both ends consider the channel live.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Device acknowledging the channel.
    pub sender_device: DeviceUid,
}

/// All channel-creation messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// Local kick-off.
    Initiate(Initiate),
    /// Signed ping.
    Ping(Ping),
    /// k1.
    EphemeralKey(EphemeralKey),
    /// k2 + confirmation.
    KeyConfirmation(KeyConfirmation),
    /// Channel confirmed.
    Ack(Ack),
}

impl Message {
    /// Discriminant carried in the payload envelope.
    #[must_use]
    pub const fn message_id(&self) -> u16 {
        match self {
            Self::Initiate(_) => MSG_INITIATE,
            Self::Ping(_) => MSG_PING,
            Self::EphemeralKey(_) => MSG_EPHEMERAL_KEY,
            Self::KeyConfirmation(_) => MSG_KEY_CONFIRMATION,
            Self::Ack(_) => MSG_ACK,
        }
    }

    /// Wrap into a payload envelope for `kind`.
    ///
    /// `kind` must be one of the two channel-creation kinds; the caller picks
    /// contact-device or owned-device.
    pub fn into_payload(self, kind: ProtocolKind, instance_uid: InstanceUid) -> Result<ProtocolPayload> {
        let message_id = self.message_id();
        match self {
            Self::Initiate(b) => ProtocolPayload::from_body(kind, instance_uid, message_id, &b),
            Self::Ping(b) => ProtocolPayload::from_body(kind, instance_uid, message_id, &b),
            Self::EphemeralKey(b) => ProtocolPayload::from_body(kind, instance_uid, message_id, &b),
            Self::KeyConfirmation(b) => {
                ProtocolPayload::from_body(kind, instance_uid, message_id, &b)
            },
            Self::Ack(b) => ProtocolPayload::from_body(kind, instance_uid, message_id, &b),
        }
    }

    /// Decode a payload body for this kind.
    ///
    /// # Errors
    ///
    /// `CodecError::UnknownMessage` for an undefined discriminant,
    /// `CodecError::Decode` for a malformed body.
    pub fn decode(payload: &ProtocolPayload) -> Result<Self> {
        match payload.message_id {
            MSG_INITIATE => Ok(Self::Initiate(from_cbor(&payload.body)?)),
            MSG_PING => Ok(Self::Ping(from_cbor(&payload.body)?)),
            MSG_EPHEMERAL_KEY => Ok(Self::EphemeralKey(from_cbor(&payload.body)?)),
            MSG_KEY_CONFIRMATION => Ok(Self::KeyConfirmation(from_cbor(&payload.body)?)),
            MSG_ACK => Ok(Self::Ack(from_cbor(&payload.body)?)),
            other => unknown_message(payload.kind, other),
        }
    }
}
