//! Group-membership ping messages.
//!
//! A member pings another member's devices with a signature binding the
//! group uid and both identities; the reply proves the peer still considers
//! itself a member. Used to nudge pending members and to refresh membership
//! knowledge after channel (re)creation.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    Result,
    error::from_cbor,
    ids::{CryptoIdentity, InstanceUid, Uid},
    payload::{ProtocolKind, ProtocolPayload, unknown_message},
};

/// Discriminant for [`Message::Initiate`].
pub const MSG_INITIATE: u16 = 0;
/// Discriminant for [`Message::Ping`].
pub const MSG_PING: u16 = 1;
/// Discriminant for [`Message::PingReply`].
pub const MSG_PING_REPLY: u16 = 2;

/// Local kick-off: ping one member of one group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Initiate {
    /// Group the ping is about.
    pub group_uid: Uid,
    /// Member to ping.
    pub member_identity: CryptoIdentity,
}

/// The ping itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    /// Group the ping is about.
    pub group_uid: Uid,
    /// Identity that sent the ping.
    pub sender_identity: CryptoIdentity,
    /// Signature over (group uid, sender, recipient).
    pub signature: Bytes,
}

/// Signed reply closing the run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingReply {
    /// Group the ping was about.
    pub group_uid: Uid,
    /// Identity replying.
    pub sender_identity: CryptoIdentity,
    /// Signature over (group uid, sender, recipient).
    pub signature: Bytes,
}

/// All group-ping messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// Local kick-off.
    Initiate(Initiate),
    /// The ping.
    Ping(Ping),
    /// The signed reply.
    PingReply(PingReply),
}

impl Message {
    /// Discriminant carried in the payload envelope.
    #[must_use]
    pub const fn message_id(&self) -> u16 {
        match self {
            Self::Initiate(_) => MSG_INITIATE,
            Self::Ping(_) => MSG_PING,
            Self::PingReply(_) => MSG_PING_REPLY,
        }
    }

    /// Wrap into a payload envelope.
    pub fn into_payload(self, instance_uid: InstanceUid) -> Result<ProtocolPayload> {
        let kind = ProtocolKind::GroupMembershipPing;
        let message_id = self.message_id();
        match self {
            Self::Initiate(b) => ProtocolPayload::from_body(kind, instance_uid, message_id, &b),
            Self::Ping(b) => ProtocolPayload::from_body(kind, instance_uid, message_id, &b),
            Self::PingReply(b) => ProtocolPayload::from_body(kind, instance_uid, message_id, &b),
        }
    }

    /// Decode a payload body for this kind.
    pub fn decode(payload: &ProtocolPayload) -> Result<Self> {
        match payload.message_id {
            MSG_INITIATE => Ok(Self::Initiate(from_cbor(&payload.body)?)),
            MSG_PING => Ok(Self::Ping(from_cbor(&payload.body)?)),
            MSG_PING_REPLY => Ok(Self::PingReply(from_cbor(&payload.body)?)),
            other => unknown_message(payload.kind, other),
        }
    }
}
