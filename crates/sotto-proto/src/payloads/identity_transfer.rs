//! Identity-transfer messages.
//!
//! Moves an owned identity to a new device: the source device shows a
//! session number, waits for the user's confirmation dialog, then hands the
//! identity snapshot to the target. Transfer instances never survive a
//! restart; the runner purges them (and their pending messages) at bootstrap.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    Result,
    error::from_cbor,
    ids::{InstanceUid, Uid},
    payload::{ProtocolKind, ProtocolPayload, unknown_message},
};

/// Discriminant for [`Message::InitiateOnSource`].
pub const MSG_INITIATE_ON_SOURCE: u16 = 0;
/// Discriminant for [`Message::DialogResponse`].
pub const MSG_DIALOG_RESPONSE: u16 = 1;
/// Discriminant for [`Message::Snapshot`].
pub const MSG_SNAPSHOT: u16 = 2;

/// Local kick-off on the device currently holding the identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiateOnSource {}

/// The user's answer to a transfer dialog.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogResponse {
    /// Dialog being answered.
    pub dialog_uid: Uid,
    /// Whether the user confirmed.
    pub accepted: bool,
}

/// The identity snapshot handed to the target device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Opaque encrypted snapshot; the identity collaborator unpacks it.
    pub snapshot: Bytes,
}

/// All identity-transfer messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// Local kick-off on the source device.
    InitiateOnSource(InitiateOnSource),
    /// User dialog answer.
    DialogResponse(DialogResponse),
    /// Snapshot handoff, consumed on the target device.
    Snapshot(Snapshot),
}

impl Message {
    /// Discriminant carried in the payload envelope.
    #[must_use]
    pub const fn message_id(&self) -> u16 {
        match self {
            Self::InitiateOnSource(_) => MSG_INITIATE_ON_SOURCE,
            Self::DialogResponse(_) => MSG_DIALOG_RESPONSE,
            Self::Snapshot(_) => MSG_SNAPSHOT,
        }
    }

    /// Wrap into a payload envelope.
    pub fn into_payload(self, instance_uid: InstanceUid) -> Result<ProtocolPayload> {
        let kind = ProtocolKind::IdentityTransfer;
        let message_id = self.message_id();
        match self {
            Self::InitiateOnSource(b) => {
                ProtocolPayload::from_body(kind, instance_uid, message_id, &b)
            },
            Self::DialogResponse(b) => {
                ProtocolPayload::from_body(kind, instance_uid, message_id, &b)
            },
            Self::Snapshot(b) => ProtocolPayload::from_body(kind, instance_uid, message_id, &b),
        }
    }

    /// Decode a payload body for this kind.
    pub fn decode(payload: &ProtocolPayload) -> Result<Self> {
        match payload.message_id {
            MSG_INITIATE_ON_SOURCE => Ok(Self::InitiateOnSource(from_cbor(&payload.body)?)),
            MSG_DIALOG_RESPONSE => Ok(Self::DialogResponse(from_cbor(&payload.body)?)),
            MSG_SNAPSHOT => Ok(Self::Snapshot(from_cbor(&payload.body)?)),
            other => unknown_message(payload.kind, other),
        }
    }
}
