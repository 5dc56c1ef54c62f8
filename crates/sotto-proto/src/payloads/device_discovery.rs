//! Device-discovery messages.
//!
//! The discovery run asks the server for a remote identity's current device
//! list, then diffs it against the local directory. The server reply comes
//! back as a local message addressed to the same instance.

use serde::{Deserialize, Serialize};

use crate::{
    Result,
    error::from_cbor,
    ids::{CryptoIdentity, DeviceUid, InstanceUid},
    payload::{ProtocolKind, ProtocolPayload, unknown_message},
};

/// Discriminant for [`Message::Initiate`].
pub const MSG_INITIATE: u16 = 0;
/// Discriminant for [`Message::DeviceListRequest`].
pub const MSG_DEVICE_LIST_REQUEST: u16 = 1;
/// Discriminant for [`Message::DeviceList`].
pub const MSG_DEVICE_LIST: u16 = 2;

/// Local kick-off: discover devices of one remote identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Initiate {
    /// Identity whose devices should be enumerated.
    pub remote_identity: CryptoIdentity,
}

/// Server query posted by the first step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceListRequest {
    /// Identity whose devices the server should enumerate.
    pub remote_identity: CryptoIdentity,
}

/// Server reply: the authoritative device list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceList {
    /// Identity the list belongs to.
    pub remote_identity: CryptoIdentity,
    /// Current devices as known by the server.
    pub devices: Vec<DeviceUid>,
}

/// All device-discovery messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// Local kick-off.
    Initiate(Initiate),
    /// Query to the server.
    DeviceListRequest(DeviceListRequest),
    /// Authoritative reply.
    DeviceList(DeviceList),
}

impl Message {
    /// Discriminant carried in the payload envelope.
    #[must_use]
    pub const fn message_id(&self) -> u16 {
        match self {
            Self::Initiate(_) => MSG_INITIATE,
            Self::DeviceListRequest(_) => MSG_DEVICE_LIST_REQUEST,
            Self::DeviceList(_) => MSG_DEVICE_LIST,
        }
    }

    /// Wrap into a payload envelope.
    pub fn into_payload(self, instance_uid: InstanceUid) -> Result<ProtocolPayload> {
        let kind = ProtocolKind::DeviceDiscovery;
        let message_id = self.message_id();
        match self {
            Self::Initiate(b) => ProtocolPayload::from_body(kind, instance_uid, message_id, &b),
            Self::DeviceListRequest(b) => {
                ProtocolPayload::from_body(kind, instance_uid, message_id, &b)
            },
            Self::DeviceList(b) => ProtocolPayload::from_body(kind, instance_uid, message_id, &b),
        }
    }

    /// Decode a payload body for this kind.
    pub fn decode(payload: &ProtocolPayload) -> Result<Self> {
        match payload.message_id {
            MSG_INITIATE => Ok(Self::Initiate(from_cbor(&payload.body)?)),
            MSG_DEVICE_LIST_REQUEST => Ok(Self::DeviceListRequest(from_cbor(&payload.body)?)),
            MSG_DEVICE_LIST => Ok(Self::DeviceList(from_cbor(&payload.body)?)),
            other => unknown_message(payload.kind, other),
        }
    }
}
