//! Outbound protocol messages.
//!
//! Steps produce these; the channel collaborator routes and encrypts them.
//! The engine never sees the wire encoding.

use serde::{Deserialize, Serialize};

use crate::{
    ids::{CryptoIdentity, DeviceUid},
    payload::ProtocolPayload,
};

/// Where an outbound protocol message should go.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recipient {
    /// Loop back to this device (feeds the next local step).
    Local,
    /// One specific remote device.
    Device {
        /// Remote identity the device belongs to.
        remote_identity: CryptoIdentity,
        /// Target device.
        remote_device: DeviceUid,
    },
    /// Every known device of a remote identity.
    AllDevicesOf {
        /// Remote identity to fan out to.
        remote_identity: CryptoIdentity,
    },
    /// A server query; the reply comes back as a local message.
    Server,
}

/// One protocol message to post through the channel collaborator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Owned identity posting the message.
    pub from: CryptoIdentity,
    /// Routing target.
    pub to: Recipient,
    /// The payload to deliver.
    pub payload: ProtocolPayload,
}
