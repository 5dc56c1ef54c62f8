//! Typed message bodies, one module per protocol kind.
//!
//! Each module defines a `Message` enum plus the discriminant mapping used in
//! [`ProtocolPayload::message_id`](crate::ProtocolPayload). Encoding is CBOR
//! of the inner struct only; the discriminant lives in the payload envelope.
//! All matches are exhaustive, so adding a variant without wiring its
//! discriminant fails to compile.

pub mod channel_creation;
pub mod device_discovery;
pub mod group_ping;
pub mod identity_transfer;

use crate::{
    Result, Uid,
    payload::{ProtocolKind, ProtocolPayload},
};

/// If the payload is a dialog response, return the dialog uid it answers.
///
/// The runner uses this to synthesize a delete-dialog directive when a
/// response arrives for which no step matches, so the prompt cannot stay on
/// screen forever.
pub fn dialog_uid_of(payload: &ProtocolPayload) -> Result<Option<Uid>> {
    match payload.kind {
        ProtocolKind::IdentityTransfer
            if payload.message_id == identity_transfer::MSG_DIALOG_RESPONSE =>
        {
            let body: identity_transfer::DialogResponse = payload.decode_body()?;
            Ok(Some(body.dialog_uid))
        },
        ProtocolKind::ChannelCreationContactDevice
        | ProtocolKind::ChannelCreationOwnedDevice
        | ProtocolKind::DeviceDiscovery
        | ProtocolKind::GroupMembershipPing
        | ProtocolKind::IdentityTransfer => Ok(None),
    }
}
