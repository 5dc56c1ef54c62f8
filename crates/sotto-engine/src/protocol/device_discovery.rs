//! Device discovery: refresh the directory from the server's device list.
//!
//! Two steps: the kick-off posts a server query, the reply step diffs the
//! authoritative list against the directory and emits add/remove effects.
//! Used to recover from stale device records, both standalone (presence
//! coordinator's delete-then-discover) and as a child of channel creation.

use serde::{Deserialize, Serialize};
use sotto_proto::{
    CryptoIdentity, OutboundMessage, Recipient, ReceptionChannel,
    payloads::device_discovery::{DeviceList, DeviceListRequest, Initiate, Message},
};

use super::{
    ProtocolEffect, StepCancelReason, StepInputs, StepTransition, decode_message, decode_state,
    encode_state,
};
use crate::collaborators::IdentityDirectory;

/// Persisted states.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// Server query posted, waiting for the reply.
    WaitingForDeviceList {
        /// Identity being discovered.
        remote_identity: CryptoIdentity,
    },
    /// Terminal marker; never persisted by a correct step.
    Done,
}

/// Run one step of the discovery machine.
pub fn step<I: IdentityDirectory + ?Sized>(
    inputs: &StepInputs<'_>,
    identity: &I,
) -> Result<StepTransition, StepCancelReason> {
    let message = decode_message(inputs.payload, Message::decode)?;
    let state: Option<State> = decode_state(inputs.state)?;

    match (state, message) {
        (None, Message::Initiate(init)) if matches!(inputs.via, ReceptionChannel::Local) => {
            request_device_list(inputs, &init)
        },
        (Some(State::WaitingForDeviceList { remote_identity }), Message::DeviceList(list))
            if matches!(inputs.via, ReceptionChannel::Local)
                && list.remote_identity == remote_identity =>
        {
            apply_device_list(inputs, identity, &list)
        },
        _ => Err(StepCancelReason::NoMatchingStep),
    }
}

fn request_device_list(
    inputs: &StepInputs<'_>,
    init: &Initiate,
) -> Result<StepTransition, StepCancelReason> {
    Ok(StepTransition {
        new_state: Some(encode_state(&State::WaitingForDeviceList {
            remote_identity: init.remote_identity,
        })?),
        outbound: vec![OutboundMessage {
            from: inputs.owned_identity,
            to: Recipient::Server,
            payload: Message::DeviceListRequest(DeviceListRequest {
                remote_identity: init.remote_identity,
            })
            .into_payload(inputs.instance_uid)
            .map_err(|e| StepCancelReason::NewStateUncomputable(e.to_string()))?,
        }],
        children: Vec::new(),
        effects: Vec::new(),
    })
}

fn apply_device_list<I: IdentityDirectory + ?Sized>(
    inputs: &StepInputs<'_>,
    identity: &I,
    list: &DeviceList,
) -> Result<StepTransition, StepCancelReason> {
    let known = identity
        .devices_of(inputs.owned_identity, list.remote_identity)
        .map_err(|e| StepCancelReason::NewStateUncomputable(e.to_string()))?;

    let mut effects = Vec::new();
    for device in &list.devices {
        if !known.contains(device) {
            effects.push(ProtocolEffect::AddDevice {
                remote_identity: list.remote_identity,
                device: *device,
            });
        }
    }
    for device in &known {
        if !list.devices.contains(device) {
            effects.push(ProtocolEffect::RemoveDevice {
                remote_identity: list.remote_identity,
                device: *device,
            });
        }
    }

    Ok(StepTransition { new_state: None, outbound: Vec::new(), children: Vec::new(), effects })
}
