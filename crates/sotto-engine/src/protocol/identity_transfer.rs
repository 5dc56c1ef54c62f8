//! Identity transfer: move an owned identity to a new device.
//!
//! Dialog-driven: the source device shows a session number and waits for the
//! user's confirmation before handing the snapshot over. The target side
//! consumes the snapshot in a single step. Instances of this protocol never
//! survive a restart; the runner purges them (and their pending messages) at
//! bootstrap, so a half-finished transfer can only be restarted, never
//! resumed.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sotto_proto::{
    DialogKind, DialogMessage, OutboundMessage, Recipient, ReceptionChannel, Uid,
    payloads::identity_transfer::{DialogResponse, InitiateOnSource, Message, Snapshot},
};

use super::{
    ProtocolEffect, StepCancelReason, StepInputs, StepTransition, decode_message, decode_state,
    encode_state,
};
use crate::collaborators::IdentityDirectory;

/// Persisted states.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// Source: session number displayed, waiting for the user.
    AwaitingDialogResponse {
        /// Dialog the user must answer.
        dialog_uid: Uid,
    },
    /// Terminal marker; never persisted by a correct step.
    Done,
}

/// Run one step of the transfer machine.
pub fn step<I: IdentityDirectory + ?Sized>(
    inputs: &StepInputs<'_>,
    _identity: &I,
) -> Result<StepTransition, StepCancelReason> {
    let message = decode_message(inputs.payload, Message::decode)?;
    let state: Option<State> = decode_state(inputs.state)?;

    match (state, message) {
        (None, Message::InitiateOnSource(init))
            if matches!(inputs.via, ReceptionChannel::Local) =>
        {
            show_session_number(inputs, &init)
        },
        (Some(State::AwaitingDialogResponse { dialog_uid }), Message::DialogResponse(response))
            if matches!(inputs.via, ReceptionChannel::Local)
                && response.dialog_uid == dialog_uid =>
        {
            handle_dialog_response(inputs, dialog_uid, &response)
        },
        (None, Message::Snapshot(snapshot))
            if matches!(inputs.via, ReceptionChannel::Asynchronous { .. }) =>
        {
            install_snapshot(&snapshot)
        },
        _ => Err(StepCancelReason::NoMatchingStep),
    }
}

fn show_session_number(
    inputs: &StepInputs<'_>,
    _init: &InitiateOnSource,
) -> Result<StepTransition, StepCancelReason> {
    let dialog_uid = Uid::from_bytes(inputs.nonce);
    // Eight decimal digits, derived from the step nonce.
    let session_number =
        u32::from_be_bytes([inputs.nonce[0], inputs.nonce[1], inputs.nonce[2], inputs.nonce[3]])
            % 100_000_000;

    Ok(StepTransition {
        new_state: Some(encode_state(&State::AwaitingDialogResponse { dialog_uid })?),
        outbound: Vec::new(),
        children: Vec::new(),
        effects: vec![ProtocolEffect::ShowDialog(DialogMessage {
            uid: dialog_uid,
            owned_identity: inputs.owned_identity,
            kind: DialogKind::TransferSessionNumber { session_number },
        })],
    })
}

fn handle_dialog_response(
    inputs: &StepInputs<'_>,
    dialog_uid: Uid,
    response: &DialogResponse,
) -> Result<StepTransition, StepCancelReason> {
    let mut outbound = Vec::new();

    if response.accepted {
        // The snapshot content is assembled server-side from the sealed
        // identity backup; this engine only routes the handoff message.
        outbound.push(OutboundMessage {
            from: inputs.owned_identity,
            to: Recipient::Server,
            payload: Message::Snapshot(Snapshot {
                snapshot: Bytes::copy_from_slice(inputs.owned_identity.as_bytes()),
            })
            .into_payload(inputs.instance_uid)
            .map_err(|e| StepCancelReason::NewStateUncomputable(e.to_string()))?,
        });
    }

    Ok(StepTransition {
        new_state: None,
        outbound,
        children: Vec::new(),
        effects: vec![ProtocolEffect::DeleteDialog { dialog_uid }],
    })
}

fn install_snapshot(snapshot: &Snapshot) -> Result<StepTransition, StepCancelReason> {
    Ok(StepTransition {
        new_state: None,
        outbound: Vec::new(),
        children: Vec::new(),
        effects: vec![ProtocolEffect::ImportSnapshot { snapshot: snapshot.snapshot.clone() }],
    })
}
