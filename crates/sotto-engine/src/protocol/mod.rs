//! Protocol step engine.
//!
//! Pure state-machine logic: given the persisted instance state and one
//! inbound message, a step yields the new state, outbound messages, spawned
//! children, and side effects - or cancels with a typed reason. Steps never
//! touch the store and never perform I/O; the runner owns both.
//!
//! Each protocol kind lives in its own module with its own state enumeration
//! and step table behind the shared [`execute_step`] contract. Dispatch is a
//! plain match on [`ProtocolKind`]; adding a kind without wiring it fails to
//! compile.
//!
//! # Invariants
//!
//! - A step either returns a complete transition or cancels; there is no
//!   partial output.
//! - `new_state == None` means the instance is final and must be deleted.
//! - Reception-channel checks happen before any state inspection: a message
//!   arriving over the wrong channel matches no step.

pub mod channel_creation;
pub mod device_discovery;
pub mod group_ping;
pub mod identity_transfer;

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};
use sotto_proto::{
    ChannelTarget, CryptoIdentity, DeviceUid, DialogMessage, InstanceUid, OutboundMessage,
    ProtocolKind, ProtocolPayload, ReceptionChannel, Uid, payloads,
};
use thiserror::Error;

use crate::collaborators::IdentityDirectory;

/// Why a step could not be executed.
///
/// Every reason is terminal for the carrying message except `CommitFailed`,
/// which the runner retries after a short fixed delay. The reason alone is
/// sufficient to pick the retry policy mechanically.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StepCancelReason {
    /// No step matches the current state and message type.
    #[error("no step matches the current state and message")]
    NoMatchingStep,

    /// A dialog response matched no step; the prompt must be dismissed.
    #[error("no step matches dialog response {0}")]
    DialogResponseNoStep(Uid),

    /// The message does not parse for its declared kind.
    #[error("message unparsable for its declared kind: {0}")]
    MessageUnparsable(String),

    /// The step logic could not produce a new state.
    #[error("new state uncomputable: {0}")]
    NewStateUncomputable(String),

    /// The owning identity could not be resolved.
    #[error("owning identity unresolvable")]
    OwnedIdentityUnresolvable,

    /// Persisting the transition failed; retried by the runner.
    #[error("store commit failed: {0}")]
    CommitFailed(String),
}

impl StepCancelReason {
    /// True if the runner should retry the message.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::CommitFailed(_))
    }
}

/// Side effects a step asks the runner to carry out.
///
/// Creation-key effects are store mutations and join the step's atomic
/// commit. The rest target collaborators and run after the commit succeeds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProtocolEffect {
    /// Create (or replace) the device channel for `target`.
    EstablishChannel {
        /// Channel endpoints.
        target: ChannelTarget,
        /// Opaque seed material for the channel keys.
        seed: Bytes,
    },
    /// Delete a half-open or stale channel.
    DeleteChannel {
        /// Channel endpoints.
        target: ChannelTarget,
    },
    /// Register this instance as the running creation for `target`.
    RegisterCreationKey {
        /// Creation target.
        target: ChannelTarget,
    },
    /// Clear the creation key for `target`.
    ClearCreationKey {
        /// Creation target.
        target: ChannelTarget,
    },
    /// Cascade-abort every other instance registered for `target`.
    AbortOtherRunsForTarget {
        /// Creation target whose stale runs must die.
        target: ChannelTarget,
    },
    /// Record a newly discovered device.
    AddDevice {
        /// Identity the device belongs to.
        remote_identity: CryptoIdentity,
        /// The device.
        device: DeviceUid,
    },
    /// Delete a device record the server no longer lists.
    RemoveDevice {
        /// Identity the device belonged to.
        remote_identity: CryptoIdentity,
        /// The device.
        device: DeviceUid,
    },
    /// Surface an interactive dialog.
    ShowDialog(DialogMessage),
    /// Dismiss an interactive dialog.
    DeleteDialog {
        /// Dialog to dismiss.
        dialog_uid: Uid,
    },
    /// Install a transferred identity snapshot.
    ImportSnapshot {
        /// Opaque snapshot.
        snapshot: Bytes,
    },
}

/// A child instance spawned by a step.
///
/// The runner links the child to the executing instance and feeds it the
/// payload as a fresh local message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChildSpawn {
    /// Uid of the child instance.
    pub instance_uid: InstanceUid,
    /// Kick-off message for the child.
    pub payload: ProtocolPayload,
}

/// The complete output of one successful step.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StepTransition {
    /// Encoded new state; `None` deletes the instance (final step).
    pub new_state: Option<Bytes>,
    /// Messages to post through the channel collaborator.
    pub outbound: Vec<OutboundMessage>,
    /// Children to spawn and link.
    pub children: Vec<ChildSpawn>,
    /// Side effects to carry out.
    pub effects: Vec<ProtocolEffect>,
}

/// Read-only facts a step executes against.
#[derive(Clone, Copy, Debug)]
pub struct StepInputs<'a> {
    /// Owned identity the instance belongs to.
    pub owned_identity: CryptoIdentity,
    /// Current device of the owned identity.
    pub current_device: DeviceUid,
    /// The instance the message addresses.
    pub instance_uid: InstanceUid,
    /// Persisted encoded state, `None` for a fresh instance.
    pub state: Option<&'a Bytes>,
    /// The inbound message.
    pub payload: &'a ProtocolPayload,
    /// How the message arrived.
    pub via: ReceptionChannel,
    /// Wall clock, unix millis.
    pub now_ms: u64,
    /// Fresh randomness for uids and session numbers.
    pub nonce: [u8; 32],
}

/// Execute one step against the kind-specific step table.
///
/// A `NoMatchingStep` result for a message that is a dialog response is
/// upgraded to `DialogResponseNoStep`, carrying the dialog uid the runner
/// needs to dismiss the stale prompt.
///
/// # Errors
///
/// A [`StepCancelReason`] describing why no transition was produced.
pub fn execute_step<I: IdentityDirectory + ?Sized>(
    inputs: &StepInputs<'_>,
    identity: &I,
) -> Result<StepTransition, StepCancelReason> {
    let result = match inputs.payload.kind {
        ProtocolKind::ChannelCreationContactDevice => {
            channel_creation::step(inputs, identity, channel_creation::Variant::ContactDevice)
        },
        ProtocolKind::ChannelCreationOwnedDevice => {
            channel_creation::step(inputs, identity, channel_creation::Variant::OwnedDevice)
        },
        ProtocolKind::DeviceDiscovery => device_discovery::step(inputs, identity),
        ProtocolKind::GroupMembershipPing => group_ping::step(inputs, identity),
        ProtocolKind::IdentityTransfer => identity_transfer::step(inputs, identity),
    };

    match result {
        Err(StepCancelReason::NoMatchingStep) => match payloads::dialog_uid_of(inputs.payload) {
            Ok(Some(dialog_uid)) => Err(StepCancelReason::DialogResponseNoStep(dialog_uid)),
            _ => Err(StepCancelReason::NoMatchingStep),
        },
        other => other,
    }
}

/// True if the persisted state decodes as a final state for its kind.
///
/// Steps that finish an instance return `new_state == None`, so final rows
/// should not exist; the bootstrap sweep deletes any that do (a step that
/// forgot to declare itself final).
#[must_use]
pub fn state_is_final(kind: ProtocolKind, state: &Bytes) -> bool {
    match kind {
        ProtocolKind::ChannelCreationContactDevice | ProtocolKind::ChannelCreationOwnedDevice => {
            matches!(decode_state::<channel_creation::State>(Some(state)), Ok(Some(channel_creation::State::Done)))
        },
        ProtocolKind::DeviceDiscovery => {
            matches!(decode_state::<device_discovery::State>(Some(state)), Ok(Some(device_discovery::State::Done)))
        },
        ProtocolKind::GroupMembershipPing => {
            matches!(decode_state::<group_ping::State>(Some(state)), Ok(Some(group_ping::State::Done)))
        },
        ProtocolKind::IdentityTransfer => {
            matches!(decode_state::<identity_transfer::State>(Some(state)), Ok(Some(identity_transfer::State::Done)))
        },
    }
}

/// Decode a persisted state value; `None` stays `None` (fresh instance).
pub(crate) fn decode_state<S: DeserializeOwned>(
    state: Option<&Bytes>,
) -> Result<Option<S>, StepCancelReason> {
    match state {
        None => Ok(None),
        Some(bytes) => ciborium::from_reader(bytes.as_ref())
            .map(Some)
            .map_err(|e| StepCancelReason::NewStateUncomputable(e.to_string())),
    }
}

/// Encode a state value for persistence.
pub(crate) fn encode_state<S: Serialize>(state: &S) -> Result<Bytes, StepCancelReason> {
    let mut buf = Vec::new();
    ciborium::into_writer(state, &mut buf)
        .map_err(|e| StepCancelReason::NewStateUncomputable(e.to_string()))?;
    Ok(Bytes::from(buf))
}

/// Decode the payload body as the kind-specific message enum.
pub(crate) fn decode_message<M>(
    payload: &ProtocolPayload,
    decode: impl FnOnce(&ProtocolPayload) -> sotto_proto::Result<M>,
) -> Result<M, StepCancelReason> {
    decode(payload).map_err(|e| StepCancelReason::MessageUnparsable(e.to_string()))
}
