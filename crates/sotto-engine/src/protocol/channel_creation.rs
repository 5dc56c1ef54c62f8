//! Channel creation with a contact device or another owned device.
//!
//! Both variants run the same machine; the payload kind keeps their
//! instances apart and the [`Variant`] parameter tightens the trust checks
//! (a contact-device run requires contact trust, an owned-device run
//! requires the peer identity to be the owned identity itself and rejects
//! the current device as its own peer).
//!
//! ```text
//!  initiator                                  responder
//!  ─────────                                  ─────────
//!  Initiate (local)
//!    │ clean stale runs + channel, ping
//!    ▼
//!  PingSent ── Ping ─────────────────────────▶ (fresh instance)
//!                                               clean stale runs + channel
//!  PingSent ◀───────────────── EphemeralKey ── AwaitingKeyConfirmation
//!    │ derive seed, establish channel
//!    ▼
//!  AwaitingAck ── KeyConfirmation ───────────▶ establish channel, ack
//!  AwaitingAck ◀──────────────────────── Ack ─ (final)
//!    │ (final)
//! ```
//!
//! The seed handed to the channel collaborator is `responder_key ||
//! initiator_key` on both sides; real key derivation happens behind the
//! collaborator.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sotto_proto::{
    ChannelTarget, CryptoIdentity, DeviceUid, InstanceUid, OutboundMessage, ProtocolKind,
    Recipient, ReceptionChannel,
    payloads::{
        channel_creation::{Ack, EphemeralKey, Initiate, KeyConfirmation, Message, Ping},
        device_discovery,
    },
};

use super::{
    ChildSpawn, ProtocolEffect, StepCancelReason, StepInputs, StepTransition, decode_message,
    decode_state, encode_state,
};
use crate::collaborators::IdentityDirectory;

/// Which flavor of channel creation is running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Variant {
    /// Peer device belongs to a trusted contact.
    ContactDevice,
    /// Peer device belongs to the owned identity itself.
    OwnedDevice,
}

impl Variant {
    /// The payload kind for this variant.
    #[must_use]
    pub const fn kind(self) -> ProtocolKind {
        match self {
            Self::ContactDevice => ProtocolKind::ChannelCreationContactDevice,
            Self::OwnedDevice => ProtocolKind::ChannelCreationOwnedDevice,
        }
    }
}

/// Persisted states.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// Initiator: ping sent, waiting for the responder's ephemeral key.
    PingSent {
        /// Channel being created.
        target: ChannelTarget,
    },
    /// Responder: ephemeral key sent, waiting for the confirmation.
    AwaitingKeyConfirmation {
        /// Channel being created.
        target: ChannelTarget,
        /// Our ephemeral public key (the k1 half of the seed).
        local_key: Bytes,
    },
    /// Initiator: channel established locally, waiting for the ack.
    AwaitingAck {
        /// Channel being created.
        target: ChannelTarget,
    },
    /// Terminal marker; never persisted by a correct step.
    Done,
}

/// Challenge bound by the ping signature.
///
/// Symmetric in the two endpoints so both sides compute the same bytes:
/// the sender signs from its own view, the receiver rebuilds from the
/// mirrored view.
fn ping_challenge(
    sender_identity: CryptoIdentity,
    sender_device: DeviceUid,
    receiver_identity: CryptoIdentity,
    receiver_device: DeviceUid,
) -> Vec<u8> {
    let mut challenge = Vec::with_capacity(16 + 4 * 32);
    challenge.extend_from_slice(b"channel-creation-ping");
    challenge.extend_from_slice(sender_identity.as_bytes());
    challenge.extend_from_slice(sender_device.as_bytes());
    challenge.extend_from_slice(receiver_identity.as_bytes());
    challenge.extend_from_slice(receiver_device.as_bytes());
    challenge
}

/// Challenge bound by the key-confirmation signature.
fn confirmation_challenge(responder_key: &[u8], initiator_key: &[u8]) -> Vec<u8> {
    let mut challenge = Vec::with_capacity(24 + responder_key.len() + initiator_key.len());
    challenge.extend_from_slice(b"channel-creation-confirm");
    challenge.extend_from_slice(responder_key);
    challenge.extend_from_slice(initiator_key);
    challenge
}

fn seed(responder_key: &[u8], initiator_key: &[u8]) -> Bytes {
    let mut bytes = Vec::with_capacity(responder_key.len() + initiator_key.len());
    bytes.extend_from_slice(responder_key);
    bytes.extend_from_slice(initiator_key);
    Bytes::from(bytes)
}

/// Run one step of the channel-creation machine.
pub fn step<I: IdentityDirectory + ?Sized>(
    inputs: &StepInputs<'_>,
    identity: &I,
    variant: Variant,
) -> Result<StepTransition, StepCancelReason> {
    let message = decode_message(inputs.payload, Message::decode)?;
    let state: Option<State> = decode_state(inputs.state)?;

    match (state, message) {
        (None, Message::Initiate(init))
            if matches!(inputs.via, ReceptionChannel::Local) =>
        {
            send_ping(inputs, identity, variant, &init)
        },
        (None, Message::Ping(ping))
            if matches!(inputs.via, ReceptionChannel::Asynchronous { remote_identity }
                if remote_identity == ping.sender_identity) =>
        {
            respond_to_ping(inputs, identity, variant, &ping)
        },
        (Some(State::PingSent { target }), Message::EphemeralKey(k1))
            if via_matches_target(inputs.via, target) && k1.sender_device == target.remote_device =>
        {
            send_key_confirmation(inputs, identity, target, &k1)
        },
        (Some(State::AwaitingKeyConfirmation { target, local_key }), Message::KeyConfirmation(k2))
            if via_matches_target(inputs.via, target) && k2.sender_device == target.remote_device =>
        {
            establish_and_ack(inputs, identity, target, &local_key, &k2)
        },
        (Some(State::AwaitingAck { target }), Message::Ack(ack))
            if via_matches_target(inputs.via, target) && ack.sender_device == target.remote_device =>
        {
            finish(target)
        },
        _ => Err(StepCancelReason::NoMatchingStep),
    }
}

fn via_matches_target(via: ReceptionChannel, target: ChannelTarget) -> bool {
    matches!(via, ReceptionChannel::Asynchronous { remote_identity }
        if remote_identity == target.remote_identity)
}

fn check_peer(
    inputs: &StepInputs<'_>,
    identity: &(impl IdentityDirectory + ?Sized),
    variant: Variant,
    remote_identity: CryptoIdentity,
    remote_device: DeviceUid,
) -> Result<(), StepCancelReason> {
    match variant {
        Variant::OwnedDevice => {
            if remote_identity != inputs.owned_identity {
                return Err(StepCancelReason::NewStateUncomputable(
                    "owned-device run with a foreign identity".to_string(),
                ));
            }
            if remote_device == inputs.current_device {
                return Err(StepCancelReason::NewStateUncomputable(
                    "owned-device run targeting the current device".to_string(),
                ));
            }
        },
        Variant::ContactDevice => {
            let trusted = identity
                .is_contact(inputs.owned_identity, remote_identity)
                .map_err(|e| StepCancelReason::NewStateUncomputable(e.to_string()))?;
            if !trusted {
                return Err(StepCancelReason::NewStateUncomputable(
                    "peer is not a trusted contact".to_string(),
                ));
            }
        },
    }
    Ok(())
}

fn send_ping<I: IdentityDirectory + ?Sized>(
    inputs: &StepInputs<'_>,
    identity: &I,
    variant: Variant,
    init: &Initiate,
) -> Result<StepTransition, StepCancelReason> {
    check_peer(inputs, identity, variant, init.remote_identity, init.remote_device)?;

    let target = ChannelTarget {
        owned_identity: inputs.owned_identity,
        remote_identity: init.remote_identity,
        remote_device: init.remote_device,
    };

    let challenge = ping_challenge(
        inputs.owned_identity,
        inputs.current_device,
        init.remote_identity,
        init.remote_device,
    );
    let signature = identity
        .sign_challenge(inputs.owned_identity, &challenge)
        .map_err(|e| StepCancelReason::NewStateUncomputable(e.to_string()))?;

    let mut transition = StepTransition {
        new_state: Some(encode_state(&State::PingSent { target })?),
        ..StepTransition::default()
    };

    // A contact device we have never catalogued means our directory is
    // stale; refresh it alongside the handshake.
    if variant == Variant::ContactDevice {
        let known = identity
            .devices_of(inputs.owned_identity, init.remote_identity)
            .map_err(|e| StepCancelReason::NewStateUncomputable(e.to_string()))?;
        if !known.contains(&init.remote_device) {
            let child_uid = InstanceUid::from_bytes(inputs.nonce);
            let payload = device_discovery::Message::Initiate(device_discovery::Initiate {
                remote_identity: init.remote_identity,
            })
            .into_payload(child_uid)
            .map_err(|e| StepCancelReason::NewStateUncomputable(e.to_string()))?;
            transition.children.push(ChildSpawn { instance_uid: child_uid, payload });
        }
    }

    transition.effects.extend([
        ProtocolEffect::AbortOtherRunsForTarget { target },
        ProtocolEffect::DeleteChannel { target },
        ProtocolEffect::RegisterCreationKey { target },
    ]);

    transition.outbound.push(OutboundMessage {
        from: inputs.owned_identity,
        to: Recipient::Device {
            remote_identity: init.remote_identity,
            remote_device: init.remote_device,
        },
        payload: Message::Ping(Ping {
            sender_identity: inputs.owned_identity,
            sender_device: inputs.current_device,
            signature,
        })
        .into_payload(inputs.payload.kind, inputs.instance_uid)
        .map_err(|e| StepCancelReason::NewStateUncomputable(e.to_string()))?,
    });

    Ok(transition)
}

fn respond_to_ping<I: IdentityDirectory + ?Sized>(
    inputs: &StepInputs<'_>,
    identity: &I,
    variant: Variant,
    ping: &Ping,
) -> Result<StepTransition, StepCancelReason> {
    check_peer(inputs, identity, variant, ping.sender_identity, ping.sender_device)?;

    // The sender signed from its own view; rebuild the mirrored challenge.
    let challenge = ping_challenge(
        ping.sender_identity,
        ping.sender_device,
        inputs.owned_identity,
        inputs.current_device,
    );
    let valid = identity
        .verify_challenge(ping.sender_identity, &challenge, &ping.signature)
        .map_err(|e| StepCancelReason::NewStateUncomputable(e.to_string()))?;
    if !valid {
        return Err(StepCancelReason::NewStateUncomputable(
            "ping signature does not verify".to_string(),
        ));
    }

    let target = ChannelTarget {
        owned_identity: inputs.owned_identity,
        remote_identity: ping.sender_identity,
        remote_device: ping.sender_device,
    };

    let local_key = Bytes::copy_from_slice(&inputs.nonce);

    Ok(StepTransition {
        new_state: Some(encode_state(&State::AwaitingKeyConfirmation {
            target,
            local_key: local_key.clone(),
        })?),
        outbound: vec![OutboundMessage {
            from: inputs.owned_identity,
            to: Recipient::Device {
                remote_identity: target.remote_identity,
                remote_device: target.remote_device,
            },
            payload: Message::EphemeralKey(EphemeralKey {
                sender_device: inputs.current_device,
                public_key: local_key,
            })
            .into_payload(inputs.payload.kind, inputs.instance_uid)
            .map_err(|e| StepCancelReason::NewStateUncomputable(e.to_string()))?,
        }],
        children: Vec::new(),
        effects: vec![
            ProtocolEffect::AbortOtherRunsForTarget { target },
            ProtocolEffect::DeleteChannel { target },
            ProtocolEffect::RegisterCreationKey { target },
        ],
    })
}

fn send_key_confirmation<I: IdentityDirectory + ?Sized>(
    inputs: &StepInputs<'_>,
    identity: &I,
    target: ChannelTarget,
    k1: &EphemeralKey,
) -> Result<StepTransition, StepCancelReason> {
    let local_key = Bytes::copy_from_slice(&inputs.nonce);
    let channel_seed = seed(&k1.public_key, &local_key);

    let confirmation = identity
        .sign_challenge(
            inputs.owned_identity,
            &confirmation_challenge(&k1.public_key, &local_key),
        )
        .map_err(|e| StepCancelReason::NewStateUncomputable(e.to_string()))?;

    Ok(StepTransition {
        new_state: Some(encode_state(&State::AwaitingAck { target })?),
        outbound: vec![OutboundMessage {
            from: inputs.owned_identity,
            to: Recipient::Device {
                remote_identity: target.remote_identity,
                remote_device: target.remote_device,
            },
            payload: Message::KeyConfirmation(KeyConfirmation {
                sender_device: inputs.current_device,
                public_key: local_key,
                confirmation,
            })
            .into_payload(inputs.payload.kind, inputs.instance_uid)
            .map_err(|e| StepCancelReason::NewStateUncomputable(e.to_string()))?,
        }],
        children: Vec::new(),
        effects: vec![ProtocolEffect::EstablishChannel { target, seed: channel_seed }],
    })
}

fn establish_and_ack<I: IdentityDirectory + ?Sized>(
    inputs: &StepInputs<'_>,
    identity: &I,
    target: ChannelTarget,
    local_key: &Bytes,
    k2: &KeyConfirmation,
) -> Result<StepTransition, StepCancelReason> {
    let valid = identity
        .verify_challenge(
            target.remote_identity,
            &confirmation_challenge(local_key, &k2.public_key),
            &k2.confirmation,
        )
        .map_err(|e| StepCancelReason::NewStateUncomputable(e.to_string()))?;
    if !valid {
        return Err(StepCancelReason::NewStateUncomputable(
            "key confirmation does not verify".to_string(),
        ));
    }

    let channel_seed = seed(local_key, &k2.public_key);

    Ok(StepTransition {
        new_state: None,
        outbound: vec![OutboundMessage {
            from: inputs.owned_identity,
            to: Recipient::Device {
                remote_identity: target.remote_identity,
                remote_device: target.remote_device,
            },
            payload: Message::Ack(Ack { sender_device: inputs.current_device })
                .into_payload(inputs.payload.kind, inputs.instance_uid)
                .map_err(|e| StepCancelReason::NewStateUncomputable(e.to_string()))?,
        }],
        children: Vec::new(),
        effects: vec![
            ProtocolEffect::EstablishChannel { target, seed: channel_seed },
            ProtocolEffect::ClearCreationKey { target },
        ],
    })
}

fn finish(target: ChannelTarget) -> Result<StepTransition, StepCancelReason> {
    Ok(StepTransition {
        new_state: None,
        outbound: Vec::new(),
        children: Vec::new(),
        effects: vec![ProtocolEffect::ClearCreationKey { target }],
    })
}

#[cfg(test)]
mod tests {
    use sotto_proto::InstanceUid;

    use super::*;
    use crate::testutil::{MockDirectory, identity, device};

    fn inputs<'a>(
        owned: CryptoIdentity,
        current: DeviceUid,
        payload: &'a sotto_proto::ProtocolPayload,
        state: Option<&'a Bytes>,
        via: ReceptionChannel,
    ) -> StepInputs<'a> {
        StepInputs {
            owned_identity: owned,
            current_device: current,
            instance_uid: InstanceUid::from_bytes([1; 32]),
            state,
            payload,
            via,
            now_ms: 1_000,
            nonce: [7; 32],
        }
    }

    #[test]
    fn initiate_sends_signed_ping_and_registers_creation_key() {
        let alice = identity(1);
        let bob = identity(2);
        let alice_dev = device(10);
        let bob_dev = device(20);

        let dir = MockDirectory::new();
        dir.add_owned(alice, alice_dev);
        dir.add_contact(alice, bob);
        dir.add_remote_device(alice, bob, bob_dev, None);

        let payload = Message::Initiate(Initiate { remote_identity: bob, remote_device: bob_dev })
            .into_payload(ProtocolKind::ChannelCreationContactDevice, InstanceUid::from_bytes([1; 32]))
            .unwrap();

        let inp = inputs(alice, alice_dev, &payload, None, ReceptionChannel::Local);
        let transition = step(&inp, &dir, Variant::ContactDevice).unwrap();

        let target = ChannelTarget {
            owned_identity: alice,
            remote_identity: bob,
            remote_device: bob_dev,
        };
        assert!(transition.new_state.is_some());
        assert_eq!(transition.outbound.len(), 1);
        assert!(transition.children.is_empty());
        assert!(transition.effects.contains(&ProtocolEffect::RegisterCreationKey { target }));
        assert!(transition.effects.contains(&ProtocolEffect::DeleteChannel { target }));
        assert!(
            transition.effects.contains(&ProtocolEffect::AbortOtherRunsForTarget { target })
        );
    }

    #[test]
    fn initiate_towards_uncatalogued_device_spawns_discovery_child() {
        let alice = identity(1);
        let bob = identity(2);
        let alice_dev = device(10);

        let dir = MockDirectory::new();
        dir.add_owned(alice, alice_dev);
        dir.add_contact(alice, bob);
        // bob's device is deliberately not catalogued.

        let payload = Message::Initiate(Initiate {
            remote_identity: bob,
            remote_device: device(20),
        })
        .into_payload(ProtocolKind::ChannelCreationContactDevice, InstanceUid::from_bytes([1; 32]))
        .unwrap();

        let inp = inputs(alice, alice_dev, &payload, None, ReceptionChannel::Local);
        let transition = step(&inp, &dir, Variant::ContactDevice).unwrap();

        assert_eq!(transition.children.len(), 1);
        assert_eq!(transition.children[0].payload.kind, ProtocolKind::DeviceDiscovery);
    }

    #[test]
    fn owned_variant_rejects_the_current_device_as_peer() {
        let alice = identity(1);
        let alice_dev = device(10);

        let dir = MockDirectory::new();
        dir.add_owned(alice, alice_dev);

        let payload = Message::Initiate(Initiate {
            remote_identity: alice,
            remote_device: alice_dev,
        })
        .into_payload(ProtocolKind::ChannelCreationOwnedDevice, InstanceUid::from_bytes([1; 32]))
        .unwrap();

        let inp = inputs(alice, alice_dev, &payload, None, ReceptionChannel::Local);
        let result = step(&inp, &dir, Variant::OwnedDevice);
        assert!(matches!(result, Err(StepCancelReason::NewStateUncomputable(_))));
    }

    #[test]
    fn ping_from_untrusted_identity_is_rejected() {
        let alice = identity(1);
        let mallory = identity(9);
        let alice_dev = device(10);

        let dir = MockDirectory::new();
        dir.add_owned(alice, alice_dev);

        let payload = Message::Ping(Ping {
            sender_identity: mallory,
            sender_device: device(90),
            signature: Bytes::from_static(b"whatever"),
        })
        .into_payload(ProtocolKind::ChannelCreationContactDevice, InstanceUid::from_bytes([1; 32]))
        .unwrap();

        let inp = inputs(
            alice,
            alice_dev,
            &payload,
            None,
            ReceptionChannel::Asynchronous { remote_identity: mallory },
        );
        let result = step(&inp, &dir, Variant::ContactDevice);
        assert!(matches!(result, Err(StepCancelReason::NewStateUncomputable(_))));
    }

    #[test]
    fn full_handshake_derives_the_same_seed_on_both_sides() {
        let alice = identity(1);
        let bob = identity(2);
        let alice_dev = device(10);
        let bob_dev = device(20);

        let dir = MockDirectory::new();
        dir.add_owned(alice, alice_dev);
        dir.add_owned(bob, bob_dev);
        dir.add_contact(alice, bob);
        dir.add_contact(bob, alice);
        dir.add_remote_device(alice, bob, bob_dev, None);
        dir.add_remote_device(bob, alice, alice_dev, None);

        let instance = InstanceUid::from_bytes([1; 32]);
        let kind = ProtocolKind::ChannelCreationContactDevice;

        // Alice initiates.
        let payload = Message::Initiate(Initiate { remote_identity: bob, remote_device: bob_dev })
            .into_payload(kind, instance)
            .unwrap();
        let inp = inputs(alice, alice_dev, &payload, None, ReceptionChannel::Local);
        let alice_t1 = step(&inp, &dir, Variant::ContactDevice).unwrap();
        let ping_payload = alice_t1.outbound[0].payload.clone();
        let alice_state = alice_t1.new_state.unwrap();

        // Bob answers the ping with his ephemeral key.
        let mut inp =
            inputs(bob, bob_dev, &ping_payload, None, ReceptionChannel::Asynchronous {
                remote_identity: alice,
            });
        inp.nonce = [11; 32];
        let bob_t1 = step(&inp, &dir, Variant::ContactDevice).unwrap();
        let k1_payload = bob_t1.outbound[0].payload.clone();
        let bob_state = bob_t1.new_state.unwrap();

        // Alice replies with the key confirmation and establishes.
        let mut inp = inputs(
            alice,
            alice_dev,
            &k1_payload,
            Some(&alice_state),
            ReceptionChannel::Asynchronous { remote_identity: bob },
        );
        inp.nonce = [13; 32];
        let alice_t2 = step(&inp, &dir, Variant::ContactDevice).unwrap();
        let k2_payload = alice_t2.outbound[0].payload.clone();
        let alice_seed = alice_t2
            .effects
            .iter()
            .find_map(|e| match e {
                ProtocolEffect::EstablishChannel { seed, .. } => Some(seed.clone()),
                _ => None,
            })
            .unwrap();

        // Bob verifies, establishes, and acks; his run is final.
        let inp = inputs(
            bob,
            bob_dev,
            &k2_payload,
            Some(&bob_state),
            ReceptionChannel::Asynchronous { remote_identity: alice },
        );
        let bob_t2 = step(&inp, &dir, Variant::ContactDevice).unwrap();
        assert!(bob_t2.new_state.is_none());
        let bob_seed = bob_t2
            .effects
            .iter()
            .find_map(|e| match e {
                ProtocolEffect::EstablishChannel { seed, .. } => Some(seed.clone()),
                _ => None,
            })
            .unwrap();

        assert_eq!(alice_seed, bob_seed);

        // The ack closes Alice's run.
        let ack_payload = bob_t2.outbound[0].payload.clone();
        let alice_state = alice_t2.new_state.unwrap();
        let inp = inputs(
            alice,
            alice_dev,
            &ack_payload,
            Some(&alice_state),
            ReceptionChannel::Asynchronous { remote_identity: bob },
        );
        let alice_t3 = step(&inp, &dir, Variant::ContactDevice).unwrap();
        assert!(alice_t3.new_state.is_none());
    }

    #[test]
    fn handshake_messages_over_the_wrong_channel_match_no_step() {
        let alice = identity(1);
        let bob = identity(2);
        let alice_dev = device(10);

        let dir = MockDirectory::new();
        dir.add_owned(alice, alice_dev);
        dir.add_contact(alice, bob);

        // An initiate arriving over the network instead of locally.
        let payload = Message::Initiate(Initiate {
            remote_identity: bob,
            remote_device: device(20),
        })
        .into_payload(ProtocolKind::ChannelCreationContactDevice, InstanceUid::from_bytes([1; 32]))
        .unwrap();

        let inp = inputs(
            alice,
            alice_dev,
            &payload,
            None,
            ReceptionChannel::Asynchronous { remote_identity: bob },
        );
        assert!(matches!(
            step(&inp, &dir, Variant::ContactDevice),
            Err(StepCancelReason::NoMatchingStep)
        ));
    }
}
