//! Group-membership ping.
//!
//! A member asserts shared membership towards another member with a signed
//! ping; the peer replies with its own signature. The responder side is
//! stateless (one step, no persisted instance); the initiator keeps one
//! state while waiting for the reply.

use serde::{Deserialize, Serialize};
use sotto_proto::{
    CryptoIdentity, OutboundMessage, Recipient, ReceptionChannel, Uid,
    payloads::group_ping::{Initiate, Message, Ping, PingReply},
};

use super::{
    StepCancelReason, StepInputs, StepTransition, decode_message, decode_state, encode_state,
};
use crate::collaborators::IdentityDirectory;

/// Persisted states.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// Ping sent, waiting for the signed reply.
    AwaitingReply {
        /// Group the ping was about.
        group_uid: Uid,
        /// Member that was pinged.
        member_identity: CryptoIdentity,
    },
    /// Terminal marker; never persisted by a correct step.
    Done,
}

fn ping_challenge(group_uid: Uid, sender: CryptoIdentity, receiver: CryptoIdentity) -> Vec<u8> {
    let mut challenge = Vec::with_capacity(16 + 3 * 32);
    challenge.extend_from_slice(b"group-membership-ping");
    challenge.extend_from_slice(group_uid.as_bytes());
    challenge.extend_from_slice(sender.as_bytes());
    challenge.extend_from_slice(receiver.as_bytes());
    challenge
}

/// Run one step of the group-ping machine.
pub fn step<I: IdentityDirectory + ?Sized>(
    inputs: &StepInputs<'_>,
    identity: &I,
) -> Result<StepTransition, StepCancelReason> {
    let message = decode_message(inputs.payload, Message::decode)?;
    let state: Option<State> = decode_state(inputs.state)?;

    match (state, message) {
        (None, Message::Initiate(init)) if matches!(inputs.via, ReceptionChannel::Local) => {
            send_ping(inputs, identity, &init)
        },
        (None, Message::Ping(ping))
            if sender_matches_via(inputs.via, ping.sender_identity) =>
        {
            reply_to_ping(inputs, identity, &ping)
        },
        (Some(State::AwaitingReply { group_uid, member_identity }), Message::PingReply(reply))
            if sender_matches_via(inputs.via, reply.sender_identity)
                && reply.group_uid == group_uid
                && reply.sender_identity == member_identity =>
        {
            verify_reply(inputs, identity, &reply)
        },
        _ => Err(StepCancelReason::NoMatchingStep),
    }
}

fn sender_matches_via(via: ReceptionChannel, sender: CryptoIdentity) -> bool {
    match via {
        ReceptionChannel::Asynchronous { remote_identity }
        | ReceptionChannel::Device { remote_identity, .. } => remote_identity == sender,
        ReceptionChannel::Local => false,
    }
}

fn send_ping<I: IdentityDirectory + ?Sized>(
    inputs: &StepInputs<'_>,
    identity: &I,
    init: &Initiate,
) -> Result<StepTransition, StepCancelReason> {
    let signature = identity
        .sign_challenge(
            inputs.owned_identity,
            &ping_challenge(init.group_uid, inputs.owned_identity, init.member_identity),
        )
        .map_err(|e| StepCancelReason::NewStateUncomputable(e.to_string()))?;

    Ok(StepTransition {
        new_state: Some(encode_state(&State::AwaitingReply {
            group_uid: init.group_uid,
            member_identity: init.member_identity,
        })?),
        outbound: vec![OutboundMessage {
            from: inputs.owned_identity,
            to: Recipient::AllDevicesOf { remote_identity: init.member_identity },
            payload: Message::Ping(Ping {
                group_uid: init.group_uid,
                sender_identity: inputs.owned_identity,
                signature,
            })
            .into_payload(inputs.instance_uid)
            .map_err(|e| StepCancelReason::NewStateUncomputable(e.to_string()))?,
        }],
        children: Vec::new(),
        effects: Vec::new(),
    })
}

fn reply_to_ping<I: IdentityDirectory + ?Sized>(
    inputs: &StepInputs<'_>,
    identity: &I,
    ping: &Ping,
) -> Result<StepTransition, StepCancelReason> {
    let valid = identity
        .verify_challenge(
            ping.sender_identity,
            &ping_challenge(ping.group_uid, ping.sender_identity, inputs.owned_identity),
            &ping.signature,
        )
        .map_err(|e| StepCancelReason::NewStateUncomputable(e.to_string()))?;
    if !valid {
        return Err(StepCancelReason::NewStateUncomputable(
            "group ping signature does not verify".to_string(),
        ));
    }

    let signature = identity
        .sign_challenge(
            inputs.owned_identity,
            &ping_challenge(ping.group_uid, inputs.owned_identity, ping.sender_identity),
        )
        .map_err(|e| StepCancelReason::NewStateUncomputable(e.to_string()))?;

    // One-shot: reply and stay final, no instance row survives.
    Ok(StepTransition {
        new_state: None,
        outbound: vec![OutboundMessage {
            from: inputs.owned_identity,
            to: Recipient::AllDevicesOf { remote_identity: ping.sender_identity },
            payload: Message::PingReply(PingReply {
                group_uid: ping.group_uid,
                sender_identity: inputs.owned_identity,
                signature,
            })
            .into_payload(inputs.instance_uid)
            .map_err(|e| StepCancelReason::NewStateUncomputable(e.to_string()))?,
        }],
        children: Vec::new(),
        effects: Vec::new(),
    })
}

fn verify_reply<I: IdentityDirectory + ?Sized>(
    inputs: &StepInputs<'_>,
    identity: &I,
    reply: &PingReply,
) -> Result<StepTransition, StepCancelReason> {
    let valid = identity
        .verify_challenge(
            reply.sender_identity,
            &ping_challenge(reply.group_uid, reply.sender_identity, inputs.owned_identity),
            &reply.signature,
        )
        .map_err(|e| StepCancelReason::NewStateUncomputable(e.to_string()))?;
    if !valid {
        return Err(StepCancelReason::NewStateUncomputable(
            "group ping reply signature does not verify".to_string(),
        ));
    }

    Ok(StepTransition::default())
}

#[cfg(test)]
mod tests {
    use sotto_proto::InstanceUid;

    use super::*;
    use crate::testutil::{MockDirectory, device, identity};

    #[test]
    fn ping_and_reply_round_trip() {
        let alice = identity(1);
        let bob = identity(2);
        let group = Uid::from_bytes([5; 32]);
        let instance = InstanceUid::from_bytes([1; 32]);

        let dir = MockDirectory::new();
        dir.add_owned(alice, device(10));
        dir.add_owned(bob, device(20));

        let init = Message::Initiate(Initiate { group_uid: group, member_identity: bob })
            .into_payload(instance)
            .unwrap();
        let inputs = StepInputs {
            owned_identity: alice,
            current_device: device(10),
            instance_uid: instance,
            state: None,
            payload: &init,
            via: ReceptionChannel::Local,
            now_ms: 0,
            nonce: [0; 32],
        };
        let t1 = step(&inputs, &dir).unwrap();
        let ping_payload = t1.outbound[0].payload.clone();
        let alice_state = t1.new_state.unwrap();

        // Bob replies without keeping any state.
        let inputs = StepInputs {
            owned_identity: bob,
            current_device: device(20),
            instance_uid: instance,
            state: None,
            payload: &ping_payload,
            via: ReceptionChannel::Asynchronous { remote_identity: alice },
            now_ms: 0,
            nonce: [0; 32],
        };
        let t2 = step(&inputs, &dir).unwrap();
        assert!(t2.new_state.is_none());
        let reply_payload = t2.outbound[0].payload.clone();

        // Alice's run closes on the verified reply.
        let inputs = StepInputs {
            owned_identity: alice,
            current_device: device(10),
            instance_uid: instance,
            state: Some(&alice_state),
            payload: &reply_payload,
            via: ReceptionChannel::Asynchronous { remote_identity: bob },
            now_ms: 0,
            nonce: [0; 32],
        };
        let t3 = step(&inputs, &dir).unwrap();
        assert!(t3.new_state.is_none());
        assert!(t3.outbound.is_empty());
    }

    #[test]
    fn reply_for_a_different_group_matches_no_step() {
        let alice = identity(1);
        let bob = identity(2);
        let instance = InstanceUid::from_bytes([1; 32]);

        let dir = MockDirectory::new();
        dir.add_owned(alice, device(10));

        let state = encode_state(&State::AwaitingReply {
            group_uid: Uid::from_bytes([5; 32]),
            member_identity: bob,
        })
        .unwrap();

        let reply = Message::PingReply(PingReply {
            group_uid: Uid::from_bytes([6; 32]),
            sender_identity: bob,
            signature: bytes::Bytes::new(),
        })
        .into_payload(instance)
        .unwrap();

        let inputs = StepInputs {
            owned_identity: alice,
            current_device: device(10),
            instance_uid: instance,
            state: Some(&state),
            payload: &reply,
            via: ReceptionChannel::Asynchronous { remote_identity: bob },
            now_ms: 0,
            nonce: [0; 32],
        };
        assert!(matches!(step(&inputs, &dir), Err(StepCancelReason::NoMatchingStep)));
    }
}
