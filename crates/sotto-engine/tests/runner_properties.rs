//! Property tests for the abort cascade.
//!
//! The cascade must delete exactly the connected component of the aborted
//! instance - every instance reachable through parent/child links in either
//! direction, their pending messages, and every touched link - and nothing
//! else, for arbitrary acyclic graphs.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use proptest::prelude::*;
use sotto_engine::{
    ChannelGateway, CollaboratorError, DeviceScope, Environment, IdentityDirectory, MemoryStore,
    ProtocolRunner, ProtocolStore, RemoteDevice, RunnerConfig, event_channel,
    store::{InstanceLink, ProtocolInstanceRow, ReceivedMessageRow, WriteBatch},
};
use sotto_proto::{
    ChannelTarget, CryptoIdentity, DeviceUid, DialogMessage, InstanceUid, MessageId,
    OutboundMessage, ProtocolKind, ReceptionChannel, Uid,
};

#[derive(Clone)]
struct TestEnv {
    counter: Arc<AtomicU64>,
}

impl TestEnv {
    fn new() -> Self {
        Self { counter: Arc::new(AtomicU64::new(1)) }
    }
}

impl Environment for TestEnv {
    fn now_ms(&self) -> u64 {
        1_000_000
    }

    fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        std::future::ready(())
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        for (i, b) in buffer.iter_mut().enumerate() {
            *b = (n as u8).wrapping_add(i as u8);
        }
    }
}

/// Directory stub; the abort path never consults it.
#[derive(Clone)]
struct NullDirectory;

impl IdentityDirectory for NullDirectory {
    fn owned_identities(&self) -> Result<Vec<CryptoIdentity>, CollaboratorError> {
        Ok(Vec::new())
    }
    fn is_active(&self, _owned: CryptoIdentity) -> Result<bool, CollaboratorError> {
        Ok(true)
    }
    fn current_device(&self, _owned: CryptoIdentity) -> Result<DeviceUid, CollaboratorError> {
        Ok(DeviceUid::from_bytes([0; 32]))
    }
    fn remote_devices(
        &self,
        _owned: CryptoIdentity,
        _scope: DeviceScope,
    ) -> Result<Vec<RemoteDevice>, CollaboratorError> {
        Ok(Vec::new())
    }
    fn devices_of(
        &self,
        _owned: CryptoIdentity,
        _remote: CryptoIdentity,
    ) -> Result<Vec<DeviceUid>, CollaboratorError> {
        Ok(Vec::new())
    }
    fn is_contact(
        &self,
        _owned: CryptoIdentity,
        _remote: CryptoIdentity,
    ) -> Result<bool, CollaboratorError> {
        Ok(false)
    }
    fn add_device(
        &self,
        _owned: CryptoIdentity,
        _remote: CryptoIdentity,
        _device: DeviceUid,
    ) -> Result<(), CollaboratorError> {
        Ok(())
    }
    fn delete_device(
        &self,
        _owned: CryptoIdentity,
        _remote: CryptoIdentity,
        _device: DeviceUid,
    ) -> Result<(), CollaboratorError> {
        Ok(())
    }
    fn sign_challenge(
        &self,
        _owned: CryptoIdentity,
        challenge: &[u8],
    ) -> Result<Bytes, CollaboratorError> {
        Ok(Bytes::copy_from_slice(challenge))
    }
    fn verify_challenge(
        &self,
        _remote: CryptoIdentity,
        _challenge: &[u8],
        _signature: &[u8],
    ) -> Result<bool, CollaboratorError> {
        Ok(true)
    }
    fn import_snapshot(
        &self,
        _owned: CryptoIdentity,
        _snapshot: &[u8],
    ) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

#[derive(Clone)]
struct NullChannel;

impl ChannelGateway for NullChannel {
    fn channel_exists(&self, _target: ChannelTarget) -> Result<bool, CollaboratorError> {
        Ok(false)
    }
    fn covered_devices(
        &self,
        _owned: CryptoIdentity,
    ) -> Result<Vec<(CryptoIdentity, DeviceUid)>, CollaboratorError> {
        Ok(Vec::new())
    }
    fn establish_channel(
        &self,
        _target: ChannelTarget,
        _seed: &[u8],
    ) -> Result<(), CollaboratorError> {
        Ok(())
    }
    fn delete_channel(&self, _target: ChannelTarget) -> Result<(), CollaboratorError> {
        Ok(())
    }
    fn post_message(&self, _message: &OutboundMessage) -> Result<Uid, CollaboratorError> {
        Ok(Uid::from_bytes([0; 32]))
    }
    fn post_dialog(&self, _dialog: &DialogMessage) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

fn runner(store: MemoryStore) -> ProtocolRunner<TestEnv, MemoryStore, NullDirectory, NullChannel> {
    let (sink, _events) = event_channel(64);
    ProtocolRunner::new(
        TestEnv::new(),
        store,
        Arc::new(NullDirectory),
        Arc::new(NullChannel),
        sink,
        RunnerConfig::default(),
    )
}

fn owned() -> CryptoIdentity {
    CryptoIdentity::from_bytes([1; 32])
}

fn node_uid(n: usize) -> InstanceUid {
    let mut bytes = [0xA5u8; 32];
    bytes[..4].copy_from_slice(&(n as u32).to_be_bytes());
    InstanceUid::from_bytes(bytes)
}

fn node_of(uid: InstanceUid) -> usize {
    let bytes = uid.as_bytes();
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
}

/// Build a store holding `nodes` instances (one pending message each) and
/// the given parent → child edges.
fn seed_store(nodes: usize, edges: &[(usize, usize)]) -> MemoryStore {
    let store = MemoryStore::new();
    let mut batch = WriteBatch::new();
    for n in 0..nodes {
        batch.put_instance(ProtocolInstanceRow {
            instance_uid: node_uid(n),
            owned_identity: owned(),
            kind: ProtocolKind::GroupMembershipPing,
            state: Bytes::from_static(b"opaque"),
            created_at_ms: 0,
        });
        let mut uid = [0x5Au8; 32];
        uid[..4].copy_from_slice(&(n as u32).to_be_bytes());
        batch.put_message(ReceivedMessageRow {
            message_id: MessageId::new(owned(), Uid::from_bytes(uid)),
            instance_uid: node_uid(n),
            kind: ProtocolKind::GroupMembershipPing,
            payload: Bytes::new(),
            via: ReceptionChannel::Local,
            received_at_ms: 0,
        });
    }
    for (parent, child) in edges {
        batch.put_link(InstanceLink {
            owned_identity: owned(),
            parent: node_uid(*parent),
            child: node_uid(*child),
        });
    }
    store.commit(batch).unwrap();
    store
}

/// The set of nodes connected to `root` when links are read in both
/// directions - the reference model for the cascade.
fn connected_component(edges: &[(usize, usize)], root: usize) -> HashSet<usize> {
    let mut component = HashSet::new();
    let mut worklist = vec![root];
    while let Some(n) = worklist.pop() {
        if !component.insert(n) {
            continue;
        }
        for (parent, child) in edges {
            if *parent == n && !component.contains(child) {
                worklist.push(*child);
            }
            if *child == n && !component.contains(parent) {
                worklist.push(*parent);
            }
        }
    }
    component
}

proptest! {
    #[test]
    fn abort_unwinds_exactly_the_connected_component(
        raw_edges in prop::collection::vec((0usize..12, 0usize..12), 0..40),
        root in 0usize..12,
    ) {
        let nodes = 12;
        // Orient every edge low → high so the graph is acyclic, as the
        // runner guarantees for real instance graphs.
        let edges: Vec<(usize, usize)> = raw_edges
            .into_iter()
            .filter(|(a, b)| a != b)
            .map(|(a, b)| (a.min(b), a.max(b)))
            .collect();

        let store = seed_store(nodes, &edges);
        let runner = runner(store.clone());

        runner.abort_instance(owned(), node_uid(root)).unwrap();

        let component = connected_component(&edges, root);

        // Exactly the component is gone, instances and messages alike.
        let remaining: HashSet<usize> = store
            .all_instances()
            .unwrap()
            .iter()
            .map(|row| node_of(row.instance_uid))
            .collect();
        let expected: HashSet<usize> =
            (0..nodes).filter(|n| !component.contains(n)).collect();
        prop_assert_eq!(&remaining, &expected);

        for id in store.all_message_ids().unwrap() {
            let row = store.message(id).unwrap().unwrap();
            prop_assert!(
                !component.contains(&node_of(row.instance_uid)),
                "message of aborted instance survived"
            );
        }

        // No link touches the deleted component in either direction.
        for n in &component {
            prop_assert!(store.links_with_parent(owned(), node_uid(*n)).unwrap().is_empty());
            prop_assert!(store.links_with_child(owned(), node_uid(*n)).unwrap().is_empty());
        }
    }
}

#[test]
fn abort_survives_a_pathologically_deep_chain() {
    // A peer could force thousands of nested children; the worklist must
    // handle it without native recursion.
    let nodes = 2_000;
    let edges: Vec<(usize, usize)> = (0..nodes - 1).map(|n| (n, n + 1)).collect();
    let store = seed_store(nodes, &edges);
    let runner = runner(store.clone());

    runner.abort_instance(owned(), node_uid(nodes / 2)).unwrap();

    assert_eq!(store.instance_count(), 0);
    assert_eq!(store.message_count(), 0);
    assert_eq!(store.link_count(), 0);
}
