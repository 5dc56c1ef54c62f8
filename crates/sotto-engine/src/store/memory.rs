#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use sotto_proto::{ChannelTarget, CryptoIdentity, InstanceUid, MessageId};

use super::{
    InstanceLink, ProtocolInstanceRow, ProtocolStore, ReceivedMessageRow, StoreError, WriteBatch,
    WriteOp,
};

/// In-memory store for production single-process use, tests, and simulation.
///
/// All state sits behind one `Arc<Mutex<..>>`, so clones share the same
/// store and a batch commit is trivially atomic: the lock is held for the
/// whole batch. Uses `lock().expect()` which panics only if the mutex is
/// poisoned (a thread panicked while holding the lock).
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryStoreInner>>,
}

#[derive(Default)]
struct MemoryStoreInner {
    /// Instance rows keyed by (owned identity, instance uid).
    instances: HashMap<(CryptoIdentity, InstanceUid), ProtocolInstanceRow>,

    /// Received message rows keyed by message id.
    messages: HashMap<MessageId, ReceivedMessageRow>,

    /// Parent/child links.
    links: Vec<InstanceLink>,

    /// Running channel-creation keys: target → registering instance.
    creation_keys: HashMap<ChannelTarget, InstanceUid>,
}

impl MemoryStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(MemoryStoreInner::default())) }
    }

    /// Number of instance rows. Useful for debugging and testing.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.inner.lock().expect("Mutex poisoned").instances.len()
    }

    /// Number of message rows. Useful for debugging and testing.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.inner.lock().expect("Mutex poisoned").messages.len()
    }

    /// Number of link rows. Useful for debugging and testing.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn link_count(&self) -> usize {
        self.inner.lock().expect("Mutex poisoned").links.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn apply(inner: &mut MemoryStoreInner, op: WriteOp) {
    match op {
        WriteOp::PutInstance(row) => {
            inner.instances.insert((row.owned_identity, row.instance_uid), row);
        },
        WriteOp::DeleteInstance { owned_identity, instance_uid } => {
            inner.instances.remove(&(owned_identity, instance_uid));
        },
        WriteOp::PutMessage(row) => {
            inner.messages.insert(row.message_id, row);
        },
        WriteOp::DeleteMessage { message_id } => {
            inner.messages.remove(&message_id);
        },
        WriteOp::PutLink(link) => {
            if !inner.links.contains(&link) {
                inner.links.push(link);
            }
        },
        WriteOp::DeleteLinksTouching { owned_identity, instance_uid } => {
            inner.links.retain(|l| {
                l.owned_identity != owned_identity
                    || (l.parent != instance_uid && l.child != instance_uid)
            });
        },
        WriteOp::PutCreationKey { target, instance_uid } => {
            inner.creation_keys.insert(target, instance_uid);
        },
        WriteOp::DeleteCreationKey { target } => {
            inner.creation_keys.remove(&target);
        },
        WriteOp::DeleteCreationKeysOfInstance { owned_identity, instance_uid } => {
            inner.creation_keys.retain(|target, uid| {
                target.owned_identity != owned_identity || *uid != instance_uid
            });
        },
    }
}

impl ProtocolStore for MemoryStore {
    #[allow(clippy::expect_used)]
    fn instance(
        &self,
        owned_identity: CryptoIdentity,
        instance_uid: InstanceUid,
    ) -> Result<Option<ProtocolInstanceRow>, StoreError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner.instances.get(&(owned_identity, instance_uid)).cloned())
    }

    #[allow(clippy::expect_used)]
    fn all_instances(&self) -> Result<Vec<ProtocolInstanceRow>, StoreError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner.instances.values().cloned().collect())
    }

    #[allow(clippy::expect_used)]
    fn message(&self, message_id: MessageId) -> Result<Option<ReceivedMessageRow>, StoreError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner.messages.get(&message_id).cloned())
    }

    #[allow(clippy::expect_used)]
    fn all_message_ids(&self) -> Result<Vec<MessageId>, StoreError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        let mut ids: Vec<MessageId> = inner.messages.keys().copied().collect();
        // Deterministic order keeps bootstrap reprocessing reproducible.
        ids.sort_unstable();
        Ok(ids)
    }

    #[allow(clippy::expect_used)]
    fn messages_for_instance(
        &self,
        owned_identity: CryptoIdentity,
        instance_uid: InstanceUid,
    ) -> Result<Vec<ReceivedMessageRow>, StoreError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        let mut rows: Vec<ReceivedMessageRow> = inner
            .messages
            .values()
            .filter(|m| {
                m.message_id.owned_identity == owned_identity && m.instance_uid == instance_uid
            })
            .cloned()
            .collect();
        rows.sort_unstable_by_key(|m| (m.received_at_ms, m.message_id));
        Ok(rows)
    }

    #[allow(clippy::expect_used)]
    fn links_with_parent(
        &self,
        owned_identity: CryptoIdentity,
        parent: InstanceUid,
    ) -> Result<Vec<InstanceLink>, StoreError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner
            .links
            .iter()
            .filter(|l| l.owned_identity == owned_identity && l.parent == parent)
            .copied()
            .collect())
    }

    #[allow(clippy::expect_used)]
    fn links_with_child(
        &self,
        owned_identity: CryptoIdentity,
        child: InstanceUid,
    ) -> Result<Vec<InstanceLink>, StoreError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner
            .links
            .iter()
            .filter(|l| l.owned_identity == owned_identity && l.child == child)
            .copied()
            .collect())
    }

    #[allow(clippy::expect_used)]
    fn running_creation_targets(&self) -> Result<Vec<ChannelTarget>, StoreError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner.creation_keys.keys().copied().collect())
    }

    #[allow(clippy::expect_used)]
    fn creation_instances_for_target(
        &self,
        target: ChannelTarget,
    ) -> Result<Vec<InstanceUid>, StoreError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner.creation_keys.get(&target).copied().into_iter().collect())
    }

    #[allow(clippy::expect_used)]
    fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");
        for op in batch.ops() {
            apply(&mut inner, op.clone());
        }
        Ok(())
    }
}
