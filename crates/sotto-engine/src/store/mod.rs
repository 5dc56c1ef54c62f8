//! Message store abstraction.
//!
//! The store holds the durable queue of inbound protocol messages and the
//! persisted per-protocol state: instance rows, parent/child links, and the
//! channel-creation dedup keys. It is the only mutable state the protocol
//! runner shares with the rest of the engine.
//!
//! Reads are snapshot queries. All mutation goes through [`WriteBatch`]
//! commits: the runner stages every change of one operation into a single
//! batch and commits it atomically, so a failed operation never leaves a
//! half-written store.
//!
//! The trait is synchronous; backends are expected to be local (memory,
//! embedded database). Network-backed stores do not fit this engine.

mod chaotic;
mod error;
mod memory;

use bytes::Bytes;
pub use chaotic::ChaoticStore;
pub use error::StoreError;
pub use memory::MemoryStore;
use serde::{Deserialize, Serialize};
use sotto_proto::{
    ChannelTarget, CryptoIdentity, InstanceUid, MessageId, ProtocolKind, ReceptionChannel,
};

/// One running protocol instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolInstanceRow {
    /// Instance key, scoped per owned identity.
    pub instance_uid: InstanceUid,
    /// Owned identity running the instance.
    pub owned_identity: CryptoIdentity,
    /// Protocol kind; selects the step table.
    pub kind: ProtocolKind,
    /// Opaque encoded state, interpreted only by kind-specific step logic.
    pub state: Bytes,
    /// Creation timestamp, unix millis.
    pub created_at_ms: u64,
}

/// One unconsumed inbound protocol message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedMessageRow {
    /// Message key.
    pub message_id: MessageId,
    /// Correlation key recovered from the encrypted header - never from an
    /// existing instance, so the first message of a run can create one.
    pub instance_uid: InstanceUid,
    /// Kind tag, duplicated from the payload for cheap bootstrap sweeps.
    pub kind: ProtocolKind,
    /// Encoded protocol payload.
    pub payload: Bytes,
    /// How the message reached this device.
    pub via: ReceptionChannel,
    /// Reception timestamp, unix millis; drives the retention sweep.
    pub received_at_ms: u64,
}

/// Directed parent → child edge between two instances of one owned identity.
///
/// # Invariants
///
/// Acyclic: children are only ever spawned by parent steps, and an abort
/// cascade deletes every edge touching a deleted instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceLink {
    /// Owned identity both endpoints belong to.
    pub owned_identity: CryptoIdentity,
    /// Parent instance.
    pub parent: InstanceUid,
    /// Child instance.
    pub child: InstanceUid,
}

/// One staged mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOp {
    /// Insert or replace an instance row.
    PutInstance(ProtocolInstanceRow),
    /// Delete an instance row if present.
    DeleteInstance {
        /// Owning identity.
        owned_identity: CryptoIdentity,
        /// Instance to delete.
        instance_uid: InstanceUid,
    },
    /// Insert or replace a received message row.
    PutMessage(ReceivedMessageRow),
    /// Delete a received message row if present.
    DeleteMessage {
        /// Message to delete.
        message_id: MessageId,
    },
    /// Insert a parent/child link.
    PutLink(InstanceLink),
    /// Delete every link with this instance as parent or child.
    DeleteLinksTouching {
        /// Owning identity.
        owned_identity: CryptoIdentity,
        /// Endpoint to disconnect.
        instance_uid: InstanceUid,
    },
    /// Register a running channel-creation key.
    PutCreationKey {
        /// The creation target.
        target: ChannelTarget,
        /// Instance running the creation.
        instance_uid: InstanceUid,
    },
    /// Clear the creation key for a target if present.
    DeleteCreationKey {
        /// The creation target.
        target: ChannelTarget,
    },
    /// Clear every creation key registered by this instance.
    DeleteCreationKeysOfInstance {
        /// Owning identity.
        owned_identity: CryptoIdentity,
        /// Registering instance.
        instance_uid: InstanceUid,
    },
}

/// An ordered batch of mutations, committed atomically.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    /// Empty batch.
    #[must_use]
    pub const fn new() -> Self {
        Self { ops: Vec::new() }
    }

    /// True if the batch stages nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Staged ops, in commit order.
    #[must_use]
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// Stage an instance insert/replace.
    pub fn put_instance(&mut self, row: ProtocolInstanceRow) -> &mut Self {
        self.ops.push(WriteOp::PutInstance(row));
        self
    }

    /// Stage an instance delete.
    pub fn delete_instance(
        &mut self,
        owned_identity: CryptoIdentity,
        instance_uid: InstanceUid,
    ) -> &mut Self {
        self.ops.push(WriteOp::DeleteInstance { owned_identity, instance_uid });
        self
    }

    /// Stage a message insert/replace.
    pub fn put_message(&mut self, row: ReceivedMessageRow) -> &mut Self {
        self.ops.push(WriteOp::PutMessage(row));
        self
    }

    /// Stage a message delete.
    pub fn delete_message(&mut self, message_id: MessageId) -> &mut Self {
        self.ops.push(WriteOp::DeleteMessage { message_id });
        self
    }

    /// Stage a link insert.
    pub fn put_link(&mut self, link: InstanceLink) -> &mut Self {
        self.ops.push(WriteOp::PutLink(link));
        self
    }

    /// Stage deletion of every link touching an instance.
    pub fn delete_links_touching(
        &mut self,
        owned_identity: CryptoIdentity,
        instance_uid: InstanceUid,
    ) -> &mut Self {
        self.ops.push(WriteOp::DeleteLinksTouching { owned_identity, instance_uid });
        self
    }

    /// Stage a creation-key insert.
    pub fn put_creation_key(
        &mut self,
        target: ChannelTarget,
        instance_uid: InstanceUid,
    ) -> &mut Self {
        self.ops.push(WriteOp::PutCreationKey { target, instance_uid });
        self
    }

    /// Stage a creation-key delete.
    pub fn delete_creation_key(&mut self, target: ChannelTarget) -> &mut Self {
        self.ops.push(WriteOp::DeleteCreationKey { target });
        self
    }

    /// Stage deletion of every creation key registered by an instance.
    pub fn delete_creation_keys_of_instance(
        &mut self,
        owned_identity: CryptoIdentity,
        instance_uid: InstanceUid,
    ) -> &mut Self {
        self.ops.push(WriteOp::DeleteCreationKeysOfInstance { owned_identity, instance_uid });
        self
    }
}

/// Message store contract.
///
/// Implementations must be `Clone` (shared via `Arc` internally),
/// thread-safe, and synchronous.
///
/// # Invariants
///
/// - `commit` applies the whole batch or nothing.
/// - Reads observe only committed state.
pub trait ProtocolStore: Clone + Send + Sync + 'static {
    /// Load one instance row.
    fn instance(
        &self,
        owned_identity: CryptoIdentity,
        instance_uid: InstanceUid,
    ) -> Result<Option<ProtocolInstanceRow>, StoreError>;

    /// All instance rows. Bootstrap sweeps only.
    fn all_instances(&self) -> Result<Vec<ProtocolInstanceRow>, StoreError>;

    /// Load one received message row.
    fn message(&self, message_id: MessageId) -> Result<Option<ReceivedMessageRow>, StoreError>;

    /// Ids of every stored message. Bootstrap reprocessing only.
    fn all_message_ids(&self) -> Result<Vec<MessageId>, StoreError>;

    /// All stored messages addressed to one instance.
    fn messages_for_instance(
        &self,
        owned_identity: CryptoIdentity,
        instance_uid: InstanceUid,
    ) -> Result<Vec<ReceivedMessageRow>, StoreError>;

    /// Links with this instance as parent.
    fn links_with_parent(
        &self,
        owned_identity: CryptoIdentity,
        parent: InstanceUid,
    ) -> Result<Vec<InstanceLink>, StoreError>;

    /// Links with this instance as child.
    fn links_with_child(
        &self,
        owned_identity: CryptoIdentity,
        child: InstanceUid,
    ) -> Result<Vec<InstanceLink>, StoreError>;

    /// Every currently registered channel-creation target.
    fn running_creation_targets(&self) -> Result<Vec<ChannelTarget>, StoreError>;

    /// Instances registered as creating a channel for this target.
    fn creation_instances_for_target(
        &self,
        target: ChannelTarget,
    ) -> Result<Vec<InstanceUid>, StoreError>;

    /// Apply a batch atomically.
    ///
    /// # Errors
    ///
    /// `StoreError::CommitFailed` if the batch could not be applied; the
    /// store is unchanged in that case.
    fn commit(&self, batch: WriteBatch) -> Result<(), StoreError>;
}
