#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

//! Inbox storage: fetched messages awaiting decryption.
//!
//! One row per fetched message, sub-rows per attachment. A row is
//! *unprocessed* until a decryption outcome binds its payload or marks it for
//! deletion; the batch processor's selection predicate makes re-running a
//! batch over already-claimed rows a no-op. Every mutation here is
//! idempotent.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sotto_proto::{CryptoIdentity, DeviceUid, MessageId};

use crate::{collaborators::AttachmentInfo, store::StoreError};

/// One fetched message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxMessageRow {
    /// Message key.
    pub message_id: MessageId,
    /// Server upload timestamp, unix millis.
    pub upload_timestamp_ms: u64,
    /// Server download timestamp, unix millis.
    pub download_timestamp_ms: u64,
    /// Local receive timestamp, unix millis.
    pub local_timestamp_ms: u64,
    /// Encrypted content as fetched.
    pub encrypted_content: Bytes,
    /// Wrapped content key from the header.
    pub wrapped_key: Bytes,
    /// Whether the sender declared an extended payload.
    pub has_extended_payload: bool,
    /// Sender, bound after successful decryption.
    pub sender: Option<(CryptoIdentity, DeviceUid)>,
    /// Decrypted application payload, bound after successful decryption.
    pub payload: Option<Bytes>,
    /// Extended payload key, if declared and resolved.
    pub extended_payload_key: Option<Bytes>,
    /// Row (and attachments) are scheduled for deletion.
    pub marked_for_deletion: bool,
    /// Row was reported to the server as listed.
    pub marked_as_listed: bool,
}

impl InboxMessageRow {
    /// Unprocessed rows are the batch processor's input.
    #[must_use]
    pub const fn is_unprocessed(&self) -> bool {
        self.payload.is_none() && self.sender.is_none() && !self.marked_for_deletion
    }
}

/// One attachment sub-row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxAttachmentRow {
    /// Owning message.
    pub message_id: MessageId,
    /// Position within the message, starting at 0.
    pub attachment_number: usize,
    /// Decryption key, resolved at decrypt time.
    pub decryption_key: Option<Bytes>,
    /// Decrypted metadata, resolved at decrypt time.
    pub metadata: Option<Bytes>,
    /// Scheduled for deletion together with its message.
    pub marked_for_deletion: bool,
}

/// Inbox storage contract.
pub trait InboxStore: Clone + Send + Sync + 'static {
    /// Insert a fetched message and its attachment sub-rows.
    ///
    /// Idempotent: a second insert with the same id is a no-op, so a re-fetch
    /// cannot reset rows that were already processed.
    fn put_message(
        &self,
        row: InboxMessageRow,
        attachment_count: usize,
    ) -> Result<(), StoreError>;

    /// Load one row.
    fn message(&self, message_id: MessageId) -> Result<Option<InboxMessageRow>, StoreError>;

    /// Up to `limit` unprocessed rows for one owned identity, oldest upload
    /// first.
    fn unprocessed_batch(
        &self,
        owned_identity: CryptoIdentity,
        limit: usize,
    ) -> Result<Vec<InboxMessageRow>, StoreError>;

    /// Attachment sub-rows of a message, in attachment order.
    fn attachments_of(
        &self,
        message_id: MessageId,
    ) -> Result<Vec<InboxAttachmentRow>, StoreError>;

    /// Mark a message and all its attachments for deletion. Idempotent.
    fn mark_for_deletion(&self, message_id: MessageId) -> Result<(), StoreError>;

    /// Bind the resolved sender, payload, and extended-payload key.
    fn bind_decryption_result(
        &self,
        message_id: MessageId,
        sender: (CryptoIdentity, DeviceUid),
        payload: Bytes,
        extended_payload_key: Option<Bytes>,
    ) -> Result<(), StoreError>;

    /// Store resolved attachment material, one entry per attachment.
    fn set_attachment_infos(
        &self,
        message_id: MessageId,
        infos: &[AttachmentInfo],
    ) -> Result<(), StoreError>;
}

/// In-memory inbox store.
#[derive(Clone, Default)]
pub struct MemoryInboxStore {
    inner: Arc<Mutex<MemoryInboxInner>>,
}

#[derive(Default)]
struct MemoryInboxInner {
    messages: HashMap<MessageId, InboxMessageRow>,
    attachments: HashMap<MessageId, Vec<InboxAttachmentRow>>,
}

impl MemoryInboxStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of message rows. Useful for debugging and testing.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.inner.lock().expect("Mutex poisoned").messages.len()
    }

    /// Rows currently marked for deletion. Useful for testing.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn marked_for_deletion_count(&self) -> usize {
        let inner = self.inner.lock().expect("Mutex poisoned");
        inner.messages.values().filter(|m| m.marked_for_deletion).count()
    }
}

impl InboxStore for MemoryInboxStore {
    #[allow(clippy::expect_used)]
    fn put_message(
        &self,
        row: InboxMessageRow,
        attachment_count: usize,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");
        if inner.messages.contains_key(&row.message_id) {
            return Ok(());
        }
        let message_id = row.message_id;
        inner.messages.insert(message_id, row);
        inner.attachments.insert(
            message_id,
            (0..attachment_count)
                .map(|attachment_number| InboxAttachmentRow {
                    message_id,
                    attachment_number,
                    decryption_key: None,
                    metadata: None,
                    marked_for_deletion: false,
                })
                .collect(),
        );
        Ok(())
    }

    #[allow(clippy::expect_used)]
    fn message(&self, message_id: MessageId) -> Result<Option<InboxMessageRow>, StoreError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner.messages.get(&message_id).cloned())
    }

    #[allow(clippy::expect_used)]
    fn unprocessed_batch(
        &self,
        owned_identity: CryptoIdentity,
        limit: usize,
    ) -> Result<Vec<InboxMessageRow>, StoreError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        let mut rows: Vec<InboxMessageRow> = inner
            .messages
            .values()
            .filter(|m| m.message_id.owned_identity == owned_identity && m.is_unprocessed())
            .cloned()
            .collect();
        rows.sort_unstable_by_key(|m| (m.upload_timestamp_ms, m.message_id));
        rows.truncate(limit);
        Ok(rows)
    }

    #[allow(clippy::expect_used)]
    fn attachments_of(
        &self,
        message_id: MessageId,
    ) -> Result<Vec<InboxAttachmentRow>, StoreError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner.attachments.get(&message_id).cloned().unwrap_or_default())
    }

    #[allow(clippy::expect_used)]
    fn mark_for_deletion(&self, message_id: MessageId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");
        if let Some(row) = inner.messages.get_mut(&message_id) {
            row.marked_for_deletion = true;
        }
        if let Some(rows) = inner.attachments.get_mut(&message_id) {
            for row in rows {
                row.marked_for_deletion = true;
            }
        }
        Ok(())
    }

    #[allow(clippy::expect_used)]
    fn bind_decryption_result(
        &self,
        message_id: MessageId,
        sender: (CryptoIdentity, DeviceUid),
        payload: Bytes,
        extended_payload_key: Option<Bytes>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");
        if let Some(row) = inner.messages.get_mut(&message_id) {
            row.sender = Some(sender);
            row.payload = Some(payload);
            row.extended_payload_key = extended_payload_key;
        }
        Ok(())
    }

    #[allow(clippy::expect_used)]
    fn set_attachment_infos(
        &self,
        message_id: MessageId,
        infos: &[AttachmentInfo],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");
        if let Some(rows) = inner.attachments.get_mut(&message_id) {
            for (row, info) in rows.iter_mut().zip(infos) {
                row.decryption_key = Some(info.key.clone());
                row.metadata = Some(info.metadata.clone());
            }
        }
        Ok(())
    }
}
