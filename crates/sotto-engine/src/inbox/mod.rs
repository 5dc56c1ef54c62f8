//! Inbound message batch processor.
//!
//! Turns freshly fetched ciphertext into protocol rows, bound application
//! messages, and ordered follow-up work. One call processes one fixed-size
//! batch of unprocessed inbox rows: build one envelope descriptor per row,
//! hand the whole batch to the decryption collaborator in a single call, and
//! fan the per-message outcomes back into row mutations.
//!
//! Follow-up tasks are deduplicated by content and executed in a fixed
//! priority order: mark-listed first (relieves server redelivery pressure
//! early), then notify-decrypted, then extended-payload downloads, then
//! attachment processing.
//!
//! # Invariants
//!
//! - A message whose resolved attachment material does not match its fetched
//!   attachment count is purged, never partially trusted.
//! - Re-running over already-claimed rows is a no-op: the unprocessed
//!   selection predicate excludes every row a previous run touched.

mod store;

use std::collections::BTreeSet;

pub use store::{InboxAttachmentRow, InboxMessageRow, InboxStore, MemoryInboxStore};

use sotto_proto::{CryptoIdentity, EnvelopeDescriptor, MessageId};
use thiserror::Error;

use crate::{
    collaborators::{DecryptionOutcome, MessageDecryptor, NetworkGateway},
    env::Environment,
    events::{DecryptedMessageInfo, EngineEvent, EventSink},
    runner::ProtocolIntake,
    store::{ReceivedMessageRow, StoreError},
};

/// Batch processor configuration.
#[derive(Clone, Copy, Debug)]
pub struct InboxConfig {
    /// Unprocessed rows handled per call.
    pub batch_size: usize,
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self { batch_size: 10 }
    }
}

/// Errors that abort a whole batch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InboxError {
    /// Inbox storage access failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The decryptor broke its one-outcome-per-envelope contract.
    #[error("decryptor returned {got} outcomes for {expected} envelopes")]
    OutcomeCountMismatch {
        /// Envelopes submitted.
        expected: usize,
        /// Outcomes received.
        got: usize,
    },
}

/// What one batch run did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// Rows submitted to the decryptor.
    pub processed: usize,
    /// Rows purged for structural reasons.
    pub structural_failures: usize,
    /// Protocol messages handed to the runner.
    pub protocol_messages: usize,
    /// Application messages bound for the app.
    pub application_messages: usize,
}

/// Follow-up work computed by a batch, deduplicated and priority-ordered.
///
/// The variant order IS the execution order; the `BTreeSet` holding these
/// sorts by it.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum FollowUp {
    /// Tell the server which rows are handled; always scheduled.
    MarkListed {
        owned_identity: CryptoIdentity,
    },
    /// Notify the app, messages sorted by upload timestamp.
    NotifyDecrypted {
        messages: Vec<DecryptedMessageInfo>,
    },
    /// Fetch a declared extended payload.
    DownloadExtendedPayload {
        message_id: MessageId,
    },
    /// Start attachment processing.
    ProcessAttachments {
        message_id: MessageId,
    },
}

/// The batch processor.
pub struct InboxProcessor<E, IS, D, N, R>
where
    E: Environment,
    IS: InboxStore,
    D: MessageDecryptor + ?Sized,
    N: NetworkGateway + ?Sized,
    R: ProtocolIntake + ?Sized,
{
    env: E,
    inbox: IS,
    decryptor: std::sync::Arc<D>,
    network: std::sync::Arc<N>,
    intake: std::sync::Arc<R>,
    events: EventSink,
    config: InboxConfig,
}

impl<E, IS, D, N, R> InboxProcessor<E, IS, D, N, R>
where
    E: Environment,
    IS: InboxStore,
    D: MessageDecryptor + ?Sized,
    N: NetworkGateway + ?Sized,
    R: ProtocolIntake + ?Sized,
{
    /// Create a processor.
    pub fn new(
        env: E,
        inbox: IS,
        decryptor: std::sync::Arc<D>,
        network: std::sync::Arc<N>,
        intake: std::sync::Arc<R>,
        events: EventSink,
        config: InboxConfig,
    ) -> Self {
        Self { env, inbox, decryptor, network, intake, events, config }
    }

    /// Process one batch of unprocessed rows for one owned identity.
    ///
    /// # Errors
    ///
    /// Only storage failures and a broken decryptor contract abort the
    /// batch; per-message problems become row mutations.
    pub async fn process_batch(
        &self,
        owned: CryptoIdentity,
    ) -> Result<BatchSummary, InboxError> {
        let rows = self.inbox.unprocessed_batch(owned, self.config.batch_size)?;
        let mut follow_ups: BTreeSet<FollowUp> = BTreeSet::new();

        if rows.is_empty() {
            // Earlier runs may have left rows that still need to be marked
            // listed; the mark-listed pass is not atomic with processing.
            tracing::debug!(owned = %owned, "no unprocessed inbox rows");
            follow_ups.insert(FollowUp::MarkListed { owned_identity: owned });
            self.execute_follow_ups(follow_ups).await;
            return Ok(BatchSummary::default());
        }

        let mut envelopes = Vec::with_capacity(rows.len());
        for row in &rows {
            envelopes.push(EnvelopeDescriptor {
                message_id: row.message_id,
                upload_timestamp_ms: row.upload_timestamp_ms,
                download_timestamp_ms: row.download_timestamp_ms,
                local_timestamp_ms: row.local_timestamp_ms,
                encrypted_content: row.encrypted_content.clone(),
                wrapped_key: row.wrapped_key.clone(),
                known_attachment_count: self.inbox.attachments_of(row.message_id)?.len(),
            });
        }

        let outcomes = self.decryptor.decrypt_batch(envelopes).await;
        if outcomes.len() != rows.len() {
            return Err(InboxError::OutcomeCountMismatch {
                expected: rows.len(),
                got: outcomes.len(),
            });
        }

        let mut summary = BatchSummary { processed: rows.len(), ..BatchSummary::default() };
        let mut decrypted = Vec::new();

        for outcome in outcomes {
            let message_id = outcome.message_id();
            let Some(row) = rows.iter().find(|r| r.message_id == message_id) else {
                tracing::error!(msg = %message_id, "outcome for a message outside the batch");
                continue;
            };

            match outcome {
                DecryptionOutcome::Undecryptable { .. }
                | DecryptionOutcome::Unparsable { .. }
                | DecryptionOutcome::UnexpectedType { .. }
                | DecryptionOutcome::Rejected { .. } => {
                    tracing::info!(msg = %message_id, "purging structurally failed message");
                    self.inbox.mark_for_deletion(message_id)?;
                    summary.structural_failures += 1;
                    follow_ups.insert(FollowUp::MarkListed { owned_identity: owned });
                },

                DecryptionOutcome::Protocol { payload, via, .. } => {
                    let protocol_row = ReceivedMessageRow {
                        message_id,
                        instance_uid: payload.instance_uid,
                        kind: payload.kind,
                        payload: match payload.encode() {
                            Ok(bytes) => bytes,
                            Err(err) => {
                                tracing::error!(msg = %message_id, error = %err, "unencodable payload");
                                self.inbox.mark_for_deletion(message_id)?;
                                summary.structural_failures += 1;
                                follow_ups
                                    .insert(FollowUp::MarkListed { owned_identity: owned });
                                continue;
                            },
                        },
                        via,
                        received_at_ms: self.env.now_ms(),
                    };

                    match self.intake.accept(protocol_row) {
                        Ok(()) => {
                            self.inbox.mark_for_deletion(message_id)?;
                            summary.protocol_messages += 1;
                            follow_ups.insert(FollowUp::MarkListed { owned_identity: owned });
                        },
                        Err(err) => {
                            // Leave the row unprocessed; the next batch will
                            // retry the handoff.
                            tracing::error!(msg = %message_id, error = %err, "protocol handoff failed");
                        },
                    }
                },

                DecryptionOutcome::Application {
                    sender,
                    sender_device,
                    payload,
                    extended_payload_key,
                    attachments,
                    ..
                } => {
                    let attachment_rows = self.inbox.attachments_of(message_id)?;
                    if attachment_rows.len() != attachments.len() {
                        // Partially resolved attachments: never trust half a
                        // message.
                        tracing::warn!(
                            msg = %message_id,
                            fetched = attachment_rows.len(),
                            resolved = attachments.len(),
                            "attachment count mismatch, purging message"
                        );
                        self.inbox.mark_for_deletion(message_id)?;
                        summary.structural_failures += 1;
                        follow_ups.insert(FollowUp::MarkListed { owned_identity: owned });
                        continue;
                    }

                    let extended_payload_pending =
                        row.has_extended_payload && extended_payload_key.is_some();

                    self.inbox.bind_decryption_result(
                        message_id,
                        (sender, sender_device),
                        payload,
                        extended_payload_key,
                    )?;
                    self.inbox.set_attachment_infos(message_id, &attachments)?;

                    decrypted.push(DecryptedMessageInfo {
                        upload_timestamp_ms: row.upload_timestamp_ms,
                        message_id,
                        attachment_numbers: (0..attachments.len()).collect(),
                        extended_payload_pending,
                    });
                    summary.application_messages += 1;

                    if extended_payload_pending {
                        follow_ups.insert(FollowUp::DownloadExtendedPayload { message_id });
                    }
                    if !attachments.is_empty() {
                        follow_ups.insert(FollowUp::ProcessAttachments { message_id });
                    }
                    follow_ups.insert(FollowUp::MarkListed { owned_identity: owned });
                },
            }
        }

        if !decrypted.is_empty() {
            decrypted.sort();
            follow_ups.insert(FollowUp::NotifyDecrypted { messages: decrypted });
        }

        self.execute_follow_ups(follow_ups).await;
        Ok(summary)
    }

    /// Execute follow-ups in priority order; failures are logged, never
    /// propagated (the server will redeliver anything we missed).
    #[allow(clippy::cognitive_complexity)]
    async fn execute_follow_ups(&self, follow_ups: BTreeSet<FollowUp>) {
        for follow_up in follow_ups {
            match follow_up {
                FollowUp::MarkListed { owned_identity } => {
                    if let Err(err) = self.network.mark_listed_and_delete(owned_identity).await {
                        tracing::warn!(owned = %owned_identity, error = %err, "mark-listed failed");
                    }
                },
                FollowUp::NotifyDecrypted { messages } => {
                    self.events
                        .publish(EngineEvent::ApplicationMessagesDecrypted { messages });
                },
                FollowUp::DownloadExtendedPayload { message_id } => {
                    if let Err(err) = self.network.download_extended_payload(message_id).await {
                        tracing::warn!(msg = %message_id, error = %err, "extended payload download failed");
                    }
                },
                FollowUp::ProcessAttachments { message_id } => {
                    if let Err(err) = self.network.process_attachments(message_id).await {
                        tracing::warn!(msg = %message_id, error = %err, "attachment processing failed");
                    }
                },
            }
        }
    }
}
