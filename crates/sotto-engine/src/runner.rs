//! Protocol operation runner.
//!
//! Serializes protocol step execution on a single no-duplicate queue keyed
//! by message id: re-enqueueing a pending id is a no-op, and one worker
//! processes one message at a time, which gives the required guarantee of at
//! most one concurrently executing step per owned identity.
//!
//! Each dequeued message becomes one transactional unit of work: load the
//! message and its instance, run the pure step, stage every mutation in one
//! [`WriteBatch`], commit, then carry out collaborator effects and post
//! outbound messages. After any successful transition the runner re-enqueues
//! every other message pending for the instance - messages legitimately
//! arrive out of causal order, and retrying them all after each transition
//! approximates in-order delivery without a transport sequence number.
//!
//! Cancellations are handled by typed reason: only a failed commit is
//! retried (after a short fixed delay); a stale dialog response additionally
//! posts a delete-dialog directive; every other reason discards the message.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use sotto_proto::{
    CryptoIdentity, DialogMessage, InstanceUid, MessageId, OutboundMessage, ProtocolKind,
    ProtocolPayload, Recipient, ReceptionChannel,
};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{
    collaborators::{ChannelGateway, CollaboratorError, IdentityDirectory},
    env::Environment,
    events::{EngineEvent, EventSink},
    protocol::{self, ProtocolEffect, StepCancelReason, StepInputs, StepTransition},
    store::{
        InstanceLink, ProtocolInstanceRow, ProtocolStore, ReceivedMessageRow, StoreError,
        WriteBatch,
    },
};

/// Runner configuration.
#[derive(Clone, Debug)]
pub struct RunnerConfig {
    /// Delay before retrying a message whose commit failed.
    pub commit_retry_delay: Duration,
    /// Unclaimed messages older than this are dropped at bootstrap.
    pub message_retention: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            commit_retry_delay: Duration::from_secs(1),
            message_retention: Duration::from_secs(15 * 24 * 60 * 60),
        }
    }
}

/// Errors surfaced by runner entry points.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunnerError {
    /// Store access failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A payload failed to encode or decode.
    #[error("codec error: {0}")]
    Codec(String),

    /// A collaborator call failed.
    #[error("collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),
}

/// How new protocol messages enter the runner.
///
/// Implemented by [`ProtocolRunner`]; the presence coordinator and the inbox
/// processor depend only on this trait.
pub trait ProtocolIntake: Send + Sync {
    /// Persist a received message and schedule it for processing.
    ///
    /// Idempotent: accepting an id that already has a row keeps the existing
    /// row and only re-schedules it.
    fn accept(&self, row: ReceivedMessageRow) -> Result<(), RunnerError>;

    /// Start a protocol run by feeding it a fresh local message.
    fn start_protocol(
        &self,
        owned: CryptoIdentity,
        payload: ProtocolPayload,
    ) -> Result<MessageId, RunnerError>;
}

/// Cloneable handle used by retry tasks to re-enter the queue.
#[derive(Clone)]
struct QueueHandle {
    pending: Arc<Mutex<HashSet<MessageId>>>,
    tx: mpsc::UnboundedSender<MessageId>,
}

impl QueueHandle {
    /// Enqueue unless the id is already pending.
    #[allow(clippy::expect_used)]
    fn enqueue(&self, message_id: MessageId) {
        let mut pending = self.pending.lock().expect("Mutex poisoned");
        if !pending.insert(message_id) {
            tracing::debug!(msg = %message_id, "message already queued, skipping");
            return;
        }
        drop(pending);
        if self.tx.send(message_id).is_err() {
            tracing::error!(msg = %message_id, "protocol queue closed");
        }
    }

    /// Remove an id from the pending set at dequeue time.
    #[allow(clippy::expect_used)]
    fn take(&self, message_id: MessageId) {
        self.pending.lock().expect("Mutex poisoned").remove(&message_id);
    }
}

/// The protocol operation runner.
///
/// # Type Parameters
///
/// - `E`: environment (time, randomness)
/// - `S`: message store
/// - `I`: identity directory
/// - `C`: channel gateway
pub struct ProtocolRunner<E, S, I, C>
where
    E: Environment,
    S: ProtocolStore,
    I: IdentityDirectory,
    C: ChannelGateway,
{
    env: E,
    store: S,
    identity: Arc<I>,
    channel: Arc<C>,
    events: EventSink,
    config: RunnerConfig,
    queue: QueueHandle,
    rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<MessageId>>>,
}

/// Everything produced by a committed step, to be applied post-commit.
struct CommittedStep {
    owned: CryptoIdentity,
    instance_uid: InstanceUid,
    outbound: Vec<OutboundMessage>,
    effects: Vec<ProtocolEffect>,
    newly_stored: Vec<MessageId>,
}

impl<E, S, I, C> ProtocolRunner<E, S, I, C>
where
    E: Environment,
    S: ProtocolStore,
    I: IdentityDirectory,
    C: ChannelGateway,
{
    /// Create a runner.
    pub fn new(
        env: E,
        store: S,
        identity: Arc<I>,
        channel: Arc<C>,
        events: EventSink,
        config: RunnerConfig,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            env,
            store,
            identity,
            channel,
            events,
            config,
            queue: QueueHandle { pending: Arc::new(Mutex::new(HashSet::new())), tx },
            rx: tokio::sync::Mutex::new(Some(rx)),
        }
    }

    /// Schedule a message for processing; a pending duplicate is a no-op.
    pub fn enqueue(&self, message_id: MessageId) {
        self.queue.enqueue(message_id);
    }

    /// Worker loop: process queued messages until the queue closes.
    ///
    /// Call exactly once, from a dedicated task.
    pub async fn run(&self) {
        let Some(mut rx) = self.rx.lock().await.take() else {
            tracing::error!("runner worker started twice");
            return;
        };
        while let Some(message_id) = rx.recv().await {
            self.queue.take(message_id);
            self.process_message(message_id).await;
        }
    }

    /// Process queued messages until the queue is momentarily empty.
    ///
    /// Deterministic alternative to [`run`](Self::run) for tests and
    /// bootstrap catch-up.
    pub async fn drain(&self) {
        let Some(mut rx) = self.rx.lock().await.take() else {
            tracing::error!("drain called while the worker owns the queue");
            return;
        };
        while let Ok(message_id) = rx.try_recv() {
            self.queue.take(message_id);
            self.process_message(message_id).await;
        }
        *self.rx.lock().await = Some(rx);
    }

    /// Process one message: one step, one commit.
    pub async fn process_message(&self, message_id: MessageId) {
        let row = match self.store.message(message_id) {
            Ok(Some(row)) => row,
            Ok(None) => {
                tracing::debug!(msg = %message_id, "message gone, nothing to process");
                return;
            },
            Err(err) => {
                tracing::error!(msg = %message_id, error = %err, "could not load message");
                self.schedule_retry(message_id);
                return;
            },
        };

        match self.execute_operation(&row) {
            Ok(committed) => self.after_success(message_id, &committed),
            Err(reason) => self.after_cancel(message_id, &reason),
        }
    }

    /// Run the step and commit its transition atomically.
    fn execute_operation(
        &self,
        row: &ReceivedMessageRow,
    ) -> Result<CommittedStep, StepCancelReason> {
        let payload = ProtocolPayload::decode(&row.payload)
            .map_err(|e| StepCancelReason::MessageUnparsable(e.to_string()))?;

        let owned = row.message_id.owned_identity;
        let current_device = self
            .identity
            .current_device(owned)
            .map_err(|_| StepCancelReason::OwnedIdentityUnresolvable)?;

        let instance = self
            .store
            .instance(owned, row.instance_uid)
            .map_err(|e| StepCancelReason::CommitFailed(e.to_string()))?;

        let inputs = StepInputs {
            owned_identity: owned,
            current_device,
            instance_uid: row.instance_uid,
            state: instance.as_ref().map(|i| &i.state),
            payload: &payload,
            via: row.via,
            now_ms: self.env.now_ms(),
            nonce: self.env.random_nonce(),
        };

        let transition = protocol::execute_step(&inputs, self.identity.as_ref())?;

        let batch = self.stage_transition(row, &payload, instance.as_ref(), &transition)?;
        let newly_stored = batch
            .ops()
            .iter()
            .filter_map(|op| match op {
                crate::store::WriteOp::PutMessage(m) => Some(m.message_id),
                _ => None,
            })
            .collect();

        self.store
            .commit(batch)
            .map_err(|e| StepCancelReason::CommitFailed(e.to_string()))?;

        Ok(CommittedStep {
            owned,
            instance_uid: row.instance_uid,
            outbound: transition
                .outbound
                .iter()
                .filter(|m| !matches!(m.to, Recipient::Local))
                .cloned()
                .collect(),
            effects: transition.effects,
            newly_stored,
        })
    }

    /// Build the single atomic batch for one successful transition.
    fn stage_transition(
        &self,
        row: &ReceivedMessageRow,
        payload: &ProtocolPayload,
        instance: Option<&ProtocolInstanceRow>,
        transition: &StepTransition,
    ) -> Result<WriteBatch, StepCancelReason> {
        let owned = row.message_id.owned_identity;
        let now_ms = self.env.now_ms();
        let mut batch = WriteBatch::new();

        match &transition.new_state {
            Some(state) => {
                batch.put_instance(ProtocolInstanceRow {
                    instance_uid: row.instance_uid,
                    owned_identity: owned,
                    kind: payload.kind,
                    state: state.clone(),
                    created_at_ms: instance.map_or(now_ms, |i| i.created_at_ms),
                });
            },
            None => {
                batch.delete_instance(owned, row.instance_uid);
                batch.delete_links_touching(owned, row.instance_uid);
                batch.delete_creation_keys_of_instance(owned, row.instance_uid);
            },
        }

        batch.delete_message(row.message_id);

        for child in &transition.children {
            batch.put_link(InstanceLink {
                owned_identity: owned,
                parent: row.instance_uid,
                child: child.instance_uid,
            });
            let child_row = self.local_row(owned, &child.payload)?;
            batch.put_message(child_row);
        }

        // Locally addressed outbound messages feed the next local step; they
        // join the commit instead of going through the channel layer.
        for message in &transition.outbound {
            if matches!(message.to, Recipient::Local) {
                let local = self.local_row(owned, &message.payload)?;
                batch.put_message(local);
            }
        }

        for effect in &transition.effects {
            match effect {
                ProtocolEffect::RegisterCreationKey { target } => {
                    batch.put_creation_key(*target, row.instance_uid);
                },
                ProtocolEffect::ClearCreationKey { target } => {
                    batch.delete_creation_key(*target);
                },
                ProtocolEffect::AbortOtherRunsForTarget { target } => {
                    let stale = self
                        .store
                        .creation_instances_for_target(*target)
                        .map_err(|e| StepCancelReason::CommitFailed(e.to_string()))?;
                    for uid in stale {
                        if uid != row.instance_uid {
                            self.stage_cascade(&mut batch, target.owned_identity, uid)
                                .map_err(|e| StepCancelReason::CommitFailed(e.to_string()))?;
                        }
                    }
                },
                ProtocolEffect::EstablishChannel { .. }
                | ProtocolEffect::DeleteChannel { .. }
                | ProtocolEffect::AddDevice { .. }
                | ProtocolEffect::RemoveDevice { .. }
                | ProtocolEffect::ShowDialog(_)
                | ProtocolEffect::DeleteDialog { .. }
                | ProtocolEffect::ImportSnapshot { .. } => {},
            }
        }

        Ok(batch)
    }

    fn local_row(
        &self,
        owned: CryptoIdentity,
        payload: &ProtocolPayload,
    ) -> Result<ReceivedMessageRow, StepCancelReason> {
        Ok(ReceivedMessageRow {
            message_id: MessageId::new(owned, self.env.random_uid()),
            instance_uid: payload.instance_uid,
            kind: payload.kind,
            payload: payload
                .encode()
                .map_err(|e| StepCancelReason::NewStateUncomputable(e.to_string()))?,
            via: ReceptionChannel::Local,
            received_at_ms: self.env.now_ms(),
        })
    }

    /// Apply collaborator effects, post outbound, retry pending messages.
    fn after_success(&self, message_id: MessageId, committed: &CommittedStep) {
        for effect in &committed.effects {
            self.apply_collaborator_effect(committed.owned, effect);
        }

        for message in &committed.outbound {
            if let Err(err) = self.channel.post_message(message) {
                tracing::error!(
                    owned = %committed.owned,
                    error = %err,
                    "could not post outbound protocol message"
                );
            }
        }

        for stored in &committed.newly_stored {
            self.events
                .publish(EngineEvent::ProtocolMessageToProcess { message_id: *stored });
            self.enqueue(*stored);
        }

        // The instance is in a new state: other pending messages that could
        // not be processed before may now match a step.
        match self.store.messages_for_instance(committed.owned, committed.instance_uid) {
            Ok(rows) => {
                for pending in rows {
                    if committed.newly_stored.contains(&pending.message_id) {
                        continue;
                    }
                    tracing::debug!(
                        msg = %pending.message_id,
                        "re-enqueueing pending message after state change"
                    );
                    self.events.publish(EngineEvent::ProtocolMessageToProcess {
                        message_id: pending.message_id,
                    });
                    self.enqueue(pending.message_id);
                }
            },
            Err(err) => {
                tracing::error!(error = %err, "could not re-scan pending messages");
            },
        }

        self.events.publish(EngineEvent::ProtocolMessageProcessed { message_id });
    }

    fn apply_collaborator_effect(&self, owned: CryptoIdentity, effect: &ProtocolEffect) {
        let result = match effect {
            ProtocolEffect::EstablishChannel { target, seed } => {
                self.channel.establish_channel(*target, seed)
            },
            ProtocolEffect::DeleteChannel { target } => self.channel.delete_channel(*target),
            ProtocolEffect::AddDevice { remote_identity, device } => {
                self.identity.add_device(owned, *remote_identity, *device)
            },
            ProtocolEffect::RemoveDevice { remote_identity, device } => {
                self.identity.delete_device(owned, *remote_identity, *device)
            },
            ProtocolEffect::ShowDialog(dialog) => self.channel.post_dialog(dialog),
            ProtocolEffect::DeleteDialog { dialog_uid } => {
                self.channel.post_dialog(&DialogMessage::delete(*dialog_uid, owned))
            },
            ProtocolEffect::ImportSnapshot { snapshot } => {
                self.identity.import_snapshot(owned, snapshot)
            },
            ProtocolEffect::RegisterCreationKey { .. }
            | ProtocolEffect::ClearCreationKey { .. }
            | ProtocolEffect::AbortOtherRunsForTarget { .. } => Ok(()),
        };
        if let Err(err) = result {
            tracing::error!(owned = %owned, error = %err, "collaborator effect failed");
        }
    }

    /// Apply the per-reason cancellation policy.
    fn after_cancel(&self, message_id: MessageId, reason: &StepCancelReason) {
        tracing::warn!(msg = %message_id, reason = %reason, "protocol operation cancelled");

        match reason {
            StepCancelReason::CommitFailed(_) => {
                // Transient: retry after a fixed delay, unbounded. A store
                // that keeps failing commits is a deeper problem; keep the
                // error level high enough to be noticed.
                self.schedule_retry(message_id);
            },
            StepCancelReason::DialogResponseNoStep(dialog_uid) => {
                // The prompt this response answered is stale. Dismiss it so
                // the user is not stuck with it, then drop the response. The
                // deletion happens even if posting the dismissal fails.
                let delete = DialogMessage::delete(*dialog_uid, message_id.owned_identity);
                if let Err(err) = self.channel.post_dialog(&delete) {
                    tracing::error!(error = %err, "could not post delete-dialog directive");
                }
                self.discard_message(message_id);
            },
            StepCancelReason::NoMatchingStep => {
                // Not an error: the message may simply have arrived before
                // the one that unlocks its step. Keep the row; the retry
                // pass after the instance's next transition will pick it up
                // (and the bootstrap retention sweep bounds its lifetime).
                self.events.publish(EngineEvent::ProtocolMessageProcessed { message_id });
            },
            StepCancelReason::MessageUnparsable(_)
            | StepCancelReason::NewStateUncomputable(_)
            | StepCancelReason::OwnedIdentityUnresolvable => {
                self.discard_message(message_id);
            },
        }
    }

    fn discard_message(&self, message_id: MessageId) {
        let mut batch = WriteBatch::new();
        batch.delete_message(message_id);
        match self.store.commit(batch) {
            Ok(()) => {
                self.events.publish(EngineEvent::ProtocolMessageProcessed { message_id });
            },
            Err(err) => {
                tracing::error!(msg = %message_id, error = %err, "could not discard message");
                self.schedule_retry(message_id);
            },
        }
    }

    fn schedule_retry(&self, message_id: MessageId) {
        let queue = self.queue.clone();
        let env = self.env.clone();
        let delay = self.config.commit_retry_delay;
        tokio::spawn(async move {
            env.sleep(delay).await;
            queue.enqueue(message_id);
        });
    }

    /// Cascade-abort an instance: delete it, its pending messages, its
    /// creation keys, and every parent and child, transitively.
    ///
    /// One atomic commit for the whole cascade. Uses an explicit worklist;
    /// a malicious peer can build deep parent/child chains and must not be
    /// able to overflow the stack.
    pub fn abort_instance(
        &self,
        owned: CryptoIdentity,
        instance_uid: InstanceUid,
    ) -> Result<(), RunnerError> {
        let mut batch = WriteBatch::new();
        self.stage_cascade(&mut batch, owned, instance_uid)?;
        self.store.commit(batch)?;
        tracing::info!(owned = %owned, instance = %instance_uid, "aborted protocol instance");
        Ok(())
    }

    fn stage_cascade(
        &self,
        batch: &mut WriteBatch,
        owned: CryptoIdentity,
        root: InstanceUid,
    ) -> Result<(), StoreError> {
        let mut visited: HashSet<InstanceUid> = HashSet::new();
        let mut worklist = vec![root];

        while let Some(uid) = worklist.pop() {
            if !visited.insert(uid) {
                continue;
            }

            batch.delete_instance(owned, uid);
            batch.delete_creation_keys_of_instance(owned, uid);

            for message in self.store.messages_for_instance(owned, uid)? {
                batch.delete_message(message.message_id);
            }

            for link in self.store.links_with_parent(owned, uid)? {
                worklist.push(link.child);
            }
            for link in self.store.links_with_child(owned, uid)? {
                worklist.push(link.parent);
            }
            batch.delete_links_touching(owned, uid);
        }

        Ok(())
    }

    /// Bootstrap cleanup and catch-up, in order: purge identity-transfer
    /// instances, purge their messages, purge leftover final-state
    /// instances, drop expired unclaimed messages, then re-enqueue
    /// everything that remains.
    pub fn bootstrap(&self) -> Result<(), RunnerError> {
        let now_ms = self.env.now_ms();

        // Transfer instances never survive a restart.
        let mut batch = WriteBatch::new();
        for row in self.store.all_instances()? {
            if row.kind == ProtocolKind::IdentityTransfer {
                self.stage_cascade(&mut batch, row.owned_identity, row.instance_uid)?;
            }
        }
        for id in self.store.all_message_ids()? {
            if let Some(row) = self.store.message(id)? {
                if row.kind == ProtocolKind::IdentityTransfer {
                    batch.delete_message(id);
                }
            }
        }
        if !batch.is_empty() {
            self.store.commit(batch)?;
        }

        // Leftover final-state rows exist only when a step forgot to declare
        // itself final; clean them so they cannot shadow future runs.
        let mut batch = WriteBatch::new();
        for row in self.store.all_instances()? {
            if protocol::state_is_final(row.kind, &row.state) {
                tracing::warn!(
                    owned = %row.owned_identity,
                    instance = %row.instance_uid,
                    "deleting leftover final-state instance"
                );
                batch.delete_instance(row.owned_identity, row.instance_uid);
                batch.delete_links_touching(row.owned_identity, row.instance_uid);
                batch.delete_creation_keys_of_instance(row.owned_identity, row.instance_uid);
            }
        }
        if !batch.is_empty() {
            self.store.commit(batch)?;
        }

        // Retention: an unclaimed message (no instance ever picked it up)
        // older than the window will never be consumed.
        let retention_ms = self.config.message_retention.as_millis() as u64;
        let mut batch = WriteBatch::new();
        for id in self.store.all_message_ids()? {
            if let Some(row) = self.store.message(id)? {
                let unclaimed = self
                    .store
                    .instance(row.message_id.owned_identity, row.instance_uid)?
                    .is_none();
                if unclaimed && now_ms.saturating_sub(row.received_at_ms) > retention_ms {
                    tracing::info!(msg = %id, "dropping expired unclaimed message");
                    batch.delete_message(id);
                }
            }
        }
        if !batch.is_empty() {
            self.store.commit(batch)?;
        }

        // Everything still stored deserves another processing attempt.
        for id in self.store.all_message_ids()? {
            self.events.publish(EngineEvent::ProtocolMessageToProcess { message_id: id });
            self.enqueue(id);
        }

        Ok(())
    }
}

impl<E, S, I, C> ProtocolIntake for ProtocolRunner<E, S, I, C>
where
    E: Environment,
    S: ProtocolStore,
    I: IdentityDirectory,
    C: ChannelGateway,
{
    fn accept(&self, row: ReceivedMessageRow) -> Result<(), RunnerError> {
        let message_id = row.message_id;

        // A duplicate delivery must not reset an existing row.
        if self.store.message(message_id)?.is_none() {
            let mut batch = WriteBatch::new();
            batch.put_message(row);
            self.store.commit(batch)?;
        } else {
            tracing::debug!(msg = %message_id, "message row already exists, re-scheduling only");
        }

        self.events.publish(EngineEvent::ProtocolMessageToProcess { message_id });
        self.enqueue(message_id);
        Ok(())
    }

    fn start_protocol(
        &self,
        owned: CryptoIdentity,
        payload: ProtocolPayload,
    ) -> Result<MessageId, RunnerError> {
        let row = ReceivedMessageRow {
            message_id: MessageId::new(owned, self.env.random_uid()),
            instance_uid: payload.instance_uid,
            kind: payload.kind,
            payload: payload.encode().map_err(|e| RunnerError::Codec(e.to_string()))?,
            via: ReceptionChannel::Local,
            received_at_ms: self.env.now_ms(),
        };
        let message_id = row.message_id;
        self.accept(row)?;
        Ok(message_id)
    }
}
