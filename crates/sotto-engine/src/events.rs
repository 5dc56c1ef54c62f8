//! Outbound event channel for the UI/notification collaborator.
//!
//! The engine publishes progress and results on a bounded channel and never
//! waits for the subscriber: a full channel drops the event with a warning.
//! Protocol correctness must not depend on anyone listening.

use sotto_proto::MessageId;

/// Everything the UI needs to present one decrypted application message.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct DecryptedMessageInfo {
    /// Server upload timestamp; notify order is ascending on this.
    pub upload_timestamp_ms: u64,
    /// The decrypted message.
    pub message_id: MessageId,
    /// Attachment numbers now carrying decryption material.
    pub attachment_numbers: Vec<usize>,
    /// Whether an extended payload is still being fetched.
    pub extended_payload_pending: bool,
}

/// Events published by the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineEvent {
    /// A protocol message was stored and awaits processing.
    ProtocolMessageToProcess {
        /// The pending message.
        message_id: MessageId,
    },
    /// A protocol message left the queue (consumed or discarded).
    ProtocolMessageProcessed {
        /// The finished message.
        message_id: MessageId,
    },
    /// A batch of application messages was decrypted, in upload order.
    ApplicationMessagesDecrypted {
        /// The decrypted messages, sorted by upload timestamp.
        messages: Vec<DecryptedMessageInfo>,
    },
}

/// Non-blocking sender half of the event channel.
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: tokio::sync::mpsc::Sender<EngineEvent>,
}

impl EventSink {
    /// Publish an event; drops it with a warning if the subscriber lags.
    pub fn publish(&self, event: EngineEvent) {
        if let Err(err) = self.tx.try_send(event) {
            tracing::warn!(error = %err, "event channel full or closed, dropping event");
        }
    }
}

/// Create an event channel with the given capacity.
#[must_use]
pub fn event_channel(capacity: usize) -> (EventSink, tokio::sync::mpsc::Receiver<EngineEvent>) {
    let (tx, rx) = tokio::sync::mpsc::channel(capacity);
    (EventSink { tx }, rx)
}
