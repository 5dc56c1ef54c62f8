//! Envelope descriptors for the inbound batch pipeline.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::ids::MessageId;

/// Everything the decryption collaborator needs about one fetched message.
///
/// Built by the batch processor from an inbox row before any decryption has
/// happened: no payload, no sender, no extended content. The
/// `known_attachment_count` is the count observed at fetch time; the
/// decryptor must resolve exactly this many attachment keys or the message is
/// purged rather than partially trusted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeDescriptor {
    /// Inbox row this descriptor was built from.
    pub message_id: MessageId,
    /// Server upload timestamp, unix millis.
    pub upload_timestamp_ms: u64,
    /// Server download timestamp, unix millis.
    pub download_timestamp_ms: u64,
    /// Local receive timestamp, unix millis.
    pub local_timestamp_ms: u64,
    /// Encrypted message content.
    pub encrypted_content: Bytes,
    /// Wrapped content key from the message header.
    pub wrapped_key: Bytes,
    /// Attachment count observed at fetch time.
    pub known_attachment_count: usize,
}
