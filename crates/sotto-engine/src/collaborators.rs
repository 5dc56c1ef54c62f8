//! Collaborator traits: the engine's view of the rest of the system.
//!
//! The engine owns no key material, no transport, and no device directory.
//! Everything it needs from those subsystems is injected through these traits
//! at construction time. Directory and channel lookups are synchronous (they
//! are local-state queries in every real deployment); decryption and server
//! directives are async because they do real I/O.

use async_trait::async_trait;
use bytes::Bytes;
use sotto_proto::{
    ChannelTarget, CryptoIdentity, DeviceUid, DialogMessage, EnvelopeDescriptor, MessageId,
    OutboundMessage, ProtocolPayload, ReceptionChannel, Uid,
};
use thiserror::Error;

/// Errors surfaced by collaborators.
///
/// The engine treats these as dependency errors: the current operation
/// cancels with a typed reason and the caller decides whether to retry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    /// The identity is not known to the directory.
    #[error("unknown identity")]
    UnknownIdentity,

    /// The device is not known to the directory.
    #[error("unknown device")]
    UnknownDevice,

    /// Posting a message failed.
    #[error("post failed: {0}")]
    PostFailed(String),

    /// The collaborator is unavailable.
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
}

/// One remote device as enumerated by the directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemoteDevice {
    /// Identity the device belongs to.
    pub remote_identity: CryptoIdentity,
    /// The device uid.
    pub device: DeviceUid,
    /// Last time any traffic was seen from this device, unix millis.
    /// `None` for a device we have never heard from.
    pub last_seen_ms: Option<u64>,
}

/// Which remote devices a presence sweep considers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceScope {
    /// Devices of contacts of the owned identity.
    ContactDevices,
    /// Other devices of the owned identity itself.
    OwnedDevices,
}

/// Identity directory: identities, devices, trust, challenge signatures.
pub trait IdentityDirectory: Send + Sync + 'static {
    /// All owned identities on this installation.
    fn owned_identities(&self) -> Result<Vec<CryptoIdentity>, CollaboratorError>;

    /// Whether the owned identity is active (not deactivated server-side).
    fn is_active(&self, owned: CryptoIdentity) -> Result<bool, CollaboratorError>;

    /// The current device uid of an owned identity.
    fn current_device(&self, owned: CryptoIdentity) -> Result<DeviceUid, CollaboratorError>;

    /// Remote devices visible to `owned` within `scope`.
    fn remote_devices(
        &self,
        owned: CryptoIdentity,
        scope: DeviceScope,
    ) -> Result<Vec<RemoteDevice>, CollaboratorError>;

    /// Known devices of one specific remote identity.
    fn devices_of(
        &self,
        owned: CryptoIdentity,
        remote: CryptoIdentity,
    ) -> Result<Vec<DeviceUid>, CollaboratorError>;

    /// Whether `remote` is a trusted contact of `owned`.
    fn is_contact(
        &self,
        owned: CryptoIdentity,
        remote: CryptoIdentity,
    ) -> Result<bool, CollaboratorError>;

    /// Record a newly discovered device.
    fn add_device(
        &self,
        owned: CryptoIdentity,
        remote: CryptoIdentity,
        device: DeviceUid,
    ) -> Result<(), CollaboratorError>;

    /// Delete a stale device record.
    fn delete_device(
        &self,
        owned: CryptoIdentity,
        remote: CryptoIdentity,
        device: DeviceUid,
    ) -> Result<(), CollaboratorError>;

    /// Sign a channel-creation or group-ping challenge for `owned`.
    fn sign_challenge(
        &self,
        owned: CryptoIdentity,
        challenge: &[u8],
    ) -> Result<Bytes, CollaboratorError>;

    /// Verify a challenge signature allegedly produced by `remote`.
    fn verify_challenge(
        &self,
        remote: CryptoIdentity,
        challenge: &[u8],
        signature: &[u8],
    ) -> Result<bool, CollaboratorError>;

    /// Install a transferred identity snapshot on this device.
    fn import_snapshot(
        &self,
        owned: CryptoIdentity,
        snapshot: &[u8],
    ) -> Result<(), CollaboratorError>;
}

/// Channel layer: device-channel records and message posting.
pub trait ChannelGateway: Send + Sync + 'static {
    /// Whether a confirmed device channel exists for this target.
    fn channel_exists(&self, target: ChannelTarget) -> Result<bool, CollaboratorError>;

    /// All (remote identity, remote device) pairs covered by a channel for
    /// `owned`. The presence coordinator subtracts this from the directory.
    fn covered_devices(
        &self,
        owned: CryptoIdentity,
    ) -> Result<Vec<(CryptoIdentity, DeviceUid)>, CollaboratorError>;

    /// Create (or replace) the channel record for `target`.
    fn establish_channel(
        &self,
        target: ChannelTarget,
        seed: &[u8],
    ) -> Result<(), CollaboratorError>;

    /// Delete a half-open or stale channel record.
    fn delete_channel(&self, target: ChannelTarget) -> Result<(), CollaboratorError>;

    /// Post a protocol message; returns the assigned message uid.
    fn post_message(&self, message: &OutboundMessage) -> Result<Uid, CollaboratorError>;

    /// Post a dialog directive for the UI.
    fn post_dialog(&self, dialog: &DialogMessage) -> Result<(), CollaboratorError>;
}

/// Network layer directives for inbox rows.
#[async_trait]
pub trait NetworkGateway: Send + Sync + 'static {
    /// Mark processed rows as listed on the server and delete rows marked
    /// for deletion. Relieves server redelivery pressure; must run before
    /// any other follow-up.
    async fn mark_listed_and_delete(&self, owned: CryptoIdentity)
    -> Result<(), CollaboratorError>;

    /// Download the extended payload declared by a decrypted message.
    async fn download_extended_payload(
        &self,
        message_id: MessageId,
    ) -> Result<(), CollaboratorError>;

    /// Start processing the attachments of a decrypted message.
    async fn process_attachments(&self, message_id: MessageId) -> Result<(), CollaboratorError>;
}

/// Per-attachment material resolved during decryption.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttachmentInfo {
    /// Attachment decryption key.
    pub key: Bytes,
    /// Decrypted attachment metadata (name, size, hash).
    pub metadata: Bytes,
}

/// One decryption outcome per envelope descriptor; a closed set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecryptionOutcome {
    /// No key decrypts the envelope.
    Undecryptable {
        /// Message the outcome is for.
        message_id: MessageId,
    },
    /// Decrypted but the plaintext does not parse.
    Unparsable {
        /// Message the outcome is for.
        message_id: MessageId,
    },
    /// Decrypted to a message type this pipeline does not accept.
    UnexpectedType {
        /// Message the outcome is for.
        message_id: MessageId,
    },
    /// Sender is revoked or otherwise rejected.
    Rejected {
        /// Message the outcome is for.
        message_id: MessageId,
    },
    /// A protocol message; handed to the protocol engine.
    Protocol {
        /// Message the outcome is for.
        message_id: MessageId,
        /// The decrypted protocol payload.
        payload: ProtocolPayload,
        /// Channel the message arrived through.
        via: ReceptionChannel,
    },
    /// An application message with a resolved sender.
    Application {
        /// Message the outcome is for.
        message_id: MessageId,
        /// Resolved sender identity.
        sender: CryptoIdentity,
        /// Resolved sender device.
        sender_device: DeviceUid,
        /// Decrypted application payload.
        payload: Bytes,
        /// Key for the extended payload, if one was declared and resolved.
        extended_payload_key: Option<Bytes>,
        /// Resolved attachment material, one entry per attachment.
        attachments: Vec<AttachmentInfo>,
    },
}

impl DecryptionOutcome {
    /// The message this outcome concerns.
    #[must_use]
    pub const fn message_id(&self) -> MessageId {
        match self {
            Self::Undecryptable { message_id }
            | Self::Unparsable { message_id }
            | Self::UnexpectedType { message_id }
            | Self::Rejected { message_id }
            | Self::Protocol { message_id, .. }
            | Self::Application { message_id, .. } => *message_id,
        }
    }
}

/// Decryption layer: unwraps envelope keys and classifies plaintext.
#[async_trait]
pub trait MessageDecryptor: Send + Sync + 'static {
    /// Decrypt one batch; returns exactly one outcome per descriptor.
    async fn decrypt_batch(&self, envelopes: Vec<EnvelopeDescriptor>) -> Vec<DecryptionOutcome>;
}
