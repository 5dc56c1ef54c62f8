//! Sotto protocol engine.
//!
//! Establishes and maintains secure device channels between devices of
//! different end-user identities, and processes inbound protocol and
//! application messages through them.
//!
//! # Architecture
//!
//! ```text
//! InboxProcessor ──decrypt──▶ MessageDecryptor
//!       │ protocol rows
//!       ▼
//! ProtocolRunner ──steps──▶ protocol::execute_step (pure)
//!       │ one WriteBatch per operation
//!       ▼
//!   ProtocolStore          PresenceCoordinator ──starts──▶ ProtocolRunner
//! ```
//!
//! The runner serializes protocol operations on a no-duplicate queue; the
//! presence coordinator heals missing device channels; the inbox processor
//! turns fetched ciphertext into protocol rows and UI notifications. All
//! collaborators (identity directory, channel layer, network, decryptor)
//! are injected at construction time.

pub mod collaborators;
pub mod env;
pub mod events;
pub mod inbox;
pub mod presence;
pub mod protocol;
pub mod runner;
pub mod store;

#[cfg(test)]
pub(crate) mod testutil;

pub use collaborators::{
    AttachmentInfo, ChannelGateway, CollaboratorError, DecryptionOutcome, DeviceScope,
    IdentityDirectory, MessageDecryptor, NetworkGateway, RemoteDevice,
};
pub use env::{Environment, SystemEnv};
pub use events::{DecryptedMessageInfo, EngineEvent, EventSink, event_channel};
pub use inbox::{InboxConfig, InboxProcessor};
pub use presence::{PresenceCoordinator, PresencePolicy, PresenceSummary};
pub use protocol::{StepCancelReason, StepTransition, execute_step};
pub use runner::{ProtocolIntake, ProtocolRunner, RunnerConfig, RunnerError};
pub use store::{MemoryStore, ProtocolStore, StoreError, WriteBatch};
