//! Interactive dialog messages.
//!
//! Some protocols need the user: the identity transfer flow shows a session
//! number on the source device and waits for confirmation. Dialogs are
//! addressed by uid so a later step (or the runner's stuck-prompt cleanup)
//! can delete a prompt it no longer wants an answer to.

use serde::{Deserialize, Serialize};

use crate::ids::{CryptoIdentity, Uid};

/// What a dialog asks of the user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DialogKind {
    /// Display a transfer session number and wait for confirmation.
    TransferSessionNumber {
        /// Number the user must read back on the other device.
        session_number: u32,
    },
    /// Ask the user to confirm finishing an identity transfer.
    ConfirmTransfer,
    /// Dismiss the dialog with this uid; sent when a prompt became stale.
    Delete,
}

/// One dialog directive for the UI collaborator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogMessage {
    /// Dialog uid; responses and delete directives quote it.
    pub uid: Uid,
    /// Owned identity the dialog belongs to.
    pub owned_identity: CryptoIdentity,
    /// What to show or do.
    pub kind: DialogKind,
}

impl DialogMessage {
    /// Build the delete directive dismissing the dialog with `uid`.
    #[must_use]
    pub const fn delete(uid: Uid, owned_identity: CryptoIdentity) -> Self {
        Self { uid, owned_identity, kind: DialogKind::Delete }
    }
}
