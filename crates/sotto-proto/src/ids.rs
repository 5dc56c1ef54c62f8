//! Typed identifiers.
//!
//! Every identifier is an opaque 32-byte value behind a newtype. The
//! newtypes prevent the classic confusion bugs of this domain (passing a
//! device uid where an instance uid is expected compiles nowhere), and their
//! `Debug` impls print a short hex prefix so log lines stay readable.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of bytes in every raw identifier.
pub const ID_LEN: usize = 32;

fn fmt_short_hex(bytes: &[u8; ID_LEN], f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for b in &bytes[..4] {
        write!(f, "{b:02x}")?;
    }
    write!(f, "..")
}

macro_rules! raw_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name([u8; ID_LEN]);

        impl $name {
            /// Wrap raw bytes.
            #[must_use]
            pub const fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
                Self(bytes)
            }

            /// Borrow the raw bytes.
            #[must_use]
            pub const fn as_bytes(&self) -> &[u8; ID_LEN] {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "("))?;
                fmt_short_hex(&self.0, f)?;
                write!(f, ")")
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt_short_hex(&self.0, f)
            }
        }
    };
}

raw_id! {
    /// A cryptographic identity: one end user, owned or remote.
    ///
    /// Opaque to the engine; the identity collaborator owns key material.
    CryptoIdentity
}

raw_id! {
    /// One physical device of an identity.
    DeviceUid
}

raw_id! {
    /// Generic unique value (message uids, dialog uids).
    Uid
}

raw_id! {
    /// Identifies one running protocol instance, scoped per owned identity.
    InstanceUid
}

/// Identifies one received protocol message.
///
/// The owned identity is part of the key: two owned identities on the same
/// device may both receive a message with the same uid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId {
    /// Owned identity the message was addressed to.
    pub owned_identity: CryptoIdentity,
    /// Server-assigned (or locally drawn) uid.
    pub uid: Uid,
}

impl MessageId {
    /// Build a message id.
    #[must_use]
    pub const fn new(owned_identity: CryptoIdentity, uid: Uid) -> Self {
        Self { owned_identity, uid }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owned_identity, self.uid)
    }
}

/// The triple a channel-creation run is keyed by.
///
/// Used both to detect an already-running creation protocol (dedup) and as
/// the presence coordinator's candidate key. For owned-device channel
/// creation, `remote_identity` equals `owned_identity`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelTarget {
    /// Local end of the channel.
    pub owned_identity: CryptoIdentity,
    /// Remote identity (may equal `owned_identity`).
    pub remote_identity: CryptoIdentity,
    /// Remote device the channel targets.
    pub remote_device: DeviceUid,
}
