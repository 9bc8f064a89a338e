//! Space replication
//!
//! A space is a set of feeds whose entries are [`Envelope`]s. The
//! [`SpaceEngine`] owns everything known about one space on this device:
//! which entries are stored (replicated timeframe), which were handed to the
//! application in causal order (processed timeframe), and the credential
//! chain. Replication sessions ([`replicate`]) exchange feed entries with one
//! peer over a teleport channel and feed them into the engine.

pub mod engine;
pub mod envelope;
pub mod protocol;
pub mod reconciler;
pub mod session;

pub use engine::{Ingested, SpaceEngine, SpaceHandle, SpaceSnapshot};
pub use envelope::{Body, Envelope};
pub use protocol::{ReplicationMessage, MAX_MESSAGE_SIZE, REPLICATION_CHANNEL};
pub use reconciler::{DocumentReconciler, MemoryReconciler};
pub use session::replicate;

use thiserror::Error;

use crate::core_credentials::CredentialError;
use crate::core_feed::FeedError;
use crate::core_identity::PublicKey;
use crate::core_teleport::TeleportError;
use crate::core_timeframe::Position;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicationError {
    #[error("protocol violation by {peer}: {reason}")]
    ProtocolViolation { peer: PublicKey, reason: String },

    #[error("invalid signature on feed {feed} seq {seq}")]
    InvalidSignature { feed: PublicKey, seq: u64 },

    #[error("peer {peer} replicates space {actual}, expected {expected}")]
    SpaceMismatch {
        peer: PublicKey,
        expected: PublicKey,
        actual: PublicKey,
    },

    #[error("no hello from {peer} in time")]
    HandshakeTimeout { peer: PublicKey },

    #[error("feed {feed} forked and is excluded from replication")]
    FeedCorrupted { feed: PublicKey },

    #[error("feed {feed} is not authorized to write")]
    NotAuthorized { feed: PublicKey },

    #[error("credential rejected: {0}")]
    Credential(#[from] CredentialError),

    #[error("feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("teleport error: {0}")]
    Teleport(#[from] TeleportError),

    #[error("space engine stopped")]
    EngineStopped,
}

pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// What happened to an entry once the engine looked at it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpaceEvent {
    /// Data entry handed to the reconciler
    MessageApplied { position: Position },
    CredentialApplied {
        position: Position,
        kind: &'static str,
    },
    CredentialRejected {
        position: Position,
        error: CredentialError,
    },
    /// Data entry from a feed without write rights in its causal past
    Unauthorized { position: Position },
    /// Two validly signed entries at the same position
    FeedCorrupted { feed: PublicKey, seq: u64 },
    /// Entries after `from_seq` arrived, but `from_seq` did not
    GapRequested { feed: PublicKey, from_seq: u64 },
    /// Stored entry whose payload is not an envelope
    MalformedMessage { position: Position },
}

impl SpaceEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SpaceEvent::MessageApplied { .. } => "message_applied",
            SpaceEvent::CredentialApplied { .. } => "credential_applied",
            SpaceEvent::CredentialRejected { .. } => "credential_rejected",
            SpaceEvent::Unauthorized { .. } => "unauthorized",
            SpaceEvent::FeedCorrupted { .. } => "feed_corrupted",
            SpaceEvent::GapRequested { .. } => "gap_requested",
            SpaceEvent::MalformedMessage { .. } => "malformed_message",
        }
    }
}
