//! Append-only signed feeds
//!
//! A feed is a log owned by exactly one keypair. Each entry is a
//! [`FeedMessage`] signed by the feed key; seqs start at 0 and have no gaps.

pub mod message;
pub mod storage;
pub mod store;

pub use message::{FeedMessage, MAX_ENCODED_SIZE, MAX_PAYLOAD_SIZE};
pub use storage::{FeedStorage, MemoryStorage};
pub use store::FeedStore;

use thiserror::Error;

use crate::core_identity::PublicKey;
use crate::wire::DecodeError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    /// Backend I/O error
    #[error("storage error: {0}")]
    Storage(String),

    #[error("feed {feed}: expected seq {expected}, got {actual}")]
    SequenceMismatch {
        feed: PublicKey,
        expected: u64,
        actual: u64,
    },

    #[error("feed {0} is not owned by this device")]
    NotOwner(PublicKey),

    #[error("payload of {size} bytes exceeds limit of {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("invalid signature on feed {feed} seq {seq}")]
    InvalidSignature { feed: PublicKey, seq: u64 },

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
}

pub type FeedResult<T> = Result<T, FeedError>;
