//! Identity primitives
//!
//! Every actor in the system is named by an ed25519 public key: swarm peers,
//! space members (identity keys) and feeds (feed keys).

pub mod keypair;

pub use keypair::{Keypair, PublicKey, Signature};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("invalid {what} length: expected {expected}, got {actual}")]
    InvalidLength {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("invalid hex: {0}")]
    InvalidHex(String),
}
