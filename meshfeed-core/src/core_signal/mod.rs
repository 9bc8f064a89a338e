//! Signaling: peer discovery and connection negotiation through a
//! rendezvous service.

pub mod client;
pub mod connector;
pub mod protocol;
pub mod rendezvous;

pub use client::SignalClient;
pub use connector::{SignalConnection, SignalConnector};
pub use protocol::SignalMessage;
pub use rendezvous::MemoryRendezvous;

use serde::Serialize;
use thiserror::Error;

use crate::core_identity::PublicKey;
use crate::core_transport::SessionId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalError {
    #[error("signaling service unavailable")]
    Unavailable,

    #[error("signaling connection lost")]
    Disconnected,

    #[error("not connected to signaling")]
    NotConnected,

    #[error("no answer for session {session}")]
    Timeout { session: SessionId },

    #[error("offer for session {session} rejected")]
    Rejected { session: SessionId },

    #[error("signal encoding error: {0}")]
    Encoding(String),

    #[error("signal client closed")]
    Closed,
}

pub type SignalResult<T> = Result<T, SignalError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalState {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalEvent {
    PeerDiscovered {
        topic: PublicKey,
        peer: PublicKey,
    },
    PeerWithdrawn {
        topic: PublicKey,
        peer: PublicKey,
    },
    Offer {
        topic: PublicKey,
        from: PublicKey,
        session: SessionId,
        payload: Vec<u8>,
    },
    Candidate {
        topic: PublicKey,
        from: PublicKey,
        session: SessionId,
        payload: Vec<u8>,
    },
    StateChanged(SignalState),
    /// Signaling stayed unreachable past the retry budget
    TopicDegraded {
        topic: PublicKey,
    },
}
