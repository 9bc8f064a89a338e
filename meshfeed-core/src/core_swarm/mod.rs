//! Swarm: topic membership and connection lifecycle
//!
//! [`NetworkManager`] joins topics through the signaling client, asks a
//! [`Topology`] which peers it should be connected to, and negotiates
//! [`Connection`]s through a [`TransportFactory`](crate::core_transport::TransportFactory).
//! Consumers learn about connections through [`NetworkEvent`]s.

pub mod connection;
pub mod manager;
pub mod topology;

pub use connection::{Connection, ConnectionState};
pub use manager::NetworkManager;
pub use topology::{FullMesh, Star, Topology};

use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

use crate::core_identity::PublicKey;
use crate::core_signal::SignalError;
use crate::core_transport::{SessionId, TransportError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    #[error("topic {topic} not joined")]
    TopicNotJoined { topic: PublicKey },

    #[error("connection attempt to {peer} timed out")]
    Timeout { peer: PublicKey },

    #[error(transparent)]
    Signal(#[from] SignalError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("network manager stopped")]
    Stopped,
}

pub type NetworkResult<T> = Result<T, NetworkError>;

/// Per (topic, peer) connection state as seen by the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotState {
    Idle,
    Connecting,
    Connected,
    /// Retry budget spent; left alone until the cool-down ends
    Unreachable,
}

#[derive(Debug, Clone)]
pub enum NetworkEvent {
    ConnectionOpened(Arc<Connection>),
    ConnectionClosed {
        topic: PublicKey,
        peer: PublicKey,
        session: SessionId,
    },
    /// Signaling is gone for this topic; live connections are kept
    TopicDegraded {
        topic: PublicKey,
    },
    PeerUnreachable {
        topic: PublicKey,
        peer: PublicKey,
    },
}

impl NetworkEvent {
    pub fn topic(&self) -> &PublicKey {
        match self {
            NetworkEvent::ConnectionOpened(connection) => connection.topic(),
            NetworkEvent::ConnectionClosed { topic, .. }
            | NetworkEvent::TopicDegraded { topic }
            | NetworkEvent::PeerUnreachable { topic, .. } => topic,
        }
    }
}
