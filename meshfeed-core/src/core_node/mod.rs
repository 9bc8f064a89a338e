//! Node: one device taking part in any number of spaces
//!
//! Ties the pieces together. Each open space has a [`SpaceEngine`] and a
//! swarm topic (the space key); every connection the swarm opens on that
//! topic runs a replication session and a [`presence`] watch.
//!
//! [`SpaceEngine`]: crate::core_replication::SpaceEngine

pub mod node;
pub mod presence;

pub use node::Node;
pub use presence::{keep_alive, Alive, PresenceOutcome, PRESENCE_CHANNEL};

use thiserror::Error;

use crate::core_identity::PublicKey;
use crate::core_replication::ReplicationError;
use crate::core_swarm::NetworkError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    #[error("space {0} is not open on this node")]
    UnknownSpace(PublicKey),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Replication(#[from] ReplicationError),
}

pub type NodeResult<T> = Result<T, NodeError>;
