//! Crate-level error
//!
//! Every module keeps its own error enum. [`MeshError`] gathers them for
//! callers that cross module boundaries, and [`ErrorClass`] tells them what
//! to do about it: retry, drop the peer's channel, give up on a feed, or fix
//! their setup.

use thiserror::Error;

use crate::config::ConfigError;
use crate::core_credentials::CredentialError;
use crate::core_feed::FeedError;
use crate::core_identity::IdentityError;
use crate::core_node::NodeError;
use crate::core_replication::ReplicationError;
use crate::core_signal::SignalError;
use crate::core_swarm::NetworkError;
use crate::core_teleport::TeleportError;
use crate::core_transport::TransportError;
use crate::logging::LoggingError;
use crate::wire::DecodeError;

/// How an error should be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Retried with backoff, never surfaced to the application
    Transient,
    /// The offending channel or connection is closed
    ProtocolViolation,
    /// A feed forked; it stays excluded until someone intervenes
    Integrity,
    /// A credential or write was refused; the connection lives on
    Admission,
    Configuration,
    /// Misuse or a stopped component
    Internal,
}

impl ErrorClass {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::Transient)
    }
}

#[derive(Debug, Error)]
pub enum MeshError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Signal(#[from] SignalError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Teleport(#[from] TeleportError),

    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Replication(#[from] ReplicationError),

    #[error(transparent)]
    Node(#[from] NodeError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Logging(#[from] LoggingError),
}

pub type MeshResult<T> = Result<T, MeshError>;

impl MeshError {
    pub fn class(&self) -> ErrorClass {
        match self {
            MeshError::Transport(e) => transport_class(e),
            MeshError::Signal(e) => signal_class(e),
            MeshError::Network(e) => network_class(e),
            MeshError::Teleport(e) => teleport_class(e),
            MeshError::Feed(e) => feed_class(e),
            MeshError::Credential(_) => ErrorClass::Admission,
            MeshError::Replication(e) => replication_class(e),
            MeshError::Node(e) => match e {
                NodeError::UnknownSpace(_) => ErrorClass::Internal,
                NodeError::Network(e) => network_class(e),
                NodeError::Replication(e) => replication_class(e),
            },
            MeshError::Identity(_) => ErrorClass::Configuration,
            MeshError::Decode(_) => ErrorClass::ProtocolViolation,
            MeshError::Config(_) | MeshError::Logging(_) => ErrorClass::Configuration,
        }
    }
}

fn transport_class(e: &TransportError) -> ErrorClass {
    match e {
        TransportError::InvalidPayload(_) => ErrorClass::ProtocolViolation,
        TransportError::Closed
        | TransportError::UnknownSession(_)
        | TransportError::ConnectionRefused { .. }
        | TransportError::Other(_) => ErrorClass::Transient,
    }
}

fn signal_class(e: &SignalError) -> ErrorClass {
    match e {
        SignalError::Encoding(_) => ErrorClass::ProtocolViolation,
        SignalError::Closed => ErrorClass::Internal,
        SignalError::Unavailable
        | SignalError::Disconnected
        | SignalError::NotConnected
        | SignalError::Timeout { .. }
        | SignalError::Rejected { .. } => ErrorClass::Transient,
    }
}

fn network_class(e: &NetworkError) -> ErrorClass {
    match e {
        NetworkError::Timeout { .. } => ErrorClass::Transient,
        NetworkError::Signal(e) => signal_class(e),
        NetworkError::Transport(e) => transport_class(e),
        NetworkError::TopicNotJoined { .. } | NetworkError::Stopped => ErrorClass::Internal,
    }
}

fn teleport_class(e: &TeleportError) -> ErrorClass {
    match e {
        TeleportError::TransportClosed | TeleportError::ChannelClosed => ErrorClass::Transient,
        TeleportError::FrameTooLarge { .. }
        | TeleportError::ProtocolViolation(_)
        | TeleportError::InvalidChannelName(_) => ErrorClass::ProtocolViolation,
        TeleportError::MessageTooLarge { .. } | TeleportError::ChannelLimit => ErrorClass::Internal,
    }
}

fn feed_class(e: &FeedError) -> ErrorClass {
    match e {
        FeedError::SequenceMismatch { .. } | FeedError::InvalidSignature { .. } | FeedError::Decode(_) => {
            ErrorClass::ProtocolViolation
        }
        FeedError::Storage(_) | FeedError::NotOwner(_) | FeedError::PayloadTooLarge { .. } => {
            ErrorClass::Internal
        }
    }
}

fn replication_class(e: &ReplicationError) -> ErrorClass {
    match e {
        ReplicationError::ProtocolViolation { .. }
        | ReplicationError::InvalidSignature { .. }
        | ReplicationError::SpaceMismatch { .. } => ErrorClass::ProtocolViolation,
        ReplicationError::HandshakeTimeout { .. } => ErrorClass::Transient,
        ReplicationError::FeedCorrupted { .. } => ErrorClass::Integrity,
        ReplicationError::NotAuthorized { .. } | ReplicationError::Credential(_) => ErrorClass::Admission,
        ReplicationError::Feed(e) => feed_class(e),
        ReplicationError::Teleport(e) => teleport_class(e),
        ReplicationError::EngineStopped => ErrorClass::Internal,
    }
}
