/*
  core_transport - point-to-point byte pipes

  Transport is the seam to whatever actually carries bytes between two peers
  (a WebRTC data channel, a websocket, an in-process pipe). It is message
  oriented: one send() is one recv() on the other side, in order.

  TransportFactory negotiates a Transport through an opaque offer/answer
  exchange that the swarm carries over signaling:

    initiator                         responder
    create_offer(session, remote) ──► accept_offer(session, remote, offer)
                                  ◄── answer (+ responder transport)
    complete(session, answer)
      └─► initiator transport

  abort(session) releases anything half-open for a session that will not
  complete (timeout, tie-break loss, leave).

  Keep this module ignorant of topics and feeds; it only moves bytes.
*/

pub mod memory;

pub use memory::{MemoryNetwork, MemoryTransport, MemoryTransportFactory};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::core_identity::PublicKey;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    #[error("connection to {remote} refused")]
    ConnectionRefused { remote: PublicKey },

    #[error("invalid negotiation payload: {0}")]
    InvalidPayload(String),

    #[error("transport error: {0}")]
    Other(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Identifies one connection negotiation end to end
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        SessionId(Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        SessionId(Uuid::from_bytes(bytes))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordered, message-oriented, bidirectional pipe
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    async fn send(&self, data: Vec<u8>) -> TransportResult<()>;

    /// Next message, or `None` once the transport is closed.
    async fn recv(&self) -> Option<Vec<u8>>;

    /// Close both directions. Idempotent.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

#[async_trait]
pub trait TransportFactory: Send + Sync + fmt::Debug {
    /// Start an outgoing negotiation and return the offer to signal.
    async fn create_offer(&self, session: SessionId, remote: PublicKey) -> TransportResult<Vec<u8>>;

    /// Answer an incoming offer. Returns the answer to signal back and the
    /// responder's end of the transport.
    async fn accept_offer(
        &self,
        session: SessionId,
        remote: PublicKey,
        offer: &[u8],
    ) -> TransportResult<(Vec<u8>, Arc<dyn Transport>)>;

    /// Finish an outgoing negotiation with the remote answer.
    async fn complete(&self, session: SessionId, answer: &[u8]) -> TransportResult<Arc<dyn Transport>>;

    /// Trickled connectivity candidate from the remote side.
    async fn add_candidate(&self, _session: SessionId, _candidate: &[u8]) -> TransportResult<()> {
        Ok(())
    }

    /// Release any half-open state for `session`.
    async fn abort(&self, session: SessionId);
}
