//! A live connection to one peer on one topic

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::TeleportConfig;
use crate::core_identity::PublicKey;
use crate::core_teleport::{Channel, Teleport, TeleportResult};
use crate::core_transport::{SessionId, Transport};

/// Lifecycle of an established connection. The negotiation phase is
/// tracked by the manager's slot state, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connected,
    Closing,
    Closed,
}

#[derive(Debug)]
pub struct Connection {
    topic: PublicKey,
    remote: PublicKey,
    session: SessionId,
    teleport: Teleport,
    closing: AtomicBool,
}

impl Connection {
    pub(crate) fn new(
        topic: PublicKey,
        remote: PublicKey,
        session: SessionId,
        transport: Arc<dyn Transport>,
        initiator: bool,
        config: TeleportConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            topic,
            remote,
            session,
            teleport: Teleport::new(transport, initiator, config),
            closing: AtomicBool::new(false),
        })
    }

    pub fn topic(&self) -> &PublicKey {
        &self.topic
    }

    pub fn remote(&self) -> &PublicKey {
        &self.remote
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// True on the side that sent the offer.
    pub fn is_initiator(&self) -> bool {
        self.teleport.is_initiator()
    }

    pub fn state(&self) -> ConnectionState {
        if self.teleport.is_closed() {
            ConnectionState::Closed
        } else if self.closing.load(Ordering::Acquire) {
            ConnectionState::Closing
        } else {
            ConnectionState::Connected
        }
    }

    pub fn open_channel(&self, name: &str) -> TeleportResult<Channel> {
        self.teleport.open_channel(name)
    }

    /// Next channel opened by the peer.
    pub async fn accept_channel(&self) -> Option<Channel> {
        self.teleport.accept().await
    }

    pub async fn closed(&self) {
        self.teleport.closed().await
    }

    pub fn close(&self) {
        self.closing.store(true, Ordering::Release);
        self.teleport.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_identity::Keypair;
    use crate::core_transport::MemoryTransport;
    use crate::test_utils::completes;

    #[tokio::test]
    async fn test_close_reaches_remote() {
        let topic = Keypair::derive("topic").public_key();
        let session = SessionId::new();
        let (a, b) = MemoryTransport::pair();
        let left = Connection::new(topic, Keypair::derive("b").public_key(), session, a, true, TeleportConfig::default());
        let right = Connection::new(topic, Keypair::derive("a").public_key(), session, b, false, TeleportConfig::default());
        assert_eq!(left.state(), ConnectionState::Connected);
        assert!(left.is_initiator());
        assert!(!right.is_initiator());

        left.close();
        completes(right.closed()).await;
        assert_eq!(right.state(), ConnectionState::Closed);
        assert_eq!(left.state(), ConnectionState::Closed);
    }
}
