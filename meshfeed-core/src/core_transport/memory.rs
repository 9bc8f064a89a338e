//! In-process transports
//!
//! [`MemoryTransport::pair`] gives two connected ends backed by unbounded
//! channels. [`MemoryNetwork`] is a shared broker that lets several
//! [`MemoryTransportFactory`] instances (one per simulated peer) negotiate
//! pairs through the normal offer/answer flow, and lets tests make peers
//! unreachable.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, trace};

use super::{SessionId, Transport, TransportError, TransportFactory, TransportResult};
use crate::core_identity::PublicKey;

const OFFER_PREFIX: &[u8] = b"mem-offer:";
const ANSWER_PREFIX: &[u8] = b"mem-answer:";

#[derive(Debug)]
pub struct MemoryTransport {
    tx: std::sync::Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    /// Shared by both ends: closing either closes the pair
    closed: Arc<watch::Sender<bool>>,
}

impl MemoryTransport {
    pub fn pair() -> (Arc<MemoryTransport>, Arc<MemoryTransport>) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);
        let a = MemoryTransport {
            tx: std::sync::Mutex::new(Some(b_tx)),
            rx: Mutex::new(a_rx),
            closed: closed.clone(),
        };
        let b = MemoryTransport {
            tx: std::sync::Mutex::new(Some(a_tx)),
            rx: Mutex::new(b_rx),
            closed,
        };
        (Arc::new(a), Arc::new(b))
    }

    fn close_now(&self) {
        self.closed.send_replace(true);
        self.tx.lock().unwrap_or_else(|p| p.into_inner()).take();
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, data: Vec<u8>) -> TransportResult<()> {
        if *self.closed.borrow() {
            return Err(TransportError::Closed);
        }
        let tx = self.tx.lock().unwrap_or_else(|p| p.into_inner());
        match tx.as_ref() {
            Some(tx) => tx.send(data).map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        let closed = self.closed.subscribe();
        let mut rx = self.rx.lock().await;
        // Buffered data is still delivered after close.
        tokio::select! {
            biased;
            msg = rx.recv() => msg,
            _ = wait_closed(closed) => rx.try_recv().ok(),
        }
    }

    async fn close(&self) {
        self.close_now();
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

async fn wait_closed(mut closed: watch::Receiver<bool>) {
    while !*closed.borrow_and_update() {
        if closed.changed().await.is_err() {
            return;
        }
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.close_now();
    }
}

#[derive(Debug, Default)]
struct NetworkState {
    /// Responder-accepted sessions waiting for the initiator to complete
    parked: HashMap<SessionId, Arc<MemoryTransport>>,
    blocked: HashSet<PublicKey>,
}

/// Shared broker for in-process peers
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory for the peer identified by `local`.
    pub fn factory(&self, local: PublicKey) -> Arc<MemoryTransportFactory> {
        Arc::new(MemoryTransportFactory {
            network: self.clone(),
            local,
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Refuse every negotiation to or from `peer` until unblocked.
    pub async fn block(&self, peer: PublicKey) {
        self.state.lock().await.blocked.insert(peer);
    }

    pub async fn unblock(&self, peer: &PublicKey) {
        self.state.lock().await.blocked.remove(peer);
    }

    async fn is_blocked(&self, a: &PublicKey, b: &PublicKey) -> bool {
        let state = self.state.lock().await;
        state.blocked.contains(a) || state.blocked.contains(b)
    }
}

#[derive(Debug)]
pub struct MemoryTransportFactory {
    network: MemoryNetwork,
    local: PublicKey,
    /// Outgoing sessions not yet completed: session -> remote
    pending: Mutex<HashMap<SessionId, PublicKey>>,
}

fn tagged(prefix: &[u8], session: SessionId) -> Vec<u8> {
    let mut out = prefix.to_vec();
    out.extend_from_slice(session.as_bytes());
    out
}

fn check_tagged(prefix: &[u8], session: SessionId, payload: &[u8]) -> TransportResult<()> {
    if payload == tagged(prefix, session).as_slice() {
        Ok(())
    } else {
        Err(TransportError::InvalidPayload(format!(
            "payload does not match session {}",
            session
        )))
    }
}

#[async_trait]
impl TransportFactory for MemoryTransportFactory {
    async fn create_offer(&self, session: SessionId, remote: PublicKey) -> TransportResult<Vec<u8>> {
        if self.network.is_blocked(&self.local, &remote).await {
            return Err(TransportError::ConnectionRefused { remote });
        }
        self.pending.lock().await.insert(session, remote);
        trace!(%session, remote = %remote.short(), "Created offer");
        Ok(tagged(OFFER_PREFIX, session))
    }

    async fn accept_offer(
        &self,
        session: SessionId,
        remote: PublicKey,
        offer: &[u8],
    ) -> TransportResult<(Vec<u8>, Arc<dyn Transport>)> {
        check_tagged(OFFER_PREFIX, session, offer)?;
        if self.network.is_blocked(&self.local, &remote).await {
            return Err(TransportError::ConnectionRefused { remote });
        }
        let (ours, theirs) = MemoryTransport::pair();
        self.network.state.lock().await.parked.insert(session, theirs);
        debug!(%session, remote = %remote.short(), "Accepted offer");
        Ok((tagged(ANSWER_PREFIX, session), ours))
    }

    async fn complete(&self, session: SessionId, answer: &[u8]) -> TransportResult<Arc<dyn Transport>> {
        let remote = self
            .pending
            .lock()
            .await
            .remove(&session)
            .ok_or(TransportError::UnknownSession(session))?;
        check_tagged(ANSWER_PREFIX, session, answer)?;

        let mut state = self.network.state.lock().await;
        let transport = state
            .parked
            .remove(&session)
            .ok_or(TransportError::UnknownSession(session))?;
        if state.blocked.contains(&self.local) || state.blocked.contains(&remote) {
            transport.close_now();
            return Err(TransportError::ConnectionRefused { remote });
        }
        debug!(%session, remote = %remote.short(), "Completed session");
        Ok(transport)
    }

    async fn abort(&self, session: SessionId) {
        self.pending.lock().await.remove(&session);
        if let Some(transport) = self.network.state.lock().await.parked.remove(&session) {
            transport.close_now();
        }
        trace!(%session, "Aborted session");
    }
}
