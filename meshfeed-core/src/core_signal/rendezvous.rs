/*
  MemoryRendezvous - in-process signaling server

  Behaves like a hosted rendezvous service:
    - Announce(topic)  : joins the topic; existing members receive the Announce
    - Lookup(topic)    : replies with one Announce per current member
    - Withdraw(topic)  : leaves the topic; members receive the Withdraw
    - Offer / Answer / Candidate : routed to `to` if it is connected
  A peer that disconnects is withdrawn from every topic.

  Test hooks: disconnect(peer), disconnect_all() and set_available(false)
  simulate service outages.
*/

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace, warn};

use super::{SignalConnection, SignalConnector, SignalError, SignalMessage, SignalResult};
use crate::core_identity::PublicKey;
use crate::core_runtime::AbortingJoinHandle;

const CONNECTION_BUFFER: usize = 256;

#[derive(Debug)]
struct PeerConn {
    generation: u64,
    tx: mpsc::Sender<String>,
    _task: AbortingJoinHandle<()>,
}

#[derive(Debug)]
struct RendezvousState {
    peers: HashMap<PublicKey, PeerConn>,
    topics: HashMap<PublicKey, BTreeSet<PublicKey>>,
    available: bool,
    next_generation: u64,
}

impl RendezvousState {
    fn deliver(&self, to: &PublicKey, message: &SignalMessage) {
        let Some(peer) = self.peers.get(to) else {
            trace!(to = %to.short(), "Dropping message for unknown peer");
            return;
        };
        match message.to_json() {
            Ok(json) => {
                if peer.tx.try_send(json).is_err() {
                    warn!(to = %to.short(), "Signal delivery failed, peer queue full or closed");
                }
            }
            Err(err) => warn!(error = %err, "Failed to encode signal message"),
        }
    }

    fn withdraw_everywhere(&mut self, peer: &PublicKey) {
        let mut emptied = Vec::new();
        let mut notices = Vec::new();
        for (topic, members) in self.topics.iter_mut() {
            if members.remove(peer) {
                notices.extend(members.iter().map(|m| (*m, *topic)));
            }
            if members.is_empty() {
                emptied.push(*topic);
            }
        }
        for topic in emptied {
            self.topics.remove(&topic);
        }
        for (member, topic) in notices {
            self.deliver(
                &member,
                &SignalMessage::Withdraw {
                    topic,
                    from: *peer,
                },
            );
        }
    }

    fn handle(&mut self, sender: PublicKey, message: SignalMessage) {
        if *message.from() != sender {
            warn!(peer = %sender.short(), "Dropping signal message with spoofed sender");
            return;
        }
        match &message {
            SignalMessage::Announce { topic, from } => {
                let members = self.topics.entry(*topic).or_default();
                if members.insert(*from) {
                    let others: Vec<_> = members.iter().filter(|m| *m != from).copied().collect();
                    debug!(topic = %topic.short(), peer = %from.short(), "Peer announced");
                    for other in others {
                        self.deliver(&other, &message);
                    }
                }
            }
            SignalMessage::Lookup { topic, from } => {
                let members: Vec<_> = self
                    .topics
                    .get(topic)
                    .map(|m| m.iter().filter(|m| *m != from).copied().collect())
                    .unwrap_or_default();
                for member in members {
                    self.deliver(
                        from,
                        &SignalMessage::Announce {
                            topic: *topic,
                            from: member,
                        },
                    );
                }
            }
            SignalMessage::Withdraw { topic, from } => {
                if let Some(members) = self.topics.get_mut(topic) {
                    if members.remove(from) {
                        let others: Vec<_> = members.iter().copied().collect();
                        if members.is_empty() {
                            self.topics.remove(topic);
                        }
                        for other in others {
                            self.deliver(&other, &message);
                        }
                    }
                }
            }
            SignalMessage::Offer { to, .. }
            | SignalMessage::Answer { to, .. }
            | SignalMessage::Candidate { to, .. } => {
                self.deliver(to, &message);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemoryRendezvous {
    state: Arc<Mutex<RendezvousState>>,
}

impl Default for MemoryRendezvous {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRendezvous {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RendezvousState {
                peers: HashMap::new(),
                topics: HashMap::new(),
                available: true,
                next_generation: 0,
            })),
        }
    }

    /// Refuse (false) or accept (true) new connections.
    pub async fn set_available(&self, available: bool) {
        self.state.lock().await.available = available;
    }

    /// Drop one peer's connection as if the service restarted under it.
    pub async fn disconnect(&self, peer: &PublicKey) {
        let mut state = self.state.lock().await;
        if state.peers.remove(peer).is_some() {
            state.withdraw_everywhere(peer);
            debug!(peer = %peer.short(), "Rendezvous dropped peer");
        }
    }

    pub async fn disconnect_all(&self) {
        let mut state = self.state.lock().await;
        state.peers.clear();
        state.topics.clear();
    }

    /// Peers currently announced on `topic`
    pub async fn members(&self, topic: &PublicKey) -> BTreeSet<PublicKey> {
        self.state
            .lock()
            .await
            .topics
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn is_connected(&self, peer: &PublicKey) -> bool {
        self.state.lock().await.peers.contains_key(peer)
    }

    async fn serve(
        state: Arc<Mutex<RendezvousState>>,
        peer: PublicKey,
        generation: u64,
        mut rx: mpsc::Receiver<String>,
    ) {
        while let Some(json) = rx.recv().await {
            match SignalMessage::from_json(&json) {
                Ok(message) => state.lock().await.handle(peer, message),
                Err(err) => warn!(peer = %peer.short(), error = %err, "Malformed signal message"),
            }
        }
        let mut state = state.lock().await;
        if state.peers.get(&peer).is_some_and(|p| p.generation == generation) {
            // Removing our own entry aborts this task at its next await;
            // nothing below awaits.
            state.withdraw_everywhere(&peer);
            state.peers.remove(&peer);
            debug!(peer = %peer.short(), "Peer left rendezvous");
        }
    }
}

#[async_trait]
impl SignalConnector for MemoryRendezvous {
    async fn connect(&self, local: PublicKey) -> SignalResult<SignalConnection> {
        let mut state = self.state.lock().await;
        if !state.available {
            return Err(SignalError::Unavailable);
        }
        let (out_tx, out_rx) = mpsc::channel(CONNECTION_BUFFER);
        let (in_tx, in_rx) = mpsc::channel(CONNECTION_BUFFER);
        let generation = state.next_generation;
        state.next_generation += 1;

        let task = tokio::spawn(Self::serve(self.state.clone(), local, generation, out_rx));
        if let Some(previous) = state.peers.insert(
            local,
            PeerConn {
                generation,
                tx: in_tx,
                _task: task.into(),
            },
        ) {
            debug!(peer = %local.short(), old = previous.generation, "Replacing rendezvous connection");
        }
        Ok(SignalConnection {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
