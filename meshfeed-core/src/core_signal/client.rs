/*
  SignalClient

  Actor that keeps one connection to the rendezvous service alive and
  translates between the swarm and the signaling wire protocol.

  Commands in (SignalClient handle):
    - join(topic)       -> announce + lookup, remembered across reconnects
    - leave(topic)      -> withdraw, forgotten
    - lookup(topic)     -> ask again for the topic's members
    - offer(...)        -> route an offer, await the matching answer
    - answer / candidate / reject

  Events out (mpsc receiver returned by spawn):
    PeerDiscovered, PeerWithdrawn, Offer, Candidate, StateChanged,
    TopicDegraded

  Connection state machine:

    Connecting ──ok──► Connected ──lost──► Disconnected ──► Reconnecting
        │                  ▲                                     │
        └──fail──► Reconnecting ◄───────────── fail ─────────────┘
                           └────────────── ok ──► Connected
    close() from any state ──► Closed

  Reconnects follow an exponential backoff with full jitter. Once the
  backoff is exhausted every joined topic is reported degraded and retries
  continue at the cap. Every successful (re)connect re-announces and
  re-looks-up all joined topics.
*/

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::{
    SignalConnection, SignalConnector, SignalError, SignalEvent, SignalMessage, SignalResult,
    SignalState,
};
use crate::config::SignalingConfig;
use crate::core_identity::PublicKey;
use crate::core_runtime::{spawn_owned, AbortingJoinHandle, Backoff, Jitter};
use crate::core_transport::SessionId;

const COMMAND_BUFFER: usize = 256;

#[derive(Debug)]
enum ClientCommand {
    Join(PublicKey),
    Leave(PublicKey),
    Lookup(PublicKey),
    Offer {
        topic: PublicKey,
        to: PublicKey,
        session: SessionId,
        payload: Vec<u8>,
        reply: oneshot::Sender<SignalResult<Vec<u8>>>,
    },
    ForgetOffer(SessionId),
    Send(SignalMessage),
    Close,
}

enum Exit {
    Closed,
    Lost,
}

struct ClientActor {
    local: PublicKey,
    connector: Arc<dyn SignalConnector>,
    config: SignalingConfig,
    jitter: Arc<dyn Jitter>,
    commands: mpsc::Receiver<ClientCommand>,
    events: mpsc::UnboundedSender<SignalEvent>,
    state: watch::Sender<SignalState>,
    joined: BTreeSet<PublicKey>,
    pending: HashMap<SessionId, oneshot::Sender<SignalResult<Vec<u8>>>>,
    degraded: bool,
}

impl ClientActor {
    fn emit(&self, event: SignalEvent) {
        // Receiver gone means nobody is listening anymore.
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: SignalState) {
        if *self.state.borrow() != state {
            self.state.send_replace(state);
            self.emit(SignalEvent::StateChanged(state));
        }
    }

    async fn run(mut self) {
        let mut backoff = Backoff::new(self.config.backoff_policy());
        self.set_state(SignalState::Connecting);
        loop {
            match self.connector.connect(self.local).await {
                Ok(conn) => {
                    backoff.reset();
                    self.degraded = false;
                    self.set_state(SignalState::Connected);
                    info!(peer = %self.local.short(), topics = self.joined.len(), "Signaling connected");
                    match self.serve(conn).await {
                        Exit::Closed => break,
                        Exit::Lost => {
                            warn!(peer = %self.local.short(), "Signaling connection lost");
                            self.fail_pending();
                            self.set_state(SignalState::Disconnected);
                        }
                    }
                }
                Err(err) => {
                    debug!(peer = %self.local.short(), error = %err, attempt = backoff.attempt(), "Signaling connect failed");
                }
            }

            let delay = backoff.next_delay(self.jitter.as_ref());
            metrics::counter!("signal.reconnects").increment(1);
            if backoff.is_exhausted() && !self.degraded {
                self.degraded = true;
                warn!(peer = %self.local.short(), attempts = backoff.attempt(), "Signaling unreachable, topics degraded");
                for topic in self.joined.clone() {
                    self.emit(SignalEvent::TopicDegraded { topic });
                }
            }
            self.set_state(SignalState::Reconnecting);
            if let Exit::Closed = self.wait_offline(delay).await {
                break;
            }
        }
        self.commands.close();
        self.fail_pending();
        self.set_state(SignalState::Closed);
        debug!(peer = %self.local.short(), "Signal client closed");
    }

    /// Sleep out a backoff delay while still taking commands.
    async fn wait_offline(&mut self, delay: std::time::Duration) -> Exit {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return Exit::Lost,
                command = self.commands.recv() => match command {
                    None | Some(ClientCommand::Close) => return Exit::Closed,
                    Some(ClientCommand::Join(topic)) => { self.joined.insert(topic); }
                    Some(ClientCommand::Leave(topic)) => { self.joined.remove(&topic); }
                    Some(ClientCommand::Offer { reply, .. }) => {
                        let _ = reply.send(Err(SignalError::NotConnected));
                    }
                    Some(ClientCommand::ForgetOffer(session)) => { self.pending.remove(&session); }
                    Some(ClientCommand::Lookup(_)) | Some(ClientCommand::Send(_)) => {}
                },
            }
        }
    }

    async fn serve(&mut self, mut conn: SignalConnection) -> Exit {
        for topic in self.joined.clone() {
            let announce = SignalMessage::Announce {
                topic,
                from: self.local,
            };
            let lookup = SignalMessage::Lookup {
                topic,
                from: self.local,
            };
            if send(&conn, &announce).await.is_err() || send(&conn, &lookup).await.is_err() {
                return Exit::Lost;
            }
        }

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else { return Exit::Closed };
                    let outgoing = match command {
                        ClientCommand::Close => return Exit::Closed,
                        ClientCommand::Join(topic) => {
                            self.joined.insert(topic);
                            vec![
                                SignalMessage::Announce { topic, from: self.local },
                                SignalMessage::Lookup { topic, from: self.local },
                            ]
                        }
                        ClientCommand::Leave(topic) => {
                            self.joined.remove(&topic);
                            vec![SignalMessage::Withdraw { topic, from: self.local }]
                        }
                        ClientCommand::Lookup(topic) => {
                            vec![SignalMessage::Lookup { topic, from: self.local }]
                        }
                        ClientCommand::Offer { topic, to, session, payload, reply } => {
                            self.pending.insert(session, reply);
                            vec![SignalMessage::Offer { topic, from: self.local, to, session, payload }]
                        }
                        ClientCommand::ForgetOffer(session) => {
                            self.pending.remove(&session);
                            Vec::new()
                        }
                        ClientCommand::Send(message) => vec![message],
                    };
                    for message in &outgoing {
                        if send(&conn, message).await.is_err() {
                            return Exit::Lost;
                        }
                    }
                }
                incoming = conn.inbound.recv() => {
                    let Some(json) = incoming else { return Exit::Lost };
                    match SignalMessage::from_json(&json) {
                        Ok(message) => self.handle_incoming(message),
                        Err(err) => warn!(error = %err, "Dropping malformed signal message"),
                    }
                }
            }
        }
    }

    fn handle_incoming(&mut self, message: SignalMessage) {
        if *message.from() == self.local {
            return;
        }
        match message {
            SignalMessage::Announce { topic, from } => {
                if self.joined.contains(&topic) {
                    self.emit(SignalEvent::PeerDiscovered { topic, peer: from });
                }
            }
            SignalMessage::Withdraw { topic, from } => {
                self.emit(SignalEvent::PeerWithdrawn { topic, peer: from });
            }
            SignalMessage::Offer {
                topic,
                from,
                to,
                session,
                payload,
            } if to == self.local => {
                self.emit(SignalEvent::Offer {
                    topic,
                    from,
                    session,
                    payload,
                });
            }
            SignalMessage::Answer {
                session, payload, ..
            } => match self.pending.remove(&session) {
                Some(reply) => {
                    let result = if payload.is_empty() {
                        Err(SignalError::Rejected { session })
                    } else {
                        Ok(payload)
                    };
                    let _ = reply.send(result);
                }
                None => debug!(%session, "Answer for unknown session"),
            },
            SignalMessage::Candidate {
                topic,
                from,
                session,
                payload,
                ..
            } => {
                self.emit(SignalEvent::Candidate {
                    topic,
                    from,
                    session,
                    payload,
                });
            }
            SignalMessage::Lookup { .. } | SignalMessage::Offer { .. } => {}
        }
    }

    fn fail_pending(&mut self) {
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(SignalError::Disconnected));
        }
    }
}

async fn send(conn: &SignalConnection, message: &SignalMessage) -> SignalResult<()> {
    let json = message.to_json()?;
    conn.outbound
        .send(json)
        .await
        .map_err(|_| SignalError::Disconnected)
}

/// Handle to the signaling actor. Cheap to clone; the actor stops when the
/// last handle is dropped.
#[derive(Debug, Clone)]
pub struct SignalClient {
    local: PublicKey,
    commands: mpsc::Sender<ClientCommand>,
    state: watch::Receiver<SignalState>,
    request_timeout: std::time::Duration,
    _task: Arc<AbortingJoinHandle<()>>,
}

impl SignalClient {
    pub fn spawn(
        local: PublicKey,
        connector: Arc<dyn SignalConnector>,
        config: SignalingConfig,
        jitter: Arc<dyn Jitter>,
    ) -> (Self, mpsc::UnboundedReceiver<SignalEvent>) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SignalState::Connecting);
        let request_timeout = config.request_timeout;

        let actor = ClientActor {
            local,
            connector,
            config,
            jitter,
            commands: commands_rx,
            events: events_tx,
            state: state_tx,
            joined: BTreeSet::new(),
            pending: HashMap::new(),
            degraded: false,
        };
        let task = spawn_owned(actor.run());

        (
            Self {
                local,
                commands: commands_tx,
                state: state_rx,
                request_timeout,
                _task: Arc::new(task),
            },
            events_rx,
        )
    }

    pub fn local(&self) -> &PublicKey {
        &self.local
    }

    pub fn state(&self) -> SignalState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SignalState> {
        self.state.clone()
    }

    async fn command(&self, command: ClientCommand) -> SignalResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SignalError::Closed)
    }

    /// Announce on `topic` and look up its members; kept across reconnects.
    pub async fn join(&self, topic: PublicKey) -> SignalResult<()> {
        self.command(ClientCommand::Join(topic)).await
    }

    pub async fn leave(&self, topic: PublicKey) -> SignalResult<()> {
        self.command(ClientCommand::Leave(topic)).await
    }

    pub async fn lookup(&self, topic: PublicKey) -> SignalResult<()> {
        self.command(ClientCommand::Lookup(topic)).await
    }

    /// Send an offer and wait for the answer payload.
    pub async fn offer(
        &self,
        topic: PublicKey,
        to: PublicKey,
        session: SessionId,
        payload: Vec<u8>,
    ) -> SignalResult<Vec<u8>> {
        let (reply, rx) = oneshot::channel();
        self.command(ClientCommand::Offer {
            topic,
            to,
            session,
            payload,
            reply,
        })
        .await?;
        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SignalError::Closed),
            Err(_) => {
                metrics::counter!("signal.requests.timed_out").increment(1);
                let _ = self.commands.try_send(ClientCommand::ForgetOffer(session));
                Err(SignalError::Timeout { session })
            }
        }
    }

    pub async fn answer(
        &self,
        topic: PublicKey,
        to: PublicKey,
        session: SessionId,
        payload: Vec<u8>,
    ) -> SignalResult<()> {
        self.command(ClientCommand::Send(SignalMessage::Answer {
            topic,
            from: self.local,
            to,
            session,
            payload,
        }))
        .await
    }

    /// Decline an offer so the initiator fails fast.
    pub async fn reject(&self, topic: PublicKey, to: PublicKey, session: SessionId) -> SignalResult<()> {
        self.answer(topic, to, session, Vec::new()).await
    }

    pub async fn candidate(
        &self,
        topic: PublicKey,
        to: PublicKey,
        session: SessionId,
        payload: Vec<u8>,
    ) -> SignalResult<()> {
        self.command(ClientCommand::Send(SignalMessage::Candidate {
            topic,
            from: self.local,
            to,
            session,
            payload,
        }))
        .await
    }

    pub async fn close(&self) {
        let _ = self.command(ClientCommand::Close).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_identity::Keypair;
    use crate::core_runtime::NoJitter;
    use crate::core_signal::MemoryRendezvous;
    use crate::test_utils::{completes, next_matching};
    use std::time::Duration;

    fn config() -> SignalingConfig {
        SignalingConfig {
            request_timeout: Duration::from_secs(2),
            reconnect_base: Duration::from_millis(50),
            reconnect_cap: Duration::from_millis(400),
            max_reconnect_attempts: 3,
        }
    }

    fn client(rv: &MemoryRendezvous, label: &str) -> (SignalClient, mpsc::UnboundedReceiver<SignalEvent>) {
        SignalClient::spawn(
            Keypair::derive(label).public_key(),
            Arc::new(rv.clone()),
            config(),
            Arc::new(NoJitter),
        )
    }

    async fn wait_state(client: &SignalClient, want: SignalState) {
        let mut rx = client.watch_state();
        completes(rx.wait_for(|s| *s == want)).await.unwrap();
    }

    #[tokio::test]
    async fn test_join_discovers_peers_both_ways() {
        let rv = MemoryRendezvous::new();
        let topic = Keypair::derive("topic").public_key();
        let (a, mut a_events) = client(&rv, "a");
        let (b, mut b_events) = client(&rv, "b");

        a.join(topic).await.unwrap();
        wait_state(&a, SignalState::Connected).await;
        completes(async {
            while !rv.members(&topic).await.contains(a.local()) {
                tokio::task::yield_now().await;
            }
        })
        .await;
        b.join(topic).await.unwrap();

        let found = next_matching(&mut b_events, |e| matches!(e, SignalEvent::PeerDiscovered { .. })).await;
        assert_eq!(found, SignalEvent::PeerDiscovered { topic, peer: *a.local() });
        let found = next_matching(&mut a_events, |e| matches!(e, SignalEvent::PeerDiscovered { .. })).await;
        assert_eq!(found, SignalEvent::PeerDiscovered { topic, peer: *b.local() });
    }

    #[tokio::test]
    async fn test_offer_answer_roundtrip_and_rejection() {
        let rv = MemoryRendezvous::new();
        let topic = Keypair::derive("topic").public_key();
        let (a, _a_events) = client(&rv, "a");
        let (b, mut b_events) = client(&rv, "b");
        wait_state(&a, SignalState::Connected).await;
        wait_state(&b, SignalState::Connected).await;

        let responder = b.clone();
        let answer_task = tokio::spawn(async move {
            for reply in [b"answer".to_vec(), Vec::new()] {
                let SignalEvent::Offer { from, session, payload, topic } =
                    next_matching(&mut b_events, |e| matches!(e, SignalEvent::Offer { .. })).await
                else {
                    unreachable!()
                };
                assert_eq!(payload, b"offer");
                responder.answer(topic, from, session, reply).await.unwrap();
            }
        });

        let answer = a
            .offer(topic, *b.local(), SessionId::new(), b"offer".to_vec())
            .await
            .unwrap();
        assert_eq!(answer, b"answer");

        let session = SessionId::new();
        let rejected = a.offer(topic, *b.local(), session, b"offer".to_vec()).await;
        assert_eq!(rejected, Err(SignalError::Rejected { session }));
        answer_task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_offer_times_out_without_answer() {
        let rv = MemoryRendezvous::new();
        let topic = Keypair::derive("topic").public_key();
        let (a, _events) = client(&rv, "a");
        wait_state(&a, SignalState::Connected).await;
        let session = SessionId::new();
        let result = a
            .offer(topic, Keypair::derive("nobody").public_key(), session, vec![1])
            .await;
        assert_eq!(result, Err(SignalError::Timeout { session }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_reannounces_joined_topics() {
        let rv = MemoryRendezvous::new();
        let topic = Keypair::derive("topic").public_key();
        let (a, _events) = client(&rv, "a");
        a.join(topic).await.unwrap();
        wait_state(&a, SignalState::Connected).await;

        rv.disconnect(a.local()).await;
        wait_state(&a, SignalState::Reconnecting).await;
        wait_state(&a, SignalState::Connected).await;
        completes(async {
            while !rv.members(&topic).await.contains(a.local()) {
                tokio::task::yield_now().await;
            }
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_backoff_degrades_topics_then_recovers() {
        let rv = MemoryRendezvous::new();
        rv.set_available(false).await;
        let topic = Keypair::derive("topic").public_key();
        let (a, mut events) = client(&rv, "a");
        a.join(topic).await.unwrap();

        let degraded = next_matching(&mut events, |e| matches!(e, SignalEvent::TopicDegraded { .. })).await;
        assert_eq!(degraded, SignalEvent::TopicDegraded { topic });
        assert_eq!(a.state(), SignalState::Reconnecting);

        rv.set_available(true).await;
        wait_state(&a, SignalState::Connected).await;
        completes(async {
            while !rv.members(&topic).await.contains(a.local()) {
                tokio::task::yield_now().await;
            }
        })
        .await;
    }

    #[tokio::test]
    async fn test_close_stops_actor() {
        let rv = MemoryRendezvous::new();
        let (a, _events) = client(&rv, "a");
        a.close().await;
        wait_state(&a, SignalState::Closed).await;
        assert_eq!(a.join(Keypair::derive("t").public_key()).await, Err(SignalError::Closed));
    }
}
