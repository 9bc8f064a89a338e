/*
  NetworkManager

  One actor per node. It owns every topic the node has joined and, per
  (topic, peer), a slot that walks this state machine:

        ┌──────── remote disconnect ────────────┐
        ▼                                       │
      Idle ──attempt──► Connecting ──ok──► Connected
       ▲  ▲                 │
       │  └──── failure ────┘ (retry after backoff)
       │                    │
       │           max_retries reached
       │                    ▼
       └── cool-down ── Unreachable

  leave_topic() drops every slot of the topic: in-flight attempts are
  aborted (their half-open sessions released through the factory) and
  live connections are closed.

  Inputs, all handled on one task:
    - commands from NetworkManager handles
    - SignalEvents (discovery, offers, candidates, degradation)
    - outcomes of attempt tasks and connection watchers
    - the reconcile tick

  Only the smaller key dials. The larger key dials too once a peer has
  been wanted for `passive_grace` without a connection, which covers
  one-sided discovery. Crossing offers are settled on arrival: a node
  that is itself dialing the sender keeps its attempt if its key is the
  smaller one, and otherwise abandons it in favour of the incoming offer.
*/

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::{Connection, NetworkError, NetworkEvent, NetworkResult, SlotState, Topology};
use crate::config::{SwarmConfig, TeleportConfig};
use crate::core_identity::PublicKey;
use crate::core_runtime::{spawn_owned, AbortingJoinHandle, Backoff, BackoffPolicy, Clock, Jitter};
use crate::core_signal::{SignalClient, SignalEvent, SignalState};
use crate::core_transport::{SessionId, Transport, TransportFactory};
use crate::metrics::Timer;

const COMMAND_BUFFER: usize = 256;
const EVENT_CAPACITY: usize = 256;

#[derive(Debug)]
enum ManagerCommand {
    Join {
        topic: PublicKey,
        topology: Arc<dyn Topology>,
        reply: oneshot::Sender<NetworkResult<()>>,
    },
    Leave {
        topic: PublicKey,
        reply: oneshot::Sender<NetworkResult<()>>,
    },
    SlotState {
        topic: PublicKey,
        peer: PublicKey,
        reply: oneshot::Sender<Option<SlotState>>,
    },
    Connections {
        topic: PublicKey,
        reply: oneshot::Sender<Vec<Arc<Connection>>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

enum Internal {
    AttemptDone {
        topic: PublicKey,
        peer: PublicKey,
        session: SessionId,
        initiator: bool,
        result: NetworkResult<Arc<dyn Transport>>,
    },
    ConnectionLost {
        topic: PublicKey,
        peer: PublicKey,
        session: SessionId,
    },
}

struct Attempt {
    session: SessionId,
    initiator: bool,
    _task: AbortingJoinHandle<()>,
}

struct Live {
    connection: Arc<Connection>,
    _watcher: AbortingJoinHandle<()>,
}

struct Slot {
    state: SlotState,
    backoff: Backoff,
    retry_at: Option<Instant>,
    unreachable_until: Option<Instant>,
    wanted_since: Instant,
    attempt: Option<Attempt>,
    live: Option<Live>,
}

impl Slot {
    fn new(policy: BackoffPolicy, now: Instant) -> Self {
        Self {
            state: SlotState::Idle,
            backoff: Backoff::new(policy),
            retry_at: None,
            unreachable_until: None,
            wanted_since: now,
            attempt: None,
            live: None,
        }
    }
}

struct TopicState {
    topology: Arc<dyn Topology>,
    discovered: BTreeSet<PublicKey>,
    slots: BTreeMap<PublicKey, Slot>,
    degraded: bool,
}

impl TopicState {
    fn connected(&self) -> BTreeSet<PublicKey> {
        self.slots
            .iter()
            .filter(|(_, slot)| slot.state == SlotState::Connected)
            .map(|(peer, _)| *peer)
            .collect()
    }
}

/// What to do with an incoming offer, decided before any I/O
enum OfferDecision {
    Reject(&'static str),
    Accept { abandon: Option<SessionId> },
}

struct ManagerActor {
    local: PublicKey,
    signal: SignalClient,
    factory: Arc<dyn TransportFactory>,
    config: SwarmConfig,
    teleport: TeleportConfig,
    clock: Arc<dyn Clock>,
    jitter: Arc<dyn Jitter>,
    topics: HashMap<PublicKey, TopicState>,
    events: broadcast::Sender<NetworkEvent>,
    internal: mpsc::UnboundedSender<Internal>,
}

impl ManagerActor {
    fn emit(&self, event: NetworkEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<ManagerCommand>,
        mut signal_events: mpsc::UnboundedReceiver<SignalEvent>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    None => break,
                    Some(ManagerCommand::Shutdown { reply }) => {
                        self.leave_all().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => self.handle_command(command).await,
                },
                Some(event) = signal_events.recv() => self.handle_signal(event).await,
                Some(message) = internal.recv() => self.handle_internal(message).await,
                _ = tick.tick() => {
                    let topics: Vec<PublicKey> = self.topics.keys().copied().collect();
                    for topic in topics {
                        self.reconcile(topic).await;
                    }
                }
            }
        }
        self.leave_all().await;
    }

    async fn handle_command(&mut self, command: ManagerCommand) {
        match command {
            ManagerCommand::Join {
                topic,
                topology,
                reply,
            } => {
                let result = self.join(topic, topology).await;
                let _ = reply.send(result);
            }
            ManagerCommand::Leave { topic, reply } => {
                let result = self.leave(topic).await;
                let _ = reply.send(result);
            }
            ManagerCommand::SlotState { topic, peer, reply } => {
                let state = self
                    .topics
                    .get(&topic)
                    .and_then(|t| t.slots.get(&peer))
                    .map(|slot| slot.state);
                let _ = reply.send(state);
            }
            ManagerCommand::Connections { topic, reply } => {
                let connections = self
                    .topics
                    .get(&topic)
                    .map(|t| {
                        t.slots
                            .values()
                            .filter_map(|slot| slot.live.as_ref())
                            .map(|live| live.connection.clone())
                            .collect()
                    })
                    .unwrap_or_default();
                let _ = reply.send(connections);
            }
            ManagerCommand::Shutdown { .. } => {}
        }
    }

    async fn join(&mut self, topic: PublicKey, topology: Arc<dyn Topology>) -> NetworkResult<()> {
        if let Some(existing) = self.topics.get_mut(&topic) {
            existing.topology = topology;
        } else {
            self.signal.join(topic).await?;
            self.topics.insert(
                topic,
                TopicState {
                    topology,
                    discovered: BTreeSet::new(),
                    slots: BTreeMap::new(),
                    degraded: false,
                },
            );
            info!(topic = %topic.short(), "Joined topic");
        }
        self.reconcile(topic).await;
        Ok(())
    }

    async fn leave(&mut self, topic: PublicKey) -> NetworkResult<()> {
        let state = self
            .topics
            .remove(&topic)
            .ok_or(NetworkError::TopicNotJoined { topic })?;
        for (peer, slot) in state.slots {
            self.tear_down(topic, peer, slot).await;
        }
        if let Err(err) = self.signal.leave(topic).await {
            debug!(topic = %topic.short(), error = %err, "Withdraw not sent");
        }
        info!(topic = %topic.short(), "Left topic");
        Ok(())
    }

    async fn leave_all(&mut self) {
        let topics: Vec<PublicKey> = self.topics.keys().copied().collect();
        for topic in topics {
            let _ = self.leave(topic).await;
        }
    }

    /// Release everything a slot holds.
    async fn tear_down(&self, topic: PublicKey, peer: PublicKey, slot: Slot) {
        if let Some(attempt) = slot.attempt {
            let session = attempt.session;
            drop(attempt);
            self.factory.abort(session).await;
            trace!(topic = %topic.short(), peer = %peer.short(), %session, "Aborted attempt");
        }
        if let Some(live) = slot.live {
            let session = live.connection.session();
            live.connection.close();
            metrics::gauge!("swarm.connections.open").decrement(1.0);
            self.emit(NetworkEvent::ConnectionClosed {
                topic,
                peer,
                session,
            });
            debug!(topic = %topic.short(), peer = %peer.short(), "Closed connection");
        }
    }

    async fn handle_signal(&mut self, event: SignalEvent) {
        match event {
            SignalEvent::PeerDiscovered { topic, peer } => {
                if peer == self.local {
                    return;
                }
                if let Some(state) = self.topics.get_mut(&topic) {
                    if state.discovered.insert(peer) {
                        debug!(topic = %topic.short(), peer = %peer.short(), "Discovered peer");
                        self.reconcile(topic).await;
                    }
                }
            }
            SignalEvent::PeerWithdrawn { topic, peer } => {
                if let Some(state) = self.topics.get_mut(&topic) {
                    if state.discovered.remove(&peer) {
                        self.reconcile(topic).await;
                    }
                }
            }
            SignalEvent::Offer {
                topic,
                from,
                session,
                payload,
            } => self.handle_offer(topic, from, session, payload).await,
            SignalEvent::Candidate {
                session, payload, ..
            } => {
                if let Err(err) = self.factory.add_candidate(session, &payload).await {
                    debug!(%session, error = %err, "Candidate ignored");
                }
            }
            SignalEvent::TopicDegraded { topic } => {
                if let Some(state) = self.topics.get_mut(&topic) {
                    if !state.degraded {
                        state.degraded = true;
                        warn!(topic = %topic.short(), "Topic degraded, keeping existing connections");
                        self.emit(NetworkEvent::TopicDegraded { topic });
                    }
                }
            }
            SignalEvent::StateChanged(SignalState::Connected) => {
                for state in self.topics.values_mut() {
                    state.degraded = false;
                }
            }
            SignalEvent::StateChanged(_) => {}
        }
    }

    fn decide_offer(&mut self, topic: PublicKey, from: PublicKey) -> OfferDecision {
        let now = self.clock.now();
        let policy = self.config.retry_policy();
        let local = self.local;
        let Some(state) = self.topics.get_mut(&topic) else {
            return OfferDecision::Reject("topic not joined");
        };

        let mut candidates = state.discovered.clone();
        candidates.insert(from);
        if !state
            .topology
            .desired(&local, &candidates, &state.connected())
            .contains(&from)
        {
            return OfferDecision::Reject("peer not wanted by topology");
        }
        state.discovered.insert(from);

        let slot = state
            .slots
            .entry(from)
            .or_insert_with(|| Slot::new(policy, now));
        match (slot.state, slot.attempt.as_ref()) {
            (SlotState::Connected, _) => OfferDecision::Reject("already connected"),
            (SlotState::Connecting, Some(attempt)) if attempt.initiator => {
                if local < from {
                    OfferDecision::Reject("crossing offer, keeping ours")
                } else {
                    OfferDecision::Accept {
                        abandon: Some(attempt.session),
                    }
                }
            }
            (SlotState::Connecting, _) => OfferDecision::Reject("already accepting"),
            (SlotState::Idle, _) | (SlotState::Unreachable, _) => {
                OfferDecision::Accept { abandon: None }
            }
        }
    }

    async fn handle_offer(&mut self, topic: PublicKey, from: PublicKey, session: SessionId, offer: Vec<u8>) {
        match self.decide_offer(topic, from) {
            OfferDecision::Reject(reason) => {
                debug!(topic = %topic.short(), peer = %from.short(), %session, reason, "Rejecting offer");
                if let Err(err) = self.signal.reject(topic, from, session).await {
                    debug!(%session, error = %err, "Reject not sent");
                }
            }
            OfferDecision::Accept { abandon } => {
                if let Some(ours) = abandon {
                    debug!(topic = %topic.short(), peer = %from.short(), "Crossing offer, yielding to remote");
                    if let Some(slot) = self.slot_mut(topic, from) {
                        slot.attempt = None;
                    }
                    self.factory.abort(ours).await;
                }
                let task = self.spawn_accept(topic, from, session, offer);
                if let Some(slot) = self.slot_mut(topic, from) {
                    slot.state = SlotState::Connecting;
                    slot.attempt = Some(Attempt {
                        session,
                        initiator: false,
                        _task: task,
                    });
                }
            }
        }
    }

    fn slot_mut(&mut self, topic: PublicKey, peer: PublicKey) -> Option<&mut Slot> {
        self.topics.get_mut(&topic)?.slots.get_mut(&peer)
    }

    fn spawn_accept(
        &self,
        topic: PublicKey,
        peer: PublicKey,
        session: SessionId,
        offer: Vec<u8>,
    ) -> AbortingJoinHandle<()> {
        let signal = self.signal.clone();
        let factory = self.factory.clone();
        let internal = self.internal.clone();
        let limit = self.config.connect_timeout;

        spawn_owned(async move {
            let negotiate = async {
                let (answer, transport) = match factory.accept_offer(session, peer, &offer).await {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        let _ = signal.reject(topic, peer, session).await;
                        return Err(NetworkError::from(err));
                    }
                };
                if let Err(err) = signal.answer(topic, peer, session, answer).await {
                    transport.close().await;
                    return Err(err.into());
                }
                Ok::<_, NetworkError>(transport)
            };
            let result = match tokio::time::timeout(limit, negotiate).await {
                Ok(result) => result,
                Err(_) => Err(NetworkError::Timeout { peer }),
            };
            if result.is_err() {
                factory.abort(session).await;
            }
            let _ = internal.send(Internal::AttemptDone {
                topic,
                peer,
                session,
                initiator: false,
                result,
            });
        })
    }

    fn spawn_dial(&self, topic: PublicKey, peer: PublicKey, session: SessionId) -> AbortingJoinHandle<()> {
        let signal = self.signal.clone();
        let factory = self.factory.clone();
        let internal = self.internal.clone();
        let limit = self.config.connect_timeout;

        spawn_owned(async move {
            let timer = Timer::new("swarm.connect.duration_ms");
            let negotiate = async {
                let offer = factory.create_offer(session, peer).await?;
                let answer = signal.offer(topic, peer, session, offer).await?;
                Ok::<_, NetworkError>(factory.complete(session, &answer).await?)
            };
            let result = match tokio::time::timeout(limit, negotiate).await {
                Ok(result) => result,
                Err(_) => Err(NetworkError::Timeout { peer }),
            };
            match &result {
                Ok(_) => timer.stop(),
                Err(_) => factory.abort(session).await,
            }
            let _ = internal.send(Internal::AttemptDone {
                topic,
                peer,
                session,
                initiator: true,
                result,
            });
        })
    }

    async fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::AttemptDone {
                topic,
                peer,
                session,
                initiator,
                result,
            } => self.attempt_done(topic, peer, session, initiator, result).await,
            Internal::ConnectionLost {
                topic,
                peer,
                session,
            } => {
                let now = self.clock.now();
                let Some(slot) = self.slot_mut(topic, peer) else {
                    return;
                };
                if slot.live.as_ref().map(|l| l.connection.session()) != Some(session) {
                    return;
                }
                slot.live = None;
                slot.state = SlotState::Idle;
                slot.retry_at = None;
                slot.wanted_since = now;
                metrics::gauge!("swarm.connections.open").decrement(1.0);
                info!(topic = %topic.short(), peer = %peer.short(), "Connection lost");
                self.emit(NetworkEvent::ConnectionClosed {
                    topic,
                    peer,
                    session,
                });
                self.reconcile(topic).await;
            }
        }
    }

    async fn attempt_done(
        &mut self,
        topic: PublicKey,
        peer: PublicKey,
        session: SessionId,
        initiator: bool,
        result: NetworkResult<Arc<dyn Transport>>,
    ) {
        let now = self.clock.now();
        let cooldown = self.config.unreachable_cooldown;
        let teleport = self.teleport.clone();
        let internal = self.internal.clone();
        let jitter = self.jitter.clone();

        let current = self
            .slot_mut(topic, peer)
            .is_some_and(|slot| slot.attempt.as_ref().map(|a| a.session) == Some(session));
        if !current {
            // Superseded by leave, tie-break or a newer attempt.
            if let Ok(transport) = result {
                transport.close().await;
            }
            return;
        }
        let Some(slot) = self.slot_mut(topic, peer) else {
            return;
        };
        slot.attempt = None;

        match result {
            Ok(transport) => {
                let connection = Connection::new(topic, peer, session, transport, initiator, teleport);
                let watched = connection.clone();
                let watcher = spawn_owned(async move {
                    watched.closed().await;
                    let _ = internal.send(Internal::ConnectionLost {
                        topic,
                        peer,
                        session,
                    });
                });
                slot.state = SlotState::Connected;
                slot.backoff.reset();
                slot.retry_at = None;
                slot.unreachable_until = None;
                slot.live = Some(Live {
                    connection: connection.clone(),
                    _watcher: watcher,
                });
                metrics::counter!("swarm.connections.established").increment(1);
                metrics::gauge!("swarm.connections.open").increment(1.0);
                info!(topic = %topic.short(), peer = %peer.short(), initiator, "Connection opened");
                self.emit(NetworkEvent::ConnectionOpened(connection));
            }
            Err(err) => {
                metrics::counter!("swarm.connections.failed").increment(1);
                let delay = slot.backoff.next_delay(jitter.as_ref());
                if slot.backoff.is_exhausted() {
                    slot.state = SlotState::Unreachable;
                    slot.retry_at = None;
                    slot.unreachable_until = Some(now + cooldown);
                    warn!(topic = %topic.short(), peer = %peer.short(), error = %err, attempts = slot.backoff.attempt(), "Peer unreachable");
                    metrics::counter!("swarm.peers.unreachable").increment(1);
                    self.emit(NetworkEvent::PeerUnreachable { topic, peer });
                } else {
                    slot.state = SlotState::Idle;
                    slot.retry_at = Some(now + delay);
                    debug!(topic = %topic.short(), peer = %peer.short(), error = %err, ?delay, "Connection attempt failed");
                }
            }
        }
    }

    /// Bring the topic's slots in line with what its topology wants.
    async fn reconcile(&mut self, topic: PublicKey) {
        let now = self.clock.now();
        let local = self.local;
        let grace = self.config.passive_grace;
        let policy = self.config.retry_policy();
        let Some(state) = self.topics.get_mut(&topic) else {
            return;
        };

        let desired = state
            .topology
            .desired(&local, &state.discovered, &state.connected());

        let unwanted: Vec<PublicKey> = state
            .slots
            .iter()
            .filter(|(peer, slot)| {
                // An accepted offer means the remote wants this connection.
                let accepting = slot.attempt.as_ref().is_some_and(|a| !a.initiator);
                !desired.contains(peer) && !accepting
            })
            .map(|(peer, _)| *peer)
            .collect();
        let mut dropped = Vec::with_capacity(unwanted.len());
        for peer in unwanted {
            if let Some(slot) = state.slots.remove(&peer) {
                dropped.push((peer, slot));
            }
        }

        let mut dial = Vec::new();
        for peer in desired {
            let slot = state
                .slots
                .entry(peer)
                .or_insert_with(|| Slot::new(policy, now));
            if slot.state == SlotState::Unreachable {
                match slot.unreachable_until {
                    Some(until) if now < until => continue,
                    _ => {
                        debug!(topic = %topic.short(), peer = %peer.short(), "Cool-down over");
                        slot.state = SlotState::Idle;
                        slot.unreachable_until = None;
                        slot.wanted_since = now;
                        slot.backoff.reset();
                    }
                }
            }
            if slot.state != SlotState::Idle {
                continue;
            }
            if slot.retry_at.is_some_and(|at| now < at) {
                continue;
            }
            if local < peer || now >= slot.wanted_since + grace {
                dial.push(peer);
            }
        }

        for (peer, slot) in dropped {
            self.tear_down(topic, peer, slot).await;
        }
        for peer in dial {
            let session = SessionId::new();
            let task = self.spawn_dial(topic, peer, session);
            if let Some(slot) = self.slot_mut(topic, peer) {
                slot.state = SlotState::Connecting;
                slot.attempt = Some(Attempt {
                    session,
                    initiator: true,
                    _task: task,
                });
            }
            metrics::counter!("swarm.connections.attempted").increment(1);
            trace!(topic = %topic.short(), peer = %peer.short(), %session, "Dialing");
        }
    }
}

/// Handle to the network manager actor. Cheap to clone.
#[derive(Debug, Clone)]
pub struct NetworkManager {
    local: PublicKey,
    commands: mpsc::Sender<ManagerCommand>,
    events: broadcast::Sender<NetworkEvent>,
    _task: Arc<AbortingJoinHandle<()>>,
}

impl NetworkManager {
    /// Start the manager. It consumes the signal client's event stream.
    pub fn spawn(
        signal: SignalClient,
        signal_events: mpsc::UnboundedReceiver<SignalEvent>,
        factory: Arc<dyn TransportFactory>,
        config: SwarmConfig,
        teleport: TeleportConfig,
        clock: Arc<dyn Clock>,
        jitter: Arc<dyn Jitter>,
    ) -> Self {
        let local = *signal.local();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let actor = ManagerActor {
            local,
            signal,
            factory,
            config,
            teleport,
            clock,
            jitter,
            topics: HashMap::new(),
            events: events.clone(),
            internal: internal_tx,
        };
        let task = spawn_owned(actor.run(commands_rx, signal_events, internal_rx));

        Self {
            local,
            commands: commands_tx,
            events,
            _task: Arc::new(task),
        }
    }

    pub fn local(&self) -> &PublicKey {
        &self.local
    }

    /// Subscribe to connection events. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events.subscribe()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand,
    ) -> NetworkResult<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| NetworkError::Stopped)?;
        rx.await.map_err(|_| NetworkError::Stopped)
    }

    pub async fn join_topic(&self, topic: PublicKey, topology: Arc<dyn Topology>) -> NetworkResult<()> {
        self.request(|reply| ManagerCommand::Join {
            topic,
            topology,
            reply,
        })
        .await?
    }

    pub async fn leave_topic(&self, topic: PublicKey) -> NetworkResult<()> {
        self.request(|reply| ManagerCommand::Leave { topic, reply }).await?
    }

    pub async fn slot_state(&self, topic: PublicKey, peer: PublicKey) -> NetworkResult<Option<SlotState>> {
        self.request(|reply| ManagerCommand::SlotState { topic, peer, reply })
            .await
    }

    pub async fn connections(&self, topic: PublicKey) -> NetworkResult<Vec<Arc<Connection>>> {
        self.request(|reply| ManagerCommand::Connections { topic, reply })
            .await
    }

    /// Leave every topic and stop the actor.
    pub async fn shutdown(&self) {
        let _ = self.request(|reply| ManagerCommand::Shutdown { reply }).await;
    }
}
