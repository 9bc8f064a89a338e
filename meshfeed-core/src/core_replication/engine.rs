/*
    SpaceEngine

    One task per space. Every mutation of the space state goes through it.

    ingest(message)
        │
        ├─ feed corrupt ───────────────────────────────► Ignored
        ├─ seq already stored ── same bytes ───────────► Duplicate
        │                     └─ other bytes, signed ──► Forked (feed corrupt)
        ├─ bad signature ──────────────────────────────► Err(InvalidSignature)
        ├─ seq beyond next ── gap buffer ──────────────► Buffered
        └─ seq == next ── store, drain gap buffer ─────► Appended
                                  │
                                  ▼
                      per-feed queue, in seq order
                                  │  head ready when its predecessor is
                                  │  processed and its envelope timeframe
                                  │  is covered by the processed timeframe
                                  ▼
               credential ──► CredentialChain::insert
               data ───────► DocumentReconciler (authorized) or retained

    replicated: every stored entry, contiguous per feed
    processed:  every entry that went through the causal stage

    A gap that stays open for `gap_timeout` raises GapRequested, which the
    replication sessions turn into Request messages.
*/

use metrics::counter;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, trace, warn};

use super::{Body, DocumentReconciler, Envelope, ReplicationError, ReplicationResult, SpaceEvent};
use crate::config::ReplicationConfig;
use crate::core_credentials::{Credential, CredentialChain, MembershipSnapshot};
use crate::core_feed::{FeedError, FeedMessage, FeedStore};
use crate::core_identity::PublicKey;
use crate::core_runtime::{spawn_owned, AbortingJoinHandle};
use crate::core_timeframe::{Position, Timeframe};

const COMMAND_BUFFER: usize = 256;

/// Outcome of handing a remote entry to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingested {
    Appended,
    Duplicate,
    /// Held until the entries before it arrive
    Buffered,
    /// Feed is corrupt or its gap buffer is full
    Ignored,
    Forked,
}

/// Immutable view of a space, replaced after every change
#[derive(Debug, Clone, Serialize)]
pub struct SpaceSnapshot {
    pub space: PublicKey,
    pub replicated: Timeframe,
    pub processed: Timeframe,
    pub membership: MembershipSnapshot,
    pub corrupt: BTreeSet<PublicKey>,
    pub unauthorized: BTreeSet<Position>,
    /// Data entries handed to the reconciler
    pub applied: u64,
    /// Stored entries waiting for their causal past
    pub pending: usize,
    /// Entries waiting in gap buffers
    pub buffered: usize,
}

impl SpaceSnapshot {
    fn empty(space: PublicKey) -> Self {
        Self {
            space,
            replicated: Timeframe::new(),
            processed: Timeframe::new(),
            membership: MembershipSnapshot::default(),
            corrupt: BTreeSet::new(),
            unauthorized: BTreeSet::new(),
            applied: 0,
            pending: 0,
            buffered: 0,
        }
    }

    pub fn is_processed(&self, feed: &PublicKey, seq: u64) -> bool {
        self.processed.contains(feed, seq)
    }

    /// Fails once `feed` has forked. There is no recovery from that.
    pub fn ensure_intact(&self, feed: &PublicKey) -> ReplicationResult<()> {
        if self.corrupt.contains(feed) {
            return Err(ReplicationError::FeedCorrupted { feed: *feed });
        }
        Ok(())
    }
}

#[derive(Debug)]
enum EngineCommand {
    Write {
        feed: PublicKey,
        body: Body,
        reply: oneshot::Sender<ReplicationResult<Position>>,
    },
    Ingest {
        message: FeedMessage,
        reply: oneshot::Sender<ReplicationResult<Ingested>>,
    },
}

/// Stored entry waiting for causal processing. `None` if the payload is not
/// an envelope.
#[derive(Debug)]
struct Queued {
    seq: u64,
    envelope: Option<Envelope>,
}

#[derive(Debug)]
struct GapBuffer {
    messages: BTreeMap<u64, FeedMessage>,
    /// Last time the gap was opened or made progress
    since: Instant,
}

pub struct SpaceEngine {
    space: PublicKey,
    store: FeedStore,
    reconciler: Arc<dyn DocumentReconciler>,
    config: ReplicationConfig,
    replicated: Timeframe,
    processed: Timeframe,
    chain: CredentialChain,
    queues: BTreeMap<PublicKey, VecDeque<Queued>>,
    gaps: BTreeMap<PublicKey, GapBuffer>,
    corrupt: BTreeSet<PublicKey>,
    unauthorized: BTreeSet<Position>,
    applied: u64,
    snapshot: watch::Sender<Arc<SpaceSnapshot>>,
    events: broadcast::Sender<SpaceEvent>,
    appended: broadcast::Sender<FeedMessage>,
}

impl SpaceEngine {
    /// Start the engine for `space` over `store`. The task stops when the
    /// last handle is dropped.
    pub fn spawn(
        space: PublicKey,
        store: FeedStore,
        reconciler: Arc<dyn DocumentReconciler>,
        config: ReplicationConfig,
    ) -> SpaceHandle {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (snapshot, snapshot_rx) = watch::channel(Arc::new(SpaceSnapshot::empty(space)));
        let (events, _) = broadcast::channel(config.event_capacity);
        let (appended, _) = broadcast::channel(config.event_capacity);

        let engine = SpaceEngine {
            space,
            store: store.clone(),
            reconciler,
            config: config.clone(),
            replicated: Timeframe::new(),
            processed: Timeframe::new(),
            chain: CredentialChain::new(space),
            queues: BTreeMap::new(),
            gaps: BTreeMap::new(),
            corrupt: BTreeSet::new(),
            unauthorized: BTreeSet::new(),
            applied: 0,
            snapshot,
            events: events.clone(),
            appended: appended.clone(),
        };
        let task = spawn_owned(engine.run(commands_rx));
        debug!(space = %space.short(), "Space engine started");

        SpaceHandle {
            space,
            store,
            config,
            commands: commands_tx,
            snapshot: snapshot_rx,
            events,
            appended,
            _task: Arc::new(task),
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<EngineCommand>) {
        let period = (self.config.gap_timeout / 4).max(Duration::from_millis(10));
        let mut gap_check = tokio::time::interval(period);
        gap_check.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    // Publish before replying so callers see their own change.
                    match command {
                        EngineCommand::Write { feed, body, reply } => {
                            let result = self.write(feed, body).await;
                            self.publish();
                            let _ = reply.send(result);
                        }
                        EngineCommand::Ingest { message, reply } => {
                            let result = self.ingest(message).await;
                            self.publish();
                            let _ = reply.send(result);
                        }
                    }
                }
                _ = gap_check.tick() => self.check_gaps(),
            }
        }
        debug!(space = %self.space.short(), "Space engine stopped");
    }

    async fn write(&mut self, feed: PublicKey, body: Body) -> ReplicationResult<Position> {
        if self.corrupt.contains(&feed) {
            return Err(ReplicationError::FeedCorrupted { feed });
        }
        let seq = self.store.len(&feed).await?;
        let position = Position::new(feed, seq);
        match &body {
            Body::Credential(credential) => self
                .chain
                .membership_at(&position, &self.processed)
                .check(&self.space, &position, credential)?,
            Body::Data(_) => {
                if !self.chain.can_write_at(&feed, seq, &self.processed) {
                    return Err(ReplicationError::NotAuthorized { feed });
                }
            }
        }

        let kind = body.kind();
        let envelope = Envelope::new(self.processed.clone(), body);
        let message = self.store.append(&feed, envelope.encode()).await?;
        let position = message.position();
        debug!(
            space = %self.space.short(),
            feed = %feed.short(),
            seq = position.seq,
            kind,
            "Wrote entry"
        );
        self.record_appended(message);
        self.process_ready();
        Ok(position)
    }

    async fn ingest(&mut self, message: FeedMessage) -> ReplicationResult<Ingested> {
        let feed = message.feed_key;
        let seq = message.seq;

        if self.corrupt.contains(&feed) {
            trace!(feed = %feed.short(), seq, "Entry of corrupt feed ignored");
            return Ok(Ingested::Ignored);
        }

        if self.replicated.contains(&feed, seq) {
            let stored = self.store.get(&feed, seq).await?.ok_or_else(|| {
                FeedError::Storage(format!("entry {} of feed {} missing from storage", seq, feed))
            })?;
            if stored == message {
                counter!("replication.messages.duplicate").increment(1);
                return Ok(Ingested::Duplicate);
            }
            if !message.verify() {
                return Err(ReplicationError::InvalidSignature { feed, seq });
            }
            self.mark_corrupt(feed, seq);
            return Ok(Ingested::Forked);
        }

        if !message.verify() {
            return Err(ReplicationError::InvalidSignature { feed, seq });
        }

        if seq > self.replicated.next_seq(&feed) {
            return Ok(self.buffer(message));
        }

        self.store.storage().append(message.clone()).await?;
        self.record_appended(message);
        self.drain_buffered(&feed).await?;
        self.process_ready();
        Ok(Ingested::Appended)
    }

    fn buffer(&mut self, message: FeedMessage) -> Ingested {
        let feed = message.feed_key;
        let seq = message.seq;
        let max = self.config.max_buffered_per_feed;
        let gap = self.gaps.entry(feed).or_insert_with(|| GapBuffer {
            messages: BTreeMap::new(),
            since: Instant::now(),
        });

        match gap.messages.get(&seq).map(|existing| *existing == message) {
            Some(true) => Ingested::Duplicate,
            Some(false) => {
                self.mark_corrupt(feed, seq);
                Ingested::Forked
            }
            None if gap.messages.len() >= max => {
                warn!(feed = %feed.short(), seq, max, "Gap buffer full, entry dropped");
                Ingested::Ignored
            }
            None => {
                gap.messages.insert(seq, message);
                trace!(feed = %feed.short(), seq, "Entry buffered behind gap");
                Ingested::Buffered
            }
        }
    }

    async fn drain_buffered(&mut self, feed: &PublicKey) -> ReplicationResult<()> {
        loop {
            let next = self.replicated.next_seq(feed);
            let Some(gap) = self.gaps.get_mut(feed) else {
                return Ok(());
            };
            let Some(message) = gap.messages.remove(&next) else {
                return Ok(());
            };
            if gap.messages.is_empty() {
                self.gaps.remove(feed);
            } else {
                gap.since = Instant::now();
            }
            self.store.storage().append(message.clone()).await?;
            self.record_appended(message);
        }
    }

    fn record_appended(&mut self, message: FeedMessage) {
        let feed = message.feed_key;
        let seq = message.seq;
        self.replicated.advance(feed, seq);
        self.queues.entry(feed).or_default().push_back(Queued {
            seq,
            envelope: Envelope::decode(&message.payload).ok(),
        });
        counter!("replication.messages.replicated").increment(1);
        // No receivers just means no sessions are running.
        let _ = self.appended.send(message);
    }

    fn is_ready(&self, feed: &PublicKey, queued: &Queued) -> bool {
        self.processed.next_seq(feed) == queued.seq
            && queued
                .envelope
                .as_ref()
                .map_or(true, |envelope| envelope.timeframe.is_subset_of(&self.processed))
    }

    fn pop_ready(&mut self, feed: &PublicKey) -> Option<Queued> {
        let head = self.queues.get(feed)?.front()?;
        if !self.is_ready(feed, head) {
            return None;
        }
        let queue = self.queues.get_mut(feed)?;
        let queued = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(feed);
        }
        queued
    }

    fn process_ready(&mut self) {
        loop {
            let feeds: Vec<PublicKey> = self.queues.keys().copied().collect();
            let mut progressed = false;
            for feed in feeds {
                while let Some(queued) = self.pop_ready(&feed) {
                    self.process(feed, queued);
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
    }

    fn process(&mut self, feed: PublicKey, queued: Queued) {
        let position = Position::new(feed, queued.seq);
        self.processed.advance(feed, queued.seq);

        let Some(envelope) = queued.envelope else {
            warn!(feed = %feed.short(), seq = queued.seq, "Entry is not an envelope");
            counter!("replication.messages.malformed").increment(1);
            self.emit(SpaceEvent::MalformedMessage { position });
            return;
        };

        match envelope.body {
            Body::Credential(credential) => self.apply_credential(position, envelope.timeframe, credential),
            Body::Data(data) => {
                if self.chain.can_write_at(&feed, queued.seq, &envelope.timeframe) {
                    self.reconciler.apply_ordered(&feed, queued.seq, &data);
                    self.applied += 1;
                    counter!("replication.messages.applied").increment(1);
                    self.emit(SpaceEvent::MessageApplied { position });
                } else {
                    warn!(
                        space = %self.space.short(),
                        feed = %feed.short(),
                        seq = queued.seq,
                        "Data entry from unauthorized feed retained"
                    );
                    counter!("replication.messages.unauthorized").increment(1);
                    self.unauthorized.insert(position);
                    self.emit(SpaceEvent::Unauthorized { position });
                }
            }
        }
    }

    fn apply_credential(&mut self, position: Position, timeframe: Timeframe, credential: Credential) {
        let kind = credential.kind();
        match self.chain.insert(position, timeframe, credential) {
            Ok(()) => {
                counter!("replication.credentials.applied").increment(1);
                self.emit(SpaceEvent::CredentialApplied { position, kind });
            }
            Err(error) => {
                counter!("replication.credentials.rejected").increment(1);
                self.emit(SpaceEvent::CredentialRejected { position, error });
            }
        }
    }

    fn mark_corrupt(&mut self, feed: PublicKey, seq: u64) {
        error!(
            space = %self.space.short(),
            feed = %feed.short(),
            seq,
            "Conflicting entries at one position, feed marked corrupt"
        );
        self.corrupt.insert(feed);
        self.gaps.remove(&feed);
        self.queues.remove(&feed);
        counter!("replication.feeds.corrupted").increment(1);
        self.emit(SpaceEvent::FeedCorrupted { feed, seq });
    }

    fn check_gaps(&mut self) {
        let now = Instant::now();
        let mut requests = Vec::new();
        for (feed, gap) in self.gaps.iter_mut() {
            if now.duration_since(gap.since) >= self.config.gap_timeout {
                gap.since = now;
                requests.push((*feed, self.replicated.next_seq(feed)));
            }
        }
        for (feed, from_seq) in requests {
            debug!(feed = %feed.short(), from_seq, "Gap timed out, requesting");
            counter!("replication.gaps.requested").increment(1);
            self.emit(SpaceEvent::GapRequested { feed, from_seq });
        }
    }

    fn emit(&self, event: SpaceEvent) {
        trace!(space = %self.space.short(), event = event.name(), "Space event");
        let _ = self.events.send(event);
    }

    fn publish(&self) {
        let snapshot = SpaceSnapshot {
            space: self.space,
            replicated: self.replicated.clone(),
            processed: self.processed.clone(),
            membership: self.chain.membership().clone(),
            corrupt: self.corrupt.clone(),
            unauthorized: self.unauthorized.clone(),
            applied: self.applied,
            pending: self.queues.values().map(VecDeque::len).sum(),
            buffered: self.gaps.values().map(|gap| gap.messages.len()).sum(),
        };
        self.snapshot.send_replace(Arc::new(snapshot));
    }
}

/// Cloneable handle to a running [`SpaceEngine`]
#[derive(Debug, Clone)]
pub struct SpaceHandle {
    space: PublicKey,
    store: FeedStore,
    config: ReplicationConfig,
    commands: mpsc::Sender<EngineCommand>,
    snapshot: watch::Receiver<Arc<SpaceSnapshot>>,
    events: broadcast::Sender<SpaceEvent>,
    appended: broadcast::Sender<FeedMessage>,
    _task: Arc<AbortingJoinHandle<()>>,
}

impl SpaceHandle {
    pub fn space(&self) -> &PublicKey {
        &self.space
    }

    pub fn store(&self) -> &FeedStore {
        &self.store
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn snapshot(&self) -> Arc<SpaceSnapshot> {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Arc<SpaceSnapshot>> {
        self.snapshot.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SpaceEvent> {
        self.events.subscribe()
    }

    /// Every entry as it is stored, local or remote
    pub fn appended(&self) -> broadcast::Receiver<FeedMessage> {
        self.appended.subscribe()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<ReplicationResult<T>>) -> EngineCommand,
    ) -> ReplicationResult<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| ReplicationError::EngineStopped)?;
        rx.await.map_err(|_| ReplicationError::EngineStopped)?
    }

    /// Append application data to an owned feed.
    pub async fn write_data(&self, feed: PublicKey, data: Vec<u8>) -> ReplicationResult<Position> {
        self.request(|reply| EngineCommand::Write {
            feed,
            body: Body::Data(data),
            reply,
        })
        .await
    }

    /// Append a credential to an owned feed. Credentials the current
    /// membership would reject are not written.
    pub async fn write_credential(&self, feed: PublicKey, credential: Credential) -> ReplicationResult<Position> {
        self.request(|reply| EngineCommand::Write {
            feed,
            body: Body::Credential(credential),
            reply,
        })
        .await
    }

    /// Hand over an entry received from a peer.
    pub async fn ingest(&self, message: FeedMessage) -> ReplicationResult<Ingested> {
        self.request(|reply| EngineCommand::Ingest { message, reply }).await
    }
}
