/*
    Node

    ┌──────────────┐  join(space key)   ┌────────────────┐
    │ Node         │───────────────────►│ NetworkManager │
    │  spaces:     │                    └───────┬────────┘
    │  key ->      │      ConnectionOpened      │
    │  SpaceHandle │◄───────────────────────────┘
    └──────┬───────┘
           │ per connection: serve_connection
           ├── "presence", both ways: keep_alive
           └── "replication", initiator opens, responder accepts:
                 replicate(space, channel, peer)

    A replication session that ends while its connection is up is
    reopened by the initiator after a backoff delay. Once the swarm retry
    policy is used up the connection is closed and the swarm reconnects
    it like any other lost connection.

    The node's identity key is also its swarm key, so one identity runs
    one device on the swarm. The founder's device feed is the genesis
    feed; other devices create a fresh feed per space and bind it with
    AdmitFeed once admitted.
*/

use metrics::counter;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::presence::{keep_alive, PRESENCE_CHANNEL};
use super::{NodeError, NodeResult};
use crate::config::{MeshConfig, PresenceConfig};
use crate::core_credentials::{Credential, Role};
use crate::core_feed::{FeedStorage, FeedStore};
use crate::core_identity::{Keypair, PublicKey};
use crate::core_replication::{replicate, DocumentReconciler, SpaceEngine, SpaceHandle, REPLICATION_CHANNEL};
use crate::core_runtime::{spawn_owned, AbortingJoinHandle, Backoff, BackoffPolicy, FullJitter, Jitter, TokioClock};
use crate::core_signal::{SignalClient, SignalConnector};
use crate::core_swarm::{Connection, ConnectionState, FullMesh, NetworkEvent, NetworkManager};
use crate::core_teleport::Channel;
use crate::core_timeframe::Position;
use crate::core_transport::{SessionId, TransportFactory};

#[derive(Debug, Clone)]
struct OpenSpace {
    handle: SpaceHandle,
    device_feed: PublicKey,
}

/// What every served connection needs besides its space
#[derive(Debug, Clone)]
struct ServeSettings {
    retry: BackoffPolicy,
    presence: PresenceConfig,
    jitter: Arc<dyn Jitter>,
}

impl ServeSettings {
    fn new(config: &MeshConfig, jitter: Arc<dyn Jitter>) -> Self {
        Self {
            retry: config.swarm.retry_policy(),
            presence: config.presence.clone(),
            jitter,
        }
    }
}

#[derive(Debug)]
struct NodeInner {
    identity: Keypair,
    config: MeshConfig,
    serve: ServeSettings,
    store: FeedStore,
    reconciler: Arc<dyn DocumentReconciler>,
    network: NetworkManager,
    spaces: RwLock<HashMap<PublicKey, OpenSpace>>,
    sessions: Mutex<HashMap<SessionId, AbortingJoinHandle<()>>>,
}

impl NodeInner {
    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, AbortingJoinHandle<()>>> {
        self.sessions.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn start_session(&self, connection: Arc<Connection>) {
        let Some(handle) = self
            .spaces
            .read()
            .await
            .get(connection.topic())
            .map(|open| open.handle.clone())
        else {
            debug!(topic = %connection.topic().short(), "Connection for a space that is not open");
            return;
        };

        let session = connection.session();
        let mut sessions = self.sessions();
        sessions.retain(|_, task| !task.is_finished());
        if sessions.contains_key(&session) {
            return;
        }
        sessions.insert(
            session,
            spawn_owned(serve_connection(handle, connection, self.serve.clone())),
        );
    }

    fn stop_session(&self, session: SessionId) {
        if self.sessions().remove(&session).is_some() {
            debug!(%session, "Connection no longer served");
        }
    }

    /// Start sessions for connections whose open event was missed.
    async fn resync(&self) {
        let topics: Vec<PublicKey> = self.spaces.read().await.keys().copied().collect();
        for topic in topics {
            match self.network.connections(topic).await {
                Ok(connections) => {
                    for connection in connections {
                        self.start_session(connection).await;
                    }
                }
                Err(err) => debug!(topic = %topic.short(), error = %err, "Resync skipped"),
            }
        }
    }
}

/// Route the peer's channels and keep replication running until the
/// connection closes.
async fn serve_connection(handle: SpaceHandle, connection: Arc<Connection>, settings: ServeSettings) {
    let peer = *connection.remote();
    let (presence_tx, presence_rx) = mpsc::unbounded_channel();
    let _presence = spawn_owned(keep_alive(connection.clone(), presence_rx, settings.presence.clone()));

    let mut replication = connection.is_initiator().then(|| {
        spawn_owned(replicate_with_retry(
            handle.clone(),
            connection.clone(),
            settings.retry,
            settings.jitter.clone(),
        ))
    });

    while let Some(channel) = connection.accept_channel().await {
        match channel.name() {
            PRESENCE_CHANNEL => {
                let _ = presence_tx.send(channel);
            }
            REPLICATION_CHANNEL if !connection.is_initiator() => {
                let session = spawn_owned(run_replication(handle.clone(), channel, peer));
                // The initiator only reopens after giving up on the old channel.
                if replication.replace(session).is_some() {
                    debug!(peer = %peer.short(), "Replication channel reopened by peer");
                }
            }
            name => {
                debug!(peer = %peer.short(), name, "Closing unexpected channel");
                channel.close();
            }
        }
    }
}

async fn run_replication(handle: SpaceHandle, channel: Channel, peer: PublicKey) {
    // The session logs its own outcome.
    let _ = replicate(handle, channel, peer).await;
}

/// Initiator side: open the replication channel, and open it again each
/// time a session ends while the connection is still up.
async fn replicate_with_retry(
    handle: SpaceHandle,
    connection: Arc<Connection>,
    policy: BackoffPolicy,
    jitter: Arc<dyn Jitter>,
) {
    let peer = *connection.remote();
    let mut backoff = Backoff::new(policy);
    loop {
        let channel = match connection.open_channel(REPLICATION_CHANNEL) {
            Ok(channel) => channel,
            Err(err) => {
                debug!(peer = %peer.short(), error = %err, "Could not open replication channel");
                return;
            }
        };
        let started = Instant::now();
        let result = replicate(handle.clone(), channel, peer).await;
        if connection.state() != ConnectionState::Connected {
            return;
        }

        // A session that ran for a while counts as a success.
        if started.elapsed() >= policy.cap {
            backoff.reset();
        }
        let delay = backoff.next_delay(jitter.as_ref());
        if backoff.is_exhausted() {
            warn!(
                peer = %peer.short(),
                attempts = backoff.attempt(),
                "Replication keeps failing, closing connection"
            );
            connection.close();
            return;
        }
        counter!("replication.sessions.restarted").increment(1);
        debug!(peer = %peer.short(), ?delay, failed = result.is_err(), "Reopening replication channel");
        tokio::time::sleep(delay).await;
    }
}

async fn watch_connections(inner: Arc<NodeInner>, mut events: broadcast::Receiver<NetworkEvent>) {
    loop {
        match events.recv().await {
            Ok(NetworkEvent::ConnectionOpened(connection)) => inner.start_session(connection).await,
            Ok(NetworkEvent::ConnectionClosed { session, .. }) => inner.stop_session(session),
            Ok(NetworkEvent::TopicDegraded { topic }) => {
                warn!(topic = %topic.short(), "Signaling lost, keeping open connections")
            }
            Ok(NetworkEvent::PeerUnreachable { topic, peer }) => {
                info!(topic = %topic.short(), peer = %peer.short(), "Peer unreachable")
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Network events lagged, resyncing sessions");
                inner.resync().await;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// One device: identity, feeds, and the spaces it takes part in
#[derive(Debug)]
pub struct Node {
    inner: Arc<NodeInner>,
    _events: AbortingJoinHandle<()>,
}

impl Node {
    /// Start signaling, the swarm and the connection watcher.
    pub fn new(
        config: MeshConfig,
        identity: Keypair,
        connector: Arc<dyn SignalConnector>,
        factory: Arc<dyn TransportFactory>,
        storage: Arc<dyn FeedStorage>,
        reconciler: Arc<dyn DocumentReconciler>,
    ) -> Self {
        let local = identity.public_key();
        let jitter: Arc<dyn Jitter> = Arc::new(FullJitter);
        let (signal, signal_events) =
            SignalClient::spawn(local, connector, config.signaling.clone(), jitter.clone());
        let network = NetworkManager::spawn(
            signal,
            signal_events,
            factory,
            config.swarm.clone(),
            config.teleport.clone(),
            Arc::new(TokioClock),
            jitter.clone(),
        );
        let events = network.subscribe();

        let inner = Arc::new(NodeInner {
            identity,
            serve: ServeSettings::new(&config, jitter),
            config,
            store: FeedStore::new(storage),
            reconciler,
            network,
            spaces: RwLock::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        });
        let task = spawn_owned(watch_connections(inner.clone(), events));
        info!(node = %local.short(), "Node started");

        Self {
            inner,
            _events: task,
        }
    }

    pub fn identity(&self) -> PublicKey {
        self.inner.identity.public_key()
    }

    pub fn network(&self) -> &NetworkManager {
        &self.inner.network
    }

    pub fn store(&self) -> &FeedStore {
        &self.inner.store
    }

    fn spawn_engine(&self, space: PublicKey) -> SpaceHandle {
        SpaceEngine::spawn(
            space,
            self.inner.store.clone(),
            self.inner.reconciler.clone(),
            self.inner.config.replication.clone(),
        )
    }

    async fn register(&self, space: PublicKey, open: OpenSpace) -> NodeResult<()> {
        self.inner.spaces.write().await.insert(space, open);
        if let Err(err) = self.inner.network.join_topic(space, Arc::new(FullMesh)).await {
            self.inner.spaces.write().await.remove(&space);
            return Err(err.into());
        }
        Ok(())
    }

    async fn open(&self, space: &PublicKey) -> NodeResult<OpenSpace> {
        self.inner
            .spaces
            .read()
            .await
            .get(space)
            .cloned()
            .ok_or(NodeError::UnknownSpace(*space))
    }

    /// Create a space owned by this node's identity. The new genesis feed
    /// is also this device's feed in the space.
    pub async fn create_space(&self) -> NodeResult<PublicKey> {
        let space = self.inner.store.add_owned(Keypair::generate()).await;
        let handle = self.spawn_engine(space);
        handle
            .write_credential(
                space,
                Credential::AdmitKey {
                    subject: self.identity(),
                    role: Role::Owner,
                },
            )
            .await?;
        self.register(
            space,
            OpenSpace {
                handle,
                device_feed: space,
            },
        )
        .await?;
        info!(space = %space.short(), "Created space");
        Ok(space)
    }

    /// Start replicating an existing space. Returns this device's feed in
    /// it; writing needs admission and [`Node::admit_own_feed`] first.
    pub async fn open_space(&self, space: PublicKey) -> NodeResult<PublicKey> {
        if let Ok(open) = self.open(&space).await {
            return Ok(open.device_feed);
        }
        let device_feed = self.inner.store.create_feed().await;
        let handle = self.spawn_engine(space);
        self.register(space, OpenSpace { handle, device_feed }).await?;
        info!(space = %space.short(), feed = %device_feed.short(), "Opened space");
        Ok(device_feed)
    }

    /// Stop replicating `space` and close its connections. Stored feeds
    /// are kept.
    pub async fn leave_space(&self, space: PublicKey) -> NodeResult<()> {
        if self.inner.spaces.write().await.remove(&space).is_none() {
            return Err(NodeError::UnknownSpace(space));
        }
        self.inner.network.leave_topic(space).await?;
        info!(space = %space.short(), "Left space");
        Ok(())
    }

    pub async fn space(&self, space: PublicKey) -> NodeResult<SpaceHandle> {
        Ok(self.open(&space).await?.handle)
    }

    pub async fn device_feed(&self, space: PublicKey) -> NodeResult<PublicKey> {
        Ok(self.open(&space).await?.device_feed)
    }

    pub async fn spaces(&self) -> Vec<PublicKey> {
        self.inner.spaces.read().await.keys().copied().collect()
    }

    async fn write_credential(&self, space: PublicKey, credential: Credential) -> NodeResult<Position> {
        let open = self.open(&space).await?;
        Ok(open.handle.write_credential(open.device_feed, credential).await?)
    }

    pub async fn admit_member(&self, space: PublicKey, identity: PublicKey, role: Role) -> NodeResult<Position> {
        self.write_credential(
            space,
            Credential::AdmitKey {
                subject: identity,
                role,
            },
        )
        .await
    }

    /// Bind this device's feed to this node's identity.
    pub async fn admit_own_feed(&self, space: PublicKey) -> NodeResult<Position> {
        let feed = self.device_feed(space).await?;
        self.write_credential(space, Credential::admit_feed(&space, feed, &self.inner.identity))
            .await
    }

    pub async fn update_member(&self, space: PublicKey, identity: PublicKey, role: Role) -> NodeResult<Position> {
        self.write_credential(
            space,
            Credential::UpdateKey {
                subject: identity,
                role,
            },
        )
        .await
    }

    pub async fn write(&self, space: PublicKey, data: Vec<u8>) -> NodeResult<Position> {
        let open = self.open(&space).await?;
        Ok(open.handle.write_data(open.device_feed, data).await?)
    }

    /// Close every connection and stop all spaces.
    pub async fn shutdown(&self) {
        self.inner.network.shutdown().await;
        self.inner.sessions().clear();
        self.inner.spaces.write().await.clear();
        info!(node = %self.identity().short(), "Node stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_feed::MemoryStorage;
    use crate::core_replication::MemoryReconciler;
    use crate::core_signal::MemoryRendezvous;
    use crate::core_transport::MemoryNetwork;
    use crate::config::TeleportConfig;
    use crate::core_runtime::NoJitter;
    use crate::core_transport::MemoryTransport;
    use crate::test_utils::{completes, fast_mesh_config, keypair, public_key, watch_until, TestDevice};
    use std::time::Duration;

    fn node(rv: &MemoryRendezvous, net: &MemoryNetwork, label: &str) -> (Node, Arc<MemoryReconciler>) {
        let identity = keypair(label);
        let reconciler = Arc::new(MemoryReconciler::new());
        let node = Node::new(
            fast_mesh_config(),
            identity.clone(),
            Arc::new(rv.clone()),
            net.factory(identity.public_key()),
            Arc::new(MemoryStorage::new()),
            reconciler.clone(),
        );
        (node, reconciler)
    }

    #[tokio::test]
    async fn test_create_space_and_write() {
        let rv = MemoryRendezvous::new();
        let net = MemoryNetwork::new();
        let (alice, reconciler) = node(&rv, &net, "alice");
        let space = alice.create_space().await.unwrap();

        assert_eq!(alice.device_feed(space).await.unwrap(), space);
        let position = alice.write(space, b"hello".to_vec()).await.unwrap();
        assert_eq!(position, Position::new(space, 1));
        assert_eq!(reconciler.payloads(), vec![b"hello".to_vec()]);
        assert_eq!(alice.spaces().await, vec![space]);
    }

    #[tokio::test]
    async fn test_unknown_space() {
        let rv = MemoryRendezvous::new();
        let net = MemoryNetwork::new();
        let (alice, _) = node(&rv, &net, "alice");
        let space = public_key("nowhere");
        assert_eq!(
            alice.write(space, b"x".to_vec()).await,
            Err(NodeError::UnknownSpace(space))
        );
        assert!(alice.space(space).await.is_err());
    }

    #[tokio::test]
    async fn test_open_space_is_idempotent() {
        let rv = MemoryRendezvous::new();
        let net = MemoryNetwork::new();
        let (bob, _) = node(&rv, &net, "bob");
        let space = public_key("some space");
        let feed = bob.open_space(space).await.unwrap();
        assert_eq!(bob.open_space(space).await.unwrap(), feed);
        assert_ne!(feed, space);
    }

    #[tokio::test]
    async fn test_two_nodes_replicate() {
        let rv = MemoryRendezvous::new();
        let net = MemoryNetwork::new();
        let (alice, _) = node(&rv, &net, "alice");
        let (bob, bob_reconciler) = node(&rv, &net, "bob");

        let space = alice.create_space().await.unwrap();
        alice.write(space, b"first".to_vec()).await.unwrap();
        bob.open_space(space).await.unwrap();

        let handle = bob.space(space).await.unwrap();
        let mut watch = handle.watch();
        watch_until(&mut watch, |s| s.applied == 1).await;
        assert_eq!(bob_reconciler.payloads(), vec![b"first".to_vec()]);
        assert_eq!(
            handle.snapshot().membership.role_of(&alice.identity()),
            Some(Role::Owner)
        );
    }

    #[tokio::test]
    async fn test_leave_space() {
        let rv = MemoryRendezvous::new();
        let net = MemoryNetwork::new();
        let (alice, _) = node(&rv, &net, "alice");
        let space = alice.create_space().await.unwrap();
        alice.leave_space(space).await.unwrap();
        assert!(alice.spaces().await.is_empty());
        assert_eq!(
            alice.leave_space(space).await,
            Err(NodeError::UnknownSpace(space))
        );
    }

    #[tokio::test]
    async fn test_entry_larger_than_channel_window_replicates() {
        let rv = MemoryRendezvous::new();
        let net = MemoryNetwork::new();
        let (alice, _) = node(&rv, &net, "alice");
        let (bob, bob_reconciler) = node(&rv, &net, "bob");

        let space = alice.create_space().await.unwrap();
        bob.open_space(space).await.unwrap();
        let handle = bob.space(space).await.unwrap();
        let mut watch = handle.watch();
        alice.write(space, b"first".to_vec()).await.unwrap();
        watch_until(&mut watch, |s| s.applied == 1).await;

        let window = TeleportConfig::default().initial_credit as usize;
        let large: Vec<u8> = (0..2 * window + 17).map(|i| (i % 251) as u8).collect();
        alice.write(space, large.clone()).await.unwrap();
        alice.write(space, b"after".to_vec()).await.unwrap();

        watch_until(&mut watch, |s| s.applied == 3).await;
        assert_eq!(
            bob_reconciler.payloads(),
            vec![b"first".to_vec(), large, b"after".to_vec()]
        );
    }

    fn settings(max_attempts: u32) -> ServeSettings {
        ServeSettings {
            retry: BackoffPolicy {
                base: Duration::from_millis(100),
                cap: Duration::from_secs(1),
                max_attempts,
            },
            presence: PresenceConfig {
                alive_interval: Duration::from_secs(60),
                peer_timeout: Duration::from_secs(3600),
            },
            jitter: Arc::new(NoJitter),
        }
    }

    /// Both ends of one connection on `space`, alice's side initiating.
    fn connection_pair(space: PublicKey, alice: &TestDevice, bob: &TestDevice) -> (Arc<Connection>, Arc<Connection>) {
        let session = SessionId::new();
        let (a, b) = MemoryTransport::pair();
        (
            Connection::new(space, bob.identity.public_key(), session, a, true, TeleportConfig::default()),
            Connection::new(space, alice.identity.public_key(), session, b, false, TeleportConfig::default()),
        )
    }

    async fn accept_replication(connection: &Connection) -> Channel {
        loop {
            let channel = completes(connection.accept_channel()).await.unwrap();
            if channel.name() == REPLICATION_CHANNEL {
                return channel;
            }
        }
    }

    /// Answer the Hello with garbage and wait for the initiator to hang up.
    async fn break_session(mut channel: Channel) {
        let _hello = completes(channel.recv()).await.unwrap().unwrap();
        channel.send(vec![0xee, 0x01]).await.unwrap();
        while let Ok(Some(_)) = completes(channel.recv()).await {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_replication_session_is_reopened() {
        let alice = TestDevice::founder("alice").await;
        alice.write(b"first").await;
        let bob = TestDevice::joiner("bob", alice.space()).await;
        let (a, b) = connection_pair(alice.space(), &alice, &bob);
        let _alice_side = spawn_owned(serve_connection(alice.handle.clone(), a.clone(), settings(5)));

        break_session(accept_replication(&b).await).await;
        assert_eq!(a.state(), ConnectionState::Connected);

        // The connection survives and the next session carries the data.
        let _bob_side = spawn_owned(serve_connection(bob.handle.clone(), b, settings(5)));
        let mut watch = bob.handle.watch();
        watch_until(&mut watch, |s| s.applied == 1).await;
        assert_eq!(bob.reconciler.payloads(), vec![b"first".to_vec()]);
        assert_eq!(a.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replication_that_keeps_failing_closes_connection() {
        let alice = TestDevice::founder("alice").await;
        let bob = TestDevice::joiner("bob", alice.space()).await;
        let (a, b) = connection_pair(alice.space(), &alice, &bob);
        let _alice_side = spawn_owned(serve_connection(alice.handle.clone(), a.clone(), settings(3)));

        for _ in 0..3 {
            break_session(accept_replication(&b).await).await;
        }
        completes(a.closed()).await;
        assert_eq!(a.state(), ConnectionState::Closed);
        completes(b.closed()).await;
    }
}
