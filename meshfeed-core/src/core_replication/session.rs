/*
    Replication session

    Runs the replication protocol with one peer over one teleport channel.

        Hello ──►                       ◄── Hello
        push (theirs, mine] per feed
        ┌───────────────────────────────────────────────┐
        │ inbound Message    -> engine ingest           │
        │ inbound Request    -> re-send from seq        │
        │ inbound Timeframe  -> merge, push missing     │
        │ local append       -> push missing            │
        │ GapRequested       -> Request to this peer    │
        │ progress tick      -> Timeframe               │
        └───────────────────────────────────────────────┘

    `remote` is what the peer is known to hold: its Hello, its progress
    updates, and everything sent to or received from it. Pushing what
    `replicated` has beyond `remote` covers the initial exchange and live
    forwarding alike.

    Inbound data is read on its own task so the peer's credit keeps flowing
    while this side waits for credit to send.
*/

use metrics::{counter, gauge};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::{ReplicationError, ReplicationMessage, ReplicationResult, SpaceEvent, SpaceHandle};
use crate::core_identity::PublicKey;
use crate::core_runtime::{spawn_owned, AbortingJoinHandle};
use crate::core_teleport::{Channel, ChannelReceiver, ChannelSender, TeleportResult};
use crate::core_timeframe::Timeframe;
use crate::metrics::Timer;

/// Replicate `space` with `peer` until either side closes the channel.
///
/// Protocol violations end the session with an error; the channel is closed
/// in every case.
pub async fn replicate(space: SpaceHandle, channel: Channel, peer: PublicKey) -> ReplicationResult<()> {
    let (sender, receiver) = channel.split();
    gauge!("replication.sessions.active").increment(1.0);
    info!(space = %space.space().short(), peer = %peer.short(), "Replication session started");

    let result = run(space.clone(), sender.clone(), receiver, peer).await;
    sender.close();

    gauge!("replication.sessions.active").decrement(1.0);
    match &result {
        Ok(()) => debug!(peer = %peer.short(), "Replication session ended"),
        Err(err) => warn!(peer = %peer.short(), error = %err, "Replication session failed"),
    }
    result
}

type Inbound = mpsc::UnboundedReceiver<TeleportResult<Vec<u8>>>;

fn spawn_reader(mut receiver: ChannelReceiver) -> (Inbound, AbortingJoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = spawn_owned(async move {
        loop {
            match receiver.recv().await {
                Ok(Some(bytes)) => {
                    if tx.send(Ok(bytes)).is_err() {
                        return;
                    }
                }
                Ok(None) => return,
                Err(err) => {
                    let _ = tx.send(Err(err));
                    return;
                }
            }
        }
    });
    (rx, task)
}

async fn run(
    space: SpaceHandle,
    sender: ChannelSender,
    receiver: ChannelReceiver,
    peer: PublicKey,
) -> ReplicationResult<()> {
    let config = space.config().clone();
    // Subscribe before taking the snapshot the Hello is built from, so no
    // append falls between the two.
    let mut appended = space.appended();
    let mut events = space.subscribe();
    let (mut inbound, _reader) = spawn_reader(receiver);

    let mut session = Session {
        space,
        sender,
        peer,
        remote: Timeframe::new(),
        announced: Timeframe::new(),
    };
    let timer = Timer::new("replication.handshake.duration_ms");
    session.send_hello().await?;

    let first = match timeout(config.handshake_timeout, inbound.recv()).await {
        Err(_) => return Err(ReplicationError::HandshakeTimeout { peer }),
        Ok(None) => return Ok(()),
        Ok(Some(bytes)) => bytes?,
    };
    session.remote = session.expect_hello(&first)?;
    timer.stop();
    debug!(
        peer = %peer.short(),
        remote_messages = session.remote.total_messages(),
        "Replication handshake complete"
    );
    session.push_missing().await?;

    let mut progress = interval_at(Instant::now() + config.progress_interval, config.progress_interval);
    progress.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            bytes = inbound.recv() => match bytes {
                None => return Ok(()),
                Some(bytes) => {
                    let message = session.decode(&bytes?)?;
                    session.handle(message).await?;
                }
            },
            message = appended.recv() => match message {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => session.push_missing().await?,
                Err(broadcast::error::RecvError::Closed) => return Err(ReplicationError::EngineStopped),
            },
            event = events.recv() => match event {
                Ok(SpaceEvent::GapRequested { feed, from_seq }) => session.request_gap(feed, from_seq).await?,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return Err(ReplicationError::EngineStopped),
            },
            _ = progress.tick() => session.announce_progress().await?,
        }
    }
}

struct Session {
    space: SpaceHandle,
    sender: ChannelSender,
    peer: PublicKey,
    remote: Timeframe,
    /// Last replicated timeframe sent to the peer
    announced: Timeframe,
}

impl Session {
    fn violation(&self, reason: impl Into<String>) -> ReplicationError {
        ReplicationError::ProtocolViolation {
            peer: self.peer,
            reason: reason.into(),
        }
    }

    fn decode(&self, bytes: &[u8]) -> ReplicationResult<ReplicationMessage> {
        ReplicationMessage::decode(bytes).map_err(|e| self.violation(format!("undecodable message: {}", e)))
    }

    async fn send(&self, message: ReplicationMessage) -> ReplicationResult<()> {
        trace!(peer = %self.peer.short(), kind = message.name(), "Sending");
        self.sender.send(message.encode()).await?;
        Ok(())
    }

    async fn send_hello(&mut self) -> ReplicationResult<()> {
        let timeframe = self.space.snapshot().replicated.clone();
        self.announced = timeframe.clone();
        self.send(ReplicationMessage::Hello {
            space: *self.space.space(),
            timeframe,
        })
        .await
    }

    fn expect_hello(&self, bytes: &[u8]) -> ReplicationResult<Timeframe> {
        match self.decode(bytes)? {
            ReplicationMessage::Hello { space, timeframe } if space == *self.space.space() => Ok(timeframe),
            ReplicationMessage::Hello { space, .. } => Err(ReplicationError::SpaceMismatch {
                peer: self.peer,
                expected: *self.space.space(),
                actual: space,
            }),
            other => Err(self.violation(format!("expected hello, got {}", other.name()))),
        }
    }

    /// Send every stored entry the peer is not known to hold.
    async fn push_missing(&mut self) -> ReplicationResult<()> {
        let snapshot = self.space.snapshot();
        for range in snapshot.replicated.missing_ranges(&self.remote) {
            if snapshot.corrupt.contains(&range.feed) {
                continue;
            }
            let messages = self
                .space
                .store()
                .read_range(&range.feed, range.from, range.to)
                .await?;
            for message in messages {
                let (feed, seq) = (message.feed_key, message.seq);
                self.send(ReplicationMessage::Message(message)).await?;
                self.remote.advance(feed, seq);
                counter!("replication.messages.sent").increment(1);
            }
        }
        Ok(())
    }

    async fn handle(&mut self, message: ReplicationMessage) -> ReplicationResult<()> {
        trace!(peer = %self.peer.short(), kind = message.name(), "Received");
        match message {
            ReplicationMessage::Hello { .. } => Err(self.violation("repeated hello")),
            ReplicationMessage::Message(message) => {
                let (feed, seq) = (message.feed_key, message.seq);
                counter!("replication.messages.received").increment(1);
                match self.space.ingest(message).await {
                    Ok(outcome) => {
                        trace!(feed = %feed.short(), seq, ?outcome, "Ingested");
                        self.remote.advance(feed, seq);
                        Ok(())
                    }
                    Err(ReplicationError::InvalidSignature { feed, seq }) => Err(self.violation(format!(
                        "invalid signature on feed {} seq {}",
                        feed.short(),
                        seq
                    ))),
                    Err(err) => Err(err),
                }
            }
            ReplicationMessage::Request { feed, from_seq } => {
                if self.space.snapshot().corrupt.contains(&feed) {
                    return Ok(());
                }
                let messages = self.space.store().read_from(&feed, from_seq).await?;
                debug!(
                    peer = %self.peer.short(),
                    feed = %feed.short(),
                    from_seq,
                    count = messages.len(),
                    "Answering request"
                );
                for message in messages {
                    self.send(ReplicationMessage::Message(message)).await?;
                    counter!("replication.messages.sent").increment(1);
                }
                Ok(())
            }
            ReplicationMessage::Timeframe(timeframe) => {
                self.remote.merge(&timeframe);
                self.push_missing().await
            }
        }
    }

    /// Ask this peer for a missing entry if it has announced it.
    async fn request_gap(&mut self, feed: PublicKey, from_seq: u64) -> ReplicationResult<()> {
        if !self.remote.contains(&feed, from_seq) {
            return Ok(());
        }
        debug!(peer = %self.peer.short(), feed = %feed.short(), from_seq, "Requesting gap");
        self.send(ReplicationMessage::Request { feed, from_seq }).await
    }

    async fn announce_progress(&mut self) -> ReplicationResult<()> {
        let replicated = self.space.snapshot().replicated.clone();
        if replicated == self.announced {
            return Ok(());
        }
        self.announced = replicated.clone();
        self.send(ReplicationMessage::Timeframe(replicated)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TeleportConfig;
    use crate::core_credentials::Role;
    use crate::core_feed::FeedMessage;
    use crate::core_replication::{Body, Envelope};
    use crate::core_teleport::Teleport;
    use crate::core_transport::MemoryTransport;
    use crate::test_utils::{completes, keypair, next_event_matching, public_key, watch_until, TestDevice};

    /// Two ends of a replication channel
    async fn channel_pair() -> (Teleport, Teleport, Channel, Channel) {
        let (a, b) = MemoryTransport::pair();
        let ta = Teleport::new(a, true, TeleportConfig::default());
        let tb = Teleport::new(b, false, TeleportConfig::default());
        let ca = ta.open_channel(crate::core_replication::REPLICATION_CHANNEL).unwrap();
        let cb = completes(tb.accept()).await.unwrap();
        (ta, tb, ca, cb)
    }

    async fn wait_converged(a: &TestDevice, b: &TestDevice) {
        let target = a.handle.snapshot().replicated.clone();
        let mut watch = b.handle.watch();
        watch_until(&mut watch, |s| target.is_subset_of(&s.replicated)).await;
    }

    #[tokio::test]
    async fn test_initial_exchange_and_live_forwarding() {
        let alice = TestDevice::founder("alice").await;
        let bob = TestDevice::joiner("bob", alice.space()).await;
        alice.admit(&bob, Role::Member).await;
        alice.write(b"before").await;

        let (_ta, _tb, ca, cb) = channel_pair().await;
        let a = tokio::spawn(replicate(alice.handle.clone(), ca, bob.identity.public_key()));
        let b = tokio::spawn(replicate(bob.handle.clone(), cb, alice.identity.public_key()));

        wait_converged(&alice, &bob).await;
        assert_eq!(bob.reconciler.payloads(), vec![b"before".to_vec()]);

        bob.write(b"live").await;
        wait_converged(&bob, &alice).await;
        assert_eq!(
            alice.reconciler.payloads(),
            vec![b"before".to_vec(), b"live".to_vec()]
        );
        a.abort();
        b.abort();
    }

    #[tokio::test]
    async fn test_space_mismatch_fails_handshake() {
        let alice = TestDevice::founder("alice").await;
        let carol = TestDevice::founder("carol").await;
        let (_ta, _tb, ca, cb) = channel_pair().await;
        let b = tokio::spawn(replicate(carol.handle.clone(), cb, public_key("alice")));
        let result = completes(replicate(alice.handle.clone(), ca, public_key("carol"))).await;
        assert!(matches!(result, Err(ReplicationError::SpaceMismatch { .. })));
        assert!(matches!(
            completes(b).await.unwrap(),
            Err(ReplicationError::SpaceMismatch { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let alice = TestDevice::founder("alice").await;
        let (_ta, _tb, ca, _cb) = channel_pair().await;
        let result = replicate(alice.handle.clone(), ca, public_key("mute")).await;
        assert_eq!(
            result,
            Err(ReplicationError::HandshakeTimeout {
                peer: public_key("mute")
            })
        );
    }

    #[tokio::test]
    async fn test_garbage_closes_channel() {
        let alice = TestDevice::founder("alice").await;
        let (_ta, _tb, ca, mut cb) = channel_pair().await;
        let session = tokio::spawn(replicate(alice.handle.clone(), ca, public_key("mallory")));

        let hello = completes(cb.recv()).await.unwrap().unwrap();
        assert!(matches!(
            ReplicationMessage::decode(&hello).unwrap(),
            ReplicationMessage::Hello { .. }
        ));
        cb.send(vec![0xee, 0x01]).await.unwrap();

        assert!(matches!(
            completes(session).await.unwrap(),
            Err(ReplicationError::ProtocolViolation { .. })
        ));
        // Anything else the session pushed, then the close.
        while completes(cb.recv()).await.unwrap().is_some() {}
    }

    #[tokio::test]
    async fn test_unbounded_seq_in_hello_is_a_violation() {
        let alice = TestDevice::founder("alice").await;
        let (_ta, _tb, ca, mut cb) = channel_pair().await;
        let session = tokio::spawn(replicate(alice.handle.clone(), ca, public_key("mallory")));

        let _hello = completes(cb.recv()).await.unwrap().unwrap();
        let mut hello = vec![0x01];
        hello.extend_from_slice(alice.space().as_bytes());
        crate::wire::put_varint(&mut hello, 1);
        hello.extend_from_slice(alice.feed.as_bytes());
        crate::wire::put_varint(&mut hello, u64::MAX);
        cb.send(hello).await.unwrap();

        assert!(matches!(
            completes(session).await.unwrap(),
            Err(ReplicationError::ProtocolViolation { .. })
        ));
    }

    #[tokio::test]
    async fn test_forged_signature_is_a_violation() {
        let alice = TestDevice::founder("alice").await;
        let (_ta, _tb, ca, mut cb) = channel_pair().await;
        let session = tokio::spawn(replicate(alice.handle.clone(), ca, public_key("mallory")));

        let _hello = completes(cb.recv()).await.unwrap().unwrap();
        cb.send(
            ReplicationMessage::Hello {
                space: alice.space(),
                timeframe: Timeframe::new(),
            }
            .encode(),
        )
        .await
        .unwrap();
        let mut forged = FeedMessage::sign(&keypair("mallory feed"), 0, b"x".to_vec());
        forged.payload = b"y".to_vec();
        cb.send(ReplicationMessage::Message(forged).encode()).await.unwrap();

        assert!(matches!(
            completes(session).await.unwrap(),
            Err(ReplicationError::ProtocolViolation { .. })
        ));
    }

    /// A peer that holds entries 0..=5 but first delivers all except 3 gets
    /// a Request for 3 once the gap times out.
    #[tokio::test(start_paused = true)]
    async fn test_gap_is_requested_from_peer() {
        let alice = TestDevice::founder("alice").await;
        for i in 1..=5u8 {
            alice.write(&[i]).await;
        }
        let messages = alice.handle.store().read_from(&alice.feed, 0).await.unwrap();
        let bob = TestDevice::joiner("bob", alice.space()).await;
        let mut events = bob.handle.subscribe();

        let (_ta, _tb, ca, mut cb) = channel_pair().await;
        let session = tokio::spawn(replicate(bob.handle.clone(), ca, alice.identity.public_key()));
        let _hello = completes(cb.recv()).await.unwrap().unwrap();
        cb.send(
            ReplicationMessage::Hello {
                space: alice.space(),
                timeframe: alice.handle.snapshot().replicated.clone(),
            }
            .encode(),
        )
        .await
        .unwrap();
        for seq in [0usize, 1, 2, 4, 5] {
            cb.send(ReplicationMessage::Message(messages[seq].clone()).encode())
                .await
                .unwrap();
        }

        next_event_matching(&mut events, |e| matches!(e, SpaceEvent::GapRequested { .. })).await;
        let request = loop {
            let bytes = completes(cb.recv()).await.unwrap().unwrap();
            match ReplicationMessage::decode(&bytes).unwrap() {
                ReplicationMessage::Request { feed, from_seq } => break (feed, from_seq),
                _ => continue,
            }
        };
        assert_eq!(request, (alice.feed, 3));

        cb.send(ReplicationMessage::Message(messages[3].clone()).encode())
            .await
            .unwrap();
        let mut watch = bob.handle.watch();
        watch_until(&mut watch, |s| s.replicated.get(&alice.feed) == Some(5)).await;
        assert_eq!(
            bob.reconciler.payloads(),
            (1..=5u8).map(|i| vec![i]).collect::<Vec<_>>()
        );
        session.abort();
    }

    #[tokio::test]
    async fn test_request_is_answered() {
        let alice = TestDevice::founder("alice").await;
        alice.write(b"one").await;
        let (_ta, _tb, ca, mut cb) = channel_pair().await;
        let session = tokio::spawn(replicate(alice.handle.clone(), ca, public_key("bob")));

        let _hello = completes(cb.recv()).await.unwrap().unwrap();
        // Claim to hold everything, so nothing is pushed unasked.
        cb.send(
            ReplicationMessage::Hello {
                space: alice.space(),
                timeframe: alice.handle.snapshot().replicated.clone(),
            }
            .encode(),
        )
        .await
        .unwrap();
        cb.send(
            ReplicationMessage::Request {
                feed: alice.feed,
                from_seq: 1,
            }
            .encode(),
        )
        .await
        .unwrap();

        let bytes = completes(cb.recv()).await.unwrap().unwrap();
        let ReplicationMessage::Message(message) = ReplicationMessage::decode(&bytes).unwrap() else {
            panic!("expected a message");
        };
        assert_eq!(message.seq, 1);
        let envelope = Envelope::decode(&message.payload).unwrap();
        assert_eq!(envelope.body, Body::Data(b"one".to_vec()));
        session.abort();
    }

    #[tokio::test]
    async fn test_remote_close_ends_session() {
        let alice = TestDevice::founder("alice").await;
        let (_ta, _tb, ca, mut cb) = channel_pair().await;
        let session = tokio::spawn(replicate(alice.handle.clone(), ca, public_key("bob")));
        let _hello = completes(cb.recv()).await.unwrap().unwrap();
        cb.close();
        assert_eq!(completes(session).await.unwrap(), Ok(()));
    }
}
