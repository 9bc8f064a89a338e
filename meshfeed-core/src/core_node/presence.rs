/*
    presence.rs - Liveness over the "presence" channel

    Every connection carries two presence channels, one opened by each
    side. A side only sends Alive on its own channel and only reads the
    remote's:

        own channel     ── Alive every alive_interval ──►
        remote channel  ◄── Alive ── resets the peer_timeout deadline

    A remote channel that stays silent for peer_timeout, or never shows
    up, means the transport is half-open: the connection is closed and the
    swarm treats it as lost.

        Alive   tag 0x01 | counter varint
*/

use metrics::counter;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::config::PresenceConfig;
use crate::core_runtime::spawn_owned;
use crate::core_swarm::Connection;
use crate::core_teleport::{Channel, ChannelSender, TeleportResult};
use crate::wire::{put_varint, DecodeError, WireReader};

/// Name of the teleport channel liveness runs on
pub const PRESENCE_CHANNEL: &str = "presence";

const TAG_ALIVE: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alive {
    /// Alive messages sent before this one on the channel
    pub counter: u64,
}

impl Alive {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![TAG_ALIVE];
        put_varint(&mut buf, self.counter);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = WireReader::new(bytes);
        let tag = reader.read_u8()?;
        if tag != TAG_ALIVE {
            return Err(DecodeError::UnknownTag {
                what: "presence message",
                tag,
            });
        }
        let counter = reader.read_varint()?;
        reader.finish()?;
        Ok(Self { counter })
    }
}

/// How [`keep_alive`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceOutcome {
    /// The peer went silent and the connection was closed
    TimedOut,
    ConnectionClosed,
}

async fn announce(own: ChannelSender, every: std::time::Duration) {
    let mut ticks = interval(every);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut counter = 0u64;
    loop {
        ticks.tick().await;
        if own.send(Alive { counter }.encode()).await.is_err() {
            return;
        }
        counter += 1;
    }
}

async fn next_message(inbound: &mut Option<Channel>) -> TeleportResult<Option<Vec<u8>>> {
    match inbound {
        Some(channel) => channel.recv().await,
        None => std::future::pending().await,
    }
}

/// Announce this side and watch the peer on `connection` until either the
/// peer times out or the connection closes. `remote` delivers the presence
/// channels the peer opens.
pub async fn keep_alive(
    connection: Arc<Connection>,
    mut remote: mpsc::UnboundedReceiver<Channel>,
    config: PresenceConfig,
) -> PresenceOutcome {
    let peer = *connection.remote();
    let own = match connection.open_channel(PRESENCE_CHANNEL) {
        Ok(channel) => channel,
        Err(err) => {
            debug!(peer = %peer.short(), error = %err, "No presence on a closed connection");
            return PresenceOutcome::ConnectionClosed;
        }
    };
    let (own, _) = own.split();
    let _announcer = spawn_owned(announce(own, config.alive_interval));

    let deadline = sleep(config.peer_timeout);
    tokio::pin!(deadline);
    let mut inbound: Option<Channel> = None;

    loop {
        tokio::select! {
            _ = &mut deadline => {
                warn!(peer = %peer.short(), timeout = ?config.peer_timeout, "Peer went silent, closing connection");
                counter!("presence.timeouts").increment(1);
                connection.close();
                return PresenceOutcome::TimedOut;
            }
            _ = connection.closed() => return PresenceOutcome::ConnectionClosed,
            channel = remote.recv() => match channel {
                Some(channel) => inbound = Some(channel),
                None => return PresenceOutcome::ConnectionClosed,
            },
            received = next_message(&mut inbound) => match received {
                Ok(Some(bytes)) => match Alive::decode(&bytes) {
                    Ok(alive) => {
                        trace!(peer = %peer.short(), counter = alive.counter, "Alive");
                        deadline.as_mut().reset(Instant::now() + config.peer_timeout);
                    }
                    Err(err) => {
                        debug!(peer = %peer.short(), error = %err, "Malformed presence message, closing channel");
                        if let Some(channel) = inbound.take() {
                            channel.close();
                        }
                    }
                },
                Ok(None) | Err(_) => inbound = None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TeleportConfig;
    use crate::core_runtime::AbortingJoinHandle;
    use crate::core_swarm::ConnectionState;
    use crate::core_transport::{MemoryTransport, SessionId};
    use crate::test_utils::{completes, public_key};
    use std::time::Duration;

    fn config() -> PresenceConfig {
        PresenceConfig {
            alive_interval: Duration::from_secs(1),
            peer_timeout: Duration::from_secs(3),
        }
    }

    fn connection_pair() -> (Arc<Connection>, Arc<Connection>) {
        let topic = public_key("topic");
        let session = SessionId::new();
        let (a, b) = MemoryTransport::pair();
        (
            Connection::new(topic, public_key("bob"), session, a, true, TeleportConfig::default()),
            Connection::new(topic, public_key("alice"), session, b, false, TeleportConfig::default()),
        )
    }

    /// Hand every presence channel the peer opens to a receiver.
    fn route(connection: Arc<Connection>) -> (mpsc::UnboundedReceiver<Channel>, AbortingJoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = spawn_owned(async move {
            while let Some(channel) = connection.accept_channel().await {
                if channel.name() == PRESENCE_CHANNEL {
                    let _ = tx.send(channel);
                }
            }
        });
        (rx, task)
    }

    fn watch(connection: &Arc<Connection>) -> (AbortingJoinHandle<PresenceOutcome>, AbortingJoinHandle<()>) {
        let (rx, router) = route(connection.clone());
        (spawn_owned(keep_alive(connection.clone(), rx, config())), router)
    }

    #[test]
    fn test_alive_codec() {
        let alive = Alive { counter: 300 };
        assert_eq!(alive.encode(), vec![TAG_ALIVE, 0xac, 0x02]);
        assert_eq!(Alive::decode(&alive.encode()).unwrap(), alive);
        assert!(matches!(
            Alive::decode(&[0x09, 0x00]),
            Err(DecodeError::UnknownTag { tag: 0x09, .. })
        ));
        assert!(Alive::decode(&[TAG_ALIVE, 0x00, 0x00]).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_peers_stay_connected() {
        let (a, b) = connection_pair();
        let (_alice, _alice_router) = watch(&a);
        let (_bob, _bob_router) = watch(&b);

        sleep(Duration::from_secs(30)).await;
        assert_eq!(a.state(), ConnectionState::Connected);
        assert_eq!(b.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_is_disconnected() {
        let (a, b) = connection_pair();
        let (alice, _alice_router) = watch(&a);
        let (bob, bob_router) = watch(&b);
        sleep(Duration::from_secs(5)).await;

        // Bob's transport stays open but nothing is sent on it any more.
        drop(bob);
        drop(bob_router);
        let started = Instant::now();
        assert_eq!(completes(alice).await.unwrap(), PresenceOutcome::TimedOut);
        assert!(started.elapsed() <= Duration::from_secs(3));
        assert_eq!(a.state(), ConnectionState::Closed);
        completes(b.closed()).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_without_presence_times_out() {
        let (a, _b) = connection_pair();
        let (alice, _router) = watch(&a);
        assert_eq!(completes(alice).await.unwrap(), PresenceOutcome::TimedOut);
        assert_eq!(a.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_connection_ends_watch() {
        let (a, b) = connection_pair();
        let (alice, _router) = watch(&a);
        b.close();
        assert_eq!(
            completes(alice).await.unwrap(),
            PresenceOutcome::ConnectionClosed
        );
    }
}
