//! Teleport: channel multiplexer with credit-based flow control
//!
//! One [`Teleport`] session runs over one transport and carries any number
//! of named [`Channel`]s. Channel close is independent of the transport;
//! transport close ends every channel.

pub mod channel;
pub mod control;
pub mod frame;
pub mod session;

pub use channel::{Channel, ChannelReceiver, ChannelSender};
pub use control::{ControlMessage, CONTROL_CHANNEL, MAX_CHANNEL_NAME};
pub use frame::{Frame, FrameDecoder};
pub use session::Teleport;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TeleportError {
    #[error("transport closed")]
    TransportClosed,

    #[error("channel closed")]
    ChannelClosed,

    #[error("message of {size} bytes exceeds the channel window of {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("invalid channel name {0:?}")]
    InvalidChannelName(String),

    #[error("channel ids exhausted")]
    ChannelLimit,
}

pub type TeleportResult<T> = Result<T, TeleportError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TeleportConfig;
    use crate::core_transport::{MemoryTransport, Transport};
    use crate::test_utils::completes;
    use std::time::Duration;

    fn small_window() -> TeleportConfig {
        TeleportConfig {
            initial_credit: 8,
            max_frame_size: 64,
            max_message_size: 64,
        }
    }

    fn session_pair(config: TeleportConfig) -> (Teleport, Teleport) {
        let (a, b) = MemoryTransport::pair();
        (
            Teleport::new(a, true, config.clone()),
            Teleport::new(b, false, config),
        )
    }

    #[tokio::test]
    async fn test_open_accept_and_exchange() {
        let (alice, bob) = session_pair(TeleportConfig::default());
        let mut ours = alice.open_channel("replication").unwrap();
        assert_eq!(ours.id() % 2, 0);

        ours.send(b"ping".to_vec()).await.unwrap();
        let mut theirs = completes(bob.accept()).await.unwrap();
        assert_eq!(theirs.name(), "replication");
        assert_eq!(theirs.id(), ours.id());
        assert_eq!(theirs.recv().await.unwrap().unwrap(), b"ping");

        theirs.send(b"pong".to_vec()).await.unwrap();
        assert_eq!(ours.recv().await.unwrap().unwrap(), b"pong");
    }

    #[tokio::test]
    async fn test_both_sides_open_without_collision() {
        let (alice, bob) = session_pair(TeleportConfig::default());
        let a = alice.open_channel("a").unwrap();
        let b = bob.open_channel("b").unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(b.id() % 2, 1);
        assert_eq!(completes(bob.accept()).await.unwrap().name(), "a");
        assert_eq!(completes(alice.accept()).await.unwrap().name(), "b");
    }

    #[tokio::test]
    async fn test_sender_waits_for_credit() {
        let (alice, bob) = session_pair(small_window());
        let ours = alice.open_channel("flow").unwrap();
        ours.send(vec![1; 8]).await.unwrap();

        // Window exhausted: the next send must wait for the reader.
        let blocked = tokio::time::timeout(Duration::from_millis(100), ours.send(vec![2; 4])).await;
        assert!(blocked.is_err());

        let mut theirs = completes(bob.accept()).await.unwrap();
        assert_eq!(theirs.recv().await.unwrap().unwrap(), vec![1; 8]);
        completes(ours.send(vec![3; 4])).await.unwrap();
        assert_eq!(theirs.recv().await.unwrap().unwrap(), vec![3; 4]);
    }

    #[tokio::test]
    async fn test_message_larger_than_window_is_fragmented() {
        let (alice, bob) = session_pair(small_window());
        let (tx, _rx) = alice.open_channel("flow").unwrap().split();
        let message: Vec<u8> = (0..30).collect();
        let sent = message.clone();
        // Needs the reader to return credit three times over.
        let writer = tokio::spawn(async move {
            tx.send(sent).await.unwrap();
            tx.send(b"next".to_vec()).await.unwrap();
        });

        let mut theirs = completes(bob.accept()).await.unwrap();
        assert_eq!(completes(theirs.recv()).await.unwrap().unwrap(), message);
        assert_eq!(completes(theirs.recv()).await.unwrap().unwrap(), b"next");
        completes(writer).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_fragmented_sends_do_not_interleave() {
        let (alice, bob) = session_pair(small_window());
        let (tx, _rx) = alice.open_channel("flow").unwrap().split();
        let writers: Vec<_> = [1u8, 2, 3]
            .into_iter()
            .map(|fill| {
                let tx = tx.clone();
                tokio::spawn(async move { tx.send(vec![fill; 20]).await.unwrap() })
            })
            .collect();

        let mut theirs = completes(bob.accept()).await.unwrap();
        let mut received = Vec::new();
        for _ in 0..3 {
            let message = completes(theirs.recv()).await.unwrap().unwrap();
            assert_eq!(message.len(), 20);
            assert!(message.iter().all(|b| *b == message[0]));
            received.push(message[0]);
        }
        received.sort();
        assert_eq!(received, vec![1, 2, 3]);
        for writer in writers {
            completes(writer).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_message_above_limit_rejected() {
        let (alice, _bob) = session_pair(small_window());
        let ours = alice.open_channel("flow").unwrap();
        assert!(matches!(
            ours.send(vec![0; 65]).await,
            Err(TeleportError::MessageTooLarge { size: 65, max: 64 })
        ));
    }

    #[tokio::test]
    async fn test_oversized_reassembly_is_a_violation() {
        let (a, b) = MemoryTransport::pair();
        let config = TeleportConfig {
            initial_credit: 64,
            max_frame_size: 64,
            max_message_size: 16,
        };
        let bob = Teleport::new(b, false, config);
        let open = ControlMessage::Open {
            id: 2,
            name: "raw".to_string(),
        };
        a.send(Frame::data(0, open.encode()).encode()).await.unwrap();
        let mut theirs = completes(bob.accept()).await.unwrap();

        for _ in 0..3 {
            a.send(Frame::fragment(2, vec![0; 8], true).encode()).await.unwrap();
        }
        assert!(matches!(
            completes(theirs.recv()).await,
            Err(TeleportError::ProtocolViolation(_))
        ));
        // Only the channel is dropped.
        assert!(!bob.is_closed());
    }

    #[tokio::test]
    async fn test_channel_close_keeps_session() {
        let (alice, bob) = session_pair(TeleportConfig::default());
        let first = alice.open_channel("first").unwrap();
        let mut first_remote = completes(bob.accept()).await.unwrap();
        first.close();
        assert_eq!(first_remote.recv().await.unwrap(), None);
        assert_eq!(first.send(vec![1]).await, Err(TeleportError::ChannelClosed));

        let second = alice.open_channel("second").unwrap();
        second.send(b"still here".to_vec()).await.unwrap();
        let mut second_remote = completes(bob.accept()).await.unwrap();
        assert_eq!(second_remote.recv().await.unwrap().unwrap(), b"still here");
        assert!(!alice.is_closed());
    }

    #[tokio::test]
    async fn test_transport_close_fails_every_channel() {
        let (a, b) = MemoryTransport::pair();
        let alice = Teleport::new(a, true, TeleportConfig::default());
        let bob = Teleport::new(b.clone(), false, TeleportConfig::default());
        let mut one = alice.open_channel("one").unwrap();
        let mut two = alice.open_channel("two").unwrap();
        completes(bob.accept()).await.unwrap();

        b.close().await;
        completes(alice.closed()).await;
        assert_eq!(one.recv().await, Err(TeleportError::TransportClosed));
        assert_eq!(two.recv().await, Err(TeleportError::TransportClosed));
        assert_eq!(one.send(vec![1]).await, Err(TeleportError::TransportClosed));
        assert!(alice.accept().await.is_none());
        assert!(alice.open_channel("three").is_err());
    }

    #[tokio::test]
    async fn test_window_violation_is_protocol_error() {
        let (a, b) = MemoryTransport::pair();
        let bob = Teleport::new(b, false, small_window());
        // Raw peer: open channel 2 then overrun the 8 byte window.
        let open = ControlMessage::Open {
            id: 2,
            name: "raw".to_string(),
        };
        a.send(Frame::data(0, open.encode()).encode()).await.unwrap();
        a.send(Frame::data(2, vec![0; 9]).encode()).await.unwrap();

        completes(bob.closed()).await;
        assert!(matches!(
            bob.failure(),
            Some(TeleportError::ProtocolViolation(_))
        ));
        assert_eq!(a.recv().await, None);
    }

    #[tokio::test]
    async fn test_wrong_parity_open_rejected() {
        let (a, b) = MemoryTransport::pair();
        // bob is the initiator, so remote ids must be odd
        let bob = Teleport::new(b, true, TeleportConfig::default());
        let open = ControlMessage::Open {
            id: 4,
            name: "even".to_string(),
        };
        a.send(Frame::data(0, open.encode()).encode()).await.unwrap();
        completes(bob.closed()).await;
        assert!(matches!(
            bob.failure(),
            Some(TeleportError::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_split_halves_work_concurrently() {
        let (alice, bob) = session_pair(small_window());
        let (tx, _rx) = alice.open_channel("split").unwrap().split();
        let mut remote = completes(bob.accept()).await.unwrap();

        let writer = tokio::spawn(async move {
            for i in 0..20u8 {
                tx.send(vec![i; 4]).await.unwrap();
            }
        });
        for i in 0..20u8 {
            assert_eq!(remote.recv().await.unwrap().unwrap(), vec![i; 4]);
        }
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropping_session_closes_transport() {
        let (a, b) = MemoryTransport::pair();
        let alice = Teleport::new(a, true, TeleportConfig::default());
        drop(alice);
        assert_eq!(completes(b.recv()).await, None);
    }
}
