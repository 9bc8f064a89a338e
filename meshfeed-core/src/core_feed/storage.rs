//! Storage backends for feeds
//!
//! [`FeedStorage`] is the seam to a real persistence layer. It stores
//! already-verified messages and enforces only the append-only shape of each
//! feed (next seq must equal current length). [`MemoryStorage`] backs tests
//! and the simulator.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{FeedError, FeedMessage, FeedResult};
use crate::core_identity::PublicKey;

#[async_trait]
pub trait FeedStorage: Send + Sync + std::fmt::Debug {
    /// Append `message`; its seq must equal the current length of its feed.
    /// Returns the stored seq.
    async fn append(&self, message: FeedMessage) -> FeedResult<u64>;

    /// Messages with `from <= seq <= to`, in order.
    async fn read_range(&self, feed: &PublicKey, from: u64, to: u64) -> FeedResult<Vec<FeedMessage>>;

    async fn get(&self, feed: &PublicKey, seq: u64) -> FeedResult<Option<FeedMessage>>;

    /// Number of stored messages in `feed` (0 for unknown feeds)
    async fn len(&self, feed: &PublicKey) -> FeedResult<u64>;

    async fn feeds(&self) -> FeedResult<Vec<PublicKey>>;

    async fn read_from(&self, feed: &PublicKey, from: u64) -> FeedResult<Vec<FeedMessage>> {
        self.read_range(feed, from, u64::MAX).await
    }
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    feeds: RwLock<HashMap<PublicKey, Vec<FeedMessage>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FeedStorage for MemoryStorage {
    async fn append(&self, message: FeedMessage) -> FeedResult<u64> {
        let mut feeds = self.feeds.write().await;
        let entries = feeds.entry(message.feed_key).or_default();
        let expected = entries.len() as u64;
        if message.seq != expected {
            return Err(FeedError::SequenceMismatch {
                feed: message.feed_key,
                expected,
                actual: message.seq,
            });
        }
        entries.push(message);
        Ok(expected)
    }

    async fn read_range(&self, feed: &PublicKey, from: u64, to: u64) -> FeedResult<Vec<FeedMessage>> {
        let feeds = self.feeds.read().await;
        let Some(entries) = feeds.get(feed) else {
            return Ok(Vec::new());
        };
        let len = entries.len() as u64;
        if from >= len || from > to {
            return Ok(Vec::new());
        }
        let end = to.saturating_add(1).min(len);
        Ok(entries[from as usize..end as usize].to_vec())
    }

    async fn get(&self, feed: &PublicKey, seq: u64) -> FeedResult<Option<FeedMessage>> {
        let feeds = self.feeds.read().await;
        Ok(feeds
            .get(feed)
            .and_then(|entries| usize::try_from(seq).ok().and_then(|i| entries.get(i)))
            .cloned())
    }

    async fn len(&self, feed: &PublicKey) -> FeedResult<u64> {
        let feeds = self.feeds.read().await;
        Ok(feeds.get(feed).map_or(0, |entries| entries.len() as u64))
    }

    async fn feeds(&self) -> FeedResult<Vec<PublicKey>> {
        let feeds = self.feeds.read().await;
        let mut keys: Vec<_> = feeds.keys().copied().collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_identity::Keypair;

    #[tokio::test]
    async fn test_append_requires_contiguous_seq() {
        let storage = MemoryStorage::new();
        let kp = Keypair::derive("storage");
        assert_eq!(storage.append(FeedMessage::sign(&kp, 0, vec![0])).await.unwrap(), 0);

        let err = storage
            .append(FeedMessage::sign(&kp, 2, vec![2]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FeedError::SequenceMismatch { expected: 1, actual: 2, .. }
        ));
        assert_eq!(storage.len(&kp.public_key()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_read_range_bounds() {
        let storage = MemoryStorage::new();
        let kp = Keypair::derive("storage");
        for seq in 0..5 {
            storage
                .append(FeedMessage::sign(&kp, seq, vec![seq as u8]))
                .await
                .unwrap();
        }
        let feed = kp.public_key();
        let range = storage.read_range(&feed, 1, 3).await.unwrap();
        assert_eq!(range.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(storage.read_from(&feed, 3).await.unwrap().len(), 2);
        assert!(storage.read_from(&feed, 9).await.unwrap().is_empty());
        assert_eq!(storage.get(&feed, 4).await.unwrap().unwrap().payload, vec![4]);
        assert!(storage.get(&feed, 5).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_feed_is_empty() {
        let storage = MemoryStorage::new();
        let feed = Keypair::derive("nobody").public_key();
        assert_eq!(storage.len(&feed).await.unwrap(), 0);
        assert!(storage.read_from(&feed, 0).await.unwrap().is_empty());
        assert!(storage.feeds().await.unwrap().is_empty());
    }
}
