/*
    FeedStore

    Device-level view over a FeedStorage backend.

    - Owned feeds: this device holds the feed keypair and is the single
      writer. append(feed, payload) serialises writers per feed, signs the
      next seq and stores it.
    - Replicas: insert_replica(message) verifies the signature and stores a
      remote message at exactly the next seq.

    Readers go straight to the backend; nothing here blocks them.
*/

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use super::{FeedError, FeedMessage, FeedResult, FeedStorage, MAX_PAYLOAD_SIZE};
use crate::core_identity::{Keypair, PublicKey};

#[derive(Debug)]
struct OwnedFeed {
    keypair: Keypair,
    writer: Mutex<()>,
}

#[derive(Debug, Clone)]
pub struct FeedStore {
    storage: Arc<dyn FeedStorage>,
    owned: Arc<RwLock<HashMap<PublicKey, Arc<OwnedFeed>>>>,
}

impl FeedStore {
    pub fn new(storage: Arc<dyn FeedStorage>) -> Self {
        Self {
            storage,
            owned: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn storage(&self) -> &Arc<dyn FeedStorage> {
        &self.storage
    }

    /// Generate a new feed keypair owned by this device.
    pub async fn create_feed(&self) -> PublicKey {
        self.add_owned(Keypair::generate()).await
    }

    pub async fn add_owned(&self, keypair: Keypair) -> PublicKey {
        let key = keypair.public_key();
        self.owned.write().await.entry(key).or_insert_with(|| {
            Arc::new(OwnedFeed {
                keypair,
                writer: Mutex::new(()),
            })
        });
        debug!(feed = %key.short(), "Registered owned feed");
        key
    }

    pub async fn is_owned(&self, feed: &PublicKey) -> bool {
        self.owned.read().await.contains_key(feed)
    }

    /// Sign and store `payload` as the next entry of an owned feed.
    pub async fn append(&self, feed: &PublicKey, payload: Vec<u8>) -> FeedResult<FeedMessage> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(FeedError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let owned = self
            .owned
            .read()
            .await
            .get(feed)
            .cloned()
            .ok_or(FeedError::NotOwner(*feed))?;

        let _writer = owned.writer.lock().await;
        let seq = self.storage.len(feed).await?;
        let message = FeedMessage::sign(&owned.keypair, seq, payload);
        self.storage.append(message.clone()).await?;
        debug!(feed = %feed.short(), seq, "Appended to owned feed");
        Ok(message)
    }

    /// Store a verified remote message. Its seq must be the next one.
    pub async fn insert_replica(&self, message: FeedMessage) -> FeedResult<u64> {
        if !message.verify() {
            return Err(FeedError::InvalidSignature {
                feed: message.feed_key,
                seq: message.seq,
            });
        }
        self.storage.append(message).await
    }

    pub async fn read_from(&self, feed: &PublicKey, from: u64) -> FeedResult<Vec<FeedMessage>> {
        self.storage.read_from(feed, from).await
    }

    pub async fn read_range(&self, feed: &PublicKey, from: u64, to: u64) -> FeedResult<Vec<FeedMessage>> {
        self.storage.read_range(feed, from, to).await
    }

    pub async fn get(&self, feed: &PublicKey, seq: u64) -> FeedResult<Option<FeedMessage>> {
        self.storage.get(feed, seq).await
    }

    pub async fn len(&self, feed: &PublicKey) -> FeedResult<u64> {
        self.storage.len(feed).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_feed::MemoryStorage;

    fn store() -> FeedStore {
        FeedStore::new(Arc::new(MemoryStorage::new()))
    }

    #[tokio::test]
    async fn test_owned_append_assigns_contiguous_seqs() {
        let store = store();
        let feed = store.create_feed().await;
        for expected in 0..3 {
            let msg = store.append(&feed, vec![expected as u8]).await.unwrap();
            assert_eq!(msg.seq, expected);
            assert!(msg.verify());
        }
        assert_eq!(store.len(&feed).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_append_to_foreign_feed_rejected() {
        let store = store();
        let foreign = Keypair::derive("someone else").public_key();
        assert!(matches!(
            store.append(&foreign, vec![1]).await,
            Err(FeedError::NotOwner(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_writers_do_not_collide() {
        let store = store();
        let feed = store.create_feed().await;
        let mut tasks = Vec::new();
        for i in 0..16u8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move { store.append(&feed, vec![i]).await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        let all = store.read_from(&feed, 0).await.unwrap();
        assert_eq!(all.len(), 16);
        assert!(all.iter().enumerate().all(|(i, m)| m.seq == i as u64));
    }

    #[tokio::test]
    async fn test_insert_replica_verifies_and_orders() {
        let store = store();
        let remote = Keypair::derive("remote");
        let first = FeedMessage::sign(&remote, 0, b"a".to_vec());
        let second = FeedMessage::sign(&remote, 1, b"b".to_vec());

        assert!(matches!(
            store.insert_replica(second.clone()).await,
            Err(FeedError::SequenceMismatch { expected: 0, actual: 1, .. })
        ));
        store.insert_replica(first).await.unwrap();
        store.insert_replica(second).await.unwrap();

        let mut forged = FeedMessage::sign(&remote, 2, b"c".to_vec());
        forged.payload = b"evil".to_vec();
        assert!(matches!(
            store.insert_replica(forged).await,
            Err(FeedError::InvalidSignature { seq: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_payload_limit() {
        let store = store();
        let feed = store.create_feed().await;
        let err = store
            .append(&feed, vec![0; MAX_PAYLOAD_SIZE + 1])
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::PayloadTooLarge { .. }));
    }
}
