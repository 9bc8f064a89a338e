//! Test fixtures
//!
//! Fast configurations for actor tests, deterministic keys and
//! [`TestDevice`], one device's view of a space without any networking.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{MeshConfig, PresenceConfig, ReplicationConfig, SignalingConfig, SwarmConfig};
use crate::core_credentials::{Credential, Role};
use crate::core_feed::{FeedStore, MemoryStorage};
use crate::core_identity::{Keypair, PublicKey};
use crate::core_replication::{MemoryReconciler, SpaceEngine, SpaceHandle};

/// Signaling settings that give up and retry quickly
pub fn fast_signaling_config() -> SignalingConfig {
    SignalingConfig {
        request_timeout: Duration::from_secs(2),
        reconnect_base: Duration::from_millis(20),
        reconnect_cap: Duration::from_millis(100),
        max_reconnect_attempts: 3,
    }
}

pub fn fast_swarm_config() -> SwarmConfig {
    SwarmConfig {
        tick_interval: Duration::from_millis(20),
        connect_timeout: Duration::from_secs(2),
        retry_base: Duration::from_millis(10),
        retry_cap: Duration::from_millis(100),
        max_retries: 5,
        unreachable_cooldown: Duration::from_secs(60),
        passive_grace: Duration::from_millis(300),
    }
}

pub fn fast_presence_config() -> PresenceConfig {
    PresenceConfig {
        alive_interval: Duration::from_millis(500),
        peer_timeout: Duration::from_secs(3),
    }
}

pub fn fast_replication_config() -> ReplicationConfig {
    ReplicationConfig {
        gap_timeout: Duration::from_millis(200),
        handshake_timeout: Duration::from_secs(2),
        progress_interval: Duration::from_millis(100),
        ..Default::default()
    }
}

pub fn fast_mesh_config() -> MeshConfig {
    MeshConfig {
        signaling: fast_signaling_config(),
        swarm: fast_swarm_config(),
        presence: fast_presence_config(),
        replication: fast_replication_config(),
        ..Default::default()
    }
}

/// Deterministic keypair for `label`
pub fn keypair(label: &str) -> Keypair {
    Keypair::derive(label)
}

pub fn public_key(label: &str) -> PublicKey {
    Keypair::derive(label).public_key()
}

pub fn memory_store() -> FeedStore {
    FeedStore::new(Arc::new(MemoryStorage::new()))
}

/// One device of a space: identity, device feed and engine.
pub struct TestDevice {
    pub identity: Keypair,
    pub feed: PublicKey,
    pub handle: SpaceHandle,
    pub reconciler: Arc<MemoryReconciler>,
}

impl TestDevice {
    /// Create a space. Its genesis feed (keyed `"<label> space"`) doubles
    /// as the founder's device feed.
    pub async fn founder(label: &str) -> Self {
        let identity = keypair(label);
        let store = memory_store();
        let feed = store.add_owned(keypair(&format!("{} space", label))).await;
        let reconciler = Arc::new(MemoryReconciler::new());
        let handle = SpaceEngine::spawn(feed, store, reconciler.clone(), fast_replication_config());
        handle
            .write_credential(
                feed,
                Credential::AdmitKey {
                    subject: identity.public_key(),
                    role: Role::Owner,
                },
            )
            .await
            .unwrap();
        Self {
            identity,
            feed,
            handle,
            reconciler,
        }
    }

    /// A device for `space` with its own feed keyed `"<label> device"`.
    pub async fn joiner(label: &str, space: PublicKey) -> Self {
        let store = memory_store();
        let feed = store.add_owned(keypair(&format!("{} device", label))).await;
        let reconciler = Arc::new(MemoryReconciler::new());
        let handle = SpaceEngine::spawn(space, store, reconciler.clone(), fast_replication_config());
        Self {
            identity: keypair(label),
            feed,
            handle,
            reconciler,
        }
    }

    pub fn space(&self) -> PublicKey {
        *self.handle.space()
    }

    /// Hand every entry this device has and `other` lacks to `other`.
    pub async fn sync_to(&self, other: &TestDevice) {
        let theirs = other.handle.snapshot().replicated.clone();
        for range in self.handle.snapshot().replicated.missing_ranges(&theirs) {
            let messages = self
                .handle
                .store()
                .read_range(&range.feed, range.from, range.to)
                .await
                .unwrap();
            for message in messages {
                other.handle.ingest(message).await.unwrap();
            }
        }
    }

    /// Admit `member` with `role` and bind its device feed, exchanging
    /// entries directly.
    pub async fn admit(&self, member: &TestDevice, role: Role) {
        self.handle
            .write_credential(
                self.feed,
                Credential::AdmitKey {
                    subject: member.identity.public_key(),
                    role,
                },
            )
            .await
            .unwrap();
        self.sync_to(member).await;
        member
            .handle
            .write_credential(
                member.feed,
                Credential::admit_feed(&member.space(), member.feed, &member.identity),
            )
            .await
            .unwrap();
        member.sync_to(self).await;
    }

    pub async fn write(&self, data: &[u8]) {
        self.handle.write_data(self.feed, data.to_vec()).await.unwrap();
    }
}
