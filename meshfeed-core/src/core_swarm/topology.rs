//! Topology strategies
//!
//! A topology turns "who is out there" into "who should I be connected
//! to". The network manager calls it on every reconcile and opens or
//! closes connections to match.

use std::collections::BTreeSet;
use std::fmt;

use crate::core_identity::PublicKey;

pub trait Topology: Send + Sync + fmt::Debug {
    /// Peers this node wants a connection to. Never contains `local`.
    fn desired(
        &self,
        local: &PublicKey,
        discovered: &BTreeSet<PublicKey>,
        connected: &BTreeSet<PublicKey>,
    ) -> BTreeSet<PublicKey>;
}

/// Connect to every discovered peer. Live connections stay desired even
/// after the peer drops out of discovery.
#[derive(Debug, Clone, Copy, Default)]
pub struct FullMesh;

impl Topology for FullMesh {
    fn desired(
        &self,
        local: &PublicKey,
        discovered: &BTreeSet<PublicKey>,
        connected: &BTreeSet<PublicKey>,
    ) -> BTreeSet<PublicKey> {
        discovered
            .union(connected)
            .filter(|peer| *peer != local)
            .copied()
            .collect()
    }
}

/// Everyone connects to `center` only; the center connects to everyone.
#[derive(Debug, Clone, Copy)]
pub struct Star {
    pub center: PublicKey,
}

impl Star {
    pub fn new(center: PublicKey) -> Self {
        Self { center }
    }
}

impl Topology for Star {
    fn desired(
        &self,
        local: &PublicKey,
        discovered: &BTreeSet<PublicKey>,
        connected: &BTreeSet<PublicKey>,
    ) -> BTreeSet<PublicKey> {
        if *local == self.center {
            return FullMesh.desired(local, discovered, connected);
        }
        let mut out = BTreeSet::new();
        if discovered.contains(&self.center) || connected.contains(&self.center) {
            out.insert(self.center);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_identity::Keypair;

    fn keys(labels: &[&str]) -> BTreeSet<PublicKey> {
        labels
            .iter()
            .map(|l| Keypair::derive(l).public_key())
            .collect()
    }

    fn key(label: &str) -> PublicKey {
        Keypair::derive(label).public_key()
    }

    #[test]
    fn test_full_mesh_wants_everyone_but_self() {
        let discovered = keys(&["a", "b", "c"]);
        let desired = FullMesh.desired(&key("a"), &discovered, &BTreeSet::new());
        assert_eq!(desired, keys(&["b", "c"]));
    }

    #[test]
    fn test_full_mesh_keeps_connected_peers() {
        let desired = FullMesh.desired(&key("a"), &keys(&["b"]), &keys(&["c"]));
        assert_eq!(desired, keys(&["b", "c"]));
    }

    #[test]
    fn test_star_leaf_wants_only_center() {
        let star = Star::new(key("hub"));
        let discovered = keys(&["hub", "b", "c"]);
        assert_eq!(star.desired(&key("b"), &discovered, &BTreeSet::new()), keys(&["hub"]));
    }

    #[test]
    fn test_star_leaf_without_center_wants_nobody() {
        let star = Star::new(key("hub"));
        assert!(star
            .desired(&key("b"), &keys(&["c", "d"]), &BTreeSet::new())
            .is_empty());
    }

    #[test]
    fn test_star_center_wants_all_leaves() {
        let star = Star::new(key("hub"));
        let discovered = keys(&["b", "c"]);
        assert_eq!(star.desired(&key("hub"), &discovered, &BTreeSet::new()), discovered);
    }
}
