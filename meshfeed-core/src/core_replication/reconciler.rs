//! Application seam for causally ordered data

use std::fmt;
use std::sync::Mutex;

use crate::core_identity::PublicKey;

/// Receives every authorized data entry of a space exactly once, after all
/// entries in its causal past.
pub trait DocumentReconciler: Send + Sync + fmt::Debug {
    fn apply_ordered(&self, feed: &PublicKey, seq: u64, payload: &[u8]);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedEntry {
    pub feed: PublicKey,
    pub seq: u64,
    pub payload: Vec<u8>,
}

/// Keeps applied entries in order
#[derive(Debug, Default)]
pub struct MemoryReconciler {
    entries: Mutex<Vec<AppliedEntry>>,
}

impl MemoryReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AppliedEntry> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|e| e.payload.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DocumentReconciler for MemoryReconciler {
    fn apply_ordered(&self, feed: &PublicKey, seq: u64, payload: &[u8]) {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(AppliedEntry {
                feed: *feed,
                seq,
                payload: payload.to_vec(),
            });
    }
}
