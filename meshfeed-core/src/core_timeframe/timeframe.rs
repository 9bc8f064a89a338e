/*
    timeframe.rs - Vector clock over feeds

    A Timeframe maps feed key -> highest seq seen on that feed. Sequence
    numbers start at 0, so an absent key means "nothing seen from this feed"
    and a present key with value 0 means "the first message was seen".

    Used for:
    - the replicated/processed progress of a space
    - the causal position carried by every envelope
    - computing what a peer is missing during replication

    Ordering is partial: a <= b iff every feed of a is in b with a lower or
    equal seq. Concurrent timeframes compare as None.
*/

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::core_identity::PublicKey;
use crate::wire::{put_varint, DecodeError, WireReader};

/// Upper bound on entries accepted by the decoder
pub const MAX_TIMEFRAME_ENTRIES: u64 = 65_536;

/// Highest sequence number a feed can reach. One below `u64::MAX` so the
/// successor of any valid seq is representable.
pub const MAX_SEQ: u64 = u64::MAX - 1;

/// Inclusive range of sequence numbers on one feed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedRange {
    pub feed: PublicKey,
    pub from: u64,
    pub to: u64,
}

impl FeedRange {
    /// Number of messages in the range (never zero)
    pub fn count(&self) -> u64 {
        (self.to - self.from).saturating_add(1)
    }
}

/// A message position in a space
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub feed: PublicKey,
    pub seq: u64,
}

impl Position {
    pub fn new(feed: PublicKey, seq: u64) -> Self {
        Self { feed, seq }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timeframe {
    frames: BTreeMap<PublicKey, u64>,
}

impl Timeframe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, feed: &PublicKey) -> Option<u64> {
        self.frames.get(feed).copied()
    }

    /// Overwrite the entry for `feed`, even if it moves backwards.
    pub fn set(&mut self, feed: PublicKey, seq: u64) {
        self.frames.insert(feed, seq);
    }

    /// Raise `feed` to `seq` if that is new. Returns whether it changed.
    pub fn advance(&mut self, feed: PublicKey, seq: u64) -> bool {
        if self.is_new(&feed, seq) {
            self.frames.insert(feed, seq);
            true
        } else {
            false
        }
    }

    /// Pointwise max. Never decreases a component.
    pub fn merge(&mut self, other: &Timeframe) {
        for (feed, &seq) in &other.frames {
            self.advance(*feed, seq);
        }
    }

    pub fn merged(mut self, other: &Timeframe) -> Timeframe {
        self.merge(other);
        self
    }

    pub fn is_subset_of(&self, other: &Timeframe) -> bool {
        self.frames
            .iter()
            .all(|(feed, &seq)| other.get(feed).is_some_and(|theirs| seq <= theirs))
    }

    /// Whether `(feed, seq)` has not been seen yet
    pub fn is_new(&self, feed: &PublicKey, seq: u64) -> bool {
        self.get(feed).map_or(true, |seen| seq > seen)
    }

    /// Whether `(feed, seq)` is covered
    pub fn contains(&self, feed: &PublicKey, seq: u64) -> bool {
        !self.is_new(feed, seq)
    }

    /// The seq that would extend `feed` contiguously
    pub fn next_seq(&self, feed: &PublicKey) -> u64 {
        self.get(feed).map_or(0, |seen| seen.saturating_add(1))
    }

    /// Ranges present here that `theirs` has not seen, in feed order.
    pub fn missing_ranges(&self, theirs: &Timeframe) -> Vec<FeedRange> {
        self.frames
            .iter()
            .filter_map(|(feed, &mine)| {
                let from = theirs.next_seq(feed);
                (from <= mine).then_some(FeedRange {
                    feed: *feed,
                    from,
                    to: mine,
                })
            })
            .collect()
    }

    /// Total number of messages covered (seq is zero based)
    pub fn total_messages(&self) -> u64 {
        self.frames
            .values()
            .fold(0u64, |total, seq| total.saturating_add(seq.saturating_add(1)))
    }

    pub fn feeds(&self) -> impl Iterator<Item = &PublicKey> {
        self.frames.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PublicKey, &u64)> {
        self.frames.iter()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// `count varint | (key 32 | seq varint)*`, keys ascending
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        put_varint(buf, self.frames.len() as u64);
        for (feed, &seq) in &self.frames {
            buf.extend_from_slice(feed.as_bytes());
            put_varint(buf, seq);
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + self.frames.len() * 34);
        self.encode_into(&mut buf);
        buf
    }

    pub fn decode_from(reader: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        let count = reader.read_varint()?;
        if count > MAX_TIMEFRAME_ENTRIES {
            return Err(DecodeError::Invalid(format!(
                "timeframe with {} entries",
                count
            )));
        }
        let mut frames = BTreeMap::new();
        let mut last: Option<PublicKey> = None;
        for _ in 0..count {
            let feed = reader.read_key()?;
            let seq = reader.read_varint()?;
            if seq > MAX_SEQ {
                return Err(DecodeError::Invalid(format!("seq {} out of range", seq)));
            }
            if last.is_some_and(|prev| prev >= feed) {
                return Err(DecodeError::Invalid(
                    "timeframe keys not strictly ascending".to_string(),
                ));
            }
            last = Some(feed);
            frames.insert(feed, seq);
        }
        Ok(Self { frames })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = WireReader::new(bytes);
        let tf = Self::decode_from(&mut reader)?;
        reader.finish()?;
        Ok(tf)
    }
}

impl PartialOrd for Timeframe {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self.is_subset_of(other), other.is_subset_of(self)) {
            (true, true) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Less),
            (false, true) => Some(Ordering::Greater),
            (false, false) => None,
        }
    }
}

impl FromIterator<(PublicKey, u64)> for Timeframe {
    fn from_iter<I: IntoIterator<Item = (PublicKey, u64)>>(iter: I) -> Self {
        let mut tf = Timeframe::new();
        for (feed, seq) in iter {
            tf.advance(feed, seq);
        }
        tf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(n: u8) -> PublicKey {
        PublicKey::from_bytes([n; 32])
    }

    #[test]
    fn test_absent_means_nothing_seen() {
        let tf = Timeframe::new();
        assert_eq!(tf.get(&key(1)), None);
        assert!(tf.is_new(&key(1), 0));
        assert_eq!(tf.next_seq(&key(1)), 0);
        assert_eq!(tf.total_messages(), 0);
    }

    #[test]
    fn test_advance_is_monotonic() {
        let mut tf = Timeframe::new();
        assert!(tf.advance(key(1), 3));
        assert!(!tf.advance(key(1), 2));
        assert!(!tf.advance(key(1), 3));
        assert_eq!(tf.get(&key(1)), Some(3));
        assert!(!tf.is_new(&key(1), 3));
        assert!(tf.is_new(&key(1), 4));
    }

    #[test]
    fn test_merge_takes_pointwise_max() {
        let a: Timeframe = [(key(1), 5), (key(2), 1)].into_iter().collect();
        let b: Timeframe = [(key(1), 2), (key(3), 7)].into_iter().collect();
        let merged = a.clone().merged(&b);
        assert_eq!(merged.get(&key(1)), Some(5));
        assert_eq!(merged.get(&key(2)), Some(1));
        assert_eq!(merged.get(&key(3)), Some(7));
        assert!(a.is_subset_of(&merged));
        assert!(b.is_subset_of(&merged));
    }

    #[test]
    fn test_partial_order() {
        let a: Timeframe = [(key(1), 1)].into_iter().collect();
        let b: Timeframe = [(key(1), 2)].into_iter().collect();
        let c: Timeframe = [(key(2), 0)].into_iter().collect();
        assert!(a < b);
        assert!(b > a);
        assert_eq!(a.partial_cmp(&c), None);
        assert!(Timeframe::new() <= a);
    }

    #[test]
    fn test_missing_ranges() {
        let mine: Timeframe = [(key(1), 4), (key(2), 2), (key(3), 0)].into_iter().collect();
        let theirs: Timeframe = [(key(1), 1), (key(2), 5)].into_iter().collect();
        let ranges = mine.missing_ranges(&theirs);
        assert_eq!(
            ranges,
            vec![
                FeedRange { feed: key(1), from: 2, to: 4 },
                FeedRange { feed: key(3), from: 0, to: 0 },
            ]
        );
        assert_eq!(ranges[0].count(), 3);
    }

    #[test]
    fn test_total_messages_counts_zero_based() {
        let tf: Timeframe = [(key(1), 0), (key(2), 9)].into_iter().collect();
        assert_eq!(tf.total_messages(), 11);
    }

    #[test]
    fn test_decode_rejects_unsorted_keys() {
        let mut buf = Vec::new();
        put_varint(&mut buf, 2);
        buf.extend_from_slice(&[2u8; 32]);
        put_varint(&mut buf, 0);
        buf.extend_from_slice(&[1u8; 32]);
        put_varint(&mut buf, 0);
        assert!(matches!(Timeframe::decode(&buf), Err(DecodeError::Invalid(_))));
    }

    #[test]
    fn test_decode_rejects_truncated() {
        let tf: Timeframe = [(key(1), 300)].into_iter().collect();
        let bytes = tf.encode();
        assert!(Timeframe::decode(&bytes[..bytes.len() - 1]).is_err());
        assert_eq!(Timeframe::decode(&bytes).unwrap(), tf);
    }

    #[test]
    fn test_decode_rejects_seq_without_successor() {
        let mut buf = Vec::new();
        put_varint(&mut buf, 1);
        buf.extend_from_slice(&[1u8; 32]);
        put_varint(&mut buf, u64::MAX);
        assert!(matches!(Timeframe::decode(&buf), Err(DecodeError::Invalid(_))));

        let edge: Timeframe = [(key(1), MAX_SEQ)].into_iter().collect();
        assert_eq!(Timeframe::decode(&edge.encode()).unwrap(), edge);
    }

    #[test]
    fn test_arithmetic_saturates_at_the_top() {
        let mut tf = Timeframe::new();
        tf.set(key(1), u64::MAX);
        tf.set(key(2), 4);
        assert_eq!(tf.next_seq(&key(1)), u64::MAX);
        assert_eq!(tf.total_messages(), u64::MAX);
        let range = FeedRange { feed: key(1), from: 0, to: u64::MAX };
        assert_eq!(range.count(), u64::MAX);
    }

    fn arb_timeframe() -> impl Strategy<Value = Timeframe> {
        prop::collection::vec((0u8..6, 0u64..50), 0..8)
            .prop_map(|entries| entries.into_iter().map(|(k, s)| (key(k), s)).collect())
    }

    proptest! {
        #[test]
        fn prop_merge_never_decreases(a in arb_timeframe(), b in arb_timeframe()) {
            let merged = a.clone().merged(&b);
            prop_assert!(a.is_subset_of(&merged));
            prop_assert!(b.is_subset_of(&merged));
        }

        #[test]
        fn prop_merge_commutative(a in arb_timeframe(), b in arb_timeframe()) {
            prop_assert_eq!(a.clone().merged(&b), b.clone().merged(&a));
        }

        #[test]
        fn prop_merge_idempotent(a in arb_timeframe()) {
            prop_assert_eq!(a.clone().merged(&a), a);
        }

        #[test]
        fn prop_missing_ranges_close_the_gap(a in arb_timeframe(), b in arb_timeframe()) {
            let mut theirs = b.clone();
            for range in a.missing_ranges(&b) {
                theirs.advance(range.feed, range.to);
            }
            prop_assert!(a.is_subset_of(&theirs));
        }
    }
}
