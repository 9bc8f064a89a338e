//! Assertions over space state
//!
//! Panicking helpers whose messages name the feeds and members involved,
//! which plain `assert_eq!` on whole snapshots does not.

use crate::core_credentials::Role;
use crate::core_identity::PublicKey;
use crate::core_replication::SpaceSnapshot;
use crate::core_timeframe::Timeframe;

/// Assert that `timeframe` has seen `feed` up to exactly `seq`
pub fn assert_seen(timeframe: &Timeframe, feed: &PublicKey, seq: u64) {
    match timeframe.get(feed) {
        Some(seen) if seen == seq => {}
        Some(seen) => panic!("Feed {} seen up to {}, expected {}", feed.short(), seen, seq),
        None => panic!("Feed {} not in timeframe, expected seq {}", feed.short(), seq),
    }
}

/// Assert that `feed` is absent from `timeframe`
pub fn assert_unseen(timeframe: &Timeframe, feed: &PublicKey) {
    if let Some(seen) = timeframe.get(feed) {
        panic!("Feed {} unexpectedly seen up to {}", feed.short(), seen);
    }
}

pub fn assert_role(snapshot: &SpaceSnapshot, identity: &PublicKey, role: Role) {
    match snapshot.membership.role_of(identity) {
        Some(actual) if actual == role => {}
        actual => panic!("Identity {} has role {:?}, expected {}", identity.short(), actual, role),
    }
}

/// Assert that two peers hold the same feeds and the same membership
pub fn assert_converged(a: &SpaceSnapshot, b: &SpaceSnapshot) {
    let one_sided = a
        .processed
        .missing_ranges(&b.processed)
        .into_iter()
        .chain(b.processed.missing_ranges(&a.processed))
        .next();
    if let Some(range) = one_sided {
        panic!(
            "Feed {} entries {}..={} processed on one side only",
            range.feed.short(),
            range.from,
            range.to
        );
    }
    if a.membership != b.membership {
        panic!("Membership differs: {:?} vs {:?}", a.membership, b.membership);
    }
    if a.pending != 0 || b.pending != 0 {
        panic!("Entries still pending: {} and {}", a.pending, b.pending);
    }
}
