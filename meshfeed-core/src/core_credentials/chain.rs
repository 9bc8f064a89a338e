/*
    CredentialChain

    Derives space membership from the credentials found in a space's feeds.

    Workflow:
    1. The replication engine hands each credential over once its causal
       dependencies have been processed: insert(position, timeframe, credential).
    2. The verdict is computed against the membership of the credential's
       causal past only, and memoised. Later credentials never change an
       earlier verdict.
    3. The current membership replays every valid credential in a
       deterministic linear extension of causal order (Kahn's algorithm, ties
       broken by (seq, feed key)). Concurrent updates for the same subject
       resolve to whichever comes last in that order, identically on every
       replica. A credential that lands at the end of that order is applied
       on top of the current membership instead.
    4. Memberships of causal pasts are cached by their frame until the next
       insert.

    Causal past of a credential at (f, s) with timeframe T:
        { (k, t) : t <= T[k] }  ∪  { (f, t) : t < s }

    States: Empty -> Genesis (owner admitted) -> Active (anything after).
*/

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

use super::{Credential, CredentialError, Role};
use crate::core_identity::PublicKey;
use crate::core_timeframe::{Position, Timeframe};

pub type Verdict = Result<(), CredentialError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainState {
    #[default]
    Empty,
    Genesis,
    Active,
}

/// Membership derived from a set of credentials
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MembershipSnapshot {
    pub state: ChainState,
    pub owner: Option<PublicKey>,
    /// identity -> role
    pub members: BTreeMap<PublicKey, Role>,
    /// feed -> identity
    pub feeds: BTreeMap<PublicKey, PublicKey>,
}

impl MembershipSnapshot {
    pub fn role_of(&self, identity: &PublicKey) -> Option<Role> {
        self.members.get(identity).copied()
    }

    pub fn identity_of(&self, feed: &PublicKey) -> Option<PublicKey> {
        self.feeds.get(feed).copied()
    }

    /// Role of the identity a feed is bound to
    pub fn feed_role(&self, feed: &PublicKey) -> Option<Role> {
        self.identity_of(feed).and_then(|id| self.role_of(&id))
    }

    pub fn can_write(&self, feed: &PublicKey) -> bool {
        self.feed_role(feed).is_some_and(Role::can_write)
    }

    fn apply(&mut self, position: &Position, credential: &Credential) {
        match credential {
            Credential::AdmitKey { subject, role } if self.state == ChainState::Empty => {
                // genesis
                self.owner = Some(*subject);
                self.members.insert(*subject, *role);
                self.feeds.insert(position.feed, *subject);
                self.state = ChainState::Genesis;
            }
            Credential::AdmitKey { subject, role } | Credential::UpdateKey { subject, role } => {
                self.members.insert(*subject, *role);
                self.state = ChainState::Active;
            }
            Credential::AdmitFeed { feed, identity, .. } => {
                self.feeds.insert(*feed, *identity);
                self.state = ChainState::Active;
            }
        }
    }

    /// Check `credential`, carried at `position`, against this membership.
    pub fn check(&self, space: &PublicKey, position: &Position, credential: &Credential) -> Verdict {
        let is_genesis_position = position.feed == *space && position.seq == 0;
        if is_genesis_position || self.state == ChainState::Empty {
            return match credential {
                Credential::AdmitKey {
                    role: Role::Owner, ..
                } if is_genesis_position && self.state == ChainState::Empty => Ok(()),
                _ if is_genesis_position => Err(CredentialError::InvalidGenesis),
                _ => Err(CredentialError::NoGenesis),
            };
        }

        match credential {
            Credential::AdmitKey { subject, role } | Credential::UpdateKey { subject, role } => {
                let issuer = self
                    .identity_of(&position.feed)
                    .ok_or(CredentialError::UnknownIssuer { feed: position.feed })?;
                let issuer_role = self.role_of(&issuer).unwrap_or(Role::Removed);
                if !issuer_role.can_admit() {
                    return Err(CredentialError::InsufficientRank {
                        issuer,
                        role: issuer_role,
                    });
                }
                if *subject == issuer {
                    return Err(match credential {
                        Credential::AdmitKey { .. } => CredentialError::SelfAdmission(issuer),
                        _ => CredentialError::OwnRoleUpdate(issuer),
                    });
                }
                if Some(*subject) == self.owner {
                    return Err(CredentialError::OwnerImmutable);
                }
                if *role == Role::Owner {
                    return Err(CredentialError::OwnerGrant);
                }
                let current = self.role_of(subject);
                if matches!(credential, Credential::UpdateKey { .. }) && current.is_none() {
                    return Err(CredentialError::UnknownSubject(*subject));
                }
                if *role > issuer_role || current.is_some_and(|c| c > issuer_role) {
                    return Err(CredentialError::InsufficientRank {
                        issuer,
                        role: issuer_role,
                    });
                }
                Ok(())
            }
            Credential::AdmitFeed { feed, identity, .. } => {
                if *feed != position.feed {
                    return Err(CredentialError::FeedCarrierMismatch {
                        carrier: position.feed,
                        feed: *feed,
                    });
                }
                match self.role_of(identity) {
                    Some(role) if !role.is_removed() => {}
                    _ => return Err(CredentialError::NotMember(*identity)),
                }
                if !credential.verify_proof(space) {
                    return Err(CredentialError::InvalidProof {
                        feed: *feed,
                        identity: *identity,
                    });
                }
                match self.identity_of(feed) {
                    Some(bound) if bound != *identity => Err(CredentialError::FeedAlreadyBound {
                        feed: *feed,
                        identity: bound,
                    }),
                    _ => Ok(()),
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct CredentialRecord {
    pub position: Position,
    pub timeframe: Timeframe,
    pub credential: Credential,
    pub verdict: Verdict,
}

impl CredentialRecord {
    fn is_in_past_of(&self, position: &Position, timeframe: &Timeframe) -> bool {
        timeframe.contains(&self.position.feed, self.position.seq)
            || (self.position.feed == position.feed && self.position.seq < position.seq)
    }
}

/// `timeframe` plus everything before `position` on its own feed
fn causal_frame(position: &Position, timeframe: &Timeframe) -> Timeframe {
    let mut frame = timeframe.clone();
    if let Some(previous) = position.seq.checked_sub(1) {
        frame.advance(position.feed, previous);
    }
    frame
}

const PAST_CACHE_LIMIT: usize = 256;

#[derive(Debug, Clone)]
pub struct CredentialChain {
    space: PublicKey,
    records: Vec<CredentialRecord>,
    index: HashMap<Position, usize>,
    membership: MembershipSnapshot,
    /// causal frame -> membership of that past, for pasts short of the
    /// whole chain
    past_cache: HashMap<Timeframe, MembershipSnapshot>,
}

impl CredentialChain {
    pub fn new(space: PublicKey) -> Self {
        Self {
            space,
            records: Vec::new(),
            index: HashMap::new(),
            membership: MembershipSnapshot::default(),
            past_cache: HashMap::new(),
        }
    }

    pub fn space(&self) -> &PublicKey {
        &self.space
    }

    pub fn state(&self) -> ChainState {
        self.membership.state
    }

    /// Current membership, replaying every valid credential
    pub fn membership(&self) -> &MembershipSnapshot {
        &self.membership
    }

    pub fn records(&self) -> &[CredentialRecord] {
        &self.records
    }

    pub fn verdict(&self, position: &Position) -> Option<&Verdict> {
        self.index.get(position).map(|&i| &self.records[i].verdict)
    }

    /// Insert a credential whose causal past has already been inserted.
    /// Inserting the same position twice returns the stored verdict.
    pub fn insert(&mut self, position: Position, timeframe: Timeframe, credential: Credential) -> Verdict {
        if let Some(&i) = self.index.get(&position) {
            return self.records[i].verdict.clone();
        }

        let space = self.space;
        let verdict = self
            .snapshot_at(&position, &timeframe)
            .check(&space, &position, &credential);

        match &verdict {
            Ok(()) => debug!(
                space = %self.space.short(),
                feed = %position.feed.short(),
                seq = position.seq,
                kind = credential.kind(),
                "Credential accepted"
            ),
            Err(err) => warn!(
                space = %self.space.short(),
                feed = %position.feed.short(),
                seq = position.seq,
                kind = credential.kind(),
                error = %err,
                "Credential rejected"
            ),
        }

        let record = CredentialRecord {
            position,
            timeframe,
            credential,
            verdict: verdict.clone(),
        };
        let last = self.sorts_last(&record);
        self.index.insert(position, self.records.len());
        self.records.push(record);
        self.past_cache.clear();

        if last {
            if verdict.is_ok() {
                let record = &self.records[self.records.len() - 1];
                self.membership.apply(&record.position, &record.credential);
            }
        } else {
            let all: Vec<usize> = (0..self.records.len()).collect();
            self.membership = self.replay(&all);
        }
        verdict
    }

    /// Membership as seen from the causal past of `(position, timeframe)`.
    pub fn membership_at(&mut self, position: &Position, timeframe: &Timeframe) -> MembershipSnapshot {
        self.snapshot_at(position, timeframe).clone()
    }

    /// Whether a data message at `(feed, seq)` with causal `timeframe` was
    /// written by a member allowed to write.
    pub fn can_write_at(&mut self, feed: &PublicKey, seq: u64, timeframe: &Timeframe) -> bool {
        self.snapshot_at(&Position::new(*feed, seq), timeframe).can_write(feed)
    }

    fn snapshot_at(&mut self, position: &Position, timeframe: &Timeframe) -> &MembershipSnapshot {
        let frame = causal_frame(position, timeframe);
        if self.past_cache.contains_key(&frame) {
            return &self.past_cache[&frame];
        }

        let past: Vec<usize> = self
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| frame.contains(&r.position.feed, r.position.seq))
            .map(|(i, _)| i)
            .collect();
        if past.len() == self.records.len() {
            return &self.membership;
        }

        let snapshot = self.replay(&past);
        if self.past_cache.len() >= PAST_CACHE_LIMIT {
            self.past_cache.clear();
        }
        self.past_cache.entry(frame).or_insert(snapshot)
    }

    /// Whether `record` would be emitted after every stored record by
    /// [`Self::linear_order`]: nothing stored depends on it, and whatever
    /// is not in its past sorts before it.
    fn sorts_last(&self, record: &CredentialRecord) -> bool {
        let frame = causal_frame(&record.position, &record.timeframe);
        let key = (record.position.seq, record.position.feed);
        self.records.iter().all(|other| {
            !record.is_in_past_of(&other.position, &other.timeframe)
                && (frame.contains(&other.position.feed, other.position.seq)
                    || (other.position.seq, other.position.feed) < key)
        })
    }

    /// Apply the valid records among `subset` in linear causal order.
    fn replay(&self, subset: &[usize]) -> MembershipSnapshot {
        let mut snapshot = MembershipSnapshot::default();
        for i in self.linear_order(subset) {
            let record = &self.records[i];
            if record.verdict.is_ok() {
                snapshot.apply(&record.position, &record.credential);
            }
        }
        snapshot
    }

    /// Kahn's algorithm over the causal DAG restricted to `subset`, always
    /// emitting the ready record with the smallest (seq, feed).
    fn linear_order(&self, subset: &[usize]) -> Vec<usize> {
        let mut indegree: HashMap<usize, usize> = HashMap::with_capacity(subset.len());
        let mut successors: HashMap<usize, Vec<usize>> = HashMap::new();
        for &j in subset {
            let rj = &self.records[j];
            let mut deps = 0;
            for &i in subset {
                if i != j && self.records[i].is_in_past_of(&rj.position, &rj.timeframe) {
                    deps += 1;
                    successors.entry(i).or_default().push(j);
                }
            }
            indegree.insert(j, deps);
        }

        let key = |i: usize| {
            let p = &self.records[i].position;
            (p.seq, p.feed, i)
        };
        let mut ready: BTreeSet<(u64, PublicKey, usize)> = indegree
            .iter()
            .filter(|&(_, &d)| d == 0)
            .map(|(&i, _)| key(i))
            .collect();

        let mut order = Vec::with_capacity(subset.len());
        while let Some(next) = ready.pop_first() {
            let i = next.2;
            order.push(i);
            for &j in successors.get(&i).map(Vec::as_slice).unwrap_or_default() {
                if let Some(d) = indegree.get_mut(&j) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(key(j));
                    }
                }
            }
        }
        order
    }
}
