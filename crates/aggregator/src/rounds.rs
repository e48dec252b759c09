//! In-flight round state.
//!
//! Three sibling structures track one aggregator's open rounds: trigger
//! locks, price submissions, and proof submissions. Each is guarded by a
//! single mutex held only for map operations. A sender is accepted at
//! most once per round, and the `locked` flag makes the quorum action
//! run exactly once.

use std::collections::HashMap;

use parking_lot::Mutex;

/// Strict majority: met at `floor(cluster_size / 2) + 1`.
pub fn meets_quorum(count: usize, cluster_size: usize) -> bool {
    count * 2 > cluster_size
}

/// Outcome of recording a submission.
#[derive(Debug, PartialEq, Eq)]
pub enum Submission<T> {
    /// Sender already submitted for this round.
    Replay,
    /// Accepted, quorum not yet reached (or round already locked).
    Pending,
    /// This submission crossed the quorum; the round is now locked and
    /// the collected values are returned for the one-shot quorum action.
    Quorum(T),
}

/// Tracks which rounds this node has already answered a trigger for.
#[derive(Default)]
pub struct RoundTriggers {
    locked: Mutex<HashMap<i32, bool>>,
}

impl RoundTriggers {
    /// Lock the round, returning false if it was already locked (replay).
    pub fn lock_once(&self, round_id: i32) -> bool {
        let mut locked = self.locked.lock();
        if locked.get(&round_id).copied().unwrap_or(false) {
            return false;
        }
        locked.insert(round_id, true);
        true
    }

    pub fn contains(&self, round_id: i32) -> bool {
        self.locked.lock().contains_key(&round_id)
    }

    pub fn cleanup(&self, round_id: i32) {
        self.locked.lock().remove(&round_id);
    }

    pub fn cleanup_through(&self, cutoff: i32) {
        self.locked.lock().retain(|round, _| *round > cutoff);
    }
}

#[derive(Default)]
struct PriceState {
    senders: HashMap<i32, Vec<String>>,
    prices: HashMap<i32, Vec<i64>>,
    locked: HashMap<i32, bool>,
}

/// Price submissions per round.
#[derive(Default)]
pub struct RoundPrices {
    inner: Mutex<PriceState>,
}

impl RoundPrices {
    /// Record a submission. At quorum the collected prices are returned
    /// once; later submissions for the round are accepted but inert.
    pub fn submit(
        &self,
        round_id: i32,
        sender: &str,
        price: i64,
        cluster_size: usize,
    ) -> Submission<Vec<i64>> {
        let mut inner = self.inner.lock();
        {
            let senders = inner.senders.entry(round_id).or_default();
            if senders.iter().any(|s| s == sender) {
                return Submission::Replay;
            }
            senders.push(sender.to_string());
        }
        inner.prices.entry(round_id).or_default().push(price);

        let count = inner.senders.get(&round_id).map_or(0, |s| s.len());
        let already_locked = inner.locked.get(&round_id).copied().unwrap_or(false);
        if meets_quorum(count, cluster_size) && !already_locked {
            inner.locked.insert(round_id, true);
            Submission::Quorum(inner.prices.get(&round_id).cloned().unwrap_or_default())
        } else {
            Submission::Pending
        }
    }

    pub fn contains(&self, round_id: i32) -> bool {
        self.inner.lock().senders.contains_key(&round_id)
    }

    pub fn cleanup(&self, round_id: i32) {
        let mut inner = self.inner.lock();
        inner.senders.remove(&round_id);
        inner.prices.remove(&round_id);
        inner.locked.remove(&round_id);
    }

    pub fn cleanup_through(&self, cutoff: i32) {
        let mut inner = self.inner.lock();
        inner.senders.retain(|round, _| *round > cutoff);
        inner.prices.retain(|round, _| *round > cutoff);
        inner.locked.retain(|round, _| *round > cutoff);
    }
}

#[derive(Default)]
struct ProofState {
    senders: HashMap<i32, Vec<String>>,
    proofs: HashMap<i32, Vec<Vec<u8>>>,
    locked: HashMap<i32, bool>,
}

/// Proof submissions per round.
#[derive(Default)]
pub struct RoundProofs {
    inner: Mutex<ProofState>,
}

impl RoundProofs {
    /// Record a proof. At quorum the collected `(sender, proof)` pairs
    /// are returned once for concatenation.
    pub fn submit(
        &self,
        round_id: i32,
        sender: &str,
        proof: Vec<u8>,
        cluster_size: usize,
    ) -> Submission<Vec<(String, Vec<u8>)>> {
        let mut inner = self.inner.lock();
        {
            let senders = inner.senders.entry(round_id).or_default();
            if senders.iter().any(|s| s == sender) {
                return Submission::Replay;
            }
            senders.push(sender.to_string());
        }
        inner.proofs.entry(round_id).or_default().push(proof);

        let count = inner.senders.get(&round_id).map_or(0, |s| s.len());
        let already_locked = inner.locked.get(&round_id).copied().unwrap_or(false);
        if meets_quorum(count, cluster_size) && !already_locked {
            inner.locked.insert(round_id, true);
            let senders = inner.senders.get(&round_id).cloned().unwrap_or_default();
            let proofs = inner.proofs.get(&round_id).cloned().unwrap_or_default();
            Submission::Quorum(senders.into_iter().zip(proofs).collect())
        } else {
            Submission::Pending
        }
    }

    pub fn contains(&self, round_id: i32) -> bool {
        self.inner.lock().senders.contains_key(&round_id)
    }

    pub fn cleanup(&self, round_id: i32) {
        let mut inner = self.inner.lock();
        inner.senders.remove(&round_id);
        inner.proofs.remove(&round_id);
        inner.locked.remove(&round_id);
    }

    pub fn cleanup_through(&self, cutoff: i32) {
        let mut inner = self.inner.lock();
        inner.senders.retain(|round, _| *round > cutoff);
        inner.proofs.retain(|round, _| *round > cutoff);
        inner.locked.retain(|round, _| *round > cutoff);
    }
}
