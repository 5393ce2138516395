//! Candidate replicas for one in-flight call, nearest first.

use std::collections::{HashSet, VecDeque};

use crate::identity::{Id, PeerAddress};

/// Peers eligible for the next RPCs of a call, ordered ascending by XOR
/// distance to the location key.
///
/// Built once and only ever popped, so a peer is handed out at most once.
/// Owned by a single call task; no locking.
#[derive(Debug)]
pub struct CandidateSet {
    target: Id,
    queue: VecDeque<PeerAddress>,
}

impl CandidateSet {
    /// Sort `peers` by distance to `target`, dropping repeated ids.
    pub fn new(target: Id, peers: impl IntoIterator<Item = PeerAddress>) -> Self {
        let mut seen = HashSet::new();
        let mut sorted: Vec<PeerAddress> =
            peers.into_iter().filter(|p| seen.insert(p.id)).collect();
        sorted.sort_by(|a, b| a.cmp_distance(b, &target));
        Self {
            target,
            queue: sorted.into(),
        }
    }

    pub fn target(&self) -> Id {
        self.target
    }

    pub fn pop_nearest(&mut self) -> Option<PeerAddress> {
        self.queue.pop_front()
    }

    pub fn peek_nearest(&self) -> Option<&PeerAddress> {
        self.queue.front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
