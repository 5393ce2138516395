//! Evaluation schemes: reduce what several replicas reported into one
//! logical answer.
//!
//! Schemes are pure functions over the finalized per-peer aggregate and
//! never influence the coordinator's round logic.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::data::Data;
use crate::identity::{Id, PeerAddress};

pub trait EvaluationScheme: Send + Sync + 'static {
    fn evaluate_data(&self, raw: &HashMap<PeerAddress, BTreeMap<Id, Data>>) -> BTreeMap<Id, Data>;

    fn evaluate_keys(&self, raw: &HashMap<PeerAddress, BTreeSet<Id>>) -> BTreeSet<Id>;
}

/// Peers in id order, so results do not depend on hash-map iteration.
fn sorted_peers<V>(raw: &HashMap<PeerAddress, V>) -> Vec<(&PeerAddress, &V)> {
    let mut peers: Vec<_> = raw.iter().collect();
    peers.sort_by(|a, b| a.0.cmp(b.0));
    peers
}

/// Majority vote.
///
/// For data, each content key resolves to the value reported by the most
/// peers; ties go to the smallest content hash. For key sets, a key survives
/// when a strict majority of responding peers reported it.
#[derive(Clone, Copy, Debug, Default)]
pub struct VotingScheme;

impl EvaluationScheme for VotingScheme {
    fn evaluate_data(&self, raw: &HashMap<PeerAddress, BTreeMap<Id, Data>>) -> BTreeMap<Id, Data> {
        // content key -> value hash -> (votes, first copy seen)
        let mut ballots: BTreeMap<Id, BTreeMap<Id, (usize, &Data)>> = BTreeMap::new();
        for (_, map) in sorted_peers(raw) {
            for (key, data) in map {
                let entry = ballots
                    .entry(*key)
                    .or_default()
                    .entry(data.content_hash())
                    .or_insert((0, data));
                entry.0 += 1;
            }
        }

        ballots
            .into_iter()
            .filter_map(|(key, candidates)| {
                // BTreeMap iterates hashes ascending; keep the first maximum.
                let mut best: Option<(usize, &Data)> = None;
                for (votes, data) in candidates.into_values() {
                    if best.map_or(true, |(top, _)| votes > top) {
                        best = Some((votes, data));
                    }
                }
                best.map(|(_, data)| (key, data.clone()))
            })
            .collect()
    }

    fn evaluate_keys(&self, raw: &HashMap<PeerAddress, BTreeSet<Id>>) -> BTreeSet<Id> {
        let voters = raw.len();
        let mut votes: BTreeMap<Id, usize> = BTreeMap::new();
        for keys in raw.values() {
            for key in keys {
                *votes.entry(*key).or_default() += 1;
            }
        }
        votes
            .into_iter()
            .filter(|(_, count)| count * 2 > voters)
            .map(|(key, _)| key)
            .collect()
    }
}

/// Take the first non-empty answer, peers in id order.
#[derive(Clone, Copy, Debug, Default)]
pub struct FirstSuccess;

impl EvaluationScheme for FirstSuccess {
    fn evaluate_data(&self, raw: &HashMap<PeerAddress, BTreeMap<Id, Data>>) -> BTreeMap<Id, Data> {
        sorted_peers(raw)
            .into_iter()
            .map(|(_, map)| map)
            .find(|map| !map.is_empty())
            .cloned()
            .unwrap_or_default()
    }

    fn evaluate_keys(&self, raw: &HashMap<PeerAddress, BTreeSet<Id>>) -> BTreeSet<Id> {
        sorted_peers(raw)
            .into_iter()
            .map(|(_, keys)| keys)
            .find(|keys| !keys.is_empty())
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u64) -> PeerAddress {
        PeerAddress::new(Id::from(n), "127.0.0.1:4000".parse().unwrap())
    }

    fn map(entries: &[(u64, &str)]) -> BTreeMap<Id, Data> {
        entries
            .iter()
            .map(|(k, v)| (Id::from(*k), Data::from(*v)))
            .collect()
    }

    #[test]
    fn majority_value_wins_per_key() {
        let mut raw = HashMap::new();
        raw.insert(peer(1), map(&[(1, "old"), (2, "x")]));
        raw.insert(peer(2), map(&[(1, "new")]));
        raw.insert(peer(3), map(&[(1, "new"), (2, "x")]));

        let result = VotingScheme.evaluate_data(&raw);

        assert_eq!(result.len(), 2);
        assert_eq!(result[&Id::from(1u64)].value(), b"new");
        assert_eq!(result[&Id::from(2u64)].value(), b"x");
    }

    #[test]
    fn voting_tie_is_deterministic() {
        let mut raw = HashMap::new();
        raw.insert(peer(1), map(&[(1, "a")]));
        raw.insert(peer(2), map(&[(1, "b")]));

        let first = VotingScheme.evaluate_data(&raw);
        let expected = if Data::from("a").content_hash() < Data::from("b").content_hash() {
            "a"
        } else {
            "b"
        };
        assert_eq!(first[&Id::from(1u64)].value(), expected.as_bytes());
    }

    #[test]
    fn key_vote_requires_strict_majority() {
        let mut raw = HashMap::new();
        raw.insert(peer(1), BTreeSet::from([Id::from(1u64), Id::from(2u64)]));
        raw.insert(peer(2), BTreeSet::from([Id::from(1u64)]));
        raw.insert(peer(3), BTreeSet::from([Id::from(1u64), Id::from(3u64)]));

        let keys = VotingScheme.evaluate_keys(&raw);
        assert_eq!(keys, BTreeSet::from([Id::from(1u64)]));
    }

    #[test]
    fn empty_input_yields_empty_output() {
        assert!(VotingScheme.evaluate_data(&HashMap::new()).is_empty());
        assert!(VotingScheme.evaluate_keys(&HashMap::new()).is_empty());
        assert!(FirstSuccess.evaluate_data(&HashMap::new()).is_empty());
    }

    #[test]
    fn first_success_skips_empty_answers() {
        let mut raw = HashMap::new();
        raw.insert(peer(1), BTreeMap::new());
        raw.insert(peer(2), map(&[(4, "found")]));
        raw.insert(peer(3), map(&[(5, "later")]));

        let result = FirstSuccess.evaluate_data(&raw);
        assert_eq!(result.len(), 1);
        assert_eq!(result[&Id::from(4u64)].value(), b"found");
    }
}
