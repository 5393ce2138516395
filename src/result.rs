//! # Call Results
//!
//! Every coordinator call hands back one [`DhtFuture`]. It resolves exactly
//! once, to either a [`DhtResult`] or a [`DhtError`].
//!
//! ## Failure Model
//!
//! | Condition | Outcome |
//! |-----------|---------|
//! | Routing failed | `Err(DhtError::RoutingFailed)`, no partial result |
//! | Invalid configuration | `Err(DhtError::InvalidConfiguration)`, no network activity |
//! | Single peer failed or timed out | absorbed, counts toward round shortfall |
//! | Failed rounds exceeded `max_failure` | `Ok`, partial aggregate |
//! | Candidates exhausted before quorum | `Ok`, partial aggregate |
//!
//! Callers that need a minimum number of confirmations check
//! [`DhtResult::is_complete`] or the size of the per-peer map themselves.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use serde::de::DeserializeOwned;
use tokio::sync::oneshot;

use crate::data::Data;
use crate::evaluation::EvaluationScheme;
use crate::identity::{Id, PeerAddress};
use crate::messages::{deserialize_bounded, RoutingResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhtError {
    /// The routing step failed; nothing was sent to storage peers.
    RoutingFailed(String),
    /// Request or routing configuration rejected before any network activity.
    InvalidConfiguration(String),
    /// Malformed argument, e.g. an identifier of the wrong width.
    InvalidArgument(String),
    /// The call task went away before producing a result.
    Cancelled,
}

impl std::fmt::Display for DhtError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DhtError::RoutingFailed(reason) => write!(f, "routing failed: {reason}"),
            DhtError::InvalidConfiguration(reason) => {
                write!(f, "invalid configuration: {reason}")
            }
            DhtError::InvalidArgument(reason) => write!(f, "invalid argument: {reason}"),
            DhtError::Cancelled => write!(f, "operation cancelled"),
        }
    }
}

impl std::error::Error for DhtError {}

/// Per-peer raw results, shaped by the operation kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerResults {
    /// ADD / PUT: content keys each peer actually wrote.
    StoredKeys {
        keys: HashMap<PeerAddress, BTreeSet<Id>>,
        put_if_absent: bool,
    },
    /// GET, or REMOVE with `return_results`.
    Data(HashMap<PeerAddress, BTreeMap<Id, Data>>),
    /// REMOVE without `return_results`.
    RemovedKeys(HashMap<PeerAddress, BTreeSet<Id>>),
    DirectRaw(HashMap<PeerAddress, Vec<u8>>),
    /// DIRECT in object mode; values are still encoded, see
    /// [`DhtResult::decode_objects`].
    DirectObject(HashMap<PeerAddress, Vec<u8>>),
}

impl PeerResults {
    pub fn len(&self) -> usize {
        match self {
            PeerResults::StoredKeys { keys, .. } => keys.len(),
            PeerResults::Data(map) => map.len(),
            PeerResults::RemovedKeys(map) => map.len(),
            PeerResults::DirectRaw(map) => map.len(),
            PeerResults::DirectObject(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn peers(&self) -> BTreeSet<PeerAddress> {
        match self {
            PeerResults::StoredKeys { keys, .. } => keys.keys().copied().collect(),
            PeerResults::Data(map) => map.keys().copied().collect(),
            PeerResults::RemovedKeys(map) => map.keys().copied().collect(),
            PeerResults::DirectRaw(map) => map.keys().copied().collect(),
            PeerResults::DirectObject(map) => map.keys().copied().collect(),
        }
    }
}

/// Terminal result of a successful (possibly degraded) call.
#[derive(Clone)]
pub struct DhtResult {
    results: PeerResults,
    routing: RoutingResult,
    minimum_results: usize,
    rounds: usize,
    failed_rounds: usize,
    scheme: Arc<dyn EvaluationScheme>,
}

impl DhtResult {
    pub(crate) fn new(
        results: PeerResults,
        routing: RoutingResult,
        minimum_results: usize,
        rounds: usize,
        failed_rounds: usize,
        scheme: Arc<dyn EvaluationScheme>,
    ) -> Self {
        Self {
            results,
            routing,
            minimum_results,
            rounds,
            failed_rounds,
            scheme,
        }
    }

    pub fn results(&self) -> &PeerResults {
        &self.results
    }

    pub fn into_results(self) -> PeerResults {
        self.results
    }

    /// The routing answer the candidate set was built from.
    pub fn routing(&self) -> &RoutingResult {
        &self.routing
    }

    /// Fork/join rounds the call went through.
    pub fn rounds(&self) -> usize {
        self.rounds
    }

    /// Rounds that ended without reaching their quorum target.
    pub fn failed_rounds(&self) -> usize {
        self.failed_rounds
    }

    /// Peers that answered successfully.
    pub fn responders(&self) -> BTreeSet<PeerAddress> {
        self.results.peers()
    }

    /// `true` when at least `minimum_results` peers answered.
    pub fn is_complete(&self) -> bool {
        self.results.len() >= self.minimum_results
    }

    pub fn stored_keys(&self) -> Option<&HashMap<PeerAddress, BTreeSet<Id>>> {
        match &self.results {
            PeerResults::StoredKeys { keys, .. } => Some(keys),
            _ => None,
        }
    }

    pub fn data(&self) -> Option<&HashMap<PeerAddress, BTreeMap<Id, Data>>> {
        match &self.results {
            PeerResults::Data(map) => Some(map),
            _ => None,
        }
    }

    pub fn removed_keys(&self) -> Option<&HashMap<PeerAddress, BTreeSet<Id>>> {
        match &self.results {
            PeerResults::RemovedKeys(keys) => Some(keys),
            _ => None,
        }
    }

    pub fn direct_raw(&self) -> Option<&HashMap<PeerAddress, Vec<u8>>> {
        match &self.results {
            PeerResults::DirectRaw(map) => Some(map),
            _ => None,
        }
    }

    /// Decode object-mode direct replies.
    ///
    /// Returns `None` for any other result kind. Peers whose reply does not
    /// decode as `T` are left out.
    pub fn decode_objects<T: DeserializeOwned>(&self) -> Option<HashMap<PeerAddress, T>> {
        match &self.results {
            PeerResults::DirectObject(map) => Some(
                map.iter()
                    .filter_map(|(peer, bytes)| {
                        deserialize_bounded(bytes).ok().map(|value| (*peer, value))
                    })
                    .collect(),
            ),
            _ => None,
        }
    }

    /// Reduce per-peer data maps to one logical value set.
    pub fn evaluated_data(&self) -> BTreeMap<Id, Data> {
        match &self.results {
            PeerResults::Data(map) => self.scheme.evaluate_data(map),
            _ => BTreeMap::new(),
        }
    }

    /// Reduce per-peer key sets (stored or removed) to one logical key set.
    pub fn evaluated_keys(&self) -> BTreeSet<Id> {
        match &self.results {
            PeerResults::StoredKeys { keys, .. } | PeerResults::RemovedKeys(keys) => {
                self.scheme.evaluate_keys(keys)
            }
            PeerResults::Data(map) => {
                let keys: HashMap<PeerAddress, BTreeSet<Id>> = map
                    .iter()
                    .map(|(peer, data)| (*peer, data.keys().copied().collect()))
                    .collect();
                self.scheme.evaluate_keys(&keys)
            }
            _ => BTreeSet::new(),
        }
    }

    /// First evaluated value, for single-value reads.
    pub fn value(&self) -> Option<Data> {
        self.evaluated_data().into_values().next()
    }
}

impl std::fmt::Debug for DhtResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhtResult")
            .field("results", &self.results)
            .field("minimum_results", &self.minimum_results)
            .field("rounds", &self.rounds)
            .field("failed_rounds", &self.failed_rounds)
            .finish_non_exhaustive()
    }
}

/// Future for one logical DHT call.
#[must_use = "a DhtFuture does nothing observable unless awaited"]
pub struct DhtFuture {
    rx: oneshot::Receiver<Result<DhtResult, DhtError>>,
}

/// Write side of a [`DhtFuture`]; consumed by its single write.
pub(crate) struct DhtSetter {
    tx: oneshot::Sender<Result<DhtResult, DhtError>>,
}

impl DhtFuture {
    pub(crate) fn channel() -> (DhtSetter, DhtFuture) {
        let (tx, rx) = oneshot::channel();
        (DhtSetter { tx }, DhtFuture { rx })
    }

    /// A future that is already failed.
    pub(crate) fn failed(error: DhtError) -> DhtFuture {
        let (setter, future) = Self::channel();
        setter.set(Err(error));
        future
    }
}

impl DhtSetter {
    pub(crate) fn set(self, result: Result<DhtResult, DhtError>) {
        // The caller may have dropped its future; nothing left to notify.
        let _ = self.tx.send(result);
    }
}

impl Future for DhtFuture {
    type Output = Result<DhtResult, DhtError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(DhtError::Cancelled)))
    }
}

impl std::fmt::Debug for DhtFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhtFuture").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::VotingScheme;

    fn peer(n: u64) -> PeerAddress {
        PeerAddress::new(Id::from(n), "127.0.0.1:4000".parse().unwrap())
    }

    fn result_with(results: PeerResults, minimum_results: usize) -> DhtResult {
        DhtResult::new(
            results,
            RoutingResult::default(),
            minimum_results,
            1,
            0,
            Arc::new(VotingScheme),
        )
    }

    #[tokio::test]
    async fn failed_future_resolves_to_error() {
        let future = DhtFuture::failed(DhtError::RoutingFailed("no peers".into()));
        assert_eq!(
            future.await.unwrap_err(),
            DhtError::RoutingFailed("no peers".into())
        );
    }

    #[tokio::test]
    async fn dropped_setter_resolves_to_cancelled() {
        let (setter, future) = DhtFuture::channel();
        drop(setter);
        assert_eq!(future.await.unwrap_err(), DhtError::Cancelled);
    }

    #[test]
    fn routing_failure_message() {
        let err = DhtError::RoutingFailed("timeout".into());
        assert_eq!(err.to_string(), "routing failed: timeout");
    }

    #[test]
    fn completeness_tracks_minimum_results() {
        let mut keys = HashMap::new();
        keys.insert(peer(1), BTreeSet::from([Id::from(9u64)]));
        let results = PeerResults::StoredKeys {
            keys,
            put_if_absent: false,
        };

        assert!(result_with(results.clone(), 1).is_complete());
        assert!(!result_with(results, 2).is_complete());
    }

    #[test]
    fn decode_objects_skips_undecodable_replies() {
        let mut map = HashMap::new();
        map.insert(peer(1), bincode::serialize(&5u32).unwrap());
        map.insert(peer(2), Vec::new());
        let result = result_with(PeerResults::DirectObject(map), 1);

        let decoded: HashMap<PeerAddress, u32> = result.decode_objects().unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[&peer(1)], 5);
        assert!(result.direct_raw().is_none());
    }
}
