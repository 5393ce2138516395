//! # Replicated-Operation Coordinator
//!
//! Turns one logical DHT request into rounds of concurrent per-peer RPCs.
//!
//! ## State Machine
//!
//! ```text
//! ROUTING ──fail──▶ FAILED
//!    │
//!    ▼
//! DISPATCHING(0) ──quorum met / nothing left / failure budget spent──▶ SUCCEEDED
//!    │  ▲
//!    └──┘ round shortfall: target -= successes, refill empty slots
//! ```
//!
//! - **Routing** picks the candidate set: potential hits for writes and
//!   direct sends, direct hits for reads and removes.
//! - **Dispatching** keeps at most `parallel` requests in flight, popping the
//!   nearest unused candidates into empty slots. A round resolves through
//!   [`fork_join`] once `min(target, active)` peers succeed or every
//!   in-flight request finished.
//! - After a short round the quorum target drops by the successes already
//!   collected, so a retry only asks for the shortfall.
//!
//! Running out of candidates or of failed-round budget is not an error: the
//! call resolves with whatever the replicas confirmed. Only a routing failure
//! (or a rejected configuration) fails the call.
//!
//! ## Concurrency
//!
//! Each call runs as its own task and owns its candidate set, slots and
//! accumulator. RPCs run as separate tasks; nothing blocks a worker thread.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::candidates::CandidateSet;
use crate::config::{RequestConfig, RoutingConfig};
use crate::evaluation::{EvaluationScheme, VotingScheme};
use crate::forkjoin::{cancel_pending, fork_join};
use crate::future::{ResponseFuture, Status};
use crate::identity::Id;
use crate::messages::RoutingRequest;
use crate::operation::{
    AddOperation, DirectOperation, GetOperation, Operation, PutOperation, RemoveOperation,
};
use crate::protocols::{DirectRpc, Routing, StorageRpc};
use crate::request::{AddRequest, DirectRequest, GetRequest, PutRequest, RemoveRequest};
use crate::result::{DhtError, DhtFuture, DhtResult, PeerResults};

/// Coordinator handle. Cheap to clone; every call is independent.
#[derive(Clone)]
pub struct DistributedHashMap {
    routing: Arc<dyn Routing>,
    storage: Arc<dyn StorageRpc>,
    direct: Arc<dyn DirectRpc>,
}

/// Where a call routes to, before it knows its candidates.
struct RouteTarget {
    location_key: Id,
    domain_key: Option<Id>,
    content_keys: Option<std::collections::BTreeSet<Id>>,
}

impl DistributedHashMap {
    pub fn new(
        routing: Arc<dyn Routing>,
        storage: Arc<dyn StorageRpc>,
        direct: Arc<dyn DirectRpc>,
    ) -> Self {
        Self {
            routing,
            storage,
            direct,
        }
    }

    /// Append values; each lands under the hash of its payload.
    pub fn add(&self, request: AddRequest) -> DhtFuture {
        let target = RouteTarget {
            location_key: request.location_key,
            domain_key: Some(request.domain_key),
            content_keys: None,
        };
        let op = AddOperation::new(
            self.storage.clone(),
            request.location_key,
            request.domain_key,
            request.data,
            request.protect_domain,
            request.sign,
        );
        self.launch(op, target, request.routing, request.request, default_scheme())
    }

    pub fn put(&self, request: PutRequest) -> DhtFuture {
        let target = RouteTarget {
            location_key: request.location_key,
            domain_key: Some(request.domain_key),
            content_keys: None,
        };
        let op = PutOperation::new(
            self.storage.clone(),
            request.location_key,
            request.domain_key,
            request.data,
            request.put_if_absent,
            request.protect_domain,
            request.sign,
        );
        self.launch(op, target, request.routing, request.request, default_scheme())
    }

    pub fn get(&self, request: GetRequest) -> DhtFuture {
        let target = RouteTarget {
            location_key: request.location_key,
            domain_key: Some(request.domain_key),
            content_keys: request.content_keys.clone(),
        };
        let op = GetOperation::new(
            self.storage.clone(),
            request.location_key,
            request.domain_key,
            request.content_keys,
            request.public_key,
            request.sign,
        );
        self.launch(op, target, request.routing, request.request, request.evaluation)
    }

    pub fn remove(&self, request: RemoveRequest) -> DhtFuture {
        let target = RouteTarget {
            location_key: request.location_key,
            domain_key: Some(request.domain_key),
            content_keys: request.content_keys.clone(),
        };
        let op = RemoveOperation::new(
            self.storage.clone(),
            request.location_key,
            request.domain_key,
            request.content_keys,
            request.return_results,
            request.sign,
        );
        self.launch(op, target, request.routing, request.request, default_scheme())
    }

    /// Send a payload straight to the peers closest to a location.
    pub fn direct(&self, request: DirectRequest) -> DhtFuture {
        let target = RouteTarget {
            location_key: request.location_key,
            domain_key: None,
            content_keys: None,
        };
        let op = DirectOperation::new(
            self.direct.clone(),
            request.payload,
            request.cancel_on_finish,
        );
        self.launch(op, target, request.routing, request.request, default_scheme())
    }

    /// Validate, then run the call on its own task.
    ///
    /// Must be called from within a tokio runtime.
    fn launch<O: Operation>(
        &self,
        op: O,
        target: RouteTarget,
        routing_config: RoutingConfig,
        config: RequestConfig,
        scheme: Arc<dyn EvaluationScheme>,
    ) -> DhtFuture {
        if let Err(e) = config.validate().and_then(|_| routing_config.validate()) {
            debug!(kind = %op.kind(), error = %e, "rejecting call before routing");
            return DhtFuture::failed(e);
        }

        let request = RoutingRequest {
            location_key: target.location_key,
            domain_key: target.domain_key,
            content_keys: target.content_keys,
            command: op.command(),
            is_direct: op.is_direct(),
            direct_hits: routing_config.direct_hits,
            max_no_new_info: routing_config.max_no_new_info(config.minimum_results),
            max_failures: routing_config.max_failures,
            max_success: routing_config.max_success,
            parallel: routing_config.parallel,
        };

        let (setter, future) = DhtFuture::channel();
        let routing = self.routing.clone();
        tokio::spawn(async move {
            let result = run_call(routing.as_ref(), op, request, config, scheme).await;
            setter.set(result);
        });
        future
    }
}

fn default_scheme() -> Arc<dyn EvaluationScheme> {
    Arc::new(VotingScheme)
}

async fn run_call<O: Operation>(
    routing: &dyn Routing,
    op: O,
    request: RoutingRequest,
    config: RequestConfig,
    scheme: Arc<dyn EvaluationScheme>,
) -> Result<DhtResult, DhtError> {
    let location_key = request.location_key;

    let routed = match routing.route(request).await {
        Ok(routed) => routed,
        Err(e) => {
            warn!(
                kind = %op.kind(),
                location = ?location_key,
                error = %e,
                "routing failed"
            );
            return Err(DhtError::RoutingFailed(format!("{e:#}")));
        }
    };

    let hits = if op.is_direct() {
        &routed.direct_hits
    } else {
        &routed.potential_hits
    };
    debug!(
        kind = %op.kind(),
        location = ?location_key,
        candidates = hits.len(),
        direct = op.is_direct(),
        "routing complete"
    );
    let candidates = CandidateSet::new(location_key, hits.iter().copied());

    let outcome = dispatch(&op, candidates, &config).await;
    Ok(DhtResult::new(
        outcome.results,
        routed,
        config.minimum_results,
        outcome.rounds,
        outcome.failed_rounds,
        scheme,
    ))
}

/// What the dispatch loop produced, plus the quorum target of every round.
pub(crate) struct Dispatched {
    pub results: PeerResults,
    pub rounds: usize,
    pub failed_rounds: usize,
    pub targets: Vec<usize>,
}

/// The round/retry loop.
pub(crate) async fn dispatch<O: Operation>(
    op: &O,
    mut candidates: CandidateSet,
    config: &RequestConfig,
) -> Dispatched {
    let parallel = config.parallel();
    let mut slots: Vec<Option<ResponseFuture<O::Reply>>> = (0..parallel).map(|_| None).collect();
    let mut acc = O::Accumulator::default();
    let mut target = config.minimum_results;
    let mut failed_rounds = 0usize;
    let mut targets = Vec::new();

    loop {
        let mut active = 0usize;
        for slot in slots.iter_mut() {
            if slot.is_none() {
                if let Some(peer) = candidates.pop_nearest() {
                    *slot = Some(op.issue(&peer));
                } else {
                    continue;
                }
            }
            active += 1;
        }

        if active == 0 {
            debug!(
                kind = %op.kind(),
                rounds = targets.len(),
                failed_rounds,
                "candidates exhausted"
            );
            return Dispatched {
                results: op.on_finalize(acc),
                rounds: targets.len(),
                failed_rounds,
                targets,
            };
        }

        targets.push(target);
        let need = target.min(active);
        debug!(
            kind = %op.kind(),
            round = targets.len() - 1,
            need,
            active,
            parallel_diff = config.parallel_diff,
            "fork/join status"
        );

        let joined = fork_join(&slots, need, false).await;
        fold_finished(op, &mut acc, &mut slots);

        if joined.quorum_met {
            finish(op, &slots);
            return Dispatched {
                results: op.on_finalize(acc),
                rounds: targets.len(),
                failed_rounds,
                targets,
            };
        }

        failed_rounds += 1;
        if failed_rounds > config.max_failure {
            debug!(
                kind = %op.kind(),
                failed_rounds,
                max_failure = config.max_failure,
                "failure budget spent, settling for partial results"
            );
            finish(op, &slots);
            return Dispatched {
                results: op.on_finalize(acc),
                rounds: targets.len(),
                failed_rounds,
                targets,
            };
        }

        target = target.saturating_sub(joined.successes);
    }
}

/// Fold every succeeded slot into the accumulator and free every terminal
/// slot. Pending slots stay for the next round.
fn fold_finished<O: Operation>(
    op: &O,
    acc: &mut O::Accumulator,
    slots: &mut [Option<ResponseFuture<O::Reply>>],
) {
    for slot in slots.iter_mut() {
        let Some(response) = slot.as_ref() else {
            continue;
        };
        match response.status() {
            Status::Pending => continue,
            Status::Succeeded => {
                let peer = *response.recipient();
                if let Some(reply) = response.take_reply() {
                    op.on_partial(acc, peer, reply);
                }
            }
            Status::Failed => {
                trace!(
                    kind = %op.kind(),
                    peer = %response.recipient(),
                    reason = %response.failure_reason().unwrap_or_default(),
                    "peer request failed"
                );
            }
        }
        *slot = None;
    }
}

/// Apply the operation's cancel-on-finish policy to leftovers.
fn finish<O: Operation>(op: &O, slots: &[Option<ResponseFuture<O::Reply>>]) {
    if op.cancel_on_finish() {
        let leftovers: Vec<&ResponseFuture<O::Reply>> = slots.iter().flatten().collect();
        cancel_pending(&leftovers);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::future::Completer;
    use crate::identity::PeerAddress;
    use crate::operation::OperationKind;

    fn peer(n: u64) -> PeerAddress {
        PeerAddress::new(Id::from(n), format!("10.0.0.{n}:9001").parse().unwrap())
    }

    #[derive(Clone, Copy)]
    enum Behaviour {
        Succeed,
        Fail,
        /// Never answers on its own.
        Hang,
    }

    /// Operation whose replies are scripted per peer.
    struct ScriptedOp {
        behaviour: HashMap<PeerAddress, Behaviour>,
        issued: Mutex<Vec<PeerAddress>>,
        completers: Mutex<Vec<Completer<u64>>>,
        cancel_on_finish: bool,
    }

    impl ScriptedOp {
        fn new(script: &[(u64, Behaviour)]) -> Self {
            Self {
                behaviour: script.iter().map(|(n, b)| (peer(*n), *b)).collect(),
                issued: Mutex::new(Vec::new()),
                completers: Mutex::new(Vec::new()),
                cancel_on_finish: false,
            }
        }

        fn issued(&self) -> Vec<PeerAddress> {
            self.issued.lock().unwrap().clone()
        }
    }

    impl Operation for ScriptedOp {
        type Reply = u64;
        type Accumulator = HashMap<PeerAddress, u64>;

        fn kind(&self) -> OperationKind {
            OperationKind::Put
        }

        fn issue(&self, peer: &PeerAddress) -> ResponseFuture<u64> {
            self.issued.lock().unwrap().push(*peer);
            let behaviour = self.behaviour.get(peer).copied().unwrap_or(Behaviour::Fail);
            let id = u64::from_be_bytes(peer.id.as_bytes()[12..].try_into().unwrap());
            match behaviour {
                Behaviour::Succeed => ResponseFuture::spawn(*peer, async move { Ok(id) }),
                Behaviour::Fail => {
                    ResponseFuture::spawn(*peer, async { Err(anyhow::anyhow!("refused")) })
                }
                Behaviour::Hang => {
                    let (response, completer) = ResponseFuture::pending(*peer);
                    self.completers.lock().unwrap().push(completer);
                    response
                }
            }
        }

        fn on_partial(&self, acc: &mut Self::Accumulator, peer: PeerAddress, reply: u64) {
            assert!(acc.insert(peer, reply).is_none(), "reply folded twice");
        }

        fn on_finalize(&self, acc: Self::Accumulator) -> PeerResults {
            PeerResults::DirectRaw(
                acc.into_iter()
                    .map(|(p, v)| (p, v.to_be_bytes().to_vec()))
                    .collect(),
            )
        }

        fn cancel_on_finish(&self) -> bool {
            self.cancel_on_finish
        }
    }

    fn candidates(ids: &[u64]) -> CandidateSet {
        CandidateSet::new(Id::ZERO, ids.iter().map(|n| peer(*n)))
    }

    async fn run(op: &ScriptedOp, ids: &[u64], config: RequestConfig) -> Dispatched {
        tokio::time::timeout(Duration::from_secs(5), dispatch(op, candidates(ids), &config))
            .await
            .expect("dispatch never hangs")
    }

    fn assert_targets_well_formed(targets: &[usize]) {
        assert!(
            targets.windows(2).all(|w| w[1] <= w[0]),
            "target must not grow: {targets:?}"
        );
    }

    #[tokio::test]
    async fn all_success_meets_quorum_in_one_round() {
        use Behaviour::*;
        let op = ScriptedOp::new(&[(1, Succeed), (2, Succeed), (3, Succeed), (4, Succeed)]);
        let out = run(
            &op,
            &[1, 2, 3, 4],
            RequestConfig::default()
                .with_minimum_results(3)
                .with_max_failure(0)
                .with_parallel_diff(0),
        )
        .await;

        assert_eq!(out.results.len(), 3);
        assert_eq!(out.rounds, 1);
        assert_eq!(out.failed_rounds, 0);
        assert_eq!(op.issued(), vec![peer(1), peer(2), peer(3)]);
    }

    #[tokio::test]
    async fn shortfall_retries_only_the_missing_quorum() {
        use Behaviour::*;
        // Round 0: 1 fails, 2 and 3 succeed, need 3 -> short by one.
        // Round 1: target 1, refills from 4 and 5.
        let op = ScriptedOp::new(&[(1, Fail), (2, Succeed), (3, Succeed), (4, Succeed), (5, Succeed)]);
        let out = run(
            &op,
            &[1, 2, 3, 4, 5],
            RequestConfig::default()
                .with_minimum_results(3)
                .with_max_failure(2)
                .with_parallel_diff(0),
        )
        .await;

        assert_eq!(out.targets, vec![3, 1]);
        assert_eq!(out.failed_rounds, 1);
        let peers = out.results.peers();
        assert!(peers.contains(&peer(2)) && peers.contains(&peer(3)));
        assert!(peers.len() >= 3);
        assert!(!peers.contains(&peer(1)));
        assert_targets_well_formed(&out.targets);
    }

    #[tokio::test]
    async fn overprovisioned_round_skips_remaining_candidates() {
        use Behaviour::*;
        let op = ScriptedOp::new(&[(1, Fail), (2, Succeed), (3, Succeed), (4, Succeed)]);
        let out = run(
            &op,
            &[1, 2, 3, 4],
            RequestConfig::default()
                .with_minimum_results(2)
                .with_max_failure(1)
                .with_parallel_diff(1),
        )
        .await;

        assert_eq!(out.rounds, 1);
        assert_eq!(out.failed_rounds, 0);
        assert_eq!(out.results.peers(), [peer(2), peer(3)].into_iter().collect());
        assert!(!op.issued().contains(&peer(4)));
    }

    #[tokio::test]
    async fn failure_budget_exhaustion_is_a_degraded_success() {
        use Behaviour::*;
        let op = ScriptedOp::new(&[(1, Fail), (2, Fail), (3, Fail), (4, Fail)]);
        let out = run(
            &op,
            &[1, 2, 3, 4],
            RequestConfig::default()
                .with_minimum_results(2)
                .with_max_failure(1)
                .with_parallel_diff(1),
        )
        .await;

        assert!(out.results.is_empty());
        assert_eq!(out.rounds, 2);
        assert_eq!(out.failed_rounds, 2);
        assert_eq!(out.targets, vec![2, 2]);
    }

    #[tokio::test]
    async fn too_few_candidates_resolve_with_partial_results() {
        use Behaviour::*;
        let op = ScriptedOp::new(&[(1, Succeed), (2, Succeed)]);
        let out = run(
            &op,
            &[1, 2],
            RequestConfig::default()
                .with_minimum_results(3)
                .with_max_failure(0)
                .with_parallel_diff(5),
        )
        .await;

        // The round only needs min(target, active) successes.
        assert_eq!(out.results.len(), 2);
        assert_eq!(out.rounds, 1);
        assert_eq!(out.failed_rounds, 0);
    }

    #[tokio::test]
    async fn empty_candidate_set_finalizes_immediately() {
        let op = ScriptedOp::new(&[]);
        let out = run(
            &op,
            &[],
            RequestConfig::default()
                .with_minimum_results(3)
                .with_max_failure(0)
                .with_parallel_diff(5),
        )
        .await;

        assert!(out.results.is_empty());
        assert_eq!(out.rounds, 0);
        assert!(op.issued().is_empty());
    }

    #[tokio::test]
    async fn each_peer_is_contacted_at_most_once() {
        use Behaviour::*;
        let script: Vec<(u64, Behaviour)> = (1..=12)
            .map(|n| (n, if n % 3 == 0 { Succeed } else { Fail }))
            .collect();
        let op = ScriptedOp::new(&script);
        let ids: Vec<u64> = (1..=12).collect();
        let out = run(
            &op,
            &ids,
            RequestConfig::default()
                .with_minimum_results(4)
                .with_max_failure(10)
                .with_parallel_diff(1),
        )
        .await;

        let issued = op.issued();
        let unique: HashSet<_> = issued.iter().collect();
        assert_eq!(unique.len(), issued.len());
        assert_eq!(out.results.len(), 4);
        assert_targets_well_formed(&out.targets);
    }

    #[tokio::test]
    async fn stragglers_are_cancelled_when_requested() {
        use Behaviour::*;
        let mut op = ScriptedOp::new(&[(1, Succeed), (2, Hang)]);
        op.cancel_on_finish = true;
        let out = run(
            &op,
            &[1, 2],
            RequestConfig::default()
                .with_minimum_results(1)
                .with_max_failure(0)
                .with_parallel_diff(1),
        )
        .await;

        assert_eq!(out.results.len(), 1);
        let completers = op.completers.lock().unwrap();
        assert!(!completers[0].succeed(2), "straggler was cancelled");
    }

    #[tokio::test]
    async fn stragglers_survive_without_cancel_on_finish() {
        use Behaviour::*;
        let op = ScriptedOp::new(&[(1, Succeed), (2, Hang)]);
        let out = run(
            &op,
            &[1, 2],
            RequestConfig::default()
                .with_minimum_results(1)
                .with_max_failure(0)
                .with_parallel_diff(1),
        )
        .await;

        assert_eq!(out.results.len(), 1);
        let completers = op.completers.lock().unwrap();
        assert!(completers[0].succeed(2), "straggler still pending");
    }
}
