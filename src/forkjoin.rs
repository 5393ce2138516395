//! Parallel batch joiner.
//!
//! Waits on one round of per-peer responses until either enough of them
//! succeed (quorum met) or all of them are terminal. Successes are counted
//! in completion order, not slot order.

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::trace;

use crate::future::{ResponseFuture, Status};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JoinOutcome {
    /// `need` responses succeeded before the batch drained.
    pub quorum_met: bool,
    /// Successes observed by the time the join resolved.
    pub successes: usize,
}

/// Join one batch of responses.
///
/// Empty slots are ignored. With no filled slot the join resolves at once as
/// all-finished; with `need == 0` it resolves at once as quorum-met. When
/// `cancel_on_finish` is set, responses still pending at quorum are
/// cancelled.
pub async fn fork_join<T>(
    slots: &[Option<ResponseFuture<T>>],
    need: usize,
    cancel_on_finish: bool,
) -> JoinOutcome {
    let filled: Vec<&ResponseFuture<T>> = slots.iter().flatten().collect();

    if filled.is_empty() {
        return JoinOutcome {
            quorum_met: false,
            successes: 0,
        };
    }

    if need == 0 {
        let successes = filled.iter().filter(|r| r.is_success()).count();
        if cancel_on_finish {
            cancel_pending(&filled);
        }
        return JoinOutcome {
            quorum_met: true,
            successes,
        };
    }

    let mut waiting: FuturesUnordered<_> = filled.iter().map(|r| r.completed()).collect();
    let mut successes = 0;
    let mut finished = 0;

    while let Some(status) = waiting.next().await {
        finished += 1;
        if status == Status::Succeeded {
            successes += 1;
            if successes >= need {
                trace!(
                    need,
                    successes,
                    finished,
                    filled = filled.len(),
                    "fork/join quorum met"
                );
                if cancel_on_finish {
                    cancel_pending(&filled);
                }
                return JoinOutcome {
                    quorum_met: true,
                    successes,
                };
            }
        }
    }

    trace!(need, successes, filled = filled.len(), "fork/join drained without quorum");
    JoinOutcome {
        quorum_met: false,
        successes,
    }
}

/// Cancel every response that is still pending.
pub fn cancel_pending<T>(responses: &[&ResponseFuture<T>]) {
    for response in responses {
        if response.cancel() {
            trace!(peer = %response.recipient(), "cancelled straggler");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::future::Completer;
    use crate::identity::{Id, PeerAddress};

    fn peer(n: u64) -> PeerAddress {
        PeerAddress::new(Id::from(n), "127.0.0.1:4000".parse().unwrap())
    }

    fn pending_slots(n: u64) -> (Vec<Option<ResponseFuture<u64>>>, Vec<Completer<u64>>) {
        (1..=n)
            .map(|i| {
                let (response, completer) = ResponseFuture::pending(peer(i));
                (Some(response), completer)
            })
            .unzip()
    }

    #[tokio::test]
    async fn empty_batch_resolves_as_all_finished() {
        let slots: Vec<Option<ResponseFuture<u64>>> = vec![None, None, None];
        let outcome = fork_join(&slots, 2, false).await;

        assert_eq!(
            outcome,
            JoinOutcome {
                quorum_met: false,
                successes: 0
            }
        );
    }

    #[tokio::test]
    async fn quorum_met_before_stragglers_finish() {
        let (slots, completers) = pending_slots(3);
        completers[0].succeed(1);
        completers[2].succeed(3);

        let outcome = tokio::time::timeout(Duration::from_secs(5), fork_join(&slots, 2, false))
            .await
            .expect("join resolves without the straggler");

        assert!(outcome.quorum_met);
        assert_eq!(outcome.successes, 2);
        assert!(slots[1].as_ref().unwrap().is_pending());
    }

    #[tokio::test]
    async fn cancel_on_finish_cancels_stragglers() {
        let (slots, completers) = pending_slots(3);
        completers[0].succeed(1);

        let outcome = fork_join(&slots, 1, true).await;

        assert!(outcome.quorum_met);
        assert_eq!(slots[1].as_ref().unwrap().status(), Status::Failed);
        assert_eq!(slots[2].as_ref().unwrap().status(), Status::Failed);
        assert!(!completers[1].succeed(2));
    }

    #[tokio::test]
    async fn all_finished_without_quorum_counts_successes() {
        let (slots, completers) = pending_slots(3);
        completers[0].fail("refused");
        completers[1].succeed(2);
        completers[2].fail("timeout");

        let outcome = fork_join(&slots, 2, false).await;

        assert!(!outcome.quorum_met);
        assert_eq!(outcome.successes, 1);
    }

    #[tokio::test]
    async fn late_completions_are_observed() {
        let (slots, completers) = pending_slots(2);

        let join = tokio::spawn(async move { fork_join(&slots, 2, false).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        completers[1].succeed(2);
        tokio::time::sleep(Duration::from_millis(10)).await;
        completers[0].succeed(1);

        let outcome = join.await.unwrap();
        assert!(outcome.quorum_met);
        assert_eq!(outcome.successes, 2);
    }

    #[tokio::test]
    async fn zero_need_is_met_immediately() {
        let (slots, _completers) = pending_slots(2);
        let outcome = fork_join(&slots, 0, false).await;

        assert!(outcome.quorum_met);
        assert_eq!(outcome.successes, 0);
    }
}
