//! # Per-Peer Response Futures
//!
//! A [`ResponseFuture`] is the eventual outcome of one RPC to one peer.
//!
//! ## States
//!
//! `Pending → Succeeded | Failed`, one-way. The first completion wins;
//! later completions (a reply racing a cancel) are ignored.
//!
//! ## Completion
//!
//! - Listeners run on whichever task completes the response, or immediately
//!   when attached to a response that is already terminal.
//! - [`ResponseFuture::completed`] is the async form, used by the fork/join.
//! - [`ResponseFuture::cancel`] marks a pending response failed and aborts
//!   the RPC task. The remote peer may still process the request.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::identity::PeerAddress;

/// Failure reason recorded by [`ResponseFuture::cancel`].
pub const CANCELLED_REASON: &str = "cancelled";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Pending,
    Succeeded,
    Failed,
}

type Listener = Box<dyn FnOnce(Status) + Send>;

enum Outcome<T> {
    Pending,
    /// `None` once the reply has been taken.
    Succeeded(Option<T>),
    Failed(String),
}

impl<T> Outcome<T> {
    fn status(&self) -> Status {
        match self {
            Outcome::Pending => Status::Pending,
            Outcome::Succeeded(_) => Status::Succeeded,
            Outcome::Failed(_) => Status::Failed,
        }
    }
}

struct Inner<T> {
    outcome: Outcome<T>,
    listeners: Vec<Listener>,
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    status: watch::Sender<Status>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<T> Shared<T> {
    fn new() -> Self {
        let (status, _) = watch::channel(Status::Pending);
        Self {
            inner: Mutex::new(Inner {
                outcome: Outcome::Pending,
                listeners: Vec::new(),
            }),
            status,
        }
    }

    /// Returns `false` if the response was already terminal.
    ///
    /// The outcome and the watch status change under the same lock; listeners
    /// run after it is released.
    fn complete(&self, result: anyhow::Result<T>) -> bool {
        let (status, listeners) = {
            let mut inner = lock(&self.inner);
            if !matches!(inner.outcome, Outcome::Pending) {
                return false;
            }
            inner.outcome = match result {
                Ok(reply) => Outcome::Succeeded(Some(reply)),
                Err(e) => Outcome::Failed(format!("{e:#}")),
            };
            let status = inner.outcome.status();
            self.status.send_replace(status);
            (status, std::mem::take(&mut inner.listeners))
        };

        for listener in listeners {
            listener(status);
        }
        true
    }

    fn status(&self) -> Status {
        lock(&self.inner).outcome.status()
    }
}

pub struct ResponseFuture<T> {
    recipient: PeerAddress,
    shared: Arc<Shared<T>>,
    task: Option<AbortHandle>,
}

impl<T: Send + 'static> ResponseFuture<T> {
    /// Run `rpc` on the runtime and track its outcome.
    pub fn spawn<F>(recipient: PeerAddress, rpc: F) -> Self
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let shared = Arc::new(Shared::new());
        let completer = shared.clone();
        let handle = tokio::spawn(async move {
            let result = rpc.await;
            completer.complete(result);
        });
        Self {
            recipient,
            shared,
            task: Some(handle.abort_handle()),
        }
    }
}

impl<T> ResponseFuture<T> {
    /// A response completed by hand through the returned [`Completer`].
    pub fn pending(recipient: PeerAddress) -> (Self, Completer<T>) {
        let shared = Arc::new(Shared::new());
        let completer = Completer {
            shared: shared.clone(),
        };
        (
            Self {
                recipient,
                shared,
                task: None,
            },
            completer,
        )
    }

    /// The peer this request was sent to.
    pub fn recipient(&self) -> &PeerAddress {
        &self.recipient
    }

    pub fn status(&self) -> Status {
        self.shared.status()
    }

    pub fn is_pending(&self) -> bool {
        self.status() == Status::Pending
    }

    pub fn is_success(&self) -> bool {
        self.status() == Status::Succeeded
    }

    pub fn failure_reason(&self) -> Option<String> {
        match &lock(&self.shared.inner).outcome {
            Outcome::Failed(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    /// Invoke `listener` once this response is terminal.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: FnOnce(Status) + Send + 'static,
    {
        let status = {
            let mut inner = lock(&self.shared.inner);
            match inner.outcome.status() {
                Status::Pending => {
                    inner.listeners.push(Box::new(listener));
                    return;
                }
                terminal => terminal,
            }
        };
        listener(status);
    }

    /// Resolves with the terminal status.
    ///
    /// The returned future does not borrow `self`, so many of them can be
    /// polled together.
    pub fn completed(&self) -> impl Future<Output = Status> + Send + 'static {
        let mut rx = self.shared.status.subscribe();
        async move {
            let status = rx.wait_for(|s| *s != Status::Pending).await.map(|s| *s);
            status.unwrap_or(Status::Failed)
        }
    }

    /// Move the success payload out. Returns `None` unless succeeded, and
    /// on every call after the first.
    pub fn take_reply(&self) -> Option<T> {
        match &mut lock(&self.shared.inner).outcome {
            Outcome::Succeeded(reply) => reply.take(),
            _ => None,
        }
    }

    /// Best-effort cancel: marks a pending response failed and aborts the
    /// RPC task. Returns `false` if the response had already finished.
    pub fn cancel(&self) -> bool {
        let cancelled = self
            .shared
            .complete(Err(anyhow::anyhow!(CANCELLED_REASON)));
        if cancelled {
            if let Some(task) = &self.task {
                task.abort();
            }
        }
        cancelled
    }
}

impl<T> std::fmt::Debug for ResponseFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseFuture")
            .field("recipient", &self.recipient)
            .field("status", &self.status())
            .finish()
    }
}

/// Completes a response created with [`ResponseFuture::pending`].
pub struct Completer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Completer<T> {
    pub fn succeed(&self, reply: T) -> bool {
        self.shared.complete(Ok(reply))
    }

    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.shared.complete(Err(anyhow::anyhow!(reason.into())))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::identity::Id;

    fn peer() -> PeerAddress {
        PeerAddress::new(Id::from(1u64), "127.0.0.1:4000".parse().unwrap())
    }

    #[tokio::test]
    async fn spawned_rpc_succeeds() {
        let response = ResponseFuture::spawn(peer(), async { Ok::<_, anyhow::Error>(42u32) });

        assert_eq!(response.completed().await, Status::Succeeded);
        assert!(response.is_success());
        assert_eq!(response.take_reply(), Some(42));
        assert_eq!(response.take_reply(), None);
    }

    #[tokio::test]
    async fn spawned_rpc_failure_keeps_reason() {
        let response: ResponseFuture<u32> =
            ResponseFuture::spawn(peer(), async { Err(anyhow::anyhow!("refused")) });

        assert_eq!(response.completed().await, Status::Failed);
        assert_eq!(response.failure_reason().as_deref(), Some("refused"));
        assert_eq!(response.take_reply(), None);
    }

    #[test]
    fn transitions_are_one_way() {
        let (response, completer) = ResponseFuture::<u32>::pending(peer());
        assert!(response.is_pending());

        assert!(completer.fail("timeout"));
        assert!(!completer.succeed(1));
        assert_eq!(response.status(), Status::Failed);
    }

    #[test]
    fn listener_runs_once_on_completion() {
        let (response, completer) = ResponseFuture::<u32>::pending(peer());
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        response.add_listener(move |status| {
            assert_eq!(status, Status::Succeeded);
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        completer.succeed(7);
        completer.succeed(8);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_on_terminal_response_runs_immediately() {
        let (response, completer) = ResponseFuture::<u32>::pending(peer());
        completer.fail("gone");

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        response.add_listener(move |status| {
            assert_eq!(status, Status::Failed);
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_marks_pending_response_failed() {
        let response: ResponseFuture<u32> = ResponseFuture::spawn(peer(), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(1)
        });

        assert!(response.cancel());
        assert_eq!(response.completed().await, Status::Failed);
        assert_eq!(response.failure_reason().as_deref(), Some(CANCELLED_REASON));
        assert!(!response.cancel());
    }

    #[test]
    fn listeners_attached_during_completion_never_see_pending() {
        for _ in 0..2_000 {
            let (response, completer) = ResponseFuture::<u32>::pending(peer());
            let calls = Arc::new(AtomicUsize::new(0));

            std::thread::scope(|scope| {
                scope.spawn(|| completer.succeed(1));
                scope.spawn(|| {
                    for _ in 0..50 {
                        let counter = calls.clone();
                        response.add_listener(move |status| {
                            assert_eq!(status, Status::Succeeded);
                            counter.fetch_add(1, Ordering::SeqCst);
                        });
                        if !response.is_pending() {
                            assert_eq!(response.status(), Status::Succeeded);
                        }
                    }
                });
            });

            assert_eq!(calls.load(Ordering::SeqCst), 50);
            assert_eq!(response.take_reply(), Some(1));
        }
    }

    #[tokio::test]
    async fn cancel_after_success_is_a_no_op() {
        let (response, completer) = ResponseFuture::<u32>::pending(peer());
        completer.succeed(3);

        assert!(!response.cancel());
        assert!(response.is_success());
    }
}
