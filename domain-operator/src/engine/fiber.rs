use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::util::Error;

use super::packet::Packet;
use super::step::{NextAction, Step};

/// How a Fiber ended.
pub enum Completion {
    /// The chain ran to its `End` with no error.
    Complete,
    /// Cancelled before reaching `End`, via `FiberGate::startFiber` or an
    /// explicit interrupt.
    Cancelled,
    /// A step returned `Err`, or a step body panicked.
    Failed(Error),
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Completion::Complete => write!(f, "Complete"),
            Completion::Cancelled => write!(f, "Cancelled"),
            Completion::Failed(e) => write!(f, "Failed({e})"),
        }
    }
}

/// A handle to a running Fiber. Dropping this does not cancel the
/// fiber; call `cancel()` explicitly.
pub struct Fiber {
    cancel: CancellationToken,
}

impl Fiber {
    /// Schedules `first.apply` to run on the Tokio runtime and returns
    /// immediately with a handle plus the task's `JoinHandle`. Never
    /// blocks an OS thread: every suspension point is an `.await`.
    pub fn start<F>(
        first: Arc<dyn Step>,
        mut packet: Packet,
        on_complete: F,
    ) -> (Fiber, JoinHandle<()>)
    where
        F: FnOnce(Packet, Completion) + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let completion = match AssertUnwindSafe(run_chain(first, &mut packet, &task_cancel))
                .catch_unwind()
                .await
            {
                Ok(completion) => completion,
                Err(_) => Completion::Failed(Error::UserInput(
                    "fiber step panicked; isolated at the fiber boundary".to_string(),
                )),
            };
            on_complete(packet, completion);
        });
        (Fiber { cancel }, handle)
    }

    /// Marks the fiber for cancellation. Takes effect at the next
    /// cooperative point (the next `apply` call or suspension resume),
    /// not immediately; in-flight Kubernetes requests are not rolled
    /// back.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

async fn run_chain(
    mut current: Arc<dyn Step>,
    packet: &mut Packet,
    cancel: &CancellationToken,
) -> Completion {
    loop {
        if cancel.is_cancelled() {
            return Completion::Cancelled;
        }
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Completion::Cancelled,
            outcome = current.apply(packet) => outcome,
        };
        match outcome {
            Ok(NextAction::Continue(next)) => current = next,
            Ok(NextAction::Suspend(wait)) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Completion::Cancelled,
                    _ = wait => {}
                }
            }
            Ok(NextAction::End) => return Completion::Complete,
            Err(e) => return Completion::Failed(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::packet::Packet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::oneshot;

    struct CountingStep {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Step for CountingStep {
        async fn apply(&self, _packet: &mut Packet) -> Result<NextAction, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(NextAction::End)
        }
    }

    #[tokio::test]
    async fn a_completed_chain_reports_complete() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();
        let (_fiber, join) = Fiber::start(
            Arc::new(CountingStep { calls: calls.clone() }),
            Packet::new("ns", "d1"),
            move |_packet, completion| {
                let _ = tx.send(matches!(completion, Completion::Complete));
            },
        );
        join.await.unwrap();
        assert!(rx.await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    struct FailingStep;

    #[async_trait::async_trait]
    impl Step for FailingStep {
        async fn apply(&self, _packet: &mut Packet) -> Result<NextAction, Error> {
            Err(Error::UserInput("boom".to_string()))
        }
    }

    #[tokio::test]
    async fn an_erroring_step_reports_failed_not_a_panic() {
        let (tx, rx) = oneshot::channel();
        let (_fiber, join) = Fiber::start(
            Arc::new(FailingStep),
            Packet::new("ns", "d1"),
            move |_packet, completion| {
                let _ = tx.send(matches!(completion, Completion::Failed(_)));
            },
        );
        join.await.unwrap();
        assert!(rx.await.unwrap());
    }

    struct ForeverStep;

    #[async_trait::async_trait]
    impl Step for ForeverStep {
        async fn apply(&self, _packet: &mut Packet) -> Result<NextAction, Error> {
            Ok(NextAction::suspend_for(Duration::from_secs(3600)))
        }
    }

    #[tokio::test]
    async fn cancel_interrupts_a_suspended_fiber() {
        let (tx, rx) = oneshot::channel();
        let (fiber, join) = Fiber::start(
            Arc::new(ForeverStep),
            Packet::new("ns", "d1"),
            move |_packet, completion| {
                let _ = tx.send(matches!(completion, Completion::Cancelled));
            },
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        fiber.cancel();
        join.await.unwrap();
        assert!(rx.await.unwrap());
    }
}
