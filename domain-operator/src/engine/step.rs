use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::util::Error;

use super::packet::Packet;

pub type Wait = Pin<Box<dyn Future<Output = ()> + Send>>;

/// What the executor should do once a step's `apply` returns.
pub enum NextAction {
    /// Move on to the given step, same Packet.
    Continue(Arc<dyn Step>),
    /// Park the fiber until `wait` resolves, then re-invoke the step
    /// that produced this value with the same Packet.
    Suspend(Wait),
    /// The chain is finished.
    End,
}

impl NextAction {
    pub fn suspend_for(duration: std::time::Duration) -> NextAction {
        NextAction::Suspend(Box::pin(tokio::time::sleep(duration)))
    }
}

/// A single unit of work in a make-right or status plan.
///
/// Steps are immutable and composable by chaining; branching is
/// expressed by a step's own `apply` returning `Continue` with an
/// arbitrary next step rather than through subtyping.
#[async_trait::async_trait]
pub trait Step: Send + Sync {
    async fn apply(&self, packet: &mut Packet) -> Result<NextAction, Error>;

    /// A short human-readable name used in diagnostics and logging.
    fn name(&self) -> &str {
        "step"
    }
}

struct EndStep;

#[async_trait::async_trait]
impl Step for EndStep {
    async fn apply(&self, _packet: &mut Packet) -> Result<NextAction, Error> {
        Ok(NextAction::End)
    }

    fn name(&self) -> &str {
        "end"
    }
}

/// Wraps one step of a chain so that its own `End` is translated into
/// "continue to the next step in the chain" while a `Continue`/`Suspend`
/// from the inner step passes straight through, preserving the inner
/// step's ability to branch to an arbitrary step.
struct ChainLink {
    inner: Arc<dyn Step>,
    next: Option<Arc<dyn Step>>,
}

#[async_trait::async_trait]
impl Step for ChainLink {
    async fn apply(&self, packet: &mut Packet) -> Result<NextAction, Error> {
        match self.inner.apply(packet).await? {
            NextAction::End => match &self.next {
                Some(next) => Ok(NextAction::Continue(next.clone())),
                None => Ok(NextAction::End),
            },
            other => Ok(other),
        }
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

/// Builds a step whose `apply` walks through `steps` in order, stopping
/// at the first one that suspends, branches elsewhere, or errors.
pub fn chain(steps: Vec<Arc<dyn Step>>) -> Arc<dyn Step> {
    let mut next: Option<Arc<dyn Step>> = None;
    for inner in steps.into_iter().rev() {
        next = Some(Arc::new(ChainLink { inner, next }));
    }
    next.unwrap_or_else(|| Arc::new(EndStep))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::packet::{Packet, PacketKey};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingStep {
        label: &'static str,
        order: Arc<std::sync::Mutex<Vec<&'static str>>>,
    }

    #[async_trait::async_trait]
    impl Step for RecordingStep {
        async fn apply(&self, _packet: &mut Packet) -> Result<NextAction, Error> {
            self.order.lock().unwrap().push(self.label);
            Ok(NextAction::End)
        }

        fn name(&self) -> &str {
            self.label
        }
    }

    #[tokio::test]
    async fn chain_runs_steps_in_order_until_end() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let steps: Vec<Arc<dyn Step>> = vec![
            Arc::new(RecordingStep { label: "a", order: order.clone() }),
            Arc::new(RecordingStep { label: "b", order: order.clone() }),
            Arc::new(RecordingStep { label: "c", order: order.clone() }),
        ];
        let mut current = chain(steps);
        let mut packet = Packet::new("ns", "d1");
        loop {
            match current.apply(&mut packet).await.unwrap() {
                NextAction::Continue(next) => current = next,
                NextAction::End => break,
                NextAction::Suspend(_) => panic!("unexpected suspend"),
            }
        }
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    struct BranchingStep {
        taken: Arc<AtomicUsize>,
        branch_to: Arc<dyn Step>,
    }

    #[async_trait::async_trait]
    impl Step for BranchingStep {
        async fn apply(&self, _packet: &mut Packet) -> Result<NextAction, Error> {
            self.taken.fetch_add(1, Ordering::SeqCst);
            Ok(NextAction::Continue(self.branch_to.clone()))
        }
    }

    #[tokio::test]
    async fn a_step_can_branch_past_the_rest_of_the_chain() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let skip_target: Arc<dyn Step> =
            Arc::new(RecordingStep { label: "skip-target", order: order.clone() });
        let taken = Arc::new(AtomicUsize::new(0));
        let steps: Vec<Arc<dyn Step>> = vec![
            Arc::new(BranchingStep { taken: taken.clone(), branch_to: skip_target }),
            Arc::new(RecordingStep { label: "never-reached", order: order.clone() }),
        ];
        let mut current = chain(steps);
        let mut packet = Packet::new("ns", "d1");
        packet.put(PacketKey::Interrupt, true);
        loop {
            match current.apply(&mut packet).await.unwrap() {
                NextAction::Continue(next) => current = next,
                NextAction::End => break,
                NextAction::Suspend(_) => panic!("unexpected suspend"),
            }
        }
        assert_eq!(taken.load(Ordering::SeqCst), 1);
        assert_eq!(*order.lock().unwrap(), vec!["skip-target"]);
    }
}
