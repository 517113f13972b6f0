use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;

use super::fiber::{Completion, Fiber};
use super::packet::Packet;
use super::step::Step;

/// Opaque identity of one fiber start, used by
/// `start_fiber_if_last_matches` to chain a follow-up safely from a
/// completion callback without racing a fiber that has since replaced
/// it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiberId(u64);

struct ActiveFiber {
    id: FiberId,
    fiber: Fiber,
}

/// Enforces at-most-one active Fiber per key (a domain UID) within one
/// namespace. Independent FiberGate instances (e.g. make-right vs.
/// status-read) never interact.
pub struct FiberGate {
    namespace: String,
    next_id: AtomicU64,
    active: Mutex<HashMap<String, ActiveFiber>>,
}

impl FiberGate {
    pub fn new(namespace: impl Into<String>) -> Self {
        FiberGate {
            namespace: namespace.into(),
            next_id: AtomicU64::new(1),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Cancels any fiber currently running for `key`, then starts a new
    /// one. Used when the caller wants to interrupt in-flight work with
    /// fresher state (e.g. a Domain MODIFIED event that changed spec).
    pub async fn start_fiber<F>(
        self: &Arc<Self>,
        key: &str,
        step: Arc<dyn Step>,
        packet: Packet,
        on_complete: F,
    ) -> FiberId
    where
        F: FnOnce(Packet, Completion) + Send + 'static,
    {
        let mut guard = self.active.lock().await;
        if let Some(existing) = guard.remove(key) {
            existing.fiber.cancel();
        }
        self.spawn_locked(&mut guard, key, step, packet, on_complete)
    }

    /// Starts a fiber for `key` only if none is currently active;
    /// returns `None` if one was already running.
    pub async fn start_fiber_if_no_current<F>(
        self: &Arc<Self>,
        key: &str,
        step: Arc<dyn Step>,
        packet: Packet,
        on_complete: F,
    ) -> Option<FiberId>
    where
        F: FnOnce(Packet, Completion) + Send + 'static,
    {
        let mut guard = self.active.lock().await;
        if guard.contains_key(key) {
            return None;
        }
        Some(self.spawn_locked(&mut guard, key, step, packet, on_complete))
    }

    /// Starts a follow-up fiber for `key` only if the currently active
    /// fiber is still the one identified by `expected`. Intended for use
    /// from within a completion callback, where a newer fiber may have
    /// already replaced the one that just finished.
    pub async fn start_fiber_if_last_matches<F>(
        self: &Arc<Self>,
        key: &str,
        expected: FiberId,
        step: Arc<dyn Step>,
        packet: Packet,
        on_complete: F,
    ) -> Option<FiberId>
    where
        F: FnOnce(Packet, Completion) + Send + 'static,
    {
        let mut guard = self.active.lock().await;
        match guard.get(key) {
            Some(active) if active.id == expected => {
                Some(self.spawn_locked(&mut guard, key, step, packet, on_complete))
            }
            _ => None,
        }
    }

    /// Snapshot of currently-active fiber keys, for diagnostics.
    pub async fn current_fibers(&self) -> Vec<String> {
        self.active.lock().await.keys().cloned().collect()
    }

    /// Drops `key`'s active-fiber entry once that fiber's completion
    /// callback has run, but only if no newer fiber has since replaced
    /// it. Without this, a key that finishes normally (rather than being
    /// cancelled and overwritten by `start_fiber`) would stay "active"
    /// forever, permanently blocking `start_fiber_if_no_current` for
    /// that key.
    async fn clear_if_current(&self, key: &str, id: FiberId) {
        let mut guard = self.active.lock().await;
        if guard.get(key).is_some_and(|active| active.id == id) {
            guard.remove(key);
        }
    }

    fn spawn_locked<F>(
        self: &Arc<Self>,
        guard: &mut HashMap<String, ActiveFiber>,
        key: &str,
        step: Arc<dyn Step>,
        packet: Packet,
        on_complete: F,
    ) -> FiberId
    where
        F: FnOnce(Packet, Completion) + Send + 'static,
    {
        let id = FiberId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let gate = self.clone();
        let key_owned = key.to_string();
        let (fiber, _join) = Fiber::start(step, packet, move |packet, completion| {
            on_complete(packet, completion);
            tokio::spawn(async move {
                gate.clear_if_current(&key_owned, id).await;
            });
        });
        guard.insert(key.to_string(), ActiveFiber { id, fiber });
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::step::NextAction;
    use crate::util::Error;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::oneshot;

    struct SuspendForever;

    #[async_trait::async_trait]
    impl Step for SuspendForever {
        async fn apply(&self, _packet: &mut Packet) -> Result<NextAction, Error> {
            Ok(NextAction::suspend_for(Duration::from_secs(3600)))
        }
    }

    struct Immediate;

    #[async_trait::async_trait]
    impl Step for Immediate {
        async fn apply(&self, _packet: &mut Packet) -> Result<NextAction, Error> {
            Ok(NextAction::End)
        }
    }

    #[tokio::test]
    async fn start_fiber_if_no_current_refuses_a_second_start() {
        let gate = Arc::new(FiberGate::new("ns1"));
        let first = gate
            .start_fiber_if_no_current(
                "domain-a",
                Arc::new(SuspendForever),
                Packet::new("ns1", "domain-a"),
                |_, _| {},
            )
            .await;
        assert!(first.is_some());

        let second = gate
            .start_fiber_if_no_current(
                "domain-a",
                Arc::new(SuspendForever),
                Packet::new("ns1", "domain-a"),
                |_, _| {},
            )
            .await;
        assert!(second.is_none());
        assert_eq!(gate.current_fibers().await, vec!["domain-a".to_string()]);
    }

    #[tokio::test]
    async fn start_fiber_cancels_the_previous_one() {
        let gate = Arc::new(FiberGate::new("ns1"));
        let cancelled_count = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();
        let cancelled_count_cb = cancelled_count.clone();
        gate.start_fiber(
            "domain-a",
            Arc::new(SuspendForever),
            Packet::new("ns1", "domain-a"),
            move |_packet, completion| {
                if matches!(completion, Completion::Cancelled) {
                    cancelled_count_cb.fetch_add(1, Ordering::SeqCst);
                }
                let _ = tx.send(());
            },
        )
        .await;

        gate.start_fiber(
            "domain-a",
            Arc::new(Immediate),
            Packet::new("ns1", "domain-a"),
            |_, _| {},
        )
        .await;

        rx.await.unwrap();
        assert_eq!(cancelled_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn start_fiber_if_last_matches_rejects_a_stale_id() {
        let gate = Arc::new(FiberGate::new("ns1"));
        let id = gate
            .start_fiber_if_no_current(
                "domain-a",
                Arc::new(Immediate),
                Packet::new("ns1", "domain-a"),
                |_, _| {},
            )
            .await
            .unwrap();

        // A newer fiber takes over before the follow-up attempt.
        let newer = gate
            .start_fiber(
                "domain-a",
                Arc::new(SuspendForever),
                Packet::new("ns1", "domain-a"),
                |_, _| {},
            )
            .await;
        assert_ne!(id, newer);

        let followup = gate
            .start_fiber_if_last_matches(
                "domain-a",
                id,
                Arc::new(Immediate),
                Packet::new("ns1", "domain-a"),
                |_, _| {},
            )
            .await;
        assert!(followup.is_none());
    }

    #[tokio::test]
    async fn a_key_becomes_available_again_once_its_fiber_completes() {
        let gate = Arc::new(FiberGate::new("ns1"));
        let (tx, rx) = oneshot::channel();
        gate.start_fiber_if_no_current(
            "domain-a",
            Arc::new(Immediate),
            Packet::new("ns1", "domain-a"),
            move |_, _| {
                let _ = tx.send(());
            },
        )
        .await;
        rx.await.unwrap();

        // The completion callback's own cleanup runs in a follow-up task;
        // give it a chance to run before asserting the key is free again.
        for _ in 0..100 {
            if gate.current_fibers().await.is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(gate.current_fibers().await.is_empty());

        let second = gate
            .start_fiber_if_no_current(
                "domain-a",
                Arc::new(Immediate),
                Packet::new("ns1", "domain-a"),
                |_, _| {},
            )
            .await;
        assert!(second.is_some());
    }
}
