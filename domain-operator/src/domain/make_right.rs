use std::sync::Arc;

use arc_swap::ArcSwap;
use kube::Client;
use weblogic_domain_types::{Domain, DomainStatus};

use crate::engine::fiber::Completion;
use crate::engine::fiber_gate::FiberGate;
use crate::engine::packet::{Packet, PacketKey};
use crate::engine::presence::PresenceCache;
use crate::engine::retry::decide_retry;
use crate::util::Error;
use crate::util::patch::patch_status;

use super::planner::{self, Flags};
use super::tuning::Tuning;

/// Ties the Make-Right Planner, the make-right FiberGate and the
/// Retry/Backoff Controller together: every watch handler and the retry
/// timer funnel through `MakeRightEngine::trigger`, the only place that
/// calls `planner::decide` and starts a fiber on the make-right gate
/// (spec.md §4.5, §4.8).
pub struct MakeRightEngine {
    pub client: Client,
    pub presence: Arc<PresenceCache>,
    pub gate: Arc<FiberGate>,
    pub tuning: Arc<ArcSwap<Tuning>>,
    #[cfg(feature = "metrics")]
    pub metrics: Arc<crate::util::metrics::EngineMetrics>,
}

/// One request to (re)run make-right for a domain.
#[derive(Clone)]
pub struct Trigger {
    pub namespace: String,
    pub domain_uid: String,
    /// The Domain object observed on a Domain ADDED/MODIFIED event.
    /// `None` for triggers coming from Pod/Service/ConfigMap/Event
    /// watches, which recheck against whatever Domain is already cached.
    pub live_domain: Option<Domain>,
    pub flags: Flags,
    pub for_deletion: bool,
}

impl MakeRightEngine {
    pub fn new(
        client: Client,
        presence: Arc<PresenceCache>,
        gate: Arc<FiberGate>,
        tuning: Arc<ArcSwap<Tuning>>,
        #[cfg(feature = "metrics")] metrics: Arc<crate::util::metrics::EngineMetrics>,
    ) -> Arc<Self> {
        #[cfg(feature = "metrics")]
        {
            Arc::new(MakeRightEngine { client, presence, gate, tuning, metrics })
        }
        #[cfg(not(feature = "metrics"))]
        {
            Arc::new(MakeRightEngine { client, presence, gate, tuning })
        }
    }

    pub async fn trigger(self: &Arc<Self>, trigger: Trigger) {
        if trigger.for_deletion {
            self.run_down(trigger).await;
        } else {
            self.run_up(trigger).await;
        }
    }

    async fn run_up(self: &Arc<Self>, trigger: Trigger) {
        let Trigger { namespace, domain_uid, live_domain, flags, .. } = trigger;

        // Capture whatever was cached *before* this event updates it, so
        // `decide()` still sees `cached == None` on first adoption rather
        // than comparing the live domain against itself.
        let previous_domain = match self.presence.get(&namespace, &domain_uid).await {
            Some(info) => Some(info.lock().await.domain.clone()),
            None => None,
        };

        if let Some(domain) = live_domain.clone() {
            self.presence.observe_domain(&namespace, domain).await;
        } else if previous_domain.is_none() {
            return;
        }

        let Some(info) = self.presence.get(&namespace, &domain_uid).await else {
            return;
        };

        let (live, deleting, populated) = {
            let guard = info.lock().await;
            (guard.domain.clone(), guard.deleting, guard.populated)
        };

        // Invariant (spec.md §3): while deleting=true, no up-plan may start.
        if deleting {
            return;
        }

        #[cfg(feature = "metrics")]
        self.metrics
            .reconcile_counter
            .with_label_values(&[&domain_uid, &namespace])
            .inc();

        #[cfg(feature = "metrics")]
        let decide_start = std::time::Instant::now();

        let max_retries = self.tuning.load().max_failure_retries();
        let decision = planner::decide(&live, previous_domain.as_ref(), flags, max_retries);
        if !decision.run {
            return;
        }

        let mut plan_domain = live.clone();
        if decision.force_online_update_disabled
            && let Some(model) = plan_domain.spec.configuration.model.as_mut()
        {
            model.online_update.enabled = false;
        }

        let needs_introspection = !populated
            || previous_domain
                .as_ref()
                .is_none_or(|prev| {
                    prev.spec.introspect_version != live.spec.introspect_version
                        || prev.spec.image != live.spec.image
                        || prev.spec.restart_version != live.spec.restart_version
                });
        let action_label = if needs_introspection { "introspect_and_apply" } else { "apply" };

        // Report the read/decision phase performance.
        #[cfg(feature = "metrics")]
        self.metrics
            .read_histogram
            .with_label_values(&[&domain_uid, &namespace, action_label])
            .observe(decide_start.elapsed().as_secs_f64());

        #[cfg(feature = "metrics")]
        self.metrics
            .action_counter
            .with_label_values(&[&domain_uid, &namespace, action_label])
            .inc();

        let started = planner::started_servers(&plan_domain);
        let step = planner::build_up_plan(self.client.clone(), plan_domain, needs_introspection);

        let mut packet = Packet::new(namespace.clone(), domain_uid.clone());
        packet.put(PacketKey::ForceOnlineUpdateDisabled, decision.force_online_update_disabled);
        packet.put(PacketKey::ServerStartupInfo, started);
        if let Some(v) = &live.spec.introspect_version {
            packet.put(PacketKey::IntrospectVersion, v.clone());
        }

        // Benchmark the write phase: the step chain a fiber runs to
        // completion asynchronously.
        #[cfg(feature = "metrics")]
        let write_timer = self
            .metrics
            .write_histogram
            .with_label_values(&[&domain_uid, &namespace, action_label])
            .start_timer();

        let engine = self.clone();
        let ns = namespace.clone();
        let uid = domain_uid.clone();
        let on_complete = move |packet: Packet, completion: Completion| {
            #[cfg(feature = "metrics")]
            write_timer.observe_duration();
            engine.spawn_completion_handler(ns, uid, packet, completion);
        };

        if flags.interrupt {
            self.gate.start_fiber(&domain_uid, step, packet, on_complete).await;
        } else {
            self.gate.start_fiber_if_no_current(&domain_uid, step, packet, on_complete).await;
        }
    }

    async fn run_down(self: &Arc<Self>, trigger: Trigger) {
        let Trigger { namespace, domain_uid, .. } = trigger;
        let Some(info) = self.presence.get(&namespace, &domain_uid).await else {
            return;
        };
        {
            let mut guard = info.lock().await;
            if guard.deleting {
                return;
            }
            guard.deleting = true;
        }

        #[cfg(feature = "metrics")]
        {
            self.metrics.reconcile_counter.with_label_values(&[&domain_uid, &namespace]).inc();
            self.metrics
                .action_counter
                .with_label_values(&[&domain_uid, &namespace, "delete_all"])
                .inc();
        }

        let step = planner::build_down_plan(
            self.client.clone(),
            self.presence.clone(),
            namespace.clone(),
            domain_uid.clone(),
        );
        let packet = Packet::new(namespace.clone(), domain_uid.clone());

        #[cfg(feature = "metrics")]
        let write_timer = self
            .metrics
            .write_histogram
            .with_label_values(&[&domain_uid, &namespace, "delete_all"])
            .start_timer();

        let engine = self.clone();
        let ns = namespace.clone();
        let uid = domain_uid.clone();
        self.gate
            .start_fiber(&domain_uid, step, packet, move |packet, completion| {
                #[cfg(feature = "metrics")]
                write_timer.observe_duration();
                engine.spawn_completion_handler(ns, uid, packet, completion);
            })
            .await;
    }

    /// `FiberGate`'s completion callback is synchronous; hand the async
    /// follow-up (status patch, retry scheduling) to its own task rather
    /// than blocking the fiber's own completion path.
    fn spawn_completion_handler(
        self: &Arc<Self>,
        namespace: String,
        domain_uid: String,
        packet: Packet,
        completion: Completion,
    ) {
        let engine = self.clone();
        tokio::spawn(async move {
            engine.handle_completion(namespace, domain_uid, packet, completion).await;
        });
    }

    async fn handle_completion(
        self: &Arc<Self>,
        namespace: String,
        domain_uid: String,
        packet: Packet,
        completion: Completion,
    ) {
        let Some(info) = self.presence.get(&namespace, &domain_uid).await else {
            return;
        };

        match completion {
            Completion::Complete => {
                let mut guard = info.lock().await;
                guard.failure_count = 0;
                guard.populated = true;
            }
            // Cancellation does not count against the retry budget
            // (spec.md §7 "Fiber cancellation: logged at debug; does not
            // increment failure counter").
            Completion::Cancelled => {}
            Completion::Failed(e) => {
                let failure_message = packet
                    .get::<String>(PacketKey::FailureMessage)
                    .cloned()
                    .unwrap_or_else(|| e.to_string());
                let is_introspection_failure = matches!(e, Error::IntrospectionFailed(_));
                let retryable = e.is_retryable();

                let (domain, failure_count, deleting) = {
                    let mut guard = info.lock().await;
                    guard.failure_count += 1;
                    (guard.domain.clone(), guard.failure_count, guard.deleting)
                };

                let _ = patch_status::<DomainStatus, Domain>(self.client.clone(), &domain, |status| {
                    status.message = Some(failure_message.clone());
                    if is_introspection_failure {
                        status.introspect_job_failure_count += 1;
                    }
                })
                .await;

                if !retryable {
                    return;
                }

                let max_retries = self.tuning.load().max_failure_retries();
                let base_delay = self.tuning.load().failure_retry_base();
                let decision = decide_retry(failure_count, max_retries, base_delay);
                if !decision.should_retry {
                    eprintln!(
                        "severe: {namespace}/{domain_uid} exceeded {max_retries} make-right retries; \
                         waiting for a spec change before trying again"
                    );
                    return;
                }

                let engine = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(decision.delay).await;
                    engine
                        .trigger(Trigger {
                            namespace,
                            domain_uid,
                            live_domain: None,
                            flags: Flags { explicit_recheck: true, interrupt: true },
                            for_deletion: deleting,
                        })
                        .await;
                });
            }
        }
    }
}
