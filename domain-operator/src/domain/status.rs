use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use kube::{Client, ResourceExt};
use weblogic_domain_types::{Domain, DomainStatus, ServerHealth, ServerStatus};

use crate::engine::fiber::Completion;
use crate::engine::fiber_gate::FiberGate;
use crate::engine::packet::Packet;
use crate::engine::presence::{DomainPresenceInfo, PresenceCache};
use crate::engine::step::{NextAction, Step};
use crate::util::Error;
use crate::util::patch::patch_status;

use super::tuning::Tuning;

/// Throttles repeated identical log lines from the periodic status
/// reader, resetting only once a read completes successfully (spec.md
/// §4.7 "Logging is gated by a once-per-message filter that resets only
/// on successful complete status read").
#[derive(Default)]
pub struct OncePerMessageFilter {
    last_message: std::sync::Mutex<Option<String>>,
}

impl OncePerMessageFilter {
    /// Returns `true` the first time `message` is seen since the last
    /// successful read; `false` on every repeat.
    pub fn should_log(&self, message: &str) -> bool {
        let mut guard = self.last_message.lock().unwrap();
        if guard.as_deref() == Some(message) {
            return false;
        }
        *guard = Some(message.to_string());
        true
    }

    pub fn reset(&self) {
        *self.last_message.lock().unwrap() = None;
    }
}

/// Reads the last-known readiness of every cluster server for one
/// domain and assembles the `status.servers[]` array a status-read
/// fiber writes back.
pub fn build_server_statuses(
    domain: &Domain,
    last_known: &std::collections::HashMap<String, String>,
) -> Vec<ServerStatus> {
    let mut statuses = Vec::new();
    let admin_state = last_known
        .get("admin-server")
        .cloned()
        .unwrap_or_else(|| "UNKNOWN".to_string());
    statuses.push(ServerStatus {
        server_name: "admin-server".to_string(),
        cluster_name: None,
        state: Some(server_state_from_probe(&admin_state)),
        health: Some(ServerHealth { overall_health: Some(admin_state), activation_time: None }),
        is_admin_server: true,
    });
    for cluster in &domain.spec.clusters {
        for server_name in super::planner::cluster_server_names(cluster) {
            let probe = last_known
                .get(&server_name)
                .cloned()
                .unwrap_or_else(|| "UNKNOWN".to_string());
            statuses.push(ServerStatus {
                server_name: server_name.clone(),
                cluster_name: Some(cluster.cluster_name.clone()),
                state: Some(server_state_from_probe(&probe)),
                health: Some(ServerHealth { overall_health: Some(probe), activation_time: None }),
                is_admin_server: false,
            });
        }
    }
    statuses
}

fn server_state_from_probe(probe: &str) -> String {
    match probe {
        "probe-succeeded" => "RUNNING".to_string(),
        "probe-failed" => "FAILED".to_string(),
        _ => "UNKNOWN".to_string(),
    }
}

/// The single step a status-read fiber runs: snapshot the cached
/// per-server readiness, patch `status.servers[]`.
struct ReadStatus {
    client: Client,
    info: Arc<tokio::sync::Mutex<DomainPresenceInfo>>,
    timeout: std::time::Duration,
}

#[async_trait]
impl Step for ReadStatus {
    async fn apply(&self, _packet: &mut Packet) -> Result<NextAction, Error> {
        let (domain, last_known) = {
            let guard = self.info.lock().await;
            (guard.domain.clone(), guard.last_known_server_status.clone())
        };
        let servers = build_server_statuses(&domain, &last_known);
        let patch = patch_status::<DomainStatus, Domain>(self.client.clone(), &domain, |status| {
            status.servers = servers;
        });
        match tokio::time::timeout(self.timeout, patch).await {
            Ok(result) => result?,
            Err(_) => return Err(Error::Timeout(format!("status read for {} timed out", domain.name_any()))),
        }
        Ok(NextAction::End)
    }

    fn name(&self) -> &str {
        "read-status"
    }
}

/// Runs one status-read tick for every domain currently in the
/// namespace's slice of the presence cache, each serialized through the
/// independent status FiberGate so it never contends with that domain's
/// make-right fiber.
pub async fn run_status_updater(
    client: Client,
    namespace: String,
    presence: Arc<PresenceCache>,
    status_gate: Arc<FiberGate>,
    tuning: Arc<arc_swap::ArcSwap<Tuning>>,
    shutdown: Arc<AtomicBool>,
) {
    tokio::time::sleep(tuning.load().initial_short_delay()).await;
    let filter = Arc::new(OncePerMessageFilter::default());
    while !shutdown.load(Ordering::Relaxed) {
        let interval = tuning.load().status_update_interval();
        let timeout = tuning.load().status_update_timeout();
        tick(&client, &namespace, &presence, &status_gate, timeout, &filter).await;
        tokio::time::sleep(interval).await;
    }
}

async fn tick(
    client: &Client,
    namespace: &str,
    presence: &Arc<PresenceCache>,
    status_gate: &Arc<FiberGate>,
    timeout: std::time::Duration,
    filter: &Arc<OncePerMessageFilter>,
) {
    for (domain_uid, info) in presence.entries_in_namespace(namespace).await {
        let deleting = info.lock().await.deleting;
        if deleting {
            continue;
        }
        let step: Arc<dyn Step> = Arc::new(ReadStatus { client: client.clone(), info, timeout });
        let filter = filter.clone();
        let domain_uid_for_log = domain_uid.clone();
        status_gate
            .start_fiber_if_no_current(
                &domain_uid,
                step,
                Packet::new(namespace, &domain_uid),
                move |_packet, completion| match completion {
                    Completion::Complete => filter.reset(),
                    Completion::Cancelled => {}
                    Completion::Failed(e) => {
                        let message = format!("status read failed for {domain_uid_for_log}: {e}");
                        if filter.should_log(&message) {
                            eprintln!("{message}");
                        }
                    }
                },
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn once_per_message_filter_suppresses_exact_repeats() {
        let filter = OncePerMessageFilter::default();
        assert!(filter.should_log("boom"));
        assert!(!filter.should_log("boom"));
        assert!(filter.should_log("different"));
    }

    #[test]
    fn once_per_message_filter_logs_again_after_reset() {
        let filter = OncePerMessageFilter::default();
        assert!(filter.should_log("boom"));
        filter.reset();
        assert!(filter.should_log("boom"));
    }

    #[test]
    fn server_state_maps_from_last_known_probe_text() {
        assert_eq!(server_state_from_probe("probe-succeeded"), "RUNNING");
        assert_eq!(server_state_from_probe("probe-failed"), "FAILED");
        assert_eq!(server_state_from_probe("anything-else"), "UNKNOWN");
    }
}
