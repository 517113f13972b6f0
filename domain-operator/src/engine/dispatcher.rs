use std::sync::Arc;

use futures::stream::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Event as CoreEvent, Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use weblogic_domain_types::{Domain, DomainStatus};
use weblogic_operator_common::labels;

use crate::domain::actions;
use crate::domain::make_right::{MakeRightEngine, Trigger};
use crate::domain::planner::Flags;
use crate::domain::readiness::{ReadinessParser, SubstringReadinessParser};
use crate::engine::presence::PresenceCache;
use crate::util::patch::patch_status;

/// Where to scope every watch stream this dispatcher owns: one
/// namespace, or every namespace the operator's RBAC allows.
#[derive(Clone)]
pub enum WatchScope {
    Namespace(String),
    AllNamespaces,
}

/// Routes the five resource-kind watch streams of spec.md §4.4 to the
/// make-right engine and the presence cache. One instance per watched
/// namespace (or one for `AllNamespaces`).
pub struct WatchDispatcher {
    client: Client,
    scope: WatchScope,
    make_right: Arc<MakeRightEngine>,
    presence: Arc<PresenceCache>,
    readiness: Arc<dyn ReadinessParser>,
}

impl WatchDispatcher {
    pub fn new(
        client: Client,
        scope: WatchScope,
        make_right: Arc<MakeRightEngine>,
        presence: Arc<PresenceCache>,
    ) -> Arc<Self> {
        Arc::new(WatchDispatcher {
            client,
            scope,
            make_right,
            presence,
            readiness: Arc::new(SubstringReadinessParser),
        })
    }

    fn api<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = kube::core::NamespaceResourceScope, DynamicType = ()>,
    {
        match &self.scope {
            WatchScope::Namespace(ns) => Api::namespaced(self.client.clone(), ns),
            WatchScope::AllNamespaces => Api::all(self.client.clone()),
        }
    }

    /// Spawns one task per watched kind; each exits when `cancel` fires.
    pub fn spawn_all(self: &Arc<Self>, cancel: CancellationToken) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            self.clone().spawn_domain_watch(cancel.clone()),
            self.clone().spawn_server_pod_watch(cancel.clone()),
            self.clone().spawn_introspector_job_watch(cancel.clone()),
            self.clone().spawn_service_watch(cancel.clone()),
            self.clone().spawn_config_map_watch(cancel.clone()),
            self.clone().spawn_readiness_event_watch(cancel),
        ]
    }

    fn spawn_domain_watch(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let api: Api<Domain> = self.api();
            let mut stream = watcher::watcher(api, watcher::Config::default()).boxed();
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    next = stream.next() => next,
                };
                match next {
                    Some(Ok(Event::Apply(domain) | Event::InitApply(domain))) => {
                        self.handle_domain_upsert(domain).await
                    }
                    Some(Ok(Event::Delete(domain))) => self.handle_domain_delete(domain).await,
                    Some(Ok(Event::Init | Event::InitDone)) => {}
                    Some(Err(e)) => eprintln!("domain watch error: {e}"),
                    None => break,
                }
            }
        })
    }

    /// A MODIFIED event whose `metadata.generation` is unchanged from the
    /// cached copy is metadata-only (e.g. a status subresource write
    /// looping back); route it to a plain cache refresh rather than a
    /// full make-right (spec.md §4.4 "Stale events").
    async fn handle_domain_upsert(&self, domain: Domain) {
        let namespace = domain.metadata.namespace.clone().unwrap_or_default();
        let domain_uid = domain.metadata.name.clone().unwrap_or_default();

        let cached = self.presence.get(&namespace, &domain_uid).await;
        let is_new = cached.is_none();
        let metadata_only = match &cached {
            Some(info) => info.lock().await.domain.metadata.generation == domain.metadata.generation,
            None => false,
        };

        if metadata_only {
            self.presence.observe_domain(&namespace, domain).await;
            return;
        }

        self.make_right
            .trigger(Trigger {
                namespace,
                domain_uid,
                live_domain: Some(domain),
                flags: Flags { explicit_recheck: false, interrupt: is_new },
                for_deletion: false,
            })
            .await;
    }

    async fn handle_domain_delete(&self, domain: Domain) {
        let namespace = domain.metadata.namespace.clone().unwrap_or_default();
        let domain_uid = domain.metadata.name.clone().unwrap_or_default();
        self.make_right
            .trigger(Trigger {
                namespace,
                domain_uid,
                live_domain: Some(domain),
                flags: Flags { explicit_recheck: true, interrupt: true },
                for_deletion: true,
            })
            .await;
    }

    fn spawn_server_pod_watch(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let api: Api<Pod> = self.api();
            let config = watcher::Config::default().labels(labels::SERVER_NAME);
            let mut stream = watcher::watcher(api, config).boxed();
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    next = stream.next() => next,
                };
                match next {
                    Some(Ok(Event::Apply(pod) | Event::InitApply(pod))) => self.handle_server_pod_apply(pod).await,
                    Some(Ok(Event::Delete(pod))) => self.handle_server_pod_delete(pod).await,
                    Some(Ok(Event::Init | Event::InitDone)) => {}
                    Some(Err(e)) => eprintln!("server pod watch error: {e}"),
                    None => break,
                }
            }
        })
    }

    async fn handle_server_pod_apply(&self, pod: Pod) {
        let Some((namespace, domain_uid, server_name)) = pod_coordinates(&pod) else {
            return;
        };
        let Some(info) = self.presence.get(&namespace, &domain_uid).await else {
            return;
        };
        let mut guard = info.lock().await;
        guard.being_deleted.remove(&server_name);
        guard.server_pods.insert(server_name, pod);
    }

    async fn handle_server_pod_delete(&self, pod: Pod) {
        let Some((namespace, domain_uid, server_name)) = pod_coordinates(&pod) else {
            return;
        };
        let Some(info) = self.presence.get(&namespace, &domain_uid).await else {
            return;
        };
        let (intentional, deleting) = {
            let mut guard = info.lock().await;
            let intentional = guard.being_deleted.remove(&server_name).unwrap_or(false);
            guard.server_pods.remove(&server_name);
            (intentional, guard.deleting)
        };
        if intentional || deleting {
            return;
        }
        self.make_right
            .trigger(Trigger {
                namespace,
                domain_uid,
                live_domain: None,
                flags: Flags { explicit_recheck: true, interrupt: true },
                for_deletion: false,
            })
            .await;
    }

    fn spawn_introspector_job_watch(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let api: Api<Pod> = self.api();
            let config = watcher::Config::default().labels(labels::JOB_NAME);
            let mut stream = watcher::watcher(api, config).boxed();
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    next = stream.next() => next,
                };
                match next {
                    Some(Ok(Event::Apply(pod) | Event::InitApply(pod))) => {
                        self.handle_introspector_pod_apply(pod).await
                    }
                    Some(Ok(Event::Delete(_) | Event::Init | Event::InitDone)) => {}
                    Some(Err(e)) => eprintln!("introspector job watch error: {e}"),
                    None => break,
                }
            }
        })
    }

    async fn handle_introspector_pod_apply(&self, pod: Pod) {
        let Some(domain_uid) = pod_label(&pod, labels::DOMAIN_UID) else {
            return;
        };
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let Some(info) = self.presence.get(&namespace, &domain_uid).await else {
            return;
        };
        let Some(outcome) = introspector_outcome(&pod) else {
            return;
        };
        let domain = info.lock().await.domain.clone();
        match outcome {
            IntrospectorOutcome::Failed(message) => {
                let _ = patch_status::<DomainStatus, Domain>(self.client.clone(), &domain, |status| {
                    status.message = Some(message.clone());
                    status.introspect_job_failure_count += 1;
                })
                .await;
            }
            IntrospectorOutcome::Progressing => {
                let _ = patch_status::<DomainStatus, Domain>(self.client.clone(), &domain, |status| {
                    status.message = Some("introspector job progressing".to_string());
                })
                .await;
            }
        }
    }

    fn spawn_service_watch(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let api: Api<Service> = self.api();
            let config = watcher::Config::default().labels(labels::DOMAIN_UID);
            let mut stream = watcher::watcher(api, config).boxed();
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    next = stream.next() => next,
                };
                match next {
                    Some(Ok(Event::Apply(svc) | Event::InitApply(svc))) => self.handle_service_apply(svc).await,
                    Some(Ok(Event::Delete(svc))) => self.handle_service_delete(svc).await,
                    Some(Ok(Event::Init | Event::InitDone)) => {}
                    Some(Err(e)) => eprintln!("service watch error: {e}"),
                    None => break,
                }
            }
        })
    }

    async fn handle_service_apply(&self, svc: Service) {
        let Some(domain_uid) = svc.metadata.labels.as_ref().and_then(|l| l.get(labels::DOMAIN_UID)).cloned() else {
            return;
        };
        let namespace = svc.metadata.namespace.clone().unwrap_or_default();
        let Some(info) = self.presence.get(&namespace, &domain_uid).await else {
            return;
        };
        let name = svc.name_any();
        info.lock().await.services.insert(name, svc);
    }

    async fn handle_service_delete(&self, svc: Service) {
        let Some(domain_uid) = svc.metadata.labels.as_ref().and_then(|l| l.get(labels::DOMAIN_UID)).cloned() else {
            return;
        };
        let namespace = svc.metadata.namespace.clone().unwrap_or_default();
        let Some(info) = self.presence.get(&namespace, &domain_uid).await else {
            return;
        };
        let name = svc.name_any();
        let deleting = {
            let mut guard = info.lock().await;
            guard.services.remove(&name);
            guard.deleting
        };
        if deleting {
            return;
        }
        self.make_right
            .trigger(Trigger {
                namespace,
                domain_uid,
                live_domain: None,
                flags: Flags { explicit_recheck: true, interrupt: true },
                for_deletion: false,
            })
            .await;
    }

    fn spawn_config_map_watch(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let api: Api<ConfigMap> = self.api();
            let config = watcher::Config::default().labels(labels::DOMAIN_UID);
            let mut stream = watcher::watcher(api, config).boxed();
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    next = stream.next() => next,
                };
                match next {
                    Some(Ok(Event::Apply(cm) | Event::InitApply(cm))) => self.handle_config_map_event(cm).await,
                    Some(Ok(Event::Delete(cm))) => self.handle_config_map_event(cm).await,
                    Some(Ok(Event::Init | Event::InitDone)) => {}
                    Some(Err(e)) => eprintln!("config map watch error: {e}"),
                    None => break,
                }
            }
        })
    }

    /// Recreates the script ConfigMap whenever it is changed or deleted,
    /// whatever the watch event kind (spec.md §4.4 treats ADDED/MODIFIED
    /// and DELETED identically here).
    async fn handle_config_map_event(&self, cm: ConfigMap) {
        let Some(domain_uid) = cm.metadata.labels.as_ref().and_then(|l| l.get(labels::DOMAIN_UID)).cloned() else {
            return;
        };
        let namespace = cm.metadata.namespace.clone().unwrap_or_default();
        let expected_name = script_config_map_name(&domain_uid);
        if cm.name_any() != expected_name {
            return;
        }
        let Some(info) = self.presence.get(&namespace, &domain_uid).await else {
            return;
        };
        let (domain, deleting) = {
            let guard = info.lock().await;
            (guard.domain.clone(), guard.deleting)
        };
        if deleting {
            return;
        }
        let _ = actions::ensure_config_map(self.client.clone(), &namespace, desired_script_config_map(&domain)).await;
    }

    fn spawn_readiness_event_watch(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let api: Api<CoreEvent> = self.api();
            let mut stream = watcher::watcher(api, watcher::Config::default()).boxed();
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    next = stream.next() => next,
                };
                match next {
                    Some(Ok(Event::Apply(event) | Event::InitApply(event))) => {
                        self.handle_readiness_event(event).await
                    }
                    Some(Ok(Event::Delete(_) | Event::Init | Event::InitDone)) => {}
                    Some(Err(e)) => eprintln!("event watch error: {e}"),
                    None => break,
                }
            }
        })
    }

    async fn handle_readiness_event(&self, event: CoreEvent) {
        let Some(domain_uid) = event.metadata.labels.as_ref().and_then(|l| l.get(labels::DOMAIN_UID)).cloned()
        else {
            return;
        };
        let Some(observation) = self.readiness.parse(&event, &domain_uid) else {
            return;
        };
        let namespace = event.metadata.namespace.clone().unwrap_or_default();
        let Some(info) = self.presence.get(&namespace, &domain_uid).await else {
            return;
        };
        info.lock()
            .await
            .last_known_server_status
            .insert(observation.server_name, observation.status);
    }
}

fn pod_label(pod: &Pod, key: &str) -> Option<String> {
    pod.metadata.labels.as_ref()?.get(key).cloned()
}

fn pod_coordinates(pod: &Pod) -> Option<(String, String, String)> {
    let namespace = pod.metadata.namespace.clone().unwrap_or_default();
    let domain_uid = pod_label(pod, labels::DOMAIN_UID)?;
    let server_name = pod_label(pod, labels::SERVER_NAME)?;
    Some((namespace, domain_uid, server_name))
}

enum IntrospectorOutcome {
    Failed(String),
    Progressing,
}

/// Classifies an introspector job Pod's status per spec.md §4.4: a
/// failed/unschedulable/terminated-nonzero pod reports `Failed`, a
/// container still waiting with a message reports `Progressing`.
fn introspector_outcome(pod: &Pod) -> Option<IntrospectorOutcome> {
    let status = pod.status.as_ref()?;
    match status.phase.as_deref() {
        Some("Failed") => {
            return Some(IntrospectorOutcome::Failed(
                status.message.clone().unwrap_or_else(|| "introspector pod failed".to_string()),
            ));
        }
        Some("Unknown") => return Some(IntrospectorOutcome::Failed("introspector pod unschedulable".to_string())),
        _ => {}
    }
    for container in status.container_statuses.iter().flatten() {
        let Some(state) = &container.state else { continue };
        if let Some(waiting) = &state.waiting {
            return Some(match &waiting.message {
                Some(message) => IntrospectorOutcome::Failed(message.clone()),
                None => IntrospectorOutcome::Progressing,
            });
        }
        if let Some(terminated) = &state.terminated
            && terminated.exit_code != 0
        {
            let message = terminated
                .message
                .clone()
                .unwrap_or_else(|| format!("introspector job exited with code {}", terminated.exit_code));
            return Some(IntrospectorOutcome::Failed(message));
        }
    }
    None
}

/// Name of the ConfigMap carrying the WDT/WLST scripts the introspector
/// job mounts, distinct from `introspector_config_map_name` (the job's
/// parsed *output*).
fn script_config_map_name(domain_uid: &str) -> String {
    format!("{domain_uid}-weblogic-domain-script-cm")
}

fn desired_script_config_map(domain: &Domain) -> ConfigMap {
    let uid = domain.metadata.name.clone().unwrap_or_default();
    let namespace = domain.metadata.namespace.clone().unwrap_or_default();
    let mut map = std::collections::BTreeMap::new();
    map.insert(labels::DOMAIN_UID.to_string(), uid.clone());
    map.insert(labels::CREATED_BY_OPERATOR.to_string(), "true".to_string());
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(script_config_map_name(&uid)),
            namespace: Some(namespace),
            labels: Some(map),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ContainerState, ContainerStateTerminated, ContainerStateWaiting, ContainerStatus, PodStatus};

    fn pod_with_status(status: PodStatus) -> Pod {
        Pod { metadata: ObjectMeta::default(), spec: None, status: Some(status) }
    }

    #[test]
    fn failed_phase_reports_failed() {
        let pod = pod_with_status(PodStatus { phase: Some("Failed".to_string()), ..Default::default() });
        assert!(matches!(introspector_outcome(&pod), Some(IntrospectorOutcome::Failed(_))));
    }

    #[test]
    fn waiting_with_message_reports_failed() {
        let pod = pod_with_status(PodStatus {
            container_statuses: Some(vec![ContainerStatus {
                state: Some(ContainerState {
                    waiting: Some(ContainerStateWaiting {
                        message: Some("ImagePullBackOff".to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert!(matches!(introspector_outcome(&pod), Some(IntrospectorOutcome::Failed(_))));
    }

    #[test]
    fn waiting_without_message_reports_progressing() {
        let pod = pod_with_status(PodStatus {
            container_statuses: Some(vec![ContainerStatus {
                state: Some(ContainerState {
                    waiting: Some(ContainerStateWaiting { message: None, ..Default::default() }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert!(matches!(introspector_outcome(&pod), Some(IntrospectorOutcome::Progressing)));
    }

    #[test]
    fn successful_termination_reports_nothing() {
        let pod = pod_with_status(PodStatus {
            container_statuses: Some(vec![ContainerStatus {
                state: Some(ContainerState {
                    terminated: Some(ContainerStateTerminated { exit_code: 0, ..Default::default() }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert!(introspector_outcome(&pod).is_none());
    }

    #[test]
    fn script_config_map_name_is_distinct_from_the_introspector_output_cm() {
        assert_ne!(
            script_config_map_name("d1"),
            crate::domain::pod_spec::introspector_config_map_name("d1")
        );
    }
}
