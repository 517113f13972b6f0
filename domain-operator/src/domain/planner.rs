use std::sync::Arc;

use async_trait::async_trait;
use kube::Client;
use weblogic_domain_types::{ClusterSpecEntry, Domain, DomainHomeSourceType, ManagedServerSpec, ServerStartPolicy};

use crate::engine::packet::{Packet, PacketKey};
use crate::engine::presence::{PresenceCache, is_same_or_newer};
use crate::engine::step::{NextAction, Step};
use crate::util::Error;

use super::actions;
use super::pod_spec::{introspector_config_map_name, introspector_job_name, DefaultPodSpecBuilder, PodSpecBuilder};
use crate::engine::policy::{effective_start_policy, stable_order, started_set};

const FATAL_INTROSPECTOR_TOKEN: &str = "FatalIntrospectorError";

/// Fields an online-update-in-flight Model-in-Image domain is allowed
/// to change without forcing the run back to a full (non-online) update.
/// Resolves the Open Question in spec.md §4.5 as an explicit whitelist.
const ONLINE_UPDATE_COMPATIBLE_FIELDS: &[&str] = &["introspectVersion", "onlineUpdate"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub run: bool,
    pub plan: Plan,
    pub force_online_update_disabled: bool,
}

/// Flags carried on a trigger into the decision function (spec.md §4.5).
#[derive(Debug, Clone, Copy, Default)]
pub struct Flags {
    pub explicit_recheck: bool,
    pub interrupt: bool,
}

/// The six ordered decision rules from spec.md §4.5, plus the
/// Model-in-Image online-update coercion. `cached` is `None` on first
/// adoption of a domain the engine has never seen.
pub fn decide(live: &Domain, cached: Option<&Domain>, flags: Flags, max_failure_retries: u32) -> Decision {
    let Some(cached) = cached else {
        return Decision { run: true, plan: Plan::Up, force_online_update_disabled: false };
    };

    // Rule 2: stale event.
    if !is_same_or_newer(&live.metadata, &cached.metadata) {
        return Decision { run: false, plan: Plan::Up, force_online_update_disabled: false };
    }

    let failure_count = cached
        .status
        .as_ref()
        .map(|s| s.introspect_job_failure_count)
        .unwrap_or(0);
    let unchanged_recovery_fields = live.spec.image == cached.spec.image
        && live.spec.restart_version == cached.spec.restart_version
        && live.spec.introspect_version == cached.spec.introspect_version;

    // Rule 3: repeated introspector failure, nothing the user could fix changed.
    if failure_count >= max_failure_retries && unchanged_recovery_fields {
        return Decision { run: false, plan: Plan::Up, force_online_update_disabled: false };
    }

    // Rule 4: terminal fatal introspector error.
    if cached
        .status
        .as_ref()
        .and_then(|s| s.message.as_deref())
        .is_some_and(|m| m.contains(FATAL_INTROSPECTOR_TOKEN))
    {
        return Decision { run: false, plan: Plan::Up, force_online_update_disabled: false };
    }

    let spec_changed = live.spec != cached.spec;

    // Rule 5: explicit recheck or a real spec change.
    if flags.explicit_recheck || flags.interrupt || spec_changed {
        let force_online_update_disabled = live.spec.domain_home_source_type == DomainHomeSourceType::FromModel
            && live
                .spec
                .configuration
                .model
                .as_ref()
                .is_some_and(|m| m.online_update.enabled)
            && spec_changed
            && !delta_is_online_update_compatible(live, cached);
        return Decision { run: true, plan: Plan::Up, force_online_update_disabled };
    }

    // Rule 6: nothing to do but refresh the cache.
    Decision { run: false, plan: Plan::Up, force_online_update_disabled: false }
}

/// True if the only differences between `live.spec` and `cached.spec`
/// lie in the whitelisted online-update-compatible fields.
fn delta_is_online_update_compatible(live: &Domain, cached: &Domain) -> bool {
    let mut live_clone = live.spec.clone();
    let mut cached_clone = cached.spec.clone();
    // Zero out the whitelisted fields before comparing the rest.
    live_clone.introspect_version = None;
    cached_clone.introspect_version = None;
    if let Some(model) = live_clone.configuration.model.as_mut() {
        model.online_update.enabled = false;
    }
    if let Some(model) = cached_clone.configuration.model.as_mut() {
        model.online_update.enabled = false;
    }
    let _ = ONLINE_UPDATE_COMPATIBLE_FIELDS; // documents which fields the zeroing above covers
    live_clone == cached_clone
}

/// Enumerates the servers of one cluster in stable order together with
/// their effective start policy, per spec.md §4.6 step 1.
pub fn cluster_server_names(cluster: &ClusterSpecEntry) -> Vec<String> {
    match cluster.dynamic_server_count {
        Some(count) => (1..=count)
            .map(|i| crate::engine::policy::dynamic_server_name("managed-server", i))
            .collect(),
        None => Vec::new(),
    }
}

/// Computes which servers must be running for one cluster, honoring
/// server > cluster > domain policy inheritance.
pub fn cluster_started_set(
    domain_policy: ServerStartPolicy,
    cluster: &ClusterSpecEntry,
    managed_servers: &[ManagedServerSpec],
    static_server_names: &[String],
) -> std::collections::BTreeSet<String> {
    let names: Vec<String> = if cluster.dynamic_server_count.is_some() {
        cluster_server_names(cluster)
    } else {
        static_server_names.to_vec()
    };
    let entries: Vec<(String, ServerStartPolicy)> = names
        .into_iter()
        .map(|name| {
            let server_override = managed_servers
                .iter()
                .find(|s| s.server_name == name)
                .and_then(|s| s.server_start_policy);
            let policy = effective_start_policy(server_override, cluster.server_start_policy, domain_policy);
            (name, policy)
        })
        .collect();
    started_set(&stable_order(entries), cluster.replicas.unwrap_or(0))
}

/// Steps implementing the up-plan / down-plan chains of spec.md §4.5.
/// Each is a thin wrapper calling into `actions`/`pod_spec`; the heavy
/// lifting (server selection, policy inheritance) lives in `policy.rs`.
struct PopulatePacketServerMaps;

#[async_trait]
impl Step for PopulatePacketServerMaps {
    async fn apply(&self, _packet: &mut Packet) -> Result<NextAction, Error> {
        // Seeds packet-local state from the cached Domain status; the
        // actual per-server maps live on DomainPresenceInfo and are read
        // directly by downstream steps, so this step is a placeholder
        // extension point for packet-scoped server state.
        Ok(NextAction::End)
    }

    fn name(&self) -> &str {
        "populate-packet-server-maps"
    }
}

pub struct UpHead;

#[async_trait]
impl Step for UpHead {
    async fn apply(&self, packet: &mut Packet) -> Result<NextAction, Error> {
        packet.put(PacketKey::Deleting, false);
        Ok(NextAction::End)
    }

    fn name(&self) -> &str {
        "up-head"
    }
}

pub struct DownHead;

#[async_trait]
impl Step for DownHead {
    async fn apply(&self, packet: &mut Packet) -> Result<NextAction, Error> {
        packet.put(PacketKey::Deleting, true);
        Ok(NextAction::End)
    }

    fn name(&self) -> &str {
        "down-head"
    }
}

pub struct CreateAdminServer {
    pub client: Client,
    pub domain: Domain,
}

#[async_trait]
impl Step for CreateAdminServer {
    async fn apply(&self, _packet: &mut Packet) -> Result<NextAction, Error> {
        let builder = DefaultPodSpecBuilder;
        let namespace = self.domain.metadata.namespace.clone().unwrap_or_default();
        actions::ensure_pod(self.client.clone(), &namespace, builder.admin_pod(&self.domain)).await?;
        actions::ensure_service(
            self.client.clone(),
            &namespace,
            builder.admin_internal_service(&self.domain),
        )
        .await?;
        if let Some(external) = builder.admin_external_service(&self.domain) {
            actions::ensure_service(self.client.clone(), &namespace, external).await?;
        }
        Ok(NextAction::End)
    }

    fn name(&self) -> &str {
        "create-admin-server"
    }
}

pub struct CreateManagedServers {
    pub client: Client,
    pub domain: Domain,
    pub started: Vec<String>,
    pub cluster_by_server: std::collections::BTreeMap<String, String>,
}

#[async_trait]
impl Step for CreateManagedServers {
    async fn apply(&self, _packet: &mut Packet) -> Result<NextAction, Error> {
        let builder = DefaultPodSpecBuilder;
        let namespace = self.domain.metadata.namespace.clone().unwrap_or_default();
        for server_name in &self.started {
            let cluster = self.cluster_by_server.get(server_name).map(String::as_str);
            actions::ensure_pod(
                self.client.clone(),
                &namespace,
                builder.managed_server_pod(&self.domain, server_name, cluster),
            )
            .await?;
            actions::ensure_service(
                self.client.clone(),
                &namespace,
                builder.managed_server_service(&self.domain, server_name),
            )
            .await?;
        }
        Ok(NextAction::End)
    }

    fn name(&self) -> &str {
        "create-managed-servers"
    }
}

pub struct CreateIntrospectorJob {
    pub client: Client,
    pub domain: Domain,
}

#[async_trait]
impl Step for CreateIntrospectorJob {
    async fn apply(&self, packet: &mut Packet) -> Result<NextAction, Error> {
        let namespace = self.domain.metadata.namespace.clone().unwrap_or_default();
        let uid = self.domain.metadata.name.clone().unwrap_or_default();
        actions::delete_job(self.client.clone(), &namespace, &introspector_job_name(&uid)).await?;
        let builder = DefaultPodSpecBuilder;
        actions::ensure_job(self.client.clone(), &namespace, builder.introspector_job(&self.domain)).await?;
        packet.put(PacketKey::IntrospectorConfigMapName, introspector_config_map_name(&uid));
        Ok(NextAction::End)
    }

    fn name(&self) -> &str {
        "create-introspector-job"
    }
}

pub struct DeleteAllResources {
    pub client: Client,
    pub namespace: String,
    pub domain_uid: String,
}

#[async_trait]
impl Step for DeleteAllResources {
    async fn apply(&self, _packet: &mut Packet) -> Result<NextAction, Error> {
        actions::delete_all_domain_resources(self.client.clone(), &self.namespace, &self.domain_uid).await?;
        Ok(NextAction::End)
    }

    fn name(&self) -> &str {
        "delete-all-resources"
    }
}

/// Validates the domain's dynamic-cluster server overrides before any
/// pod is created (spec.md §4.6 "dynamic cluster server numbers must
/// satisfy 1 <= i <= maxDynamicClusterSize"). Runs after introspection,
/// ahead of the admin/managed-server bring-up steps.
pub struct ValidateDomain {
    pub domain: Domain,
}

#[async_trait]
impl Step for ValidateDomain {
    async fn apply(&self, packet: &mut Packet) -> Result<NextAction, Error> {
        for cluster in &self.domain.spec.clusters {
            if cluster.dynamic_server_count.is_none() {
                continue;
            }
            for server in &self.domain.spec.managed_servers {
                let Some(index) = dynamic_index_suffix(&server.server_name, "managed-server") else {
                    continue;
                };
                if let Err(e) = crate::engine::policy::validate_dynamic_server_index(
                    index,
                    cluster.max_dynamic_cluster_size,
                ) {
                    packet.put(PacketKey::ValidationFailure, true);
                    packet.put(PacketKey::FailureMessage, e.to_string());
                    return Err(e);
                }
            }
        }
        Ok(NextAction::End)
    }

    fn name(&self) -> &str {
        "validate-domain"
    }
}

/// Parses the numeric suffix of a dynamic-cluster server name, e.g.
/// `dynamic_index_suffix("managed-server7", "managed-server") == Some(7)`.
fn dynamic_index_suffix(name: &str, prefix: &str) -> Option<u32> {
    name.strip_prefix(prefix)?.parse().ok()
}

/// Destroys the `DomainPresenceInfo` at the end of a successful
/// down-plan (spec.md §3 "Lifetime"). A later Pod ADDED event for the
/// same UID finds no cache entry and cannot revive the domain.
pub struct Unregister {
    pub presence: Arc<PresenceCache>,
    pub namespace: String,
    pub domain_uid: String,
}

#[async_trait]
impl Step for Unregister {
    async fn apply(&self, _packet: &mut Packet) -> Result<NextAction, Error> {
        self.presence.unregister(&self.namespace, &self.domain_uid).await;
        Ok(NextAction::End)
    }

    fn name(&self) -> &str {
        "unregister"
    }
}

/// Builds the up-plan: clear `deleting`, bring up the admin server, then
/// the managed servers the policy evaluator selected.
pub fn build_up_plan(client: Client, domain: Domain, needs_introspection: bool) -> Arc<dyn Step> {
    let started = started_servers(&domain);
    let cluster_by_server = cluster_membership(&domain);

    let mut steps: Vec<Arc<dyn Step>> = vec![Arc::new(PopulatePacketServerMaps), Arc::new(UpHead)];
    if needs_introspection {
        steps.push(Arc::new(CreateIntrospectorJob {
            client: client.clone(),
            domain: domain.clone(),
        }));
    }
    steps.push(Arc::new(ValidateDomain { domain: domain.clone() }));
    steps.push(Arc::new(CreateAdminServer {
        client: client.clone(),
        domain: domain.clone(),
    }));
    steps.push(Arc::new(CreateManagedServers {
        client,
        domain,
        started,
        cluster_by_server,
    }));
    crate::engine::step::chain(steps)
}

/// Builds the down-plan: mark `deleting`, delete every owned resource,
/// then unregister the domain from the presence cache.
pub fn build_down_plan(
    client: Client,
    presence: Arc<PresenceCache>,
    namespace: String,
    domain_uid: String,
) -> Arc<dyn Step> {
    crate::engine::step::chain(vec![
        Arc::new(PopulatePacketServerMaps),
        Arc::new(DownHead),
        Arc::new(DeleteAllResources {
            client,
            namespace: namespace.clone(),
            domain_uid: domain_uid.clone(),
        }),
        Arc::new(Unregister { presence, namespace, domain_uid }),
    ])
}

/// Computes the full started-server set: every dynamic cluster's
/// members, the `managedServers[]` entries left unclaimed by a dynamic
/// cluster (bound to the domain's first static cluster, if one exists —
/// this CRD carries no per-server `clusterName`, so a single implicit
/// binding is the simplifying assumption; see DESIGN.md), plus, when the
/// domain declares no clusters at all, every one of those entries
/// evaluated standalone against an implicit replica count of 1.
pub fn started_servers(domain: &Domain) -> Vec<String> {
    let membership = cluster_membership(domain);
    let mut started = Vec::new();

    let unclaimed_by_dynamic: Vec<String> = domain
        .spec
        .managed_servers
        .iter()
        .filter(|s| !membership.contains_key(&s.server_name))
        .map(|s| s.server_name.clone())
        .collect();

    for cluster in &domain.spec.clusters {
        if cluster.dynamic_server_count.is_some() {
            let set = cluster_started_set(domain.spec.server_start_policy, cluster, &domain.spec.managed_servers, &[]);
            started.extend(set);
        }
    }

    match domain.spec.clusters.iter().find(|c| c.dynamic_server_count.is_none()) {
        Some(static_cluster) => {
            let set = cluster_started_set(
                domain.spec.server_start_policy,
                static_cluster,
                &domain.spec.managed_servers,
                &unclaimed_by_dynamic,
            );
            started.extend(set);
        }
        None => {
            let set = standalone_started_servers(
                domain.spec.server_start_policy,
                &unclaimed_by_dynamic,
                &domain.spec.managed_servers,
            );
            started.extend(set);
        }
    }

    started.sort();
    started.dedup();
    started
}

/// Evaluates `managedServers[]` entries with no cluster to belong to
/// against an implicit replica count of 1 (spec.md §4.6 applied with
/// `R = 1`): every `ALWAYS` entry starts regardless, at most one
/// `IF_NEEDED`/`ADMIN_ONLY` entry starts, `NEVER` entries never start.
fn standalone_started_servers(
    domain_policy: ServerStartPolicy,
    names: &[String],
    managed_servers: &[ManagedServerSpec],
) -> std::collections::BTreeSet<String> {
    let entries: Vec<(String, ServerStartPolicy)> = names
        .iter()
        .map(|name| {
            let server_override = managed_servers.iter().find(|s| &s.server_name == name).and_then(|s| s.server_start_policy);
            let policy = effective_start_policy(server_override, None, domain_policy);
            (name.clone(), policy)
        })
        .collect();
    started_set(&stable_order(entries), 1)
}

fn cluster_membership(domain: &Domain) -> std::collections::BTreeMap<String, String> {
    let mut map = std::collections::BTreeMap::new();
    for cluster in &domain.spec.clusters {
        if cluster.dynamic_server_count.is_some() {
            for name in cluster_server_names(cluster) {
                map.insert(name, cluster.cluster_name.clone());
            }
        }
    }
    map
}
