use std::collections::HashMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Pod, Service};
use tokio::sync::RwLock;
use weblogic_domain_types::Domain;

/// In-memory view of one live domain: the last observed spec plus the
/// pods/services the engine has seen for it. Read by planners, written
/// by watch handlers and by steps that mutate Kubernetes.
pub struct DomainPresenceInfo {
    pub domain: Domain,
    pub server_pods: HashMap<String, Pod>,
    pub services: HashMap<String, Service>,
    /// True while a down-plan is active; no up-plan may start.
    pub deleting: bool,
    /// True once the initial LIST has seeded `server_pods`/`services`.
    pub populated: bool,
    pub failure_count: u32,
    pub last_known_server_status: HashMap<String, String>,
    pub being_deleted: HashMap<String, bool>,
}

impl DomainPresenceInfo {
    pub fn new(domain: Domain) -> Self {
        DomainPresenceInfo {
            domain,
            server_pods: HashMap::new(),
            services: HashMap::new(),
            deleting: false,
            populated: false,
            failure_count: 0,
            last_known_server_status: HashMap::new(),
            being_deleted: HashMap::new(),
        }
    }
}

fn resource_version(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> Option<u64> {
    meta.resource_version.as_ref().and_then(|v| v.parse().ok())
}

/// Returns true if `incoming` is newer than or equal in recency to
/// `cached`, using a monotonic comparison on `resourceVersion` (falling
/// back to `creationTimestamp` when resource versions aren't comparable,
/// e.g. across a re-list).
pub(crate) fn is_same_or_newer(
    incoming: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta,
    cached: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta,
) -> bool {
    match (resource_version(incoming), resource_version(cached)) {
        (Some(a), Some(b)) => a >= b,
        _ => match (
            incoming.creation_timestamp.as_ref(),
            cached.creation_timestamp.as_ref(),
        ) {
            (Some(a), Some(b)) => a.0 >= b.0,
            _ => true,
        },
    }
}

/// The process-wide `namespace -> domainUid -> DomainPresenceInfo` map.
/// Each entry is individually lockable so that one domain's mutation
/// never blocks another's.
#[derive(Default)]
pub struct PresenceCache {
    domains: RwLock<HashMap<(String, String), Arc<tokio::sync::Mutex<DomainPresenceInfo>>>>,
}

impl PresenceCache {
    pub fn new() -> Self {
        PresenceCache::default()
    }

    pub async fn get(
        &self,
        namespace: &str,
        domain_uid: &str,
    ) -> Option<Arc<tokio::sync::Mutex<DomainPresenceInfo>>> {
        self.domains
            .read()
            .await
            .get(&(namespace.to_string(), domain_uid.to_string()))
            .cloned()
    }

    /// Registers a fresh `DomainPresenceInfo`, or returns the existing
    /// one unchanged if the key is already present (register is not a
    /// destructive overwrite).
    pub async fn register(
        &self,
        namespace: &str,
        domain_uid: &str,
        info: DomainPresenceInfo,
    ) -> Arc<tokio::sync::Mutex<DomainPresenceInfo>> {
        let mut guard = self.domains.write().await;
        guard
            .entry((namespace.to_string(), domain_uid.to_string()))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(info)))
            .clone()
    }

    pub async fn unregister(&self, namespace: &str, domain_uid: &str) {
        self.domains
            .write()
            .await
            .remove(&(namespace.to_string(), domain_uid.to_string()));
    }

    /// Applies a Domain ADDED/MODIFIED event, respecting the staleness
    /// rule: an event no newer than the cached object is ignored.
    /// Returns `true` if the cache was updated.
    pub async fn observe_domain(&self, namespace: &str, domain: Domain) -> bool {
        let key = (namespace.to_string(), domain.metadata.name.clone().unwrap_or_default());
        let mut guard = self.domains.write().await;
        match guard.get(&key) {
            Some(existing) => {
                let mut info = existing.lock().await;
                if !is_same_or_newer(&domain.metadata, &info.domain.metadata) {
                    return false;
                }
                info.domain = domain;
                true
            }
            None => {
                guard.insert(key, Arc::new(tokio::sync::Mutex::new(DomainPresenceInfo::new(domain))));
                true
            }
        }
    }

    /// Applies a Domain DELETED event. The cached entry is dropped only
    /// if the removed object's UID matches the cached one, guarding
    /// against out-of-order delivery of a stale DELETE after a newer
    /// object has already replaced it.
    pub async fn observe_domain_deleted(&self, namespace: &str, domain_uid: &str, deleted_uid: &str) {
        let key = (namespace.to_string(), domain_uid.to_string());
        let mut guard = self.domains.write().await;
        let Some(existing) = guard.get(&key) else {
            return;
        };
        let matches = {
            let info = existing.lock().await;
            info.domain.metadata.uid.as_deref() == Some(deleted_uid)
        };
        if matches {
            guard.remove(&key);
        }
    }

    /// Snapshot of every `(domainUid, info)` pair cached for `namespace`,
    /// used by the periodic status reader to enumerate what to tick.
    pub async fn entries_in_namespace(
        &self,
        namespace: &str,
    ) -> Vec<(String, Arc<tokio::sync::Mutex<DomainPresenceInfo>>)> {
        self.domains
            .read()
            .await
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|((_, uid), info)| (uid.clone(), info.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.domains.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use weblogic_domain_types::DomainSpec;

    fn domain(name: &str, resource_version: &str, uid: &str) -> Domain {
        Domain {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns1".to_string()),
                resource_version: Some(resource_version.to_string()),
                uid: Some(uid.to_string()),
                ..Default::default()
            },
            spec: DomainSpec {
                image: "weblogic:14.1.1".to_string(),
                ..Default::default()
            },
            status: None,
        }
    }

    #[tokio::test]
    async fn register_then_get_returns_the_same_entry() {
        let cache = PresenceCache::new();
        cache
            .register("ns1", "d1", DomainPresenceInfo::new(domain("d1", "1", "uid-1")))
            .await;
        assert!(cache.get("ns1", "d1").await.is_some());
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn observe_domain_ignores_a_stale_resource_version() {
        let cache = PresenceCache::new();
        cache.observe_domain("ns1", domain("d1", "10", "uid-1")).await;
        let updated = cache.observe_domain("ns1", domain("d1", "5", "uid-1")).await;
        assert!(!updated);
        let entry = cache.get("ns1", "d1").await.unwrap();
        assert_eq!(
            entry.lock().await.domain.metadata.resource_version.as_deref(),
            Some("10")
        );
    }

    #[tokio::test]
    async fn entries_in_namespace_excludes_other_namespaces() {
        let cache = PresenceCache::new();
        cache.observe_domain("ns1", domain("d1", "1", "uid-1")).await;
        cache
            .register("ns2", "d2", DomainPresenceInfo::new(domain("d2", "1", "uid-2")))
            .await;
        let entries = cache.entries_in_namespace("ns1").await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "d1");
    }

    #[tokio::test]
    async fn observe_domain_deleted_only_drops_on_matching_uid() {
        let cache = PresenceCache::new();
        cache.observe_domain("ns1", domain("d1", "1", "uid-1")).await;
        cache.observe_domain_deleted("ns1", "d1", "uid-stale").await;
        assert!(cache.get("ns1", "d1").await.is_some());
        cache.observe_domain_deleted("ns1", "d1", "uid-1").await;
        assert!(cache.get("ns1", "d1").await.is_none());
    }
}
