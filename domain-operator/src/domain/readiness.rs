use k8s_openapi::api::core::v1::Event as CoreEvent;
use weblogic_operator_common::labels;

/// One parsed readiness observation: which server it concerns and the
/// textual status to record in `DomainPresenceInfo::last_known_server_status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessObservation {
    pub server_name: String,
    pub status: String,
}

/// Pluggable so a structured Pod-condition-based implementation can be
/// added later without touching the dispatcher (spec.md Open Questions).
pub trait ReadinessParser: Send + Sync {
    /// `domain_uid` is the UID the event's own `weblogic.domainUID` label
    /// already resolved to in the caller; it's what a server pod's own
    /// name is prefixed with (`pod_spec.rs`'s `"{uid}-{server_name}"`),
    /// needed to recover the bare server name `build_server_statuses`
    /// looks entries up by.
    fn parse(&self, event: &CoreEvent, domain_uid: &str) -> Option<ReadinessObservation>;
}

/// Parses the `"Readiness probe ... <state>"` substring the kubelet
/// writes into an `Event.message` for a server pod's readiness probe.
pub struct SubstringReadinessParser;

const READINESS_TOKEN: &str = "Readiness probe";

impl ReadinessParser for SubstringReadinessParser {
    fn parse(&self, event: &CoreEvent, domain_uid: &str) -> Option<ReadinessObservation> {
        let message = event.message.as_deref()?;
        if !message.contains(READINESS_TOKEN) {
            return None;
        }
        let server_name = bare_server_name(event, domain_uid)?;
        let status = if message.contains("failed") {
            "probe-failed".to_string()
        } else if message.contains("succeeded") {
            "probe-succeeded".to_string()
        } else {
            message.to_string()
        };
        Some(ReadinessObservation { server_name, status })
    }
}

/// Recovers the bare server name (`"managed-server1"`, `"admin-server"`)
/// the readiness event concerns: the `weblogic.serverName` label if the
/// event carries one, otherwise the involved Pod's name with its
/// `"{domain_uid}-"` prefix stripped.
fn bare_server_name(event: &CoreEvent, domain_uid: &str) -> Option<String> {
    if let Some(label) = event.metadata.labels.as_ref().and_then(|l| l.get(labels::SERVER_NAME)) {
        return Some(label.clone());
    }
    let pod_name = event.involved_object.name.as_deref()?;
    pod_name.strip_prefix(&format!("{domain_uid}-")).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ObjectReference;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn event(message: &str, involved_name: &str) -> CoreEvent {
        CoreEvent {
            message: Some(message.to_string()),
            involved_object: ObjectReference { name: Some(involved_name.to_string()), ..Default::default() },
            metadata: ObjectMeta::default(),
            ..Default::default()
        }
    }

    #[test]
    fn recognizes_a_failed_readiness_probe_and_strips_the_domain_uid_prefix() {
        let parser = SubstringReadinessParser;
        let obs = parser
            .parse(&event("Readiness probe failed: connection refused", "d1-managed-server1"), "d1")
            .expect("observation");
        assert_eq!(obs.server_name, "managed-server1");
        assert_eq!(obs.status, "probe-failed");
    }

    #[test]
    fn admin_server_pod_name_strips_to_the_bare_admin_server_name() {
        let parser = SubstringReadinessParser;
        let obs = parser
            .parse(&event("Readiness probe succeeded", "d1-admin-server"), "d1")
            .expect("observation");
        assert_eq!(obs.server_name, "admin-server");
        assert_eq!(obs.status, "probe-succeeded");
    }

    #[test]
    fn the_server_name_label_is_preferred_over_the_pod_name_when_present() {
        let parser = SubstringReadinessParser;
        let mut event = event("Readiness probe succeeded", "d1-managed-server1");
        let mut labels = std::collections::BTreeMap::new();
        labels.insert(labels::SERVER_NAME.to_string(), "managed-server1".to_string());
        event.metadata.labels = Some(labels);
        let obs = parser.parse(&event, "d1").expect("observation");
        assert_eq!(obs.server_name, "managed-server1");
    }

    #[test]
    fn ignores_unrelated_events() {
        let parser = SubstringReadinessParser;
        assert!(parser.parse(&event("Pulled image", "d1-managed-server1"), "d1").is_none());
    }
}
