use k8s_openapi::api::core::v1::{EnvVar, LocalObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

fn default_server_start_policy() -> ServerStartPolicy {
    ServerStartPolicy::IfNeeded
}

fn default_true() -> bool {
    true
}

fn default_max_dynamic_cluster_size() -> u32 {
    256
}

/// Where the operator should look to find the domain home (config, apps, data).
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum DomainHomeSourceType {
    #[default]
    Image,
    FromModel,
    PersistentVolume,
}

impl FromStr for DomainHomeSourceType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Image" => Ok(Self::Image),
            "FromModel" => Ok(Self::FromModel),
            "PersistentVolume" => Ok(Self::PersistentVolume),
            _ => Err(()),
        }
    }
}

/// The policy that determines whether a server should be running.
///
/// Ordering here is significant only insofar as `NEVER < IF_NEEDED < ADMIN_ONLY < ALWAYS`
/// is never assumed anywhere; the evaluator treats these as a closed set, not a scale.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerStartPolicy {
    Never,
    #[default]
    IfNeeded,
    AdminOnly,
    Always,
}

impl FromStr for ServerStartPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEVER" => Ok(Self::Never),
            "IF_NEEDED" => Ok(Self::IfNeeded),
            "ADMIN_ONLY" => Ok(Self::AdminOnly),
            "ALWAYS" => Ok(Self::Always),
            _ => Err(()),
        }
    }
}

impl fmt::Display for ServerStartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => write!(f, "NEVER"),
            Self::IfNeeded => write!(f, "IF_NEEDED"),
            Self::AdminOnly => write!(f, "ADMIN_ONLY"),
            Self::Always => write!(f, "ALWAYS"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownSpec {
    pub shutdown_type: Option<String>,
    pub timeout_seconds: Option<i64>,
    pub ignore_session_during_shutdown: Option<bool>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServerPodSpec {
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub shutdown: Option<ShutdownSpec>,
    #[serde(default)]
    pub node_selector: std::collections::BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AdminServerSpec {
    pub server_start_state: Option<String>,
    #[serde(default)]
    pub server_pod: ServerPodSpec,
    /// Optional externally-reachable NodePort/LoadBalancer service for the admin channel.
    pub admin_service: Option<AdminServiceSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AdminServiceSpec {
    #[serde(default)]
    pub channels: Vec<AdminChannel>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AdminChannel {
    pub channel_name: String,
    pub node_port: Option<i32>,
}

/// One entry of `spec.clusters[]`.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpecEntry {
    pub cluster_name: String,
    #[serde(default)]
    pub replicas: Option<i32>,
    pub server_start_state: Option<String>,
    pub server_start_policy: Option<ServerStartPolicy>,
    #[serde(default)]
    pub server_pod: ServerPodSpec,
    pub restart_version: Option<String>,
    /// Dynamic clusters only: the numeric suffix upper bound for generated server names.
    #[serde(default = "default_max_dynamic_cluster_size")]
    pub max_dynamic_cluster_size: u32,
    /// Absent for static clusters; present (>0) for dynamic clusters.
    #[serde(default)]
    pub dynamic_server_count: Option<u32>,
}

/// One entry of `spec.managedServers[]`.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManagedServerSpec {
    pub server_name: String,
    pub server_start_policy: Option<ServerStartPolicy>,
    pub restart_version: Option<String>,
    #[serde(default)]
    pub server_pod: ServerPodSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OnlineUpdateSpec {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModelSpec {
    pub domain_type: Option<String>,
    pub runtime_encryption_secret: Option<String>,
    #[serde(default)]
    pub online_update: OnlineUpdateSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationSpec {
    pub model: Option<ModelSpec>,
}

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "weblogic.oracle",
    version = "v9",
    kind = "Domain",
    plural = "domains",
    derive = "PartialEq",
    status = "DomainStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.servers[?(@.serverName==\\\"admin-server\\\")].state\", \"name\": \"ADMIN\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.message\", \"name\": \"MESSAGE\", \"type\": \"string\" }"
)]
#[serde(rename_all = "camelCase")]
pub struct DomainSpec {
    #[serde(default)]
    pub domain_home_source_type: DomainHomeSourceType,
    pub image: String,
    #[serde(default)]
    pub image_pull_secrets: Vec<LocalObjectReference>,
    pub web_logic_credentials_secret: Option<String>,
    #[serde(default)]
    pub include_server_out_in_pod_log: bool,
    #[serde(default = "default_server_start_policy")]
    pub server_start_policy: ServerStartPolicy,
    pub restart_version: Option<String>,
    pub introspect_version: Option<String>,
    #[serde(default)]
    pub admin_server: AdminServerSpec,
    #[serde(default)]
    pub clusters: Vec<ClusterSpecEntry>,
    #[serde(default)]
    pub managed_servers: Vec<ManagedServerSpec>,
    #[serde(default)]
    pub configuration: ConfigurationSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServerHealth {
    pub overall_health: Option<String>,
    pub activation_time: Option<Time>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub server_name: String,
    pub cluster_name: Option<String>,
    pub state: Option<String>,
    pub health: Option<ServerHealth>,
    #[serde(default = "default_true")]
    pub is_admin_server: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatusEntry {
    pub cluster_name: String,
    pub replicas: i32,
    pub ready_replicas: i32,
    pub maximum_replicas: i32,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DomainStatus {
    #[serde(default)]
    pub servers: Vec<ServerStatus>,
    #[serde(default)]
    pub clusters: Vec<ClusterStatusEntry>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub introspect_job_failure_count: u32,
    pub message: Option<String>,
    pub last_updated: Option<Time>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_start_policy_round_trips_through_wire_strings() {
        for (s, policy) in [
            ("NEVER", ServerStartPolicy::Never),
            ("IF_NEEDED", ServerStartPolicy::IfNeeded),
            ("ADMIN_ONLY", ServerStartPolicy::AdminOnly),
            ("ALWAYS", ServerStartPolicy::Always),
        ] {
            assert_eq!(ServerStartPolicy::from_str(s).unwrap(), policy);
            assert_eq!(policy.to_string(), s);
        }
        assert!(ServerStartPolicy::from_str("bogus").is_err());
    }

    #[test]
    fn domain_spec_defaults_to_if_needed_and_image_source() {
        let spec: DomainSpec = serde_json::from_value(serde_json::json!({
            "image": "weblogic:14.1.1",
        }))
        .unwrap();
        assert_eq!(spec.server_start_policy, ServerStartPolicy::IfNeeded);
        assert_eq!(spec.domain_home_source_type, DomainHomeSourceType::Image);
        assert!(spec.clusters.is_empty());
    }
}
