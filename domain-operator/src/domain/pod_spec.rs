use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use weblogic_domain_types::Domain;
use weblogic_operator_common::{annotations, labels};

use crate::util::hash_spec;

/// Bodies the concrete WDT/WLST tooling and image contents actually
/// need, which spec.md places out of scope and specifies only "at the
/// interface". One illustrative default is provided so the planner's
/// step chain is exercisable end-to-end; a real deployment swaps this
/// implementation for one that renders the full WebLogic container
/// spec (volumes, probes, JVM options, sidecars).
pub trait PodSpecBuilder: Send + Sync {
    fn admin_pod(&self, domain: &Domain) -> Pod;
    fn admin_internal_service(&self, domain: &Domain) -> Service;
    fn admin_external_service(&self, domain: &Domain) -> Option<Service>;
    fn managed_server_pod(&self, domain: &Domain, server_name: &str, cluster_name: Option<&str>) -> Pod;
    fn managed_server_service(&self, domain: &Domain, server_name: &str) -> Service;
    fn introspector_job(&self, domain: &Domain) -> Job;
}

pub struct DefaultPodSpecBuilder;

fn domain_uid(domain: &Domain) -> String {
    domain.metadata.name.clone().unwrap_or_default()
}

fn namespace(domain: &Domain) -> String {
    domain.metadata.namespace.clone().unwrap_or_default()
}

fn base_labels(domain: &Domain, server_name: Option<&str>) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    map.insert(labels::DOMAIN_UID.to_string(), domain_uid(domain));
    map.insert(labels::CREATED_BY_OPERATOR.to_string(), "true".to_string());
    if let Some(server) = server_name {
        map.insert(labels::SERVER_NAME.to_string(), server.to_string());
    }
    map
}

fn base_annotations(domain: &Domain) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    map.insert(annotations::CREATED_BY.to_string(), "weblogic-domain-operator".to_string());
    map.insert(annotations::SPEC_HASH.to_string(), hash_spec(&domain.spec));
    if let Some(v) = &domain.spec.restart_version {
        map.insert(annotations::DOMAIN_RESTART_VERSION.to_string(), v.clone());
    }
    if let Some(v) = &domain.spec.introspect_version {
        map.insert(annotations::INTROSPECT_VERSION.to_string(), v.clone());
    }
    map
}

fn container(name: &str, image: &str, env: Vec<k8s_openapi::api::core::v1::EnvVar>) -> Container {
    Container {
        name: name.to_string(),
        image: Some(image.to_string()),
        env: Some(env),
        ..Default::default()
    }
}

impl PodSpecBuilder for DefaultPodSpecBuilder {
    fn admin_pod(&self, domain: &Domain) -> Pod {
        let uid = domain_uid(domain);
        Pod {
            metadata: ObjectMeta {
                name: Some(format!("{uid}-admin-server")),
                namespace: Some(namespace(domain)),
                labels: Some(base_labels(domain, Some("admin-server"))),
                annotations: Some(base_annotations(domain)),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![container(
                    "weblogic-server",
                    &domain.spec.image,
                    domain.spec.admin_server.server_pod.env.clone(),
                )],
                node_selector: non_empty_map(domain.spec.admin_server.server_pod.node_selector.clone()),
                ..Default::default()
            }),
            status: None,
        }
    }

    fn admin_internal_service(&self, domain: &Domain) -> Service {
        let uid = domain_uid(domain);
        Service {
            metadata: ObjectMeta {
                name: Some(format!("{uid}-admin-server")),
                namespace: Some(namespace(domain)),
                labels: Some(base_labels(domain, Some("admin-server"))),
                annotations: Some(base_annotations(domain)),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(base_labels(domain, Some("admin-server"))),
                ports: Some(vec![ServicePort {
                    port: 7001,
                    name: Some("default".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            status: None,
        }
    }

    fn admin_external_service(&self, domain: &Domain) -> Option<Service> {
        let channels = &domain.spec.admin_server.admin_service.as_ref()?.channels;
        if channels.is_empty() {
            return None;
        }
        let uid = domain_uid(domain);
        Some(Service {
            metadata: ObjectMeta {
                name: Some(format!("{uid}-admin-server-external")),
                namespace: Some(namespace(domain)),
                labels: Some(base_labels(domain, Some("admin-server"))),
                annotations: Some(base_annotations(domain)),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("NodePort".to_string()),
                selector: Some(base_labels(domain, Some("admin-server"))),
                ports: Some(
                    channels
                        .iter()
                        .map(|c| ServicePort {
                            name: Some(c.channel_name.clone()),
                            node_port: c.node_port,
                            port: c.node_port.unwrap_or(7001),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            status: None,
        })
    }

    fn managed_server_pod(&self, domain: &Domain, server_name: &str, cluster_name: Option<&str>) -> Pod {
        let uid = domain_uid(domain);
        let mut labels_map = base_labels(domain, Some(server_name));
        if let Some(cluster) = cluster_name {
            labels_map.insert(labels::CLUSTER_NAME.to_string(), cluster.to_string());
        }
        let env = cluster_name
            .and_then(|cluster| domain.spec.clusters.iter().find(|c| c.cluster_name == cluster))
            .map(|c| c.server_pod.env.clone())
            .or_else(|| {
                domain
                    .spec
                    .managed_servers
                    .iter()
                    .find(|s| s.server_name == server_name)
                    .map(|s| s.server_pod.env.clone())
            })
            .unwrap_or_default();
        Pod {
            metadata: ObjectMeta {
                name: Some(format!("{uid}-{server_name}")),
                namespace: Some(namespace(domain)),
                labels: Some(labels_map),
                annotations: Some(base_annotations(domain)),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![container("weblogic-server", &domain.spec.image, env)],
                ..Default::default()
            }),
            status: None,
        }
    }

    fn managed_server_service(&self, domain: &Domain, server_name: &str) -> Service {
        let uid = domain_uid(domain);
        Service {
            metadata: ObjectMeta {
                name: Some(format!("{uid}-{server_name}")),
                namespace: Some(namespace(domain)),
                labels: Some(base_labels(domain, Some(server_name))),
                annotations: Some(base_annotations(domain)),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(base_labels(domain, Some(server_name))),
                ports: Some(vec![ServicePort {
                    port: 8001,
                    name: Some("default".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            status: None,
        }
    }

    fn introspector_job(&self, domain: &Domain) -> Job {
        use k8s_openapi::api::batch::v1::JobSpec;
        use k8s_openapi::api::core::v1::PodTemplateSpec;

        let uid = domain_uid(domain);
        Job {
            metadata: ObjectMeta {
                name: Some(introspector_job_name(&uid)),
                namespace: Some(namespace(domain)),
                labels: Some(base_labels(domain, None).into_iter().chain([(
                    labels::JOB_NAME.to_string(),
                    introspector_job_name(&uid),
                )]).collect()),
                annotations: Some(base_annotations(domain)),
                ..Default::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(0),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(base_labels(domain, None)),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        restart_policy: Some("Never".to_string()),
                        containers: vec![container("introspector", &domain.spec.image, Vec::new())],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: None,
        }
    }
}

fn non_empty_map(map: BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    if map.is_empty() { None } else { Some(map) }
}

/// Name of the Kubernetes Job the introspector runs as, per spec.md §6.
pub fn introspector_job_name(domain_uid: &str) -> String {
    format!("{domain_uid}-introspector")
}

/// Name of the ConfigMap the introspector's parsed output is written to.
pub fn introspector_config_map_name(domain_uid: &str) -> String {
    format!("{domain_uid}-weblogic-domain-introspect-cm")
}

#[cfg(test)]
mod tests {
    use super::*;
    use weblogic_domain_types::DomainSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta as Meta;

    fn domain() -> Domain {
        Domain {
            metadata: Meta {
                name: Some("d1".to_string()),
                namespace: Some("ns1".to_string()),
                ..Default::default()
            },
            spec: DomainSpec {
                image: "weblogic:14.1.1".to_string(),
                ..Default::default()
            },
            status: None,
        }
    }

    #[test]
    fn admin_pod_is_named_and_labeled_deterministically() {
        let builder = DefaultPodSpecBuilder;
        let pod = builder.admin_pod(&domain());
        assert_eq!(pod.metadata.name.as_deref(), Some("d1-admin-server"));
        assert_eq!(
            pod.metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(labels::DOMAIN_UID))
                .map(String::as_str),
            Some("d1")
        );
    }

    #[test]
    fn no_external_service_without_configured_channels() {
        let builder = DefaultPodSpecBuilder;
        assert!(builder.admin_external_service(&domain()).is_none());
    }

    #[test]
    fn introspector_job_name_matches_the_spec_convention() {
        assert_eq!(introspector_job_name("d1"), "d1-introspector");
        assert_eq!(
            introspector_config_map_name("d1"),
            "d1-weblogic-domain-introspect-cm"
        );
    }
}
