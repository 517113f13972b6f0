use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use weblogic_operator_common::labels;

use crate::util::{Error, MANAGER_NAME};

/// Creates `desired` if absent, or server-side-applies it if the live
/// object differs. Each creation step built on top of this is
/// idempotent: running the same plan twice with no external change
/// patches nothing the second time (spec.md P2).
pub async fn ensure_pod(client: Client, namespace: &str, desired: Pod) -> Result<Pod, Error> {
    let api: Api<Pod> = Api::namespaced(client, namespace);
    apply(&api, desired.name_any(), &desired).await
}

pub async fn ensure_service(client: Client, namespace: &str, desired: Service) -> Result<Service, Error> {
    let api: Api<Service> = Api::namespaced(client, namespace);
    apply(&api, desired.name_any(), &desired).await
}

pub async fn ensure_config_map(
    client: Client,
    namespace: &str,
    desired: ConfigMap,
) -> Result<ConfigMap, Error> {
    let api: Api<ConfigMap> = Api::namespaced(client, namespace);
    apply(&api, desired.name_any(), &desired).await
}

pub async fn ensure_job(client: Client, namespace: &str, desired: Job) -> Result<Job, Error> {
    let api: Api<Job> = Api::namespaced(client, namespace);
    apply(&api, desired.name_any(), &desired).await
}

async fn apply<K>(api: &Api<K>, name: String, desired: &K) -> Result<K, Error>
where
    K: Clone
        + std::fmt::Debug
        + serde::Serialize
        + for<'de> serde::Deserialize<'de>
        + kube::Resource<Scope = kube::core::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    let patch = Patch::Apply(desired);
    let params = PatchParams::apply(MANAGER_NAME).force();
    Ok(api.patch(&name, &params, &patch).await?)
}

pub async fn delete_job(client: Client, namespace: &str, name: &str) -> Result<(), Error> {
    let api: Api<Job> = Api::namespaced(client, namespace);
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Deletes every Pod/Service/ConfigMap/Job this operator created for one
/// domain, identified by the `weblogic.createdByOperator=true,
/// weblogic.domainUID=<uid>` label pair (spec.md §8 scenario 6).
pub async fn delete_all_domain_resources(client: Client, namespace: &str, domain_uid: &str) -> Result<(), Error> {
    let selector = format!(
        "{}=true,{}={}",
        labels::CREATED_BY_OPERATOR,
        labels::DOMAIN_UID,
        domain_uid
    );
    let lp = ListParams::default().labels(&selector);
    let dp = DeleteParams::default();

    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    for pod in pods.list(&lp).await?.items {
        let _ = pods.delete(&pod.name_any(), &dp).await;
    }

    let services: Api<Service> = Api::namespaced(client.clone(), namespace);
    for svc in services.list(&lp).await?.items {
        let _ = services.delete(&svc.name_any(), &dp).await;
    }

    let jobs: Api<Job> = Api::namespaced(client.clone(), namespace);
    for job in jobs.list(&lp).await?.items {
        let _ = jobs.delete(&job.name_any(), &dp).await;
    }

    let config_maps: Api<ConfigMap> = Api::namespaced(client, namespace);
    for cm in config_maps.list(&lp).await?.items {
        let _ = config_maps.delete(&cm.name_any(), &dp).await;
    }

    Ok(())
}
