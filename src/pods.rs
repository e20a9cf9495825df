use crate::error::Result;
use crate::image_reference::parse_image_id;
use crate::workload::{Workload, WorkloadKind};
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, warn};

/// container name → pod name → `repo@sha256:<hex>` the pod is running.
pub type RunningDigests = BTreeMap<String, BTreeMap<String, String>>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunningImages {
    pub containers: RunningDigests,
    pub init_containers: RunningDigests,
}

/// Build label selector string like "key1=value1,key2=value2"
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Images reported by the pods the workload currently owns.
pub async fn running_images<K: Workload>(client: &Client, workload: &K) -> Result<RunningImages> {
    let kind = K::KIND;
    let Some(owner_kind) = kind.pod_owner_kind() else {
        debug!("Pods of {} are not inspected", kind);
        return Ok(RunningImages::default());
    };
    let Some(labels) = workload
        .pod_template()
        .and_then(|template| template.metadata.as_ref())
        .and_then(|metadata| metadata.labels.as_ref())
        .filter(|labels| !labels.is_empty())
    else {
        return Ok(RunningImages::default());
    };

    let namespace = workload.namespace().unwrap_or_default();
    let lp = ListParams::default().labels(&label_selector(labels));

    let workload_names = HashSet::from([workload.name_any()]);
    // Deployment pods belong to the ReplicaSets the Deployment owns
    let owners: HashSet<String> = match kind {
        WorkloadKind::Deployment => {
            let replica_sets: Api<ReplicaSet> = Api::namespaced(client.clone(), &namespace);
            replica_sets
                .list(&lp)
                .await?
                .items
                .into_iter()
                .filter(|rs| is_owned_by(&rs.metadata, kind.as_str(), &workload_names))
                .map(|rs| rs.name_any())
                .collect()
        }
        _ => workload_names,
    };

    let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);
    let pod_list = pods.list(&lp).await?;
    Ok(collect_running_images(
        pod_list
            .items
            .iter()
            .filter(|pod| is_owned_by(&pod.metadata, owner_kind, &owners)),
    ))
}

fn is_owned_by(metadata: &ObjectMeta, kind: &str, names: &HashSet<String>) -> bool {
    metadata
        .owner_references
        .iter()
        .flatten()
        .any(|owner| owner.kind == kind && names.contains(&owner.name))
}

fn collect_running_images<'a>(pods: impl IntoIterator<Item = &'a Pod>) -> RunningImages {
    let mut running = RunningImages::default();
    for pod in pods {
        let pod_name = pod.name_any();
        let Some(status) = pod.status.as_ref() else {
            continue;
        };
        add_statuses(&mut running.init_containers, &pod_name, &status.init_container_statuses);
        add_statuses(&mut running.containers, &pod_name, &status.container_statuses);
    }
    running
}

fn add_statuses(
    running: &mut RunningDigests,
    pod_name: &str,
    statuses: &Option<Vec<ContainerStatus>>,
) {
    for status in statuses.iter().flatten() {
        match parse_image_id(&status.image_id) {
            Ok(image) => {
                running
                    .entry(status.name.clone())
                    .or_default()
                    .insert(pod_name.to_string(), image);
            }
            Err(e) => warn!("Skipping container {} of pod {}: {}", status.name, pod_name, e),
        }
    }
}
