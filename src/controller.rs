use crate::annotation::{CONFIG_ANNOTATION, ConfigAnnotation};
use crate::credentials::SecretSource;
use crate::error::Result;
use crate::planner::{DigestSource, UpdatePlan, plan_workload};
use crate::pods::{self, RunningImages};
use crate::rollout;
use crate::state::{NamespaceSelection, RunContext};
use crate::workload::{Workload, WorkloadKind, WorkloadStore};
use anyhow::Context;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::CronJob;
use kube::api::ListParams;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, ResourceExt};
use std::path::Path;
use tracing::{debug, error, info};

pub async fn create_client(kubeconfig: Option<&Path>) -> anyhow::Result<Client> {
    info!("Initializing K8s client");
    let client = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("Failed to read kubeconfig {}", path.display()))?;
            let config =
                kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .context("Failed to load kubeconfig")?;
            Client::try_from(config)?
        }
        None => Client::try_default().await?,
    };
    let api_server_info = client.apiserver_version().await?;
    info!(
        "Connected to namespace {}, Kubernetes API server with version {}.{}",
        client.default_namespace(),
        api_server_info.major,
        api_server_info.minor
    );
    Ok(client)
}

/// Cluster access used by the run loop.
pub trait Cluster: SecretSource {
    /// Lists workloads in `namespace`, or in all namespaces for `None`.
    async fn list<K: Workload>(
        &self,
        namespace: Option<&str>,
        lp: &ListParams,
    ) -> Result<Vec<K>, kube::Error>;

    async fn running_images<K: Workload>(&self, workload: &K) -> Result<RunningImages>;

    fn workloads<K: Workload>(&self, namespace: &str) -> impl WorkloadStore<K>;
}

impl Cluster for Client {
    async fn list<K: Workload>(
        &self,
        namespace: Option<&str>,
        lp: &ListParams,
    ) -> Result<Vec<K>, kube::Error> {
        let api: Api<K> = match namespace {
            Some(namespace) => Api::namespaced(self.clone(), namespace),
            None => Api::all(self.clone()),
        };
        Ok(api.list(lp).await?.items)
    }

    async fn running_images<K: Workload>(&self, workload: &K) -> Result<RunningImages> {
        pods::running_images(self, workload).await
    }

    fn workloads<K: Workload>(&self, namespace: &str) -> impl WorkloadStore<K> {
        Api::<K>::namespaced(self.clone(), namespace)
    }
}

/// Checks every selected workload of every kind. Failures of single workloads
/// don't stop the run; they are returned together as one error at the end.
pub async fn run<C: Cluster, R: DigestSource>(ctx: &RunContext<C, R>) -> anyhow::Result<()> {
    let namespaces: Vec<Option<&str>> = match &ctx.options.selection {
        NamespaceSelection::All => vec![None],
        NamespaceSelection::Namespaces(namespaces) => {
            namespaces.iter().map(|ns| Some(ns.as_str())).collect()
        }
    };

    let mut failed = Vec::new();
    for namespace in namespaces {
        for kind in WorkloadKind::ALL {
            let failures = match kind {
                WorkloadKind::Deployment => {
                    reconcile_kind::<Deployment, _, _>(ctx, namespace).await?
                }
                WorkloadKind::DaemonSet => {
                    reconcile_kind::<DaemonSet, _, _>(ctx, namespace).await?
                }
                WorkloadKind::StatefulSet => {
                    reconcile_kind::<StatefulSet, _, _>(ctx, namespace).await?
                }
                WorkloadKind::CronJob => reconcile_kind::<CronJob, _, _>(ctx, namespace).await?,
            };
            failed.extend(failures);
        }
    }

    if !failed.is_empty() {
        anyhow::bail!(failed.join("\n"));
    }
    Ok(())
}

async fn reconcile_kind<K: Workload, C: Cluster, R: DigestSource>(
    ctx: &RunContext<C, R>,
    namespace: Option<&str>,
) -> anyhow::Result<Vec<String>> {
    let mut lp = ListParams::default();
    if let Some(labels) = &ctx.options.label_selector {
        lp = lp.labels(labels);
    }
    if let Some(fields) = &ctx.options.field_selector {
        lp = lp.fields(fields);
    }

    let workloads = ctx
        .cluster
        .list::<K>(namespace, &lp)
        .await
        .with_context(|| format!("Failed to list {} resources", K::KIND))?;

    let mut failed = Vec::new();
    for workload in workloads {
        let namespace = workload.namespace().unwrap_or_default();
        let name = workload.name_any();
        if ctx.options.excluded.contains(&namespace) {
            debug!("Skipping {}/{}/{}, namespace is excluded", namespace, K::KIND, name);
            continue;
        }
        if let Err(e) = reconcile(ctx, &workload, &namespace, &name).await {
            let message = format!(
                "failed to check {}/{}/{}: {:#}",
                namespace,
                K::KIND,
                name,
                anyhow::Error::from(e)
            );
            error!("{}", message);
            failed.push(message);
        }
    }
    Ok(failed)
}

/// Merge → plan → apply for one workload.
async fn reconcile<K: Workload, C: Cluster, R: DigestSource>(
    ctx: &RunContext<C, R>,
    workload: &K,
    namespace: &str,
    name: &str,
) -> Result<()> {
    let Some(pod_spec) = workload.pod_spec() else {
        debug!("Skipping {}/{}/{} without pod template", namespace, K::KIND, name);
        return Ok(());
    };
    info!("checking {}/{}/{}", namespace, K::KIND, name);

    let credentials = ctx
        .credentials
        .effective_auth(namespace, &workload.image_pull_secrets())
        .await?;
    let config = ConfigAnnotation::merge(
        workload.annotations().get(CONFIG_ANNOTATION).map(String::as_str),
        pod_spec,
    )?;
    let running = if ctx.options.check_pods {
        ctx.cluster.running_images(workload).await?
    } else {
        RunningImages::default()
    };

    let update = plan_workload(
        &ctx.registry.with_credentials(&credentials),
        &config,
        pod_spec,
        &running,
    )
    .await;
    if update.is_empty() {
        return Ok(());
    }
    if !ctx.options.update {
        info!(
            "{}/{}/{} is outdated, run with --update to apply",
            namespace,
            K::KIND,
            name
        );
        return Ok(());
    }

    info!(
        "update {}/{}/{} ({} containers)",
        namespace,
        K::KIND,
        name,
        update.containers.len() + update.init_containers.len()
    );
    log_plan("container", &update.containers);
    log_plan("init container", &update.init_containers);
    let store = ctx.cluster.workloads::<K>(namespace);
    rollout::apply::<K, _>(&store, namespace, name, &update, &config, &ctx.options.retry).await
}

fn log_plan(what: &str, plan: &UpdatePlan) {
    for (container, image) in plan.iter() {
        debug!("Setting {} {} image to {}", what, container, image);
    }
}
