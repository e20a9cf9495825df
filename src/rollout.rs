use crate::annotation::{CONFIG_ANNOTATION, ConfigAnnotation};
use crate::error::{Error, Result};
use crate::planner::{UpdatePlan, WorkloadUpdate};
use crate::workload::{Workload, WorkloadStore};
use chrono::Utc;
use k8s_openapi::api::core::v1::Container;
use kube::ResourceExt;
use std::time::Duration;
use tracing::{debug, info, warn};

static UPDATED_AT_ANNOTATION: &str = "kube-digestpin/updatedAt";

/// Bounds the get → mutate → replace cycles on 409 Conflict.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            interval: Duration::from_millis(10),
        }
    }
}

/// Writes the planned images and the merged config annotation in a single
/// replace. Every attempt starts from a fresh copy of the object, so a
/// conflicting writer's changes are never overwritten with stale data.
pub async fn apply<K, S>(
    store: &S,
    namespace: &str,
    name: &str,
    update: &WorkloadUpdate,
    config: &ConfigAnnotation,
    retry: &RetryPolicy,
) -> Result<()>
where
    K: Workload,
    S: WorkloadStore<K>,
{
    if update.is_empty() {
        return Ok(());
    }

    let kind = K::KIND.as_str();
    let annotation = config.encode()?;
    let attempts = retry.max_attempts.max(1);

    for attempt in 1..=attempts {
        let mut workload = store.fetch(name).await?;
        rewrite(&mut workload, &annotation, update);

        debug!("Replacing {} {}/{} (attempt {})", kind, namespace, name, attempt);
        match store.store(name, &workload).await {
            Ok(_) => {
                info!("Updated {} {}/{}", kind, namespace, name);
                return Ok(());
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                warn!(
                    "Conflict while updating {} {}/{} (attempt {}/{})",
                    kind, namespace, name, attempt, attempts
                );
                if attempt < attempts {
                    tokio::time::sleep(retry.interval).await;
                }
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(Error::ConcurrentUpdate {
        kind,
        namespace: namespace.to_string(),
        name: name.to_string(),
        attempts,
    })
}

fn rewrite<K: Workload>(workload: &mut K, annotation: &str, update: &WorkloadUpdate) {
    let annotations = workload.annotations_mut();
    annotations.insert(CONFIG_ANNOTATION.to_string(), annotation.to_string());
    annotations.insert(UPDATED_AT_ANNOTATION.to_string(), Utc::now().to_rfc3339());

    if let Some(spec) = workload.pod_template_mut().and_then(|t| t.spec.as_mut()) {
        set_images(&mut spec.containers, &update.containers);
        set_images(spec.init_containers.iter_mut().flatten(), &update.init_containers);
    }
}

fn set_images<'a>(containers: impl IntoIterator<Item = &'a mut Container>, plan: &UpdatePlan) {
    for container in containers {
        if let Some(image) = plan.get(&container.name) {
            container.image = Some(image.to_string());
        }
    }
}
