use crate::annotation::{ConfigAnnotation, ContainerImage};
use crate::credentials::CredentialSet;
use crate::error::Result;
use crate::image_reference::{digest_of, is_digest_pinned, strip_tag};
use crate::pods::{RunningDigests, RunningImages};
use k8s_openapi::api::core::v1::{Container, PodSpec};
use std::collections::BTreeMap;
use std::collections::btree_map;
use tracing::{info, warn};

/// Resolves an image tag to the digest it currently points to.
pub trait DigestResolver {
    async fn resolve_digest(&self, image: &str) -> Result<String>;
}

/// Hands out resolvers bound to the registry credentials of one workload.
pub trait DigestSource {
    fn with_credentials<'a>(&'a self, credentials: &'a CredentialSet)
    -> impl DigestResolver + 'a;
}

/// Container name → pinned image (`repository@sha256:<hex>`) to write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdatePlan(BTreeMap<String, String>);

impl UpdatePlan {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, container: &str) -> Option<&str> {
        self.0.get(container).map(String::as_str)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, String> {
        self.0.iter()
    }
}

#[cfg(test)]
impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for UpdatePlan {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        UpdatePlan(
            iter.into_iter()
                .map(|(name, image)| (name.into(), image.into()))
                .collect(),
        )
    }
}

/// Plans for both container lists of a pod template.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkloadUpdate {
    pub containers: UpdatePlan,
    pub init_containers: UpdatePlan,
}

impl WorkloadUpdate {
    pub fn is_empty(&self) -> bool {
        self.containers.is_empty() && self.init_containers.is_empty()
    }
}

pub async fn plan_workload<R: DigestResolver>(
    resolver: &R,
    config: &ConfigAnnotation,
    pod_spec: &PodSpec,
    running: &RunningImages,
) -> WorkloadUpdate {
    let init_containers = plan(
        resolver,
        &config.init_containers,
        pod_spec.init_containers.as_deref().unwrap_or_default(),
        &running.init_containers,
    )
    .await;
    let containers = plan(
        resolver,
        &config.containers,
        &pod_spec.containers,
        &running.containers,
    )
    .await;
    WorkloadUpdate {
        containers,
        init_containers,
    }
}

/// Decides which containers are out of date.
///
/// Entries already pinned to a digest are left alone. The others are resolved
/// through `resolver`; a resolution failure only skips that container. The
/// candidate `repository@digest` is compared against the running pods when
/// any were found, and against the live spec otherwise.
pub async fn plan<R: DigestResolver>(
    resolver: &R,
    config: &[ContainerImage],
    live: &[Container],
    running: &RunningDigests,
) -> UpdatePlan {
    let mut plan = UpdatePlan::default();
    for entry in config {
        if is_digest_pinned(&entry.image) {
            info!("{} ok (fixed digest)", entry.name);
            continue;
        }
        let Some(spec_image) = live
            .iter()
            .find(|container| container.name == entry.name)
            .and_then(|container| container.image.as_deref())
        else {
            continue;
        };

        let digest = match resolver.resolve_digest(&entry.image).await {
            Ok(digest) => digest,
            Err(e) => {
                warn!("{} unable to get digest: {}", entry.name, e);
                continue;
            }
        };
        let candidate = format!("{}@{}", strip_tag(&entry.image), digest);

        if needs_update(&entry.name, &candidate, spec_image, running.get(&entry.name)) {
            plan.0.insert(entry.name.clone(), candidate);
        }
    }
    plan
}

fn needs_update(
    name: &str,
    candidate: &str,
    spec_image: &str,
    running: Option<&BTreeMap<String, String>>,
) -> bool {
    let Some(pods) = running.filter(|pods| !pods.is_empty()) else {
        if candidate != spec_image {
            info!("{} need to be updated from {} to {}", name, spec_image, candidate);
            return true;
        }
        info!("{} ok", name);
        return false;
    };

    let mut outdated = false;
    for (pod, image) in pods {
        if digest_of(image) != digest_of(candidate) {
            info!(
                "{} on {} need to be updated from {} to {}",
                name, pod, image, candidate
            );
            outdated = true;
        } else {
            info!("{} on {} ok", name, pod);
        }
    }
    outdated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::collections::HashMap;
    use std::sync::Mutex;

    const OLD: &str = "sha256:1111111111111111111111111111111111111111111111111111111111111111";
    const NEW: &str = "sha256:2222222222222222222222222222222222222222222222222222222222222222";

    #[derive(Default)]
    struct FakeRegistry {
        digests: HashMap<String, String>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeRegistry {
        fn with(digests: &[(&str, &str)]) -> Self {
            Self {
                digests: digests
                    .iter()
                    .map(|(image, digest)| (image.to_string(), digest.to_string()))
                    .collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl DigestResolver for FakeRegistry {
        async fn resolve_digest(&self, image: &str) -> Result<String> {
            self.calls.lock().unwrap().push(image.to_string());
            self.digests.get(image).cloned().ok_or_else(|| Error::DigestFetch {
                url: image.to_string(),
                reason: "unexpected response 404 Not Found".to_string(),
            })
        }
    }

    fn container(name: &str, image: &str) -> Container {
        Container {
            name: name.to_string(),
            image: Some(image.to_string()),
            ..Default::default()
        }
    }

    fn running(container: &str, pods: &[(&str, &str)]) -> RunningDigests {
        BTreeMap::from([(
            container.to_string(),
            pods.iter()
                .map(|(pod, image)| (pod.to_string(), image.to_string()))
                .collect(),
        )])
    }

    #[tokio::test]
    async fn test_outdated_spec_is_planned() {
        let registry = FakeRegistry::with(&[("repo:v1", NEW)]);
        let config = vec![ContainerImage::new("app", "repo:v1")];
        let live = vec![container("app", &format!("repo@{}", OLD))];

        let plan = plan(&registry, &config, &live, &RunningDigests::new()).await;

        assert_eq!(plan.get("app"), Some(format!("repo@{}", NEW).as_str()));
    }

    #[tokio::test]
    async fn test_up_to_date_spec_is_not_planned() {
        let registry = FakeRegistry::with(&[("repo:v1", NEW)]);
        let config = vec![ContainerImage::new("app", "repo:v1")];
        let live = vec![container("app", &format!("repo@{}", NEW))];

        let plan = plan(&registry, &config, &live, &RunningDigests::new()).await;

        assert!(plan.is_empty());
    }

    #[tokio::test]
    async fn test_fixed_digest_is_never_resolved() {
        let registry = FakeRegistry::with(&[]);
        let pinned = format!("repo@{}", OLD);
        let config = vec![ContainerImage::new("app", &pinned)];
        let live = vec![container("app", &pinned)];

        let plan = plan(&registry, &config, &live, &RunningDigests::new()).await;

        assert!(plan.is_empty());
        assert!(registry.calls().is_empty());
    }

    #[tokio::test]
    async fn test_running_pods_take_precedence_over_spec() {
        let registry = FakeRegistry::with(&[("repo:v1", NEW)]);
        let config = vec![ContainerImage::new("app", "repo:v1")];
        // spec already pinned to the candidate, pod still on the old digest
        let live = vec![container("app", &format!("repo@{}", NEW))];

        let stale = running("app", &[("pod-1", &format!("repo@{}", OLD))]);
        let plan_stale = plan(&registry, &config, &live, &stale).await;
        assert_eq!(plan_stale.get("app"), Some(format!("repo@{}", NEW).as_str()));

        let current = running(
            "app",
            &[
                ("pod-1", &format!("repo@{}", NEW)),
                ("pod-2", &format!("docker.io/library/repo@{}", NEW)),
            ],
        );
        let plan_current = plan(&registry, &config, &live, &current).await;
        assert!(plan_current.is_empty());
    }

    #[tokio::test]
    async fn test_one_stale_pod_is_enough() {
        let registry = FakeRegistry::with(&[("repo:v1", NEW)]);
        let config = vec![ContainerImage::new("app", "repo:v1")];
        let live = vec![container("app", "repo:v1")];
        let pods = running(
            "app",
            &[
                ("pod-1", &format!("repo@{}", NEW)),
                ("pod-2", &format!("repo@{}", OLD)),
            ],
        );

        let plan = plan(&registry, &config, &live, &pods).await;

        assert_eq!(plan.len(), 1);
    }

    #[tokio::test]
    async fn test_resolution_failure_skips_only_that_container() {
        let registry = FakeRegistry::with(&[("myhost:5000/api:v1", NEW)]);
        let config = vec![
            ContainerImage::new("api", "myhost:5000/api:v1"),
            ContainerImage::new("broken", "missing:v1"),
        ];
        let live = vec![
            container("api", "myhost:5000/api:v1"),
            container("broken", "missing:v1"),
        ];

        let plan = plan(&registry, &config, &live, &RunningDigests::new()).await;

        assert_eq!(
            plan.get("api"),
            Some(format!("myhost:5000/api@{}", NEW).as_str())
        );
        assert_eq!(plan.get("broken"), None);
        assert_eq!(registry.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_second_run_is_a_no_op() {
        let registry = FakeRegistry::with(&[("repo:v1", NEW), ("tools", OLD)]);
        let mut spec = PodSpec {
            containers: vec![container("app", "repo:v1")],
            init_containers: Some(vec![container("init", "tools")]),
            ..Default::default()
        };

        let config = ConfigAnnotation::merge(None, &spec).unwrap();
        let first = plan_workload(&registry, &config, &spec, &RunningImages::default()).await;
        assert_eq!(first.containers.len(), 1);
        assert_eq!(first.init_containers.get("init"), Some(format!("tools@{}", OLD).as_str()));

        // what the applier writes
        for c in spec.containers.iter_mut() {
            if let Some(image) = first.containers.get(&c.name) {
                c.image = Some(image.to_string());
            }
        }
        for c in spec.init_containers.iter_mut().flatten() {
            if let Some(image) = first.init_containers.get(&c.name) {
                c.image = Some(image.to_string());
            }
        }
        let annotation = config.encode().unwrap();

        let config = ConfigAnnotation::merge(Some(&annotation), &spec).unwrap();
        assert_eq!(config.containers, vec![ContainerImage::new("app", "repo:v1")]);
        let second = plan_workload(&registry, &config, &spec, &RunningImages::default()).await;
        assert!(second.is_empty());
    }
}
