use crate::credentials::CredentialStore;
use crate::oci_registry::RegistryClient;
use crate::rollout::RetryPolicy;
use globset::{Glob, GlobSet, GlobSetBuilder};

/// Everything one invocation shares across workloads. The secret and digest
/// caches live here and die with the run.
pub struct RunContext<C = kube::Client, R = RegistryClient> {
    pub(crate) cluster: C,
    pub(crate) registry: R,
    pub(crate) credentials: CredentialStore<C>,
    pub(crate) options: RunOptions,
}

pub struct RunOptions {
    pub(crate) selection: NamespaceSelection,
    pub(crate) excluded: ExcludedNamespaces,
    pub(crate) label_selector: Option<String>,
    pub(crate) field_selector: Option<String>,
    pub(crate) update: bool,
    pub(crate) check_pods: bool,
    pub(crate) retry: RetryPolicy,
}

pub enum NamespaceSelection {
    All,
    Namespaces(Vec<String>),
}

/// Namespaces skipped when listing across all namespaces.
#[derive(Debug)]
pub struct ExcludedNamespaces(GlobSet);

impl ExcludedNamespaces {
    pub fn new(patterns: &[String]) -> anyhow::Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(Glob::new(pattern)?);
        }
        Ok(Self(builder.build()?))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, namespace: &str) -> bool {
        self.0.is_match(namespace)
    }
}
