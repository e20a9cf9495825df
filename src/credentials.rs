use crate::error::{BoxError, Error, Result};
use crate::image_reference::normalize_domain;
use crate::secret_string::SecretString;
use anyhow::Context;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{env, fs, io};
use tokio::sync::Mutex;
use tracing::debug;

pub static DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";

/// `config.json` / `.dockerconfigjson` payload.
#[derive(Debug, Default, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, DockerAuth>,
}

#[derive(Debug, Deserialize)]
struct DockerAuth {
    #[serde(default)]
    auth: SecretString,
}

/// Registry host → Basic token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialSet(BTreeMap<String, SecretString>);

impl CredentialSet {
    pub fn from_docker_config(json: &[u8]) -> serde_json::Result<Self> {
        let config: DockerConfig = serde_json::from_slice(json)?;
        let mut credentials = Self::default();
        for (host, entry) in config.auths {
            if !entry.auth.is_empty() {
                credentials.insert(&host, entry.auth);
            }
        }
        Ok(credentials)
    }

    pub fn insert(&mut self, host: &str, token: SecretString) {
        self.0.insert(normalize_domain(host), token);
    }

    /// Right-biased overlay: entries of `other` replace ours host by host.
    pub fn overlay(&mut self, other: &CredentialSet) {
        for (host, token) in &other.0 {
            self.0.insert(host.clone(), token.clone());
        }
    }

    pub fn token_for(&self, host: &str) -> Option<&SecretString> {
        self.0.get(host)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn default_docker_config_path() -> Option<PathBuf> {
    if let Some(dir) = env::var_os("DOCKER_CONFIG") {
        return Some(PathBuf::from(dir).join("config.json"));
    }
    env::var_os("HOME").map(|home| PathBuf::from(home).join(".docker").join("config.json"))
}

/// Loads the default credentials. An explicit path must exist; the implicit
/// `~/.docker/config.json` is optional.
pub fn load_default_credentials(path: Option<&Path>) -> anyhow::Result<CredentialSet> {
    let (path, required) = match path {
        Some(path) => (path.to_path_buf(), true),
        None => match default_docker_config_path() {
            Some(path) => (path, false),
            None => return Ok(CredentialSet::default()),
        },
    };

    let data = match fs::read(&path) {
        Ok(data) => data,
        Err(e) if !required && e.kind() == io::ErrorKind::NotFound => {
            debug!("No docker config found at {}", path.display());
            return Ok(CredentialSet::default());
        }
        Err(e) => {
            return Err(e)
                .with_context(|| format!("Failed to read docker config {}", path.display()));
        }
    };
    if data.is_empty() {
        return Ok(CredentialSet::default());
    }

    let credentials = CredentialSet::from_docker_config(&data)
        .with_context(|| format!("Failed to parse docker config {}", path.display()))?;
    debug!("Read docker config {}", path.display());
    Ok(credentials)
}

/// Where pull secrets come from.
pub trait SecretSource {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, kube::Error>;
}

impl SecretSource for Client {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, kube::Error> {
        Api::<Secret>::namespaced(self.clone(), namespace).get(name).await
    }
}

/// Default credentials layered with the pull secrets of a workload.
/// Decoded secrets are cached per `namespace/name` for the lifetime of the store.
pub struct CredentialStore<S = Client> {
    source: S,
    defaults: CredentialSet,
    secrets: Mutex<HashMap<String, Arc<CredentialSet>>>,
}

impl<S: SecretSource> CredentialStore<S> {
    pub fn new(source: S, defaults: CredentialSet) -> Self {
        Self {
            source,
            defaults,
            secrets: Mutex::new(HashMap::new()),
        }
    }

    pub fn default_auth(&self) -> &CredentialSet {
        &self.defaults
    }

    pub async fn effective_auth(
        &self,
        namespace: &str,
        pull_secrets: &[String],
    ) -> Result<CredentialSet> {
        let mut credentials = self.defaults.clone();
        for name in pull_secrets {
            let secret = self.pull_secret(namespace, name).await?;
            credentials.overlay(&secret);
        }
        Ok(credentials)
    }

    async fn pull_secret(&self, namespace: &str, name: &str) -> Result<Arc<CredentialSet>> {
        // held across the fetch so that concurrent misses on one key fetch once
        let mut cache = self.secrets.lock().await;
        let key = format!("{}/{}", namespace, name);
        if let Some(credentials) = cache.get(&key) {
            return Ok(Arc::clone(credentials));
        }

        let fetch_error = |source: BoxError| Error::CredentialFetch {
            namespace: namespace.to_string(),
            name: name.to_string(),
            source,
        };

        debug!("Fetching pull secret {}", key);
        let secret = self
            .source
            .get_secret(namespace, name)
            .await
            .map_err(|e| fetch_error(e.into()))?;
        let payload = secret
            .data
            .as_ref()
            .and_then(|data| data.get(DOCKER_CONFIG_JSON_KEY))
            .ok_or_else(|| fetch_error(format!("no {} key", DOCKER_CONFIG_JSON_KEY).into()))?;
        let credentials = CredentialSet::from_docker_config(&payload.0)
            .map_err(|e| fetch_error(e.into()))?;

        let credentials = Arc::new(credentials);
        cache.insert(key, Arc::clone(&credentials));
        Ok(credentials)
    }
}
