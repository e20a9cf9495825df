use crate::rollout::RetryPolicy;
use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};
use tracing::info;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub registry: RegistrySettings,
    pub update: UpdateSettings,
}

#[derive(Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RegistrySettings {
    pub timeout_seconds: u64,
    /// Registries addressed over plain http.
    pub insecure_registries: Vec<String>,
    pub ca_certificate_paths: Vec<PathBuf>,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            timeout_seconds: 10,
            insecure_registries: Vec::new(),
            ca_certificate_paths: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UpdateSettings {
    pub max_attempts: u32,
    pub retry_interval_millis: u64,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            max_attempts: retry.max_attempts,
            retry_interval_millis: retry.interval.as_millis() as u64,
        }
    }
}

impl UpdateSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            interval: Duration::from_millis(self.retry_interval_millis),
        }
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    info!("Loading config from file {}", path.as_ref().display());
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let expanded = expand_env_vars(&yaml_str)?;
    if expanded.trim().is_empty() {
        return Ok(Config::default());
    }

    let config = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")?;

    Ok(config)
}

/// Replaces `${VAR}` placeholders with environment variables values.
/// Returns an error naming every missing variable.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    let mut missing = Vec::new();
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        env::var(var_name).unwrap_or_else(|_| {
            missing.push(var_name.to_string());
            String::new()
        })
    });

    if !missing.is_empty() {
        anyhow::bail!("Missing environment variable: {}", missing.join(", "));
    }
    Ok(result.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_expand_env_vars_success() {
        unsafe {
            env::set_var("DIGESTPIN_TEST_VAR", "value123");
        }
        let input = "This is a test: ${DIGESTPIN_TEST_VAR}";
        let expanded = expand_env_vars(input).expect("Expansion should succeed");
        assert_eq!(expanded, "This is a test: value123");
        unsafe {
            env::remove_var("DIGESTPIN_TEST_VAR");
        }
    }

    #[test]
    fn test_expand_env_vars_missing_var() {
        let input = "This will fail: ${DIGESTPIN_MISSING_VAR}";
        let err = expand_env_vars(input).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Missing environment variable: DIGESTPIN_MISSING_VAR"
        );
    }

    #[test]
    fn test_expand_env_vars_no_vars() {
        let input = "No variables here";
        let expanded = expand_env_vars(input).expect("Expansion should succeed");
        assert_eq!(expanded, input);
    }

    #[test]
    fn test_load_config_file() {
        unsafe {
            env::set_var("DIGESTPIN_TEST_REGISTRY", "registry.local:5000");
        }
        let yaml_content = r#"
        registry:
          timeoutSeconds: 3
          insecureRegistries:
            - ${DIGESTPIN_TEST_REGISTRY}
        update:
          maxAttempts: 2
        "#;

        let tmp_file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        let path = tmp_file.path();
        fs::write(path, yaml_content).expect("Failed to write to temp file");

        let config = load_config(path).expect("Should load config");

        assert_eq!(config.registry.timeout_seconds, 3);
        assert_eq!(config.registry.insecure_registries, vec!["registry.local:5000"]);
        assert!(config.registry.ca_certificate_paths.is_empty());
        assert_eq!(config.update.max_attempts, 2);
        assert_eq!(config.update.retry_interval_millis, 10);
        unsafe {
            env::remove_var("DIGESTPIN_TEST_REGISTRY");
        }
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.registry.timeout_seconds, 10);
        let retry = config.update.retry_policy();
        assert_eq!(retry.max_attempts, 5);
        assert_eq!(retry.interval, Duration::from_millis(10));
    }
}
