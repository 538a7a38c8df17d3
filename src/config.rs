//! Configuration for workflow creators
//!
//! A [`Configuration`] can be built in code or loaded from a YAML file.
//! Every field has a default, so a file only needs the values it changes:
//!
//! ```yaml
//! namespace_prefix: nightly
//! runner_location: internal_to_cluster   # omit to detect it on first start
//! timing:
//!   operation_timeout_secs: 900
//!   poll_interval_secs: 10
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{Error, Result, DEFAULT_NAMESPACE_PREFIX, DEFAULT_PORT_BASE};

/// Where the process driving the tests runs relative to the cluster
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunnerLocation {
    /// Outside the cluster: containers are reached through service node ports
    ExternalToCluster,
    /// Inside the cluster: containers are reached at pod IP and container port
    InternalToCluster,
}

/// How container ports are numbered
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PortAllocation {
    /// One counter for the creator's whole lifetime; every port is unique
    #[default]
    ClusterUnique,
    /// A fixed block of ports per container ordinal
    PerContainerOffset,
}

/// Polling timeouts for remote convergence
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Timing {
    /// How long to wait for the cluster to converge before failing
    pub operation_timeout_secs: u64,
    /// Delay between two polls of the cluster
    pub poll_interval_secs: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            operation_timeout_secs: 60,
            poll_interval_secs: 1,
        }
    }
}

impl Timing {
    /// Time set for long-running tests on slow clusters
    pub fn long() -> Self {
        Self {
            operation_timeout_secs: 15 * 60,
            poll_interval_secs: 10,
        }
    }

    /// Convergence timeout
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    /// Poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Crash detection settings
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CrashWatcherConfig {
    /// Log fragments that mark abnormal termination of the container process
    pub signatures: Vec<String>,
}

impl Default for CrashWatcherConfig {
    fn default() -> Self {
        Self {
            signatures: vec![
                "panic".to_string(),
                "SIGSEGV".to_string(),
                "Segmentation fault".to_string(),
                "fatal error".to_string(),
            ],
        }
    }
}

/// Settings shared by every workflow of one creator
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Kubeconfig to use; `None` infers in-cluster or default config
    pub kubeconfig: Option<PathBuf>,
    /// Fixed namespace; `None` generates `{namespace_prefix}-{uuid}`
    pub namespace: Option<String>,
    /// Prefix for generated namespaces
    pub namespace_prefix: String,
    /// How callers reach started containers; `None` detects it from the
    /// first started pod
    pub runner_location: Option<RunnerLocation>,
    /// Host used for node port addresses; defaults to the API server host
    pub cluster_host: Option<String>,
    /// Convergence timeouts
    pub timing: Timing,
    /// Port numbering scheme
    pub port_allocation: PortAllocation,
    /// First port number handed out
    pub port_base: u16,
    /// Size of each container's port block for [`PortAllocation::PerContainerOffset`]
    pub ports_per_container: u16,
    /// Attempts for one log download before giving up
    pub log_download_attempts: u32,
    /// Crash detection
    pub crash_watcher: CrashWatcherConfig,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            namespace: None,
            namespace_prefix: DEFAULT_NAMESPACE_PREFIX.to_string(),
            runner_location: None,
            cluster_host: None,
            timing: Timing::default(),
            port_allocation: PortAllocation::default(),
            port_base: DEFAULT_PORT_BASE,
            ports_per_container: 100,
            log_download_attempts: 5,
            crash_watcher: CrashWatcherConfig::default(),
        }
    }
}

impl Configuration {
    /// Load and validate a YAML configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate YAML configuration
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Configuration = serde_yaml::from_str(content)
            .map_err(|e| Error::serialization(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot work
    pub fn validate(&self) -> Result<()> {
        if self.timing.operation_timeout_secs == 0 {
            return Err(Error::configuration(
                "timing.operation_timeout_secs must be greater than 0",
            ));
        }
        if self.timing.poll_interval_secs == 0 {
            return Err(Error::configuration(
                "timing.poll_interval_secs must be greater than 0",
            ));
        }
        if self.log_download_attempts == 0 {
            return Err(Error::configuration(
                "log_download_attempts must be at least 1",
            ));
        }
        if self.port_allocation == PortAllocation::PerContainerOffset
            && self.ports_per_container == 0
        {
            return Err(Error::configuration(
                "ports_per_container must be greater than 0",
            ));
        }
        match &self.namespace {
            Some(ns) => validate_dns_label(ns, "namespace")?,
            // 36 characters of uuid plus the separator
            None => validate_dns_label(
                &format!("{}-{}", self.namespace_prefix, "0".repeat(36)),
                "namespace_prefix",
            )?,
        }
        Ok(())
    }
}

/// Validate an RFC 1123 label (namespace names, resource name parts)
fn validate_dns_label(value: &str, field: &str) -> Result<()> {
    let valid_chars = value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let valid_edges = value
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric())
        && value
            .chars()
            .last()
            .is_some_and(|c| c.is_ascii_alphanumeric());

    if value.is_empty() || value.len() > 63 || !valid_chars || !valid_edges {
        return Err(Error::configuration(format!(
            "{} '{}' is not a valid DNS label (lowercase alphanumerics and '-', at most 63 characters)",
            field, value
        )));
    }
    Ok(())
}
