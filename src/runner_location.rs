//! Detecting where the test runner lives relative to the cluster
//!
//! When the configuration leaves `runner_location` unset, the first started
//! pod decides it: if its IP answers, the runner is inside the cluster
//! network; otherwise, if the cluster host answers, it is outside. The answer
//! is cached for the lifetime of the creator.

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::OnceCell;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::config::RunnerLocation;
use crate::{Error, Result};

/// How long one reachability check may take
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Answers whether a host can be reached from this process
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Reachability: Send + Sync {
    /// True if `host` answers on `port`
    async fn is_reachable(&self, host: &str, port: u16) -> bool;
}

/// TCP connect check
///
/// A refused connection counts as reachable: the host answered, it just has
/// nothing listening on that port yet.
#[derive(Clone, Debug)]
pub struct TcpReachability {
    timeout: Duration,
}

impl Default for TcpReachability {
    fn default() -> Self {
        Self {
            timeout: CONNECT_TIMEOUT,
        }
    }
}

#[async_trait]
impl Reachability for TcpReachability {
    async fn is_reachable(&self, host: &str, port: u16) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => true,
            Ok(Err(e)) => {
                debug!(host = %host, port, error = %e, "host not reachable");
                false
            }
            Err(_) => {
                debug!(host = %host, port, "reachability check timed out");
                false
            }
        }
    }
}

/// A host and port to check
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Endpoint<'a> {
    /// Host name or IP
    pub host: &'a str,
    /// Port to connect to
    pub port: u16,
}

/// Resolves the runner location once per creator
pub struct RunnerLocator {
    configured: Option<RunnerLocation>,
    checker: Arc<dyn Reachability>,
    detected: OnceCell<RunnerLocation>,
}

impl RunnerLocator {
    /// A locator that returns `configured`, or detects it with `checker`
    pub fn new(configured: Option<RunnerLocation>, checker: Arc<dyn Reachability>) -> Self {
        Self {
            configured,
            checker,
            detected: OnceCell::new(),
        }
    }

    /// The configured location, or the one detected on the first call
    ///
    /// Fails if neither the pod nor the cluster host can be reached; the
    /// failure is not cached.
    pub async fn locate(
        &self,
        pod: Endpoint<'_>,
        cluster: Endpoint<'_>,
    ) -> Result<RunnerLocation> {
        if let Some(location) = self.configured {
            return Ok(location);
        }
        self.detected
            .get_or_try_init(|| self.detect(pod, cluster))
            .await
            .copied()
    }

    async fn detect(&self, pod: Endpoint<'_>, cluster: Endpoint<'_>) -> Result<RunnerLocation> {
        let location = if self.checker.is_reachable(pod.host, pod.port).await {
            RunnerLocation::InternalToCluster
        } else if self.checker.is_reachable(cluster.host, cluster.port).await {
            RunnerLocation::ExternalToCluster
        } else {
            return Err(Error::configuration(format!(
                "unable to determine runner location: neither pod {} nor cluster host {} is reachable; set runner_location",
                pod.host, cluster.host
            )));
        };
        info!(location = ?location, "runner location detected");
        Ok(location)
    }
}

impl std::fmt::Debug for RunnerLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerLocator")
            .field("configured", &self.configured)
            .field("detected", &self.detected.get())
            .finish()
    }
}
