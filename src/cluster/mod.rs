//! Cluster operations
//!
//! [`ClusterClient`] is the seam to the Kubernetes API: every call the
//! workflow layer makes goes through it, so tests can swap in a mock or the
//! in-memory fake. [`ClusterOperations`] binds a client to one namespace and
//! adds the convergence waits on top of the raw calls.
//!
//! All API calls are single attempts. Waiting for the cluster to converge is
//! done exclusively through [`wait_until`].

mod kube_client;
pub mod manifests;
mod wait;

#[cfg(test)]
pub(crate) mod fake;

pub use kube_client::{connect, KubeClusterClient};
#[cfg(test)]
pub(crate) use kube_client::lossy_lines;
pub use wait::wait_until;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use tracing::{debug, info, instrument};

#[cfg(test)]
use mockall::automock;

use crate::config::Timing;
use crate::Result;

/// Lines of a container log
///
/// A followed log ends when the container exits; a read log ends at the
/// last line written so far.
pub type LogStream = BoxStream<'static, Result<String>>;

/// Identity of a running pod
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodInfo {
    /// Pod name
    pub name: String,
    /// Pod IP; empty until the pod has been scheduled and started
    pub ip: String,
    /// Node the pod runs on; empty until scheduled
    pub node_name: String,
}

/// Trait abstracting the Kubernetes API calls used by workflows
///
/// This trait allows mocking the cluster in tests while using the real
/// client in production. Deletes treat "not found" as success and creates
/// of namespaces treat "already exists" as success.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Whether the namespace exists (including while terminating)
    async fn namespace_exists(&self, name: &str) -> Result<bool>;

    /// Create a namespace
    async fn create_namespace(&self, namespace: &k8s_openapi::api::core::v1::Namespace)
        -> Result<()>;

    /// Delete a namespace and everything in it, without grace period
    async fn delete_namespace(&self, name: &str) -> Result<()>;

    /// Create a deployment
    async fn create_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<()>;

    /// Available replicas of a deployment, `None` if it does not exist
    async fn deployment_available_replicas(&self, namespace: &str, name: &str)
        -> Result<Option<i32>>;

    /// Delete a deployment with foreground propagation
    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()>;

    /// Create a service and return it as stored by the API server
    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service>;

    /// Delete a service
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()>;

    /// Pods matching a label selector; an empty selector lists every pod
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<PodInfo>>;

    /// Stream the log of a container as written so far, optionally only the
    /// last `tail_lines`
    async fn read_log(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        tail_lines: Option<i64>,
    ) -> Result<LogStream>;

    /// Follow the log of a container
    async fn follow_log(&self, namespace: &str, pod: &str, container: &str) -> Result<LogStream>;
}

/// Cluster calls scoped to one namespace, with bounded waits
#[derive(Clone)]
pub struct ClusterOperations {
    client: Arc<dyn ClusterClient>,
    namespace: String,
    timing: Timing,
}

impl ClusterOperations {
    /// Bind `client` to `namespace`
    pub fn new(client: Arc<dyn ClusterClient>, namespace: impl Into<String>, timing: Timing) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            timing,
        }
    }

    /// The namespace all operations act on
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Timeouts used for waits
    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    /// Create the namespace unless it exists, then wait for it to appear
    #[instrument(skip(self), fields(namespace = %self.namespace))]
    pub async fn ensure_namespace(&self) -> Result<()> {
        if self.client.namespace_exists(&self.namespace).await? {
            debug!("namespace already exists");
            return Ok(());
        }

        info!("creating namespace");
        self.client
            .create_namespace(&manifests::build_namespace(&self.namespace))
            .await?;

        let (client, namespace) = (&self.client, self.namespace.as_str());
        let description = format!("namespace {} created", namespace);
        self.wait(&description, || async move {
            client.namespace_exists(namespace).await
        })
        .await
    }

    /// Submit a deployment
    pub async fn create_deployment(&self, deployment: &Deployment) -> Result<()> {
        self.client
            .create_deployment(&self.namespace, deployment)
            .await
    }

    /// Submit a service, returning it with its assigned node ports
    pub async fn create_service(&self, service: &Service) -> Result<Service> {
        self.client.create_service(&self.namespace, service).await
    }

    /// Wait until the deployment reports at least one available replica
    #[instrument(skip(self), fields(namespace = %self.namespace))]
    pub async fn wait_until_online(&self, deployment: &str) -> Result<()> {
        let (client, namespace) = (&self.client, self.namespace.as_str());
        let description = format!("deployment {} available", deployment);
        self.wait(&description, || async move {
            let replicas = client
                .deployment_available_replicas(namespace, deployment)
                .await?;
            Ok(matches!(replicas, Some(n) if n > 0))
        })
        .await
    }

    /// Wait until the deployment is gone or has no available replicas
    #[instrument(skip(self), fields(namespace = %self.namespace))]
    pub async fn wait_until_offline(&self, deployment: &str) -> Result<()> {
        let (client, namespace) = (&self.client, self.namespace.as_str());
        let description = format!("deployment {} offline", deployment);
        self.wait(&description, || async move {
            let replicas = client
                .deployment_available_replicas(namespace, deployment)
                .await?;
            Ok(replicas.unwrap_or(0) == 0)
        })
        .await
    }

    /// Delete a deployment
    pub async fn delete_deployment(&self, name: &str) -> Result<()> {
        self.client.delete_deployment(&self.namespace, name).await
    }

    /// Delete a service
    pub async fn delete_service(&self, name: &str) -> Result<()> {
        self.client.delete_service(&self.namespace, name).await
    }

    /// Pods matching `label_selector`
    pub async fn list_pods(&self, label_selector: &str) -> Result<Vec<PodInfo>> {
        self.client.list_pods(&self.namespace, label_selector).await
    }

    /// Stream a container log up to its current end
    pub async fn read_log(
        &self,
        pod: &str,
        container: &str,
        tail_lines: Option<i64>,
    ) -> Result<LogStream> {
        self.client
            .read_log(&self.namespace, pod, container, tail_lines)
            .await
    }

    /// Follow a container log
    pub async fn follow_log(&self, pod: &str, container: &str) -> Result<LogStream> {
        self.client.follow_log(&self.namespace, pod, container).await
    }

    /// Delete the namespace and wait until it and all its pods are gone
    ///
    /// Both conditions are checked in the same poll, so a namespace that
    /// disappears before its pods do is not reported as cleaned up.
    #[instrument(skip(self), fields(namespace = %self.namespace))]
    pub async fn delete_all_resources(&self) -> Result<()> {
        info!("deleting namespace and all resources");
        self.client.delete_namespace(&self.namespace).await?;

        let (client, namespace) = (&self.client, self.namespace.as_str());
        let description = format!("namespace {} and its pods deleted", namespace);
        self.wait(&description, || async move {
            let pods = client.list_pods(namespace, "").await?;
            let exists = client.namespace_exists(namespace).await?;
            Ok(pods.is_empty() && !exists)
        })
        .await
    }

    async fn wait<F, Fut>(&self, description: &str, predicate: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<bool>>,
    {
        wait_until(
            description,
            self.timing.operation_timeout(),
            self.timing.poll_interval(),
            predicate,
        )
        .await
    }
}

impl std::fmt::Debug for ClusterOperations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterOperations")
            .field("namespace", &self.namespace)
            .field("timing", &self.timing)
            .finish()
    }
}
