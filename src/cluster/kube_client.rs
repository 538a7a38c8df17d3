//! [`ClusterClient`] backed by a real kube client

use std::time::Duration;

use async_trait::async_trait;
use futures::{AsyncBufRead, AsyncBufReadExt, Stream, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Pod, Service};
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams, PropagationPolicy};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, trace, warn};

use super::{ClusterClient, LogStream, PodInfo};
use crate::config::Configuration;
use crate::{Error, Result};

/// Connect timeout for API server requests
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Buffered log lines per followed stream
const LOG_CHANNEL_CAPACITY: usize = 256;

/// Create a kube client from the configured kubeconfig, or the inferred one
///
/// Returns the client and the API server host, which is where node ports of
/// the cluster are reachable unless `cluster_host` overrides it.
///
/// No read timeout is set: followed log streams may stay silent for as long
/// as the container does.
pub async fn connect(config: &Configuration) -> Result<(Client, String)> {
    let mut kube_config = match &config.kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::configuration(format!(
                    "failed to read kubeconfig {}: {}",
                    path.display(),
                    e
                ))
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::configuration(format!("failed to load kubeconfig: {}", e)))?
        }
        None => Config::infer()
            .await
            .map_err(|e| Error::configuration(format!("failed to infer kube config: {}", e)))?,
    };
    kube_config.connect_timeout = Some(CONNECT_TIMEOUT);
    kube_config.read_timeout = None;

    let host = match &config.cluster_host {
        Some(host) => host.clone(),
        None => kube_config
            .cluster_url
            .host()
            .map(str::to_string)
            .ok_or_else(|| Error::configuration("cluster url has no host"))?,
    };

    let client = Client::try_from(kube_config)?;
    Ok((client, host))
}

/// Real Kubernetes client implementation
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Create a new KubeClusterClient wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn namespace_exists(&self, name: &str) -> Result<bool> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?.is_some())
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.create(&PostParams::default(), namespace).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(namespace = ?namespace.metadata.name, "namespace already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..Default::default()
        };
        match api.delete(name, &params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(namespace = %name, "namespace already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn create_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), deployment).await?;
        Ok(())
    }

    async fn deployment_available_replicas(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<i32>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let deployment = api.get_opt(name).await?;
        Ok(deployment.map(|d| {
            d.status
                .and_then(|s| s.available_replicas)
                .unwrap_or(0)
        }))
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Foreground),
            ..Default::default()
        };
        match api.delete(name, &params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), service).await?)
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<PodInfo>> {
        let params = if label_selector.is_empty() {
            ListParams::default()
        } else {
            ListParams::default().labels(label_selector)
        };
        let pods = self.pods(namespace).list(&params).await?;

        Ok(pods
            .items
            .into_iter()
            .filter_map(|pod| {
                let name = pod.metadata.name?;
                Some(PodInfo {
                    name,
                    ip: pod
                        .status
                        .and_then(|s| s.pod_ip)
                        .unwrap_or_default(),
                    node_name: pod.spec.and_then(|s| s.node_name).unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn read_log(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        tail_lines: Option<i64>,
    ) -> Result<LogStream> {
        let params = LogParams {
            container: Some(container.to_string()),
            tail_lines,
            ..Default::default()
        };
        Ok(spawn_log_reader(self.pods(namespace), pod.to_string(), params))
    }

    async fn follow_log(&self, namespace: &str, pod: &str, container: &str) -> Result<LogStream> {
        let params = LogParams {
            container: Some(container.to_string()),
            follow: true,
            ..Default::default()
        };
        Ok(spawn_log_reader(self.pods(namespace), pod.to_string(), params))
    }
}

/// Forward the lines of a pod log into a channel-backed stream
///
/// A failure to open the log is delivered as the first item.
fn spawn_log_reader(api: Api<Pod>, pod: String, params: LogParams) -> LogStream {
    let (tx, rx) = tokio::sync::mpsc::channel(LOG_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let reader = match api.log_stream(&pod, &params).await {
            Ok(reader) => reader,
            Err(e) => {
                warn!(pod = %pod, error = %e, "failed to open log stream");
                let _ = tx.send(Err(Error::from(e))).await;
                return;
            }
        };

        let mut lines = Box::pin(lossy_lines(Box::pin(reader)));
        while let Some(line) = lines.next().await {
            if tx.send(line).await.is_err() {
                trace!(pod = %pod, "log stream receiver dropped");
                return;
            }
        }
        trace!(pod = %pod, "log stream ended");
    });

    ReceiverStream::new(rx).boxed()
}

/// Split a byte stream into lines, replacing invalid UTF-8
///
/// Container output is arbitrary bytes. A line that is not valid UTF-8 is
/// still a line and must not end the stream.
pub(crate) fn lossy_lines<R>(reader: R) -> impl Stream<Item = Result<String>>
where
    R: AsyncBufRead + Unpin,
{
    futures::stream::try_unfold(reader, |mut reader| async move {
        let mut buf = Vec::new();
        let read = reader.read_until(b'\n', &mut buf).await;
        match read {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some((decode_line(&buf), reader))),
            Err(e) => Err(Error::from(e)),
        }
    })
}

fn decode_line(raw: &[u8]) -> String {
    let line = raw.strip_suffix(b"\n").unwrap_or(raw);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}
