//! In-memory cluster for workflow tests
//!
//! Models the eventual consistency that matters to the workflow layer:
//! deployments need a few polls to become available, deletions take a few
//! polls to finish, and namespace teardown removes pods and the namespace
//! object at different times.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::io::Cursor;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Service};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{lossy_lines, ClusterClient, LogStream, PodInfo};
use crate::location::HOSTNAME_LABEL;
use crate::{Error, Result};

type Key = (String, String);

struct FakeDeployment {
    polls_until_available: u32,
    deleting: Option<u32>,
}

struct FakePod {
    namespace: String,
    info: PodInfo,
    labels: BTreeMap<String, String>,
    owner: Option<String>,
}

struct NamespaceTeardown {
    pod_polls: u32,
    namespace_polls: u32,
}

#[derive(Default)]
struct State {
    namespaces: HashSet<String>,
    teardowns: HashMap<String, NamespaceTeardown>,
    deployments: HashMap<Key, FakeDeployment>,
    services: HashMap<Key, Service>,
    pods: Vec<FakePod>,
    next_pod: u32,
    next_node_port: i32,
    logs: HashMap<Key, Vec<u8>>,
    read_log_failures: u32,
    broken_log_reads: u32,
    break_after_lines: usize,
    followers: HashMap<Key, Vec<UnboundedSender<Result<String>>>>,
    deleted_deployments: Vec<String>,
    deleted_services: Vec<String>,
}

/// Scriptable in-memory [`ClusterClient`]
pub(crate) struct FakeCluster {
    state: Mutex<State>,
    /// Polls a new deployment reports zero available replicas
    pub polls_until_available: u32,
    /// Polls a deleted deployment keeps reporting a replica
    pub deployment_teardown_polls: u32,
    /// Pod listings that still show pods of a deleted namespace
    pub namespace_pod_teardown_polls: u32,
    /// Existence checks that still see a deleted namespace
    pub namespace_teardown_polls: u32,
    /// Deployments never become available
    pub never_available: bool,
}

impl FakeCluster {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_node_port: 30000,
                ..Default::default()
            }),
            polls_until_available: 2,
            deployment_teardown_polls: 2,
            namespace_pod_teardown_polls: 3,
            namespace_teardown_polls: 1,
            never_available: false,
        }
    }

    /// A pod that exists before any workflow runs
    pub(crate) fn add_pod(&self, namespace: &str, name: &str, labels: BTreeMap<String, String>) {
        let mut state = self.state.lock().unwrap();
        state.pods.push(FakePod {
            namespace: namespace.to_string(),
            info: PodInfo {
                name: name.to_string(),
                ip: "10.244.9.9".to_string(),
                node_name: "kind-worker".to_string(),
            },
            labels,
            owner: None,
        });
    }

    /// Log content returned by `read_log`
    pub(crate) fn set_log(&self, pod: &str, container: &str, lines: &[&str]) {
        let mut raw = lines.join("\n").into_bytes();
        raw.push(b'\n');
        self.set_raw_log(pod, container, &raw);
    }

    /// Log content as the bytes the container wrote
    pub(crate) fn set_raw_log(&self, pod: &str, container: &str, raw: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .logs
            .insert((pod.to_string(), container.to_string()), raw.to_vec());
    }

    /// Make the next `count` calls to `read_log` fail with a transient error
    pub(crate) fn fail_next_log_reads(&self, count: u32) {
        self.state.lock().unwrap().read_log_failures = count;
    }

    /// Make the next `count` log reads drop the connection after `lines` lines
    pub(crate) fn break_next_log_reads(&self, count: u32, lines: usize) {
        let mut state = self.state.lock().unwrap();
        state.broken_log_reads = count;
        state.break_after_lines = lines;
    }

    /// Emit a line on every follower of a container log
    pub(crate) fn push_log_line(&self, pod: &str, container: &str, line: &str) {
        let state = self.state.lock().unwrap();
        if let Some(senders) = state.followers.get(&(pod.to_string(), container.to_string())) {
            for tx in senders {
                let _ = tx.send(Ok(line.to_string()));
            }
        }
    }

    /// End every followed stream of a container log
    pub(crate) fn end_log_stream(&self, pod: &str, container: &str) {
        self.state
            .lock()
            .unwrap()
            .followers
            .remove(&(pod.to_string(), container.to_string()));
    }

    pub(crate) fn namespace_exists_now(&self, namespace: &str) -> bool {
        self.state.lock().unwrap().namespaces.contains(namespace)
    }

    pub(crate) fn deployment_exists(&self, namespace: &str, name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .deployments
            .contains_key(&(namespace.to_string(), name.to_string()))
    }

    pub(crate) fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        self.state
            .lock()
            .unwrap()
            .services
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub(crate) fn deleted_deployments(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted_deployments.clone()
    }

    pub(crate) fn deleted_services(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted_services.clone()
    }

    pub(crate) fn pod_count(&self, namespace: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .pods
            .iter()
            .filter(|p| p.namespace == namespace)
            .count()
    }

    pub(crate) fn follower_count(&self, pod: &str, container: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .followers
            .get(&(pod.to_string(), container.to_string()))
            .map(|f| f.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
            None => labels.contains_key(term),
        })
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn namespace_exists(&self, name: &str) -> Result<bool> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        if let Some(teardown) = state.teardowns.get_mut(name) {
            if teardown.namespace_polls == 0 {
                state.namespaces.remove(name);
            } else {
                teardown.namespace_polls -= 1;
            }
        }
        Ok(state.namespaces.contains(name))
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<()> {
        let name = namespace
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::cluster("namespace has no name"))?;
        self.state.lock().unwrap().namespaces.insert(name);
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.namespaces.contains(name) {
            state.teardowns.insert(
                name.to_string(),
                NamespaceTeardown {
                    pod_polls: self.namespace_pod_teardown_polls,
                    namespace_polls: self.namespace_teardown_polls,
                },
            );
            state.deployments.retain(|(ns, _), _| ns != name);
            state.services.retain(|(ns, _), _| ns != name);
        }
        Ok(())
    }

    async fn create_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<()> {
        let name = deployment
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::cluster("deployment has no name"))?;
        let mut state = self.state.lock().unwrap();
        if !state.namespaces.contains(namespace) {
            return Err(Error::cluster(format!("namespace {} not found", namespace)));
        }
        let key = (namespace.to_string(), name.clone());
        if state.deployments.contains_key(&key) {
            return Err(Error::cluster(format!("deployment {} already exists", name)));
        }

        let template = deployment.spec.as_ref().map(|s| &s.template);
        let labels = template
            .and_then(|t| t.metadata.as_ref())
            .and_then(|m| m.labels.clone())
            .unwrap_or_default();
        let node_name = template
            .and_then(|t| t.spec.as_ref())
            .and_then(|s| s.node_selector.as_ref())
            .and_then(|sel| sel.get(HOSTNAME_LABEL).cloned())
            .unwrap_or_else(|| "kind-worker".to_string());

        state.next_pod += 1;
        let pod_number = state.next_pod;
        state.pods.push(FakePod {
            namespace: namespace.to_string(),
            info: PodInfo {
                name: format!("{}-{:05}", name, pod_number),
                ip: format!("10.244.0.{}", pod_number),
                node_name,
            },
            labels,
            owner: Some(name),
        });
        state.deployments.insert(
            key,
            FakeDeployment {
                polls_until_available: self.polls_until_available,
                deleting: None,
            },
        );
        Ok(())
    }

    async fn deployment_available_replicas(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<i32>> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let key = (namespace.to_string(), name.to_string());
        let Some(deployment) = state.deployments.get_mut(&key) else {
            return Ok(None);
        };

        match deployment.deleting {
            Some(0) => {}
            Some(remaining) => {
                deployment.deleting = Some(remaining - 1);
                return Ok(Some(1));
            }
            None if self.never_available => return Ok(Some(0)),
            None if deployment.polls_until_available > 0 => {
                deployment.polls_until_available -= 1;
                return Ok(Some(0));
            }
            None => return Ok(Some(1)),
        }

        state.deployments.remove(&key);
        state
            .pods
            .retain(|p| !(p.namespace == namespace && p.owner.as_deref() == Some(name)));
        Ok(None)
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.deleted_deployments.push(name.to_string());
        if let Some(deployment) = state
            .deployments
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            deployment.deleting.get_or_insert(self.deployment_teardown_polls);
        }
        Ok(())
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service> {
        let name = service
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::cluster("service has no name"))?;
        let mut state = self.state.lock().unwrap();
        let mut stored = service.clone();
        if let Some(ports) = stored.spec.as_mut().and_then(|s| s.ports.as_mut()) {
            for port in ports.iter_mut() {
                port.node_port = Some(state.next_node_port);
                state.next_node_port += 1;
            }
        }
        state
            .services
            .insert((namespace.to_string(), name), stored.clone());
        Ok(stored)
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.deleted_services.push(name.to_string());
        state
            .services
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<PodInfo>> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        if let Some(teardown) = state.teardowns.get_mut(namespace) {
            if teardown.pod_polls == 0 {
                state.pods.retain(|p| p.namespace != namespace);
            } else {
                teardown.pod_polls -= 1;
            }
        }
        Ok(state
            .pods
            .iter()
            .filter(|p| p.namespace == namespace && matches_selector(&p.labels, label_selector))
            .map(|p| p.info.clone())
            .collect())
    }

    async fn read_log(
        &self,
        _namespace: &str,
        pod: &str,
        container: &str,
        tail_lines: Option<i64>,
    ) -> Result<LogStream> {
        let (raw, break_after) = {
            let mut state = self.state.lock().unwrap();
            if state.read_log_failures > 0 {
                state.read_log_failures -= 1;
                return Err(connection_reset());
            }
            let raw = state
                .logs
                .get(&(pod.to_string(), container.to_string()))
                .cloned()
                .unwrap_or_default();
            let break_after = if state.broken_log_reads > 0 {
                state.broken_log_reads -= 1;
                Some(state.break_after_lines)
            } else {
                None
            };
            (raw, break_after)
        };

        let lines: Vec<String> = lossy_lines(Cursor::new(raw)).try_collect().await?;
        let skip = match tail_lines {
            Some(n) => lines.len().saturating_sub(usize::try_from(n).unwrap_or(0)),
            None => 0,
        };
        let mut items: Vec<Result<String>> = lines.into_iter().skip(skip).map(Ok).collect();
        if let Some(after) = break_after {
            items.truncate(after);
            items.push(Err(connection_reset()));
        }
        Ok(futures::stream::iter(items).boxed())
    }

    async fn follow_log(&self, _namespace: &str, pod: &str, container: &str) -> Result<LogStream> {
        let (tx, rx) = unbounded_channel();
        self.state
            .lock()
            .unwrap()
            .followers
            .entry((pod.to_string(), container.to_string()))
            .or_default()
            .push(tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}

fn connection_reset() -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::ConnectionReset,
        "connection reset by peer",
    ))
}
