//! Workflows: start and stop groups of containers as one pod
//!
//! A [`WorkflowCreator`] owns everything that must be shared between
//! workflows: the cluster connection, the numbering counters and the
//! registry of pods already attributed to a workflow. Each
//! [`StartupWorkflow`] it creates gets a unique workflow number, which names
//! its deployment and service, so concurrent workflows never collide.

mod running;

pub use running::{Address, ContainerAddress, RunningContainer, RunningContainers, ServiceRef};

use std::cell::RefCell;
use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::cluster::{self, manifests, ClusterClient, ClusterOperations, KubeClusterClient, PodInfo};
use crate::config::{Configuration, PortAllocation, RunnerLocation};
use crate::crash_watcher::CrashWatcher;
use crate::known_pods::KnownPods;
use crate::location::Location;
use crate::numbers::{NumberSource, WorkflowNumberSource};
use crate::recipe::{
    create_recipe, ContainerRecipe, ContainerRecipeFactory, RecipeComponentFactory, StartupConfig,
};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::runner_location::{Endpoint, Reachability, RunnerLocator, TcpReachability};
use crate::{Error, Result};

/// Port checked on a pod that declares no ports of its own
const FALLBACK_POD_PORT: u16 = 80;

/// Port checked on the cluster host when no node port was assigned
const API_SERVER_PORT: u16 = 443;

/// Receives downloaded log lines, one call per line
pub trait LogHandler {
    /// Handle one log line
    fn handle_line(&mut self, line: &str);
}

impl<F> LogHandler for F
where
    F: FnMut(&str),
{
    fn handle_line(&mut self, line: &str) {
        self(line)
    }
}

/// Handler plus the number of lines it has already seen
struct LogCursor<'a> {
    handler: &'a mut dyn LogHandler,
    delivered: usize,
}

// =============================================================================
// Workflow creator
// =============================================================================

/// Factory for workflows sharing one namespace, counters and pod registry
pub struct WorkflowCreator {
    ops: ClusterOperations,
    config: Arc<Configuration>,
    workflow_numbers: Arc<NumberSource>,
    container_numbers: Arc<NumberSource>,
    port_numbers: Arc<NumberSource>,
    known_pods: Arc<KnownPods>,
    locator: Arc<RunnerLocator>,
}

impl WorkflowCreator {
    /// Connect to the cluster described by `config`
    pub async fn connect(mut config: Configuration) -> Result<Self> {
        config.validate()?;
        let (client, host) = cluster::connect(&config).await?;
        config.cluster_host = Some(host);
        Ok(Self::new(Arc::new(KubeClusterClient::new(client)), config))
    }

    /// Create a creator on top of an existing cluster client
    pub fn new(client: Arc<dyn ClusterClient>, config: Configuration) -> Self {
        let namespace = config
            .namespace
            .clone()
            .unwrap_or_else(|| format!("{}-{}", config.namespace_prefix, Uuid::new_v4()));
        info!(namespace = %namespace, "workflow creator ready");

        Self {
            ops: ClusterOperations::new(client, namespace, config.timing.clone()),
            port_numbers: Arc::new(NumberSource::new(u64::from(config.port_base))),
            locator: Arc::new(RunnerLocator::new(
                config.runner_location,
                Arc::new(TcpReachability::default()),
            )),
            config: Arc::new(config),
            workflow_numbers: Arc::new(NumberSource::new(0)),
            container_numbers: Arc::new(NumberSource::new(0)),
            known_pods: Arc::new(KnownPods::new()),
        }
    }

    /// Detect the runner location with `checker` instead of TCP connects
    pub fn with_reachability(mut self, checker: Arc<dyn Reachability>) -> Self {
        self.locator = Arc::new(RunnerLocator::new(self.config.runner_location, checker));
        self
    }

    /// Namespace every workflow of this creator uses
    pub fn namespace(&self) -> &str {
        self.ops.namespace()
    }

    /// Create a workflow with a fresh workflow number
    pub fn create_workflow(&self) -> StartupWorkflow {
        let numbers = WorkflowNumberSource::new(
            self.workflow_numbers.next_number(),
            self.container_numbers.clone(),
        );
        StartupWorkflow {
            numbers,
            ops: self.ops.clone(),
            config: self.config.clone(),
            port_numbers: self.port_numbers.clone(),
            known_pods: self.known_pods.clone(),
            locator: self.locator.clone(),
        }
    }
}

// =============================================================================
// Startup workflow
// =============================================================================

/// One start/stop transaction
pub struct StartupWorkflow {
    numbers: WorkflowNumberSource,
    ops: ClusterOperations,
    config: Arc<Configuration>,
    port_numbers: Arc<NumberSource>,
    known_pods: Arc<KnownPods>,
    locator: Arc<RunnerLocator>,
}

impl StartupWorkflow {
    /// Number identifying this workflow
    pub fn workflow_number(&self) -> u64 {
        self.numbers.workflow_number()
    }

    /// Namespace the workflow runs in
    pub fn namespace(&self) -> &str {
        self.ops.namespace()
    }

    /// Start `count` containers built by `factory` in one pod
    ///
    /// Returns once the deployment is available and its pod has been
    /// identified. One crash watcher per container is running on return.
    /// If anything fails after the deployment was submitted, the deployment
    /// and service are deleted again before the error is returned.
    #[instrument(
        skip(self, factory, config),
        fields(workflow = self.numbers.workflow_number(), namespace = %self.ops.namespace(), app = factory.app_name())
    )]
    pub async fn start(
        &self,
        count: usize,
        location: &Location,
        factory: &dyn ContainerRecipeFactory,
        config: &StartupConfig,
    ) -> Result<RunningContainers> {
        if count == 0 {
            return Err(Error::configuration(
                "at least one container must be requested",
            ));
        }

        let recipes = self.create_recipes(count, factory, config)?;
        ensure_unique_ports(&recipes)?;

        let workflow_number = self.numbers.workflow_number();
        let deployment_name = manifests::deployment_name(workflow_number);
        let service_name = manifests::service_name(workflow_number);

        self.ops.ensure_namespace().await?;

        let deployment = manifests::build_deployment(
            &deployment_name,
            self.ops.namespace(),
            workflow_number,
            &recipes,
            location,
        );
        let service = manifests::build_service(
            &service_name,
            self.ops.namespace(),
            &deployment_name,
            workflow_number,
            &recipes,
        );

        self.ops.create_deployment(&deployment).await?;
        debug!(deployment = %deployment_name, "deployment created");

        match self
            .launch(&deployment_name, &service_name, service.as_ref(), recipes)
            .await
        {
            Ok(running) => {
                info!(containers = %running, "containers started");
                Ok(running)
            }
            Err(e) => {
                warn!(deployment = %deployment_name, error = %e, "start failed, removing deployment");
                self.discard(&deployment_name, service.as_ref().map(|_| service_name.as_str()))
                    .await;
                Err(e)
            }
        }
    }

    /// Stop the containers of a previous `start`
    ///
    /// Crash watchers are stopped first so the teardown is not reported as
    /// a crash. With `wait_for_stop`, returns only after the deployment is
    /// gone or reports no available replicas.
    #[instrument(skip(self, running), fields(workflow = running.workflow_number, namespace = %self.ops.namespace()))]
    pub async fn stop(&self, mut running: RunningContainers, wait_for_stop: bool) -> Result<()> {
        for container in running.containers.iter_mut() {
            container.crash_watcher.stop().await;
        }

        if let Some(service) = &running.service {
            self.ops.delete_service(&service.name).await?;
        }
        self.ops.delete_deployment(&running.deployment).await?;

        if wait_for_stop {
            self.ops.wait_until_offline(&running.deployment).await?;
        }
        info!(deployment = %running.deployment, "containers stopped");
        Ok(())
    }

    /// Stream the log of one container into `handler`
    ///
    /// Lines reach the handler as they are read. A transient failure retries
    /// the read and skips the lines the handler already received, so no line
    /// is delivered twice.
    #[instrument(skip(self, container, handler), fields(pod = %container.pod.name, container = %container.name()))]
    pub async fn download_container_log(
        &self,
        container: &RunningContainer,
        handler: &mut dyn LogHandler,
        tail_lines: Option<i64>,
    ) -> Result<()> {
        let pod = container.pod.name.as_str();
        let name = container.name();
        let retry = RetryConfig::with_max_attempts(self.config.log_download_attempts);
        let operation = format!("download log {}/{}", pod, name);
        let cursor = RefCell::new(LogCursor {
            handler,
            delivered: 0,
        });

        retry_with_backoff(&retry, &operation, Error::is_transient, || {
            self.read_log_into(&cursor, pod, &name, tail_lines)
        })
        .await
        .map_err(|e| Error::log_download(pod, name.as_str(), e.to_string()))?;

        debug!(lines = cursor.borrow().delivered, "log downloaded");
        Ok(())
    }

    /// Delete the namespace and wait until it and all its pods are gone
    pub async fn delete_all_resources(&self) -> Result<()> {
        self.ops.delete_all_resources().await
    }

    /// An idle crash watcher for `container`; the caller starts and stops it
    pub fn create_crash_watcher(&self, container: &RunningContainer) -> CrashWatcher {
        self.watcher_for(&container.pod, &container.name())
    }

    /// Everything of `start` after the deployment was submitted
    async fn launch(
        &self,
        deployment_name: &str,
        service_name: &str,
        service: Option<&Service>,
        recipes: Vec<ContainerRecipe>,
    ) -> Result<RunningContainers> {
        let service = match service {
            Some(service) => {
                let created = self.ops.create_service(service).await?;
                let service = ServiceRef {
                    name: service_name.to_string(),
                    node_ports: manifests::node_ports(&created),
                };
                debug!(service = %service.name, ports = service.node_ports.len(), "service created");
                Some(service)
            }
            None => None,
        };

        self.ops.wait_until_online(deployment_name).await?;
        let pod = self.attribute_new_pod(deployment_name).await?;
        let runner_location = self
            .locate_runner(&pod, &recipes, service.as_ref())
            .await?;

        let mut containers = Vec::with_capacity(recipes.len());
        for recipe in recipes {
            let mut crash_watcher = self.watcher_for(&pod, &recipe.name());
            crash_watcher.start().await?;
            containers.push(RunningContainer {
                addresses: self.addresses(&recipe, &pod, service.as_ref()),
                recipe,
                pod: pod.clone(),
                runner_location,
                crash_watcher,
            });
        }

        Ok(RunningContainers {
            workflow_number: self.numbers.workflow_number(),
            namespace: self.ops.namespace().to_string(),
            deployment: deployment_name.to_string(),
            service,
            pod,
            containers,
        })
    }

    /// Best-effort removal of a deployment whose start failed
    async fn discard(&self, deployment: &str, service: Option<&str>) {
        if let Some(service) = service {
            if let Err(e) = self.ops.delete_service(service).await {
                warn!(service = %service, error = %e, "failed to delete service");
            }
        }
        if let Err(e) = self.ops.delete_deployment(deployment).await {
            warn!(deployment = %deployment, error = %e, "failed to delete deployment");
        }
    }

    /// One read of the log; lines the cursor already delivered are skipped
    async fn read_log_into(
        &self,
        cursor: &RefCell<LogCursor<'_>>,
        pod: &str,
        container: &str,
        tail_lines: Option<i64>,
    ) -> Result<()> {
        let mut lines = self.ops.read_log(pod, container, tail_lines).await?;
        let mut position = 0;
        while let Some(line) = lines.next().await {
            let line = line?;
            position += 1;
            let mut cursor = cursor.borrow_mut();
            if position > cursor.delivered {
                cursor.handler.handle_line(&line);
                cursor.delivered = position;
            }
        }
        Ok(())
    }

    async fn locate_runner(
        &self,
        pod: &PodInfo,
        recipes: &[ContainerRecipe],
        service: Option<&ServiceRef>,
    ) -> Result<RunnerLocation> {
        let pod_port = recipes
            .iter()
            .flat_map(ContainerRecipe::all_ports)
            .map(|port| port.number)
            .next()
            .unwrap_or(FALLBACK_POD_PORT);
        let cluster_port = service
            .and_then(|s| s.node_ports.values().next().copied())
            .unwrap_or(API_SERVER_PORT);

        self.locator
            .locate(
                Endpoint {
                    host: &pod.ip,
                    port: pod_port,
                },
                Endpoint {
                    host: self.cluster_host(),
                    port: cluster_port,
                },
            )
            .await
    }

    fn cluster_host(&self) -> &str {
        self.config.cluster_host.as_deref().unwrap_or("localhost")
    }

    fn watcher_for(&self, pod: &PodInfo, container: &str) -> CrashWatcher {
        CrashWatcher::new(
            self.ops.clone(),
            pod.name.clone(),
            container,
            self.config.crash_watcher.signatures.clone(),
        )
    }

    fn create_recipes(
        &self,
        count: usize,
        factory: &dyn ContainerRecipeFactory,
        config: &StartupConfig,
    ) -> Result<Vec<ContainerRecipe>> {
        (0..count)
            .map(|index| {
                let number = self.numbers.next_container_number();
                let components = match self.config.port_allocation {
                    PortAllocation::ClusterUnique => {
                        RecipeComponentFactory::cluster_unique(self.port_numbers.clone())
                    }
                    PortAllocation::PerContainerOffset => RecipeComponentFactory::per_container_offset(
                        self.config.port_base,
                        self.config.ports_per_container,
                        number,
                    ),
                };
                create_recipe(factory, number, index, components, config)
            })
            .collect()
    }

    /// Find the single pod of `deployment` no other workflow has claimed
    async fn attribute_new_pod(&self, deployment: &str) -> Result<PodInfo> {
        let selector = manifests::selector_string(&manifests::selector_labels(deployment));
        let pods = self.ops.list_pods(&selector).await?;

        let mut new_pods: Vec<PodInfo> = pods
            .into_iter()
            .filter(|pod| self.known_pods.try_attribute(&pod.name))
            .collect();

        if new_pods.len() != 1 {
            let names: Vec<&str> = new_pods.iter().map(|p| p.name.as_str()).collect();
            return Err(Error::cluster(format!(
                "expected exactly one new pod for deployment {}, found {}: {:?}",
                deployment,
                new_pods.len(),
                names
            )));
        }
        let pod = new_pods.remove(0);
        if pod.ip.is_empty() {
            return Err(Error::cluster(format!("pod {} has no IP address", pod.name)));
        }

        debug!(pod = %pod.name, ip = %pod.ip, node = %pod.node_name, "pod attributed");
        Ok(pod)
    }

    fn addresses(
        &self,
        recipe: &ContainerRecipe,
        pod: &PodInfo,
        service: Option<&ServiceRef>,
    ) -> Vec<ContainerAddress> {
        let host = self.cluster_host();
        recipe
            .all_ports()
            .map(|port| ContainerAddress {
                port: port.clone(),
                internal: Address::new(pod.ip.clone(), port.number),
                external: service
                    .and_then(|s| s.node_ports.get(&port.number))
                    .map(|node_port| Address::new(host, *node_port)),
            })
            .collect()
    }
}

/// Containers of one pod share its network namespace; a port number can be
/// bound only once
fn ensure_unique_ports(recipes: &[ContainerRecipe]) -> Result<()> {
    let mut seen = HashSet::new();
    for port in recipes.iter().flat_map(ContainerRecipe::all_ports) {
        if !seen.insert(port.number) {
            return Err(Error::configuration(format!(
                "port {} (tag '{}') is declared more than once in one pod",
                port.number, port.tag
            )));
        }
    }
    Ok(())
}
