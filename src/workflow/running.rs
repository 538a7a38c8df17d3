//! Handles to started containers

use std::collections::BTreeMap;

use crate::cluster::PodInfo;
use crate::config::RunnerLocation;
use crate::crash_watcher::CrashWatcher;
use crate::recipe::{ContainerRecipe, Port};
use crate::{Error, Result};

/// A host and port pair
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Address {
    /// Host name or IP
    pub host: String,
    /// Port number
    pub port: u16,
}

impl Address {
    /// Create an address
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `http://host:port`
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Where one container port can be reached
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerAddress {
    /// The declared port
    pub port: Port,
    /// Pod IP and container port, reachable from inside the cluster
    pub internal: Address,
    /// Cluster host and node port; only for exposed ports
    pub external: Option<Address>,
}

/// The service projecting a workflow's exposed ports
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceRef {
    /// Service name
    pub name: String,
    /// Node port per container port
    pub node_ports: BTreeMap<u16, u16>,
}

/// One container of a started workflow
#[derive(Debug)]
pub struct RunningContainer {
    pub(crate) recipe: ContainerRecipe,
    pub(crate) pod: PodInfo,
    pub(crate) addresses: Vec<ContainerAddress>,
    pub(crate) runner_location: RunnerLocation,
    pub(crate) crash_watcher: CrashWatcher,
}

impl RunningContainer {
    /// Container name within the pod
    pub fn name(&self) -> String {
        self.recipe.name()
    }

    /// The recipe the container was started from
    pub fn recipe(&self) -> &ContainerRecipe {
        &self.recipe
    }

    /// The pod the container runs in
    pub fn pod(&self) -> &PodInfo {
        &self.pod
    }

    /// Addresses of every declared port
    pub fn addresses(&self) -> &[ContainerAddress] {
        &self.addresses
    }

    /// Crash watcher started for this container
    pub fn crash_watcher(&self) -> &CrashWatcher {
        &self.crash_watcher
    }

    /// Where the runner was configured or detected to live
    pub fn runner_location(&self) -> RunnerLocation {
        self.runner_location
    }

    /// Address of the port tagged `tag`, as seen from where the runner lives
    ///
    /// A runner outside the cluster can only reach exposed ports.
    pub fn address(&self, tag: &str) -> Result<Address> {
        let port = self.recipe.port_by_tag(tag)?;
        let address = self
            .addresses
            .iter()
            .find(|a| a.port == *port)
            .ok_or_else(|| {
                Error::configuration(format!("no address for port tagged '{}'", tag))
            })?;

        match self.runner_location {
            RunnerLocation::InternalToCluster => Ok(address.internal.clone()),
            RunnerLocation::ExternalToCluster => address.external.clone().ok_or_else(|| {
                Error::configuration(format!(
                    "port tagged '{}' of {} is not exposed outside the cluster",
                    tag,
                    self.name()
                ))
            }),
        }
    }
}

impl std::fmt::Display for RunningContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}) on {}", self.name(), self.recipe.app_name(), self.pod.name)
    }
}

/// Result of one `start` call: a single pod hosting every container
#[derive(Debug)]
pub struct RunningContainers {
    pub(crate) workflow_number: u64,
    pub(crate) namespace: String,
    pub(crate) deployment: String,
    pub(crate) service: Option<ServiceRef>,
    pub(crate) pod: PodInfo,
    pub(crate) containers: Vec<RunningContainer>,
}

impl RunningContainers {
    /// Number of the workflow that started the containers
    pub fn workflow_number(&self) -> u64 {
        self.workflow_number
    }

    /// Namespace of the pod
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Name of the deployment
    pub fn deployment_name(&self) -> &str {
        &self.deployment
    }

    /// The NodePort service, if any port was exposed
    pub fn service(&self) -> Option<&ServiceRef> {
        self.service.as_ref()
    }

    /// The pod hosting the containers
    pub fn pod(&self) -> &PodInfo {
        &self.pod
    }

    /// The containers, in start order
    pub fn containers(&self) -> &[RunningContainer] {
        &self.containers
    }

    /// Containers whose watcher observed a crash
    pub fn crashed(&self) -> impl Iterator<Item = &RunningContainer> {
        self.containers
            .iter()
            .filter(|c| c.crash_watcher.has_crashed())
    }
}

impl std::fmt::Display for RunningContainers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = self
            .containers
            .iter()
            .map(|c| c.name())
            .collect::<Vec<_>>()
            .join(",");
        write!(
            f,
            "[{}] {} in pod {} on {}",
            self.deployment, names, self.pod.name, self.pod.node_name
        )
    }
}
