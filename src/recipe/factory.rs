//! Recipe building: port/env allocation and the recipe factory trait

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::trace;

use super::{Additionals, ContainerRecipe, EnvVar, Port, StartupConfig};
use crate::numbers::NumberSource;
use crate::{Error, Result};

// =============================================================================
// Component allocation
// =============================================================================

enum PortScheme {
    /// Draw from a counter shared by the whole creator
    Shared(Arc<NumberSource>),
    /// Hand out ports from a fixed block owned by one container
    Offset { first: u32, capacity: u16, used: u16 },
}

/// Allocates ports and environment variables for one recipe build
///
/// Containers of one workflow share a pod and therefore a network
/// namespace, so every allocated port must be unique among them.
pub struct RecipeComponentFactory {
    ports: PortScheme,
}

impl RecipeComponentFactory {
    /// Ports come from a counter shared across the creator's lifetime
    pub fn cluster_unique(ports: Arc<NumberSource>) -> Self {
        Self {
            ports: PortScheme::Shared(ports),
        }
    }

    /// Ports come from the block `base + container_number * ports_per_container`
    pub fn per_container_offset(base: u16, ports_per_container: u16, container_number: u64) -> Self {
        let first = u64::from(base) + container_number * u64::from(ports_per_container);
        Self {
            ports: PortScheme::Offset {
                first: u32::try_from(first).unwrap_or(u32::MAX),
                capacity: ports_per_container,
                used: 0,
            },
        }
    }

    /// Allocate the next port number for `tag`
    pub fn create_port(&mut self, tag: impl Into<String>) -> Result<Port> {
        let number = match &mut self.ports {
            PortScheme::Shared(source) => {
                let next = source.next_number();
                u16::try_from(next).map_err(|_| {
                    Error::configuration(format!("port numbers exhausted (next would be {})", next))
                })?
            }
            PortScheme::Offset {
                first,
                capacity,
                used,
            } => {
                if *used >= *capacity {
                    return Err(Error::configuration(format!(
                        "container already allocated all {} ports of its block",
                        capacity
                    )));
                }
                let next = first.saturating_add(u32::from(*used));
                let number = u16::try_from(next).map_err(|_| {
                    Error::configuration(format!("port {} is out of range", next))
                })?;
                *used += 1;
                number
            }
        };
        Ok(Port::new(number, tag))
    }

    /// A port with a caller-chosen number
    pub fn create_port_with_number(&self, number: u16, tag: impl Into<String>) -> Port {
        Port::new(number, tag)
    }

    /// An environment variable with a literal value
    pub fn create_env_var(&self, name: impl Into<String>, value: impl Into<String>) -> EnvVar {
        EnvVar::new(name, value)
    }

    /// An environment variable holding a port number
    pub fn create_port_env_var(&self, name: impl Into<String>, port: &Port) -> EnvVar {
        EnvVar::new(name, port.number.to_string())
    }
}

// =============================================================================
// Recipe builder
// =============================================================================

/// Accumulates the declarations of one recipe build
///
/// A fresh builder is created for every build and consumed when the recipe
/// is produced, so nothing declared here can leak into another recipe.
pub struct RecipeBuilder {
    container_number: u64,
    index: usize,
    components: RecipeComponentFactory,
    exposed_ports: Vec<Port>,
    internal_ports: Vec<Port>,
    env_vars: Vec<EnvVar>,
    pod_annotations: BTreeMap<String, String>,
    pod_labels: BTreeMap<String, String>,
    additionals: Vec<Arc<dyn Any + Send + Sync>>,
}

impl RecipeBuilder {
    fn new(container_number: u64, index: usize, components: RecipeComponentFactory) -> Self {
        Self {
            container_number,
            index,
            components,
            exposed_ports: Vec::new(),
            internal_ports: Vec::new(),
            env_vars: Vec::new(),
            pod_annotations: BTreeMap::new(),
            pod_labels: BTreeMap::new(),
            additionals: Vec::new(),
        }
    }

    /// Ordinal of the container being built
    pub fn container_number(&self) -> u64 {
        self.container_number
    }

    /// Position of the container within its start call
    pub fn index(&self) -> usize {
        self.index
    }

    /// Declare a port reachable from outside the pod
    pub fn add_exposed_port(&mut self, tag: impl Into<String>) -> Result<Port> {
        let port = self.components.create_port(tag)?;
        self.exposed_ports.push(port.clone());
        Ok(port)
    }

    /// Declare an exposed port with a fixed number
    pub fn add_exposed_port_with_number(&mut self, number: u16, tag: impl Into<String>) -> Port {
        let port = self.components.create_port_with_number(number, tag);
        self.exposed_ports.push(port.clone());
        port
    }

    /// Declare a pod-local port
    pub fn add_internal_port(&mut self, tag: impl Into<String>) -> Result<Port> {
        let port = self.components.create_port(tag)?;
        self.internal_ports.push(port.clone());
        Ok(port)
    }

    /// Declare an exposed port and tell the workload its number via `name`
    pub fn add_exposed_port_and_var(
        &mut self,
        name: impl Into<String>,
        tag: impl Into<String>,
    ) -> Result<Port> {
        let port = self.add_exposed_port(tag)?;
        self.add_port_env_var(name, &port);
        Ok(port)
    }

    /// Declare an internal port and tell the workload its number via `name`
    pub fn add_internal_port_and_var(
        &mut self,
        name: impl Into<String>,
        tag: impl Into<String>,
    ) -> Result<Port> {
        let port = self.add_internal_port(tag)?;
        self.add_port_env_var(name, &port);
        Ok(port)
    }

    /// Add an environment variable
    pub fn add_env_var(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let var = self.components.create_env_var(name, value);
        self.env_vars.push(var);
    }

    /// Add an environment variable holding a port number
    pub fn add_port_env_var(&mut self, name: impl Into<String>, port: &Port) {
        let var = self.components.create_port_env_var(name, port);
        self.env_vars.push(var);
    }

    /// Add an annotation to the pod template
    pub fn add_pod_annotation(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.pod_annotations.insert(key.into(), value.into());
    }

    /// Add a label to the pod template
    pub fn add_pod_label(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.pod_labels.insert(key.into(), value.into());
    }

    /// Attach an opaque object for sibling components
    pub fn additional<T: Any + Send + Sync>(&mut self, value: T) {
        self.additionals.push(Arc::new(value));
    }

    fn build(self, app_name: String, image: String) -> ContainerRecipe {
        ContainerRecipe::new(
            self.container_number,
            self.index,
            app_name,
            image,
            self.exposed_ports,
            self.internal_ports,
            self.env_vars,
            self.pod_annotations,
            self.pod_labels,
            Additionals::new(self.additionals),
        )
    }
}

// =============================================================================
// Recipe factory
// =============================================================================

/// One implementation per workload type
///
/// Implementations declare their container inside [`initialize`], which is
/// called exactly once per build. They hold no per-build state.
///
/// [`initialize`]: ContainerRecipeFactory::initialize
pub trait ContainerRecipeFactory: Send + Sync {
    /// Application name of the workload type
    fn app_name(&self) -> &str;

    /// Image reference to run
    fn image(&self) -> &str;

    /// Declare ports, env vars, annotations and additionals for one container
    fn initialize(&self, builder: &mut RecipeBuilder, config: &StartupConfig) -> Result<()>;
}

/// Build one immutable recipe
///
/// `container_number` and `index` come from the caller so names are
/// reproducible.
pub fn create_recipe(
    factory: &dyn ContainerRecipeFactory,
    container_number: u64,
    index: usize,
    components: RecipeComponentFactory,
    config: &StartupConfig,
) -> Result<ContainerRecipe> {
    let mut builder = RecipeBuilder::new(container_number, index, components);
    factory.initialize(&mut builder, config)?;

    let app_name = config
        .name_override()
        .unwrap_or_else(|| factory.app_name())
        .to_string();
    let recipe = builder.build(app_name, factory.image().to_string());
    trace!(recipe = %recipe, "built container recipe");
    Ok(recipe)
}
