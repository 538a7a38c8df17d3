//! Container recipes
//!
//! A [`ContainerRecipe`] is the immutable description of one container:
//! image, ports, environment and pod metadata. Recipes are produced by a
//! [`ContainerRecipeFactory`] through [`create_recipe`]; nothing can change
//! them afterwards.

mod factory;
mod startup_config;

pub use factory::{create_recipe, ContainerRecipeFactory, RecipeBuilder, RecipeComponentFactory};
pub use startup_config::StartupConfig;

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::{Error, Result};

/// A container port with an opaque role tag ("api", "metrics", ...)
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Port {
    /// Port number inside the pod
    pub number: u16,
    /// Role label; may be empty for anonymous ports
    pub tag: String,
}

impl Port {
    /// Create a port
    pub fn new(number: u16, tag: impl Into<String>) -> Self {
        Self {
            number,
            tag: tag.into(),
        }
    }

    /// Name used for the container port and service port objects
    ///
    /// Kubernetes limits port names to 15 characters, so tags cannot be used.
    pub fn k8s_name(&self) -> String {
        format!("p{}", self.number)
    }
}

/// An environment variable of a container
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvVar {
    /// Variable name
    pub name: String,
    /// Variable value
    pub value: String,
}

impl EnvVar {
    /// Create an environment variable
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Opaque objects a recipe hands to sibling components
///
/// They travel with the recipe but are never part of the submitted
/// deployment. Lookup is by type.
#[derive(Clone, Default)]
pub struct Additionals {
    items: Vec<Arc<dyn Any + Send + Sync>>,
}

impl Additionals {
    pub(crate) fn new(items: Vec<Arc<dyn Any + Send + Sync>>) -> Self {
        Self { items }
    }

    /// First additional of type `T`, if any
    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.items
            .iter()
            .find_map(|item| item.as_ref().downcast_ref::<T>())
    }

    /// Number of additionals
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True if the recipe declared no additionals
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl std::fmt::Debug for Additionals {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Additionals({} items)", self.items.len())
    }
}

/// Immutable description of one container
#[derive(Clone, Debug)]
pub struct ContainerRecipe {
    number: u64,
    index: usize,
    app_name: String,
    image: String,
    exposed_ports: Vec<Port>,
    internal_ports: Vec<Port>,
    env_vars: Vec<EnvVar>,
    pod_annotations: BTreeMap<String, String>,
    pod_labels: BTreeMap<String, String>,
    additionals: Additionals,
}

impl ContainerRecipe {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        number: u64,
        index: usize,
        app_name: String,
        image: String,
        exposed_ports: Vec<Port>,
        internal_ports: Vec<Port>,
        env_vars: Vec<EnvVar>,
        pod_annotations: BTreeMap<String, String>,
        pod_labels: BTreeMap<String, String>,
        additionals: Additionals,
    ) -> Self {
        Self {
            number,
            index,
            app_name,
            image,
            exposed_ports,
            internal_ports,
            env_vars,
            pod_annotations,
            pod_labels,
            additionals,
        }
    }

    /// Container name within the pod
    pub fn name(&self) -> String {
        format!("ctnr{}", self.number)
    }

    /// Container ordinal, unique within a workflow creator
    pub fn number(&self) -> u64 {
        self.number
    }

    /// Position of this container within its start call
    pub fn index(&self) -> usize {
        self.index
    }

    /// Application name of the workload type
    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Image reference
    pub fn image(&self) -> &str {
        &self.image
    }

    /// Ports projected through the workflow's service
    pub fn exposed_ports(&self) -> &[Port] {
        &self.exposed_ports
    }

    /// Pod-local ports
    pub fn internal_ports(&self) -> &[Port] {
        &self.internal_ports
    }

    /// Environment variables
    pub fn env_vars(&self) -> &[EnvVar] {
        &self.env_vars
    }

    /// Annotations for the pod template
    pub fn pod_annotations(&self) -> &BTreeMap<String, String> {
        &self.pod_annotations
    }

    /// Extra labels for the pod template
    pub fn pod_labels(&self) -> &BTreeMap<String, String> {
        &self.pod_labels
    }

    /// Side-channel objects declared during the build
    pub fn additionals(&self) -> &Additionals {
        &self.additionals
    }

    /// All ports, exposed first
    pub fn all_ports(&self) -> impl Iterator<Item = &Port> {
        self.exposed_ports.iter().chain(self.internal_ports.iter())
    }

    /// The single port carrying `tag`
    ///
    /// Fails if no port, or more than one port, carries the tag.
    pub fn port_by_tag(&self, tag: &str) -> Result<&Port> {
        let mut matches = self.all_ports().filter(|p| p.tag == tag);
        match (matches.next(), matches.next()) {
            (Some(port), None) => Ok(port),
            (None, _) => Err(Error::configuration(format!(
                "recipe {} has no port tagged '{}'",
                self.name(),
                tag
            ))),
            (Some(_), Some(_)) => Err(Error::configuration(format!(
                "recipe {} has more than one port tagged '{}'",
                self.name(),
                tag
            ))),
        }
    }
}

impl std::fmt::Display for ContainerRecipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let join_ports = |ports: &[Port]| {
            ports
                .iter()
                .map(|p| p.number.to_string())
                .collect::<Vec<_>>()
                .join(",")
        };
        let env = self
            .env_vars
            .iter()
            .map(|v| format!("{}:{}", v.name, v.value))
            .collect::<Vec<_>>()
            .join(",");
        write!(
            f,
            "(container-recipe: {}, image: {}, exposedPorts: {}, internalPorts: {}, envVars: {})",
            self.name(),
            self.image,
            join_ports(&self.exposed_ports),
            join_ports(&self.internal_ports),
            env
        )
    }
}
