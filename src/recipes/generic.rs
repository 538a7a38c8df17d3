//! Arbitrary images described entirely by configuration

use std::collections::BTreeMap;

use crate::recipe::{ContainerRecipeFactory, EnvVar, RecipeBuilder, StartupConfig};
use crate::Result;

/// Ports, environment and annotations of a [`GenericContainerRecipe`]
///
/// Every port tag gets an environment variable `{TAG}_PORT` holding the
/// allocated number, so the workload can bind to it.
#[derive(Clone, Debug, Default)]
pub struct GenericContainerConfig {
    /// Tags of ports reachable through the service
    pub exposed_ports: Vec<String>,
    /// Tags of pod-local ports
    pub internal_ports: Vec<String>,
    /// Literal environment variables
    pub env: Vec<EnvVar>,
    /// Pod annotations
    pub annotations: BTreeMap<String, String>,
}

/// Runs any image; the layout comes from a [`GenericContainerConfig`]
#[derive(Clone, Debug)]
pub struct GenericContainerRecipe {
    app_name: String,
    image: String,
}

impl GenericContainerRecipe {
    /// Create a recipe for `image`
    pub fn new(app_name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            image: image.into(),
        }
    }
}

/// `api` becomes `API_PORT`, `p2p-listen` becomes `P2P_LISTEN_PORT`
pub(crate) fn port_env_name(tag: &str) -> String {
    format!("{}_PORT", tag.to_uppercase().replace('-', "_"))
}

impl ContainerRecipeFactory for GenericContainerRecipe {
    fn app_name(&self) -> &str {
        &self.app_name
    }

    fn image(&self) -> &str {
        &self.image
    }

    fn initialize(&self, builder: &mut RecipeBuilder, config: &StartupConfig) -> Result<()> {
        let layout = config.try_get::<GenericContainerConfig>().cloned().unwrap_or_default();

        for tag in &layout.exposed_ports {
            builder.add_exposed_port_and_var(port_env_name(tag), tag.as_str())?;
        }
        for tag in &layout.internal_ports {
            builder.add_internal_port_and_var(port_env_name(tag), tag.as_str())?;
        }
        for var in layout.env {
            builder.add_env_var(var.name, var.value);
        }
        for (key, value) in layout.annotations {
            builder.add_pod_annotation(key, value);
        }
        Ok(())
    }
}
