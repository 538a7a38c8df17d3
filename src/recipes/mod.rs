//! Concrete workload types
//!
//! Each type implements [`ContainerRecipeFactory`](crate::recipe::ContainerRecipeFactory)
//! and reads its settings from the [`StartupConfig`](crate::recipe::StartupConfig).

mod generic;
mod prometheus;

pub use generic::{GenericContainerConfig, GenericContainerRecipe};
pub use prometheus::{PrometheusConfig, PrometheusContainerRecipe, API_PORT_TAG, PROMETHEUS_IMAGE};
