//! Metrics collector scraping other running containers

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;

use crate::recipe::{ContainerRecipeFactory, RecipeBuilder, StartupConfig};
use crate::workflow::{Address, RunningContainer};
use crate::{Error, Result};

/// Image that reads its configuration from the `PROM_CONFIG` variable
pub const PROMETHEUS_IMAGE: &str = "codexstorage/dist-tests-prometheus:latest";

/// Port tag of the Prometheus HTTP API
pub const API_PORT_TAG: &str = "prometheus-api";

const DEFAULT_SCRAPE_INTERVAL_SECS: u64 = 10;

/// What the collector scrapes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrometheusConfig {
    /// Metrics endpoints, reachable from inside the cluster
    pub scrape_targets: Vec<Address>,
    /// Scrape interval
    pub scrape_interval_secs: u64,
}

impl PrometheusConfig {
    /// Scrape `targets` at the default interval
    pub fn new(scrape_targets: Vec<Address>) -> Self {
        Self {
            scrape_targets,
            scrape_interval_secs: DEFAULT_SCRAPE_INTERVAL_SECS,
        }
    }

    /// Scrape the port tagged `tag` of every container
    ///
    /// Uses pod-internal addresses: the collector runs inside the cluster.
    pub fn for_containers<'a>(
        containers: impl IntoIterator<Item = &'a RunningContainer>,
        tag: &str,
    ) -> Result<Self> {
        let targets = containers
            .into_iter()
            .map(|container| {
                let port = container.recipe().port_by_tag(tag)?;
                container
                    .addresses()
                    .iter()
                    .find(|a| a.port == *port)
                    .map(|a| a.internal.clone())
                    .ok_or_else(|| {
                        Error::configuration(format!(
                            "{} has no address for port tagged '{}'",
                            container.name(),
                            tag
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(targets))
    }

    /// Prometheus configuration file content
    pub fn render(&self) -> Result<String> {
        let file = PromFile {
            global: PromGlobal {
                scrape_interval: format!("{}s", self.scrape_interval_secs),
                scrape_timeout: format!("{}s", self.scrape_interval_secs),
            },
            scrape_configs: vec![PromScrapeConfig {
                job_name: "services".to_string(),
                metrics_path: "/metrics".to_string(),
                static_configs: vec![PromStaticConfig {
                    targets: self.scrape_targets.iter().map(Address::to_string).collect(),
                }],
            }],
        };
        serde_yaml::to_string(&file)
            .map_err(|e| Error::serialization(format!("failed to render prometheus config: {}", e)))
    }
}

#[derive(Serialize)]
struct PromFile {
    global: PromGlobal,
    scrape_configs: Vec<PromScrapeConfig>,
}

#[derive(Serialize)]
struct PromGlobal {
    scrape_interval: String,
    scrape_timeout: String,
}

#[derive(Serialize)]
struct PromScrapeConfig {
    job_name: String,
    metrics_path: String,
    static_configs: Vec<PromStaticConfig>,
}

#[derive(Serialize)]
struct PromStaticConfig {
    targets: Vec<String>,
}

/// Prometheus collecting the metrics of other containers
#[derive(Clone, Debug, Default)]
pub struct PrometheusContainerRecipe;

impl ContainerRecipeFactory for PrometheusContainerRecipe {
    fn app_name(&self) -> &str {
        "prometheus"
    }

    fn image(&self) -> &str {
        PROMETHEUS_IMAGE
    }

    fn initialize(&self, builder: &mut RecipeBuilder, config: &StartupConfig) -> Result<()> {
        let prometheus = config.get::<PrometheusConfig>()?;

        builder.add_exposed_port(API_PORT_TAG)?;
        builder.add_env_var("PROM_CONFIG", BASE64.encode(prometheus.render()?));
        // The collector must not scrape itself
        builder.add_pod_annotation("prometheus.io/scrape", "false");
        Ok(())
    }
}
