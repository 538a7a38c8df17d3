//! kube-workflow - ephemeral workload orchestration for distributed tests on Kubernetes
//!
//! A test harness describes the containers it needs as recipes, starts them
//! as one pod per workflow, and gets back handles carrying the pod identity
//! and the addresses of every declared port. Containers are watched for
//! crashes while they run, and everything is torn down by deleting the test
//! namespace.
//!
//! # Architecture
//!
//! - A [`workflow::WorkflowCreator`] owns the cluster connection and the
//!   state shared by all of its workflows (counters, known pods)
//! - Each [`workflow::StartupWorkflow`] starts `count` containers built by a
//!   [`recipe::ContainerRecipeFactory`] as a single deployment
//! - All waiting on the cluster goes through [`cluster::wait_until`], which
//!   always gives up after the configured timeout
//!
//! # Modules
//!
//! - [`numbers`] - Monotonic counters for workflow and container ordinals
//! - [`recipe`] - Container recipes, the recipe builder and factory trait
//! - [`recipes`] - Concrete workload types (generic image, Prometheus)
//! - [`workflow`] - Workflow creator, start/stop and log download
//! - [`cluster`] - Kubernetes client seam, manifests and bounded polling
//! - [`crash_watcher`] - Per-container crash detection by log following
//! - [`known_pods`] - Registry of pods already attributed to a workflow
//! - [`config`] - Creator configuration, loadable from YAML
//! - [`location`] - Pod placement
//! - [`runner_location`] - Detecting whether pod IPs are reachable
//! - [`retry`] - Bounded retry with backoff
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod cluster;
pub mod config;
pub mod crash_watcher;
pub mod error;
pub mod known_pods;
pub mod location;
pub mod numbers;
pub mod recipe;
pub mod recipes;
pub mod retry;
pub mod runner_location;
pub mod workflow;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Prefix of generated test namespaces (`{prefix}-{uuid}`)
pub const DEFAULT_NAMESPACE_PREFIX: &str = "kube-workflow";

/// First port number handed out to containers
///
/// Ports are allocated upwards from here; the range below 1024 is avoided
/// so images do not need privileges to bind.
pub const DEFAULT_PORT_BASE: u16 = 8080;
