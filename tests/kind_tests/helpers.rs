//! Shared fixtures for kind tests

use kube_workflow::config::{Configuration, RunnerLocation, Timing};
use kube_workflow::workflow::WorkflowCreator;

/// Connect a creator with its own generated namespace
///
/// Tests run inside the cluster's network in CI, so pod IPs are reachable;
/// timeouts are generous because image pulls on fresh kind nodes are slow.
pub async fn test_creator() -> WorkflowCreator {
    let config = Configuration {
        namespace_prefix: "kw-it".to_string(),
        runner_location: Some(RunnerLocation::InternalToCluster),
        timing: Timing {
            operation_timeout_secs: 180,
            poll_interval_secs: 2,
        },
        ..Default::default()
    };
    WorkflowCreator::connect(config)
        .await
        .expect("failed to connect to cluster")
}
