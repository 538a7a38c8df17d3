//! Integration tests for crash detection
//!
//! These tests tell the story of crash watchers following real container
//! logs while pods come and go.

use std::time::Duration;

use kube_workflow::crash_watcher::{CrashReason, WatcherState};
use kube_workflow::location::Location;
use kube_workflow::recipe::StartupConfig;
use kube_workflow::recipes::GenericContainerRecipe;

use super::helpers::test_creator;

/// Story: Stopping a workflow is not reported as a crash, a vanished container is
///
/// The watchers a workflow starts are stopped before its deployment is
/// deleted. An extra watcher the test started itself is still watching when
/// the container goes away, and reports it.
///
/// Expected behavior:
/// - The extra watcher ends up `Crashed` with the log stream ended
/// - The extra watcher was watching until then
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_vanished_container_is_reported_by_a_running_watcher() {
    let creator = test_creator().await;
    let workflow = creator.create_workflow();

    let running = workflow
        .start(
            1,
            &Location::Unspecified,
            &GenericContainerRecipe::new("web", "nginx:1.27-alpine"),
            &StartupConfig::new(),
        )
        .await
        .expect("failed to start containers");

    let mut extra = workflow.create_crash_watcher(&running.containers()[0]);
    extra.start().await.expect("failed to start watcher");
    assert_eq!(extra.state(), WatcherState::Watching);

    workflow.stop(running, true).await.expect("failed to stop");

    let state = tokio::time::timeout(Duration::from_secs(60), extra.wait_for_terminal())
        .await
        .expect("watcher did not notice the container going away");
    match state {
        WatcherState::Crashed(report) => {
            assert!(matches!(
                report.reason,
                CrashReason::StreamEnded | CrashReason::StreamFailed(_)
            ));
        }
        other => panic!("expected crash, got {:?}", other),
    }

    extra.stop().await;
    workflow
        .delete_all_resources()
        .await
        .expect("failed to delete namespace");
}
