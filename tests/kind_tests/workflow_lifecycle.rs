//! Integration tests for the workflow lifecycle
//!
//! These tests tell the story of a test harness that starts a group of
//! containers, inspects where they run, and tears everything down again.

use std::time::Duration;

use kube_workflow::location::Location;
use kube_workflow::recipe::StartupConfig;
use kube_workflow::recipes::{GenericContainerConfig, GenericContainerRecipe};

use super::helpers::test_creator;

const NGINX_IMAGE: &str = "nginx:1.27-alpine";
/// Binds no ports, so any number of copies fit in one pod
const PAUSE_IMAGE: &str = "registry.k8s.io/pause:3.10";

fn web_layout() -> StartupConfig {
    StartupConfig::new().with(GenericContainerConfig {
        exposed_ports: vec!["api".to_string()],
        internal_ports: vec!["metrics".to_string()],
        ..Default::default()
    })
}

// =============================================================================
// Start and Stop Stories
// =============================================================================

/// Story: A test starts three nodes and gets one handle per container
///
/// All containers of one start call share a pod, so they share its identity
/// and its network namespace. The pause image listens on nothing, so three
/// copies never fight over a port.
///
/// Expected behavior:
/// - Three containers come back, all attributed to the same running pod
/// - Every declared port has a pod-internal address
/// - Every crash watcher is watching
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_test_starts_three_containers_in_one_pod() {
    let creator = test_creator().await;
    let workflow = creator.create_workflow();

    let running = workflow
        .start(
            3,
            &Location::Unspecified,
            &GenericContainerRecipe::new("idle", PAUSE_IMAGE),
            &web_layout(),
        )
        .await
        .expect("failed to start containers");

    assert_eq!(running.containers().len(), 3);
    assert!(!running.pod().ip.is_empty());
    for container in running.containers() {
        assert_eq!(container.pod(), running.pod());
        let api = container.address("api").expect("api address");
        assert_eq!(api.host, running.pod().ip);
        assert!(!container.crash_watcher().has_crashed());
    }

    workflow
        .stop(running, true)
        .await
        .expect("failed to stop containers");
    workflow
        .delete_all_resources()
        .await
        .expect("failed to delete namespace");
}

/// Story: Two workflows of one creator run side by side
///
/// A harness often starts a bootstrap node first and then the rest of the
/// network. Both workflows share the namespace but never each other's pods.
///
/// Expected behavior:
/// - Each workflow gets its own deployment and pod
/// - Container names never collide
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_concurrent_workflows_do_not_share_pods() {
    let creator = test_creator().await;
    let first = creator.create_workflow();
    let second = creator.create_workflow();
    let recipe = GenericContainerRecipe::new("idle", PAUSE_IMAGE);
    let layout = web_layout();

    let (a, b) = tokio::join!(
        first.start(1, &Location::Unspecified, &recipe, &layout),
        second.start(2, &Location::Unspecified, &recipe, &layout),
    );
    let a = a.expect("first workflow failed");
    let b = b.expect("second workflow failed");

    assert_ne!(a.deployment_name(), b.deployment_name());
    assert_ne!(a.pod().name, b.pod().name);
    assert!(b
        .containers()
        .iter()
        .all(|c| c.name() != a.containers()[0].name()));

    first.stop(a, false).await.expect("failed to stop first");
    second.stop(b, false).await.expect("failed to stop second");
    first
        .delete_all_resources()
        .await
        .expect("failed to delete namespace");
}

/// Story: A test downloads the log of a container after it ran
///
/// Expected behavior:
/// - The handler receives the lines nginx printed on startup
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_test_downloads_container_log() {
    let creator = test_creator().await;
    let workflow = creator.create_workflow();

    let running = workflow
        .start(
            1,
            &Location::Unspecified,
            &GenericContainerRecipe::new("web", NGINX_IMAGE),
            &web_layout(),
        )
        .await
        .expect("failed to start containers");

    // nginx logs its startup banner right after the container starts
    tokio::time::sleep(Duration::from_secs(2)).await;

    let mut lines = Vec::new();
    workflow
        .download_container_log(
            &running.containers()[0],
            &mut |line: &str| lines.push(line.to_string()),
            None,
        )
        .await
        .expect("failed to download log");
    assert!(!lines.is_empty(), "nginx should have logged its startup");

    workflow.stop(running, true).await.expect("failed to stop");
    workflow
        .delete_all_resources()
        .await
        .expect("failed to delete namespace");
}
