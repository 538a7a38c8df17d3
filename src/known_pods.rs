//! Registry of pods already attributed to a workflow
//!
//! Several workflows can run against one namespace. After a deployment
//! converges, the pods that show up and are not yet in this registry belong
//! to the workflow that just converged.

use dashmap::DashSet;

/// Grow-only set of attributed pod names
#[derive(Debug, Default)]
pub struct KnownPods {
    pods: DashSet<String>,
}

impl KnownPods {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a pod for the caller
    ///
    /// Returns `true` if the pod was unknown and is now attributed to the
    /// caller, `false` if another workflow already claimed it. Check and
    /// insert are one atomic step, so the first writer wins.
    pub fn try_attribute(&self, pod_name: &str) -> bool {
        self.pods.insert(pod_name.to_string())
    }

    /// Whether the pod has been attributed to some workflow
    pub fn contains(&self, pod_name: &str) -> bool {
        self.pods.contains(pod_name)
    }

    /// Number of attributed pods
    pub fn len(&self) -> usize {
        self.pods.len()
    }

    /// True if no pod has been attributed yet
    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }
}
