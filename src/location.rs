//! Placement of a workflow's pod within the cluster

use std::collections::BTreeMap;

/// Node label used to pin a pod to one node
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// Where the pod of a workflow should be scheduled
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Location {
    /// Let the scheduler decide
    #[default]
    Unspecified,
    /// Pin to the node with the given hostname label
    Node(String),
}

impl Location {
    /// Node selector for the pod template, if any
    pub fn node_selector(&self) -> Option<BTreeMap<String, String>> {
        match self {
            Location::Unspecified => None,
            Location::Node(node) => Some(BTreeMap::from([(
                HOSTNAME_LABEL.to_string(),
                node.clone(),
            )])),
        }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Location::Unspecified => write!(f, "unspecified"),
            Location::Node(node) => write!(f, "node:{}", node),
        }
    }
}
