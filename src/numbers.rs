//! Monotonic number sources for workflow and container identities

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Concurrency-safe, strictly increasing number generator
#[derive(Debug)]
pub struct NumberSource {
    next: AtomicU64,
}

impl NumberSource {
    /// Create a source whose first number is `base`
    pub fn new(base: u64) -> Self {
        Self {
            next: AtomicU64::new(base),
        }
    }

    /// Return the next number; never returns the same value twice
    pub fn next_number(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Numbering context of one workflow
///
/// The workflow number is private to the workflow. The container counter is
/// shared by every workflow of the same creator so container ordinals never
/// collide within that creator's scope.
#[derive(Debug, Clone)]
pub struct WorkflowNumberSource {
    workflow_number: u64,
    containers: Arc<NumberSource>,
}

impl WorkflowNumberSource {
    /// Create a numbering context for one workflow
    pub fn new(workflow_number: u64, containers: Arc<NumberSource>) -> Self {
        Self {
            workflow_number,
            containers,
        }
    }

    /// Number identifying the workflow (used in resource names)
    pub fn workflow_number(&self) -> u64 {
        self.workflow_number
    }

    /// Draw the next container ordinal from the shared counter
    pub fn next_container_number(&self) -> u64 {
        self.containers.next_number()
    }
}
