//! Integration tests against a real cluster
//!
//! These tests tell the story of how a distributed test harness uses
//! kube-workflow to bring containers up, talk to them and tear them down.
//!
//! # Test Organization
//!
//! - `workflow_lifecycle`: Stories about starting containers, reaching their
//!   ports, stopping them and cleaning up the namespace
//!
//! - `crash_detection`: Stories about crash watchers observing real
//!   container logs
//!
//! # Running These Tests
//!
//! ```bash
//! cargo test --test kind -- --ignored --nocapture
//! ```
//!
//! Every test creates its own namespace and deletes it at the end.

mod crash_detection;
mod helpers;
mod workflow_lifecycle;
