//! Error types for workload orchestration

use std::time::Duration;

use thiserror::Error;

/// Main error type for orchestration operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Programming or setup mistake (missing config bundle, unknown port tag, ...)
    ///
    /// Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The remote platform did not converge in time
    #[error("operation timed out after {timeout:?}: {operation}")]
    Timeout {
        /// What was being waited for
        operation: String,
        /// The timeout that elapsed
        timeout: Duration,
    },

    /// Log retrieval failed after exhausting retries
    #[error("log download failed for {pod}/{container}: {message}")]
    LogDownload {
        /// Pod the log was requested from
        pod: String,
        /// Container within the pod
        container: String,
        /// Last transport error
        message: String,
    },

    /// The cluster reported a state the workflow cannot continue from
    #[error("cluster error: {0}")]
    Cluster(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Local I/O error (reading configuration files)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a timeout error for the named operation
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// Create a log download error
    pub fn log_download(
        pod: impl Into<String>,
        container: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::LogDownload {
            pod: pod.into(),
            container: container.into(),
            message: msg.into(),
        }
    }

    /// Create a cluster error with the given message
    pub fn cluster(msg: impl Into<String>) -> Self {
        Self::Cluster(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// True for errors caused by a transient transport problem
    ///
    /// Only log downloads act on this; everything else fails the operation.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(resp)) => resp.code >= 500 || resp.code == 429,
            // Decoding the same bytes again fails the same way
            Error::Kube(
                kube::Error::FromUtf8(_)
                | kube::Error::SerdeError(_)
                | kube::Error::BuildRequest(_),
            ) => false,
            Error::Kube(_) => true,
            Error::Io(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: A recipe asks for a config bundle that was never supplied
    ///
    /// This is a programming error in the calling test; the message must name
    /// what was missing so it can be fixed without a debugger.
    #[test]
    fn story_configuration_errors_name_the_missing_piece() {
        let err = Error::configuration("startup config has no value of type GethConfig");
        assert!(err.to_string().contains("configuration error"));
        assert!(err.to_string().contains("GethConfig"));

        match Error::configuration("any") {
            Error::Configuration(msg) => assert_eq!(msg, "any"),
            _ => panic!("Expected Configuration variant"),
        }
    }

    /// Story: A deployment never becomes available
    ///
    /// The timeout error says what was awaited and for how long.
    #[test]
    fn story_timeouts_describe_the_operation() {
        let err = Error::timeout(
            "deployment deploy-3 to become available",
            Duration::from_secs(60),
        );
        let msg = err.to_string();
        assert!(msg.contains("operation timed out"));
        assert!(msg.contains("deploy-3"));
        assert!(msg.contains("60s"));
    }

    /// Story: Log download gives up after repeated transport failures
    #[test]
    fn story_log_download_errors_identify_container() {
        let err = Error::log_download("deploy-1-abc", "ctnr4", "connection reset");
        let msg = err.to_string();
        assert!(msg.contains("deploy-1-abc/ctnr4"));
        assert!(msg.contains("connection reset"));
    }

    /// Story: Only transport-level failures count as transient
    ///
    /// Retrying a configuration mistake or a timeout would hide a broken
    /// test setup, so those are never transient.
    #[test]
    fn story_transient_classification() {
        assert!(Error::Io(std::io::Error::other("reset")).is_transient());
        assert!(!Error::configuration("bad tag").is_transient());
        assert!(!Error::timeout("x", Duration::from_secs(1)).is_transient());
        assert!(!Error::cluster("no pod").is_transient());

        let not_found = Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "pods \"x\" not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        }));
        assert!(!not_found.is_transient());

        let unavailable = Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "etcd leader changed".to_string(),
            reason: "ServiceUnavailable".to_string(),
            code: 503,
        }));
        assert!(unavailable.is_transient());

        let undecodable = String::from_utf8(vec![b'o', b'k', 0xff]).unwrap_err();
        assert!(!Error::Kube(kube::Error::FromUtf8(undecodable)).is_transient());
    }

    /// Story: Error helper functions accept both String and &str
    #[test]
    fn story_error_construction_ergonomics() {
        let name = "service-7";
        let err = Error::cluster(format!("service {} has no ports", name));
        assert!(err.to_string().contains("service-7"));

        let err = Error::serialization("invalid YAML");
        assert!(err.to_string().contains("serialization error"));
    }
}
