//! Per-container crash detection by following the container log
//!
//! A [`CrashWatcher`] runs a background task that follows one container's
//! log. The watcher state lives in a [`tokio::sync::watch`] channel and every
//! transition is made inside `send_if_modified`, so "is the watcher still
//! watching?" and "record the crash" happen under the same lock. Once
//! [`CrashWatcher::stop`] has stored `Stopped`, no later line can turn the
//! watcher into `Crashed`.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::cluster::{ClusterOperations, LogStream};
use crate::{Error, Result};

/// Why a container is considered crashed
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CrashReason {
    /// A log line contained a crash signature
    Signature {
        /// The signature that matched
        signature: String,
        /// The offending line
        line: String,
    },
    /// The followed log ended, i.e. the container process exited
    StreamEnded,
    /// The followed log failed
    StreamFailed(String),
}

impl std::fmt::Display for CrashReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CrashReason::Signature { signature, line } => {
                write!(f, "log matched '{}': {}", signature, line)
            }
            CrashReason::StreamEnded => write!(f, "log stream ended"),
            CrashReason::StreamFailed(e) => write!(f, "log stream failed: {}", e),
        }
    }
}

/// A detected crash
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CrashReport {
    /// Pod of the crashed container
    pub pod: String,
    /// Crashed container
    pub container: String,
    /// What was observed
    pub reason: CrashReason,
}

/// Lifecycle of a watcher; `Stopped` and `Crashed` are terminal
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatcherState {
    /// Created, not started
    Idle,
    /// Following the log
    Watching,
    /// Stopped by the owner
    Stopped,
    /// A crash was observed while watching
    Crashed(CrashReport),
}

impl WatcherState {
    /// True for `Stopped` and `Crashed`
    pub fn is_terminal(&self) -> bool {
        matches!(self, WatcherState::Stopped | WatcherState::Crashed(_))
    }
}

/// Background health monitor for one container
pub struct CrashWatcher {
    ops: ClusterOperations,
    pod: String,
    container: String,
    signatures: Arc<Vec<String>>,
    state: Arc<watch::Sender<WatcherState>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl CrashWatcher {
    /// Create an idle watcher for `container` in `pod`
    pub fn new(
        ops: ClusterOperations,
        pod: impl Into<String>,
        container: impl Into<String>,
        signatures: Vec<String>,
    ) -> Self {
        let (state, _) = watch::channel(WatcherState::Idle);
        Self {
            ops,
            pod: pod.into(),
            container: container.into(),
            signatures: Arc::new(signatures),
            state: Arc::new(state),
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// Start following the container log
    ///
    /// Fails if the watcher was started before or the log cannot be opened.
    pub async fn start(&mut self) -> Result<()> {
        if *self.state.borrow() != WatcherState::Idle {
            return Err(Error::configuration(format!(
                "crash watcher for {}/{} was already started",
                self.pod, self.container
            )));
        }

        let stream = self.ops.follow_log(&self.pod, &self.container).await?;

        let started = self.state.send_if_modified(|state| {
            if *state == WatcherState::Idle {
                *state = WatcherState::Watching;
                true
            } else {
                false
            }
        });
        if !started {
            return Ok(());
        }

        debug!(pod = %self.pod, container = %self.container, "crash watcher started");
        self.task = Some(tokio::spawn(watch_log(
            stream,
            self.signatures.clone(),
            self.state.clone(),
            self.cancel.clone(),
            self.pod.clone(),
            self.container.clone(),
        )));
        Ok(())
    }

    /// Stop watching and wait for the background task to finish
    ///
    /// A crash observed before the stop is kept; anything after is ignored.
    pub async fn stop(&mut self) {
        self.state.send_if_modified(|state| match state {
            WatcherState::Idle | WatcherState::Watching => {
                *state = WatcherState::Stopped;
                true
            }
            _ => false,
        });
        self.cancel.cancel();

        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(pod = %self.pod, container = %self.container, error = %e, "crash watcher task failed");
            }
        }
        debug!(pod = %self.pod, container = %self.container, "crash watcher stopped");
    }

    /// Current state
    pub fn state(&self) -> WatcherState {
        self.state.borrow().clone()
    }

    /// True if a crash was observed
    pub fn has_crashed(&self) -> bool {
        matches!(*self.state.borrow(), WatcherState::Crashed(_))
    }

    /// The crash report, if a crash was observed
    pub fn crash_report(&self) -> Option<CrashReport> {
        match &*self.state.borrow() {
            WatcherState::Crashed(report) => Some(report.clone()),
            _ => None,
        }
    }

    /// Resolve once the watcher reaches a terminal state
    ///
    /// Never resolves for a watcher that is never started or stopped.
    pub async fn wait_for_terminal(&self) -> WatcherState {
        let mut rx = self.state.subscribe();
        let state = match rx.wait_for(WatcherState::is_terminal).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        };
        state
    }

    /// Pod being watched
    pub fn pod(&self) -> &str {
        &self.pod
    }

    /// Container being watched
    pub fn container(&self) -> &str {
        &self.container
    }
}

impl Drop for CrashWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for CrashWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrashWatcher")
            .field("pod", &self.pod)
            .field("container", &self.container)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

async fn watch_log(
    mut stream: LogStream,
    signatures: Arc<Vec<String>>,
    state: Arc<watch::Sender<WatcherState>>,
    cancel: CancellationToken,
    pod: String,
    container: String,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = stream.next() => {
                let reason = match next {
                    Some(Ok(line)) => match find_signature(&signatures, &line) {
                        Some(signature) => CrashReason::Signature {
                            signature: signature.to_string(),
                            line,
                        },
                        None => continue,
                    },
                    Some(Err(e)) => CrashReason::StreamFailed(e.to_string()),
                    None => CrashReason::StreamEnded,
                };
                record_crash(&state, &pod, &container, reason);
                return;
            }
        }
    }
}

fn find_signature<'a>(signatures: &'a [String], line: &str) -> Option<&'a str> {
    signatures
        .iter()
        .find(|s| line.contains(s.as_str()))
        .map(String::as_str)
}

/// Move `Watching` to `Crashed`; any other state is left alone
fn record_crash(state: &watch::Sender<WatcherState>, pod: &str, container: &str, reason: CrashReason) -> bool {
    let report = CrashReport {
        pod: pod.to_string(),
        container: container.to_string(),
        reason,
    };
    let crashed = state.send_if_modified(|current| {
        if *current == WatcherState::Watching {
            *current = WatcherState::Crashed(report.clone());
            true
        } else {
            false
        }
    });
    if crashed {
        error!(pod = %pod, container = %container, reason = %report.reason, "container crash detected");
    }
    crashed
}
