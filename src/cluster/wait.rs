//! Bounded polling for remote convergence

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::{Error, Result};

/// Poll `predicate` until it holds or `timeout` elapses.
///
/// The predicate is evaluated immediately, then every `poll_interval`. The
/// last sleep is shortened so the final evaluation happens at the deadline.
/// Predicate errors are logged and count as "not yet": the remote platform
/// is eventually consistent and a failed read does not mean failure. If the
/// deadline passes, [`Error::Timeout`] is returned, carrying the last
/// predicate error if there was one. Callers must not retry a timeout.
pub async fn wait_until<F, Fut>(
    description: &str,
    timeout: Duration,
    poll_interval: Duration,
    mut predicate: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let start = Instant::now();
    let mut last_error: Option<String> = None;

    loop {
        match predicate().await {
            Ok(true) => {
                debug!(
                    operation = %description,
                    elapsed_ms = start.elapsed().as_millis(),
                    "Condition met"
                );
                return Ok(());
            }
            Ok(false) => trace!(operation = %description, "Condition not yet met"),
            Err(e) => {
                warn!(operation = %description, error = %e, "Poll failed, will retry");
                last_error = Some(e.to_string());
            }
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            let operation = match last_error {
                Some(e) => format!("{} (last error: {})", description, e),
                None => description.to_string(),
            };
            error!(operation = %operation, timeout_secs = timeout.as_secs_f64(), "Operation timed out");
            return Err(Error::timeout(operation, timeout));
        }

        tokio::time::sleep(poll_interval.min(timeout - elapsed)).await;
    }
}
