//! Condition poller: run a probe until its output satisfies a predicate.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::sandbox::Sandbox;
use crate::{ExecOutput, Result};

/// Default deadline for in-session readiness checks.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default pause between probe attempts.
const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

/// Deadline for a freshly spawned network service to start listening.
const PORT_TIMEOUT: Duration = Duration::from_secs(60);

/// Timing for [`wait_and_verify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Give up once this much time has passed without success.
    pub timeout: Duration,
    /// Sleep between attempts.
    pub interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            interval: DEFAULT_INTERVAL,
        }
    }
}

impl PollConfig {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    /// Longer deadline used while waiting for a port to open.
    pub fn for_port() -> Self {
        Self {
            timeout: PORT_TIMEOUT,
            interval: DEFAULT_INTERVAL,
        }
    }
}

/// Run `command` until `on_result` accepts its output or `config.timeout`
/// elapses.
///
/// A probe exiting non-zero ([`Error::CommandExit`](crate::Error::CommandExit))
/// counts as "not ready yet" and is retried; every other error is returned
/// immediately. Returns `Ok(false)` on timeout, never before the deadline.
pub async fn wait_and_verify<F>(
    sandbox: &Sandbox,
    command: &str,
    on_result: F,
    config: &PollConfig,
) -> Result<bool>
where
    F: Fn(&ExecOutput) -> bool,
{
    let deadline = Instant::now() + config.timeout;
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;

        match sandbox.run(command).await {
            Ok(output) if on_result(&output) => {
                debug!(command, attempt, "condition satisfied");
                return Ok(true);
            }
            Ok(_) => debug!(command, attempt, "condition not met yet"),
            Err(e) if e.is_transient() => debug!(command, attempt, "probe not ready: {}", e),
            Err(e) => return Err(e),
        }

        if Instant::now() >= deadline {
            debug!(command, attempt, "deadline reached");
            return Ok(false);
        }
        tokio::time::sleep(config.interval).await;
    }
}
