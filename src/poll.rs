//! Bounded fixed-interval readiness polling
//!
//! Every slow external stage (a container reaching `running`, the nested
//! API server answering `kubectl get nodes`) is gated by the same
//! combinator: run a check, sleep a fixed interval, give up after a hard
//! attempt cap. Running out of attempts is reported as an outcome rather
//! than an error so the caller names the stage that timed out.
//!
//! ```ignore
//! let outcome = poll_until("control plane", &PollPolicy::new(15, Duration::from_secs(2)), move || async move {
//!     let result = tooling.get_nodes().await?;
//!     Ok(if result.success() { Readiness::Ready } else { Readiness::NotReady(result.output) })
//! })
//! .await?;
//! outcome.into_result("control plane")?;
//! ```

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::common::{Error, Result};

/// Attempt cap and fixed delay between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Hard cap on checks; at least one check always runs
    pub max_attempts: u32,
    /// Delay between consecutive checks
    pub interval: Duration,
}

impl PollPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval,
        }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::new(15, Duration::from_secs(2))
    }
}

/// Result of a single check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Not yet; carries the diagnostic output of the failed check
    NotReady(String),
}

/// Result of a whole poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Ready {
        attempts: u32,
    },
    TimedOut {
        attempts: u32,
        last_failure: Option<String>,
    },
}

impl PollOutcome {
    /// Turn a timeout into a fatal setup error for `stage`
    pub fn into_result(self, stage: &str) -> Result<u32> {
        match self {
            PollOutcome::Ready { attempts } => Ok(attempts),
            PollOutcome::TimedOut {
                attempts,
                last_failure,
            } => Err(Error::setup_timeout(stage, attempts, last_failure)),
        }
    }
}

/// Run `check` until it reports [`Readiness::Ready`] or the policy is exhausted.
///
/// An `Err` from `check` aborts immediately: it means the check itself could
/// not run (engine unreachable, container gone), not that the target is
/// still starting. Each `NotReady` diagnostic is logged, and the last one is
/// kept in the timeout outcome.
pub async fn poll_until<F, Fut>(
    description: &str,
    policy: &PollPolicy,
    mut check: F,
) -> Result<PollOutcome>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Readiness>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_failure = None;

    for attempt in 1..=max_attempts {
        match check().await? {
            Readiness::Ready => {
                debug!(what = %description, attempt, "ready");
                return Ok(PollOutcome::Ready { attempts: attempt });
            }
            Readiness::NotReady(diagnostic) => {
                warn!(
                    what = %description,
                    attempt,
                    max_attempts,
                    diagnostic = %diagnostic.trim(),
                    "not yet ready"
                );
                last_failure = Some(diagnostic);
            }
        }

        if attempt < max_attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }

    Ok(PollOutcome::TimedOut {
        attempts: max_attempts,
        last_failure,
    })
}
