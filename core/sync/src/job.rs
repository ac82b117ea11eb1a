//! Background job outcomes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::retry::{backoff_sleep, RetryConfig};

/// Two-valued result a background job reports to whoever schedules it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobOutcome {
    Success,
    Failure,
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Success)
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOutcome::Success => write!(f, "success"),
            JobOutcome::Failure => write!(f, "failure"),
        }
    }
}

/// Re-run `job` until it succeeds, retries are exhausted, or `cancel`
/// fires.
///
/// This is the rescheduling a platform job runner would do with a failed
/// job: each failure waits out the configured backoff before the next run.
pub async fn run_with_backoff<F, Fut>(
    retry: &RetryConfig,
    cancel: &CancellationToken,
    mut job: F,
) -> JobOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = JobOutcome>,
{
    let mut attempt = 0;
    loop {
        if job().await.is_success() {
            return JobOutcome::Success;
        }

        attempt += 1;
        if attempt > retry.max_retries {
            warn!("Job failed after {} runs", attempt);
            return JobOutcome::Failure;
        }

        let delay = retry.delay_for_attempt(attempt - 1);
        info!("Job run {} failed, rescheduling in {:?}", attempt, delay);
        if !backoff_sleep(delay, cancel).await {
            return JobOutcome::Failure;
        }
    }
}
