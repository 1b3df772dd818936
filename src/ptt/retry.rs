//! Bounded retry with remediation.
//!
//! Both combinators run `attempt` up to `1 + max_retries` times.  Between
//! attempts they call `remediate(&error)`, which performs the
//! operation-specific repair (tear down a listener, release a device) and
//! answers whether another attempt makes sense.  Errors that are not
//! [retryable](PttError::is_retryable) are returned as they are; a spent
//! budget becomes [`PttError::RetriesExhausted`].

use std::future::Future;
use std::time::Duration;

use super::{Operation, PttError};

/// Retry budget and linear backoff step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Wait before retry `n` is `backoff * n`.
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn delay(&self, retry: u32) -> Duration {
        self.backoff * retry
    }

    fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

/// What to do after a failed attempt.
enum Next {
    Retry(Duration),
    Fail(PttError),
}

fn after_failure<R>(
    operation: Operation,
    policy: &RetryPolicy,
    attempt: u32,
    error: PttError,
    remediate: &mut R,
) -> Next
where
    R: FnMut(&PttError) -> bool,
{
    if !error.is_retryable() {
        return Next::Fail(error);
    }
    log::warn!(
        "ptt: {operation} attempt {attempt}/{} failed: {error}",
        policy.total_attempts()
    );
    if attempt >= policy.total_attempts() || !remediate(&error) {
        return Next::Fail(PttError::RetriesExhausted {
            operation,
            attempts: attempt,
            last: Box::new(error),
        });
    }
    Next::Retry(policy.delay(attempt))
}

/// Blocking variant; sleeps the calling thread between attempts.
///
/// `attempt` receives the 1-based attempt number.
///
/// # Errors
///
/// The first non-retryable error, or [`PttError::RetriesExhausted`].
pub fn retry_with_remediation<T, A, R>(
    operation: Operation,
    policy: RetryPolicy,
    mut attempt: A,
    mut remediate: R,
) -> Result<T, PttError>
where
    A: FnMut(u32) -> Result<T, PttError>,
    R: FnMut(&PttError) -> bool,
{
    let mut n = 1;
    loop {
        match attempt(n) {
            Ok(value) => {
                if n > 1 {
                    log::info!("ptt: {operation} succeeded on attempt {n}");
                }
                return Ok(value);
            }
            Err(error) => match after_failure(operation, &policy, n, error, &mut remediate) {
                Next::Retry(delay) => std::thread::sleep(delay),
                Next::Fail(error) => return Err(error),
            },
        }
        n += 1;
    }
}

/// Async variant; backs off with `tokio::time::sleep`.
///
/// # Errors
///
/// Same as [`retry_with_remediation`].
pub async fn retry_with_remediation_async<T, A, F, R>(
    operation: Operation,
    policy: RetryPolicy,
    mut attempt: A,
    mut remediate: R,
) -> Result<T, PttError>
where
    A: FnMut(u32) -> F,
    F: Future<Output = Result<T, PttError>>,
    R: FnMut(&PttError) -> bool,
{
    let mut n = 1;
    loop {
        match attempt(n).await {
            Ok(value) => {
                if n > 1 {
                    log::info!("ptt: {operation} succeeded on attempt {n}");
                }
                return Ok(value);
            }
            Err(error) => match after_failure(operation, &policy, n, error, &mut remediate) {
                Next::Retry(delay) => tokio::time::sleep(delay).await,
                Next::Fail(error) => return Err(error),
            },
        }
        n += 1;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
