//! The retry layer around model calls.
//!
//! This module is the single place retries happen: the model adapters
//! classify each failure as transient or fatal, and [`run_retries`] decides
//! whether to try again. Neither the adapters nor the page drivers retry on
//! their own.
//!
//! Classification is expressed by converting plain `Result`s into
//! [`keen_retry::RetryResult`]s via [`IntoRetryResult`], then propagating
//! with [`try_retry!`]. A failure only becomes `Transient` when something
//! deliberately marked it so; everything else is fatal, which keeps us from
//! burning a whole backoff schedule on errors that will never resolve.

use keen_retry::{ExponentialJitter, ResolvedResult, RetryResult};
use reqwest::StatusCode;

use crate::prelude::*;

/// Build the backoff schedule for a retry budget of `max_retries`.
fn jitter_for(max_retries: usize) -> ExponentialJitter<anyhow::Error> {
    ExponentialJitter::FromBackoffRange {
        backoff_range_millis: 250..=30_000,
        re_attempts: max_retries.min(u8::MAX as usize) as u8,
        jitter_ratio: 0.2,
    }
}

/// Run `func`, retrying transient failures up to `max_retries` times with
/// exponential backoff and jitter.
///
/// `page_tag` identifies the work in log output ("page 3", "full document").
/// Every failed attempt is logged; on exhaustion only the final error is
/// returned to the caller.
#[instrument(level = "debug", skip(func), fields(page = %page_tag))]
pub async fn run_retries<Output, Func, Fut>(
    max_retries: usize,
    page_tag: &str,
    mut func: Func,
) -> Result<Output>
where
    Func: (FnMut() -> Fut) + Send,
    Fut: Future<Output = RetryResult<(), (), Output, anyhow::Error>> + Send,
{
    let resolved = func()
        .await
        .retry_with_async(|_| func())
        .with_exponential_jitter(|| jitter_for(max_retries))
        .await;
    match resolved {
        ResolvedResult::Ok { output, .. } => Ok(output),
        ResolvedResult::Recovered {
            output,
            retry_errors,
            ..
        } => {
            warn!(
                "succeeded after {} retries (failed attempts: [{}])",
                retry_errors.len(),
                keen_retry::loggable_retry_errors(&retry_errors)
            );
            Ok(output)
        }
        ResolvedResult::Fatal { error, .. } => {
            error!("failed with non-retryable error: {error:?}");
            Err(error)
        }
        ResolvedResult::GivenUp {
            retry_errors,
            fatal_error,
            ..
        }
        | ResolvedResult::Unrecoverable {
            retry_errors,
            fatal_error,
            ..
        } => {
            error!(
                "failed after exhausting {} retry attempts: {fatal_error:?} (previous transient failures: [{}])",
                retry_errors.len(),
                keen_retry::loggable_retry_errors(&retry_errors)
            );
            Err(fatal_error)
        }
    }
}

/// `?` for [`RetryResult`]: unwrap a success, or propagate the failure with
/// its transient/fatal classification intact.
macro_rules! try_retry {
    ($result:expr) => {
        match $result {
            ::keen_retry::RetryResult::Ok { output, .. } => output,
            ::keen_retry::RetryResult::Transient { input, error } => {
                return ::keen_retry::RetryResult::Transient { input, error };
            }
            ::keen_retry::RetryResult::Fatal { input, error } => {
                return ::keen_retry::RetryResult::Fatal { input, error };
            }
        }
    };
}

pub(crate) use try_retry;

/// Build a successful [`RetryResult`].
pub(crate) fn retry_ok<T>(output: T) -> RetryResult<(), (), T, anyhow::Error> {
    RetryResult::Ok {
        reported_input: (),
        output,
    }
}

/// Build a [`RetryResult`] that gives up immediately.
pub(crate) fn retry_fatal<T>(
    error: anyhow::Error,
) -> RetryResult<(), (), T, anyhow::Error> {
    RetryResult::Fatal { input: (), error }
}

/// Build a [`RetryResult`] worth another attempt.
pub(crate) fn retry_transient<T>(
    error: anyhow::Error,
) -> RetryResult<(), (), T, anyhow::Error> {
    debug!("potentially transient error: {error:?}");
    RetryResult::Transient { input: (), error }
}

/// Classify a plain `Result` for the retry layer. Used together with
/// [`try_retry!`] at the adapter call sites:
///
/// ```ignore
/// let parsed = try_retry!(serde_json::from_str(&text).or_transient());
/// let response = try_retry!(client.send(req).await.or_known_transient());
/// ```
pub trait IntoRetryResult<T, E> {
    /// Any error here means the request can never succeed as written.
    fn or_fatal(self) -> RetryResult<(), (), T, anyhow::Error>;

    /// Any error here is worth another attempt.
    fn or_transient(self) -> RetryResult<(), (), T, anyhow::Error>;

    /// Let the error type decide, via [`IsKnownTransient`].
    fn or_known_transient(self) -> RetryResult<(), (), T, anyhow::Error>
    where
        E: IsKnownTransient;
}

impl<T, E> IntoRetryResult<T, E> for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn or_fatal(self) -> RetryResult<(), (), T, anyhow::Error> {
        match self {
            Ok(output) => retry_ok(output),
            Err(error) => retry_fatal(error.into()),
        }
    }

    fn or_transient(self) -> RetryResult<(), (), T, anyhow::Error> {
        match self {
            Ok(output) => retry_ok(output),
            Err(error) => retry_transient(error.into()),
        }
    }

    fn or_known_transient(self) -> RetryResult<(), (), T, anyhow::Error>
    where
        E: IsKnownTransient,
    {
        match self {
            Ok(output) => retry_ok(output),
            Err(error) if error.is_known_transient() => retry_transient(error.into()),
            Err(error) => retry_fatal(error.into()),
        }
    }
}

/// Is this error one we have seen recover on a later attempt?
///
/// Each adapter implements this for its SDK's error type, naming the exact
/// throttling/overload conditions it has observed. The default answer is
/// "no": an unclassified error goes fatal rather than eating the whole
/// backoff schedule.
pub trait IsKnownTransient {
    fn is_known_transient(&self) -> bool;
}

impl IsKnownTransient for reqwest::Error {
    fn is_known_transient(&self) -> bool {
        // With a status code we can be precise. Without one (connect
        // failures, resets, timeouts) the error is network-level, and
        // those usually clear up on their own.
        self.status()
            .map(|status| status.is_known_transient())
            .unwrap_or(true)
    }
}

impl IsKnownTransient for StatusCode {
    fn is_known_transient(&self) -> bool {
        // 429 plus the gateway/overload family.
        matches!(self.as_u16(), 429 | 502 | 503 | 504)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let attempts = AtomicUsize::new(0);
        let result: Result<u32> = run_retries(3, "page 1", || async {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                retry_transient(anyhow!("flaky"))
            } else {
                retry_ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_budget_exhausted() {
        let attempts = AtomicUsize::new(0);
        let result: Result<u32> = run_retries(2, "page 1", || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            retry_transient(anyhow!("always down"))
        })
        .await;
        assert!(result.is_err());
        // One initial attempt plus two retries.
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_errors_do_not_retry() {
        let attempts = AtomicUsize::new(0);
        let result: Result<u32> = run_retries(5, "page 1", || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            retry_fatal(anyhow!("bad request"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn classification_follows_the_conversion_used() {
        let flaky: Result<(), anyhow::Error> = Err(anyhow!("blip"));
        assert!(matches!(
            flaky.or_transient(),
            RetryResult::Transient { .. }
        ));

        let broken: Result<(), anyhow::Error> = Err(anyhow!("bad schema"));
        assert!(matches!(broken.or_fatal(), RetryResult::Fatal { .. }));

        let fine: Result<u32, anyhow::Error> = Ok(1);
        assert!(matches!(fine.or_fatal(), RetryResult::Ok { .. }));
    }

    #[test]
    fn status_codes_classify_as_observed() {
        assert!(StatusCode::TOO_MANY_REQUESTS.is_known_transient());
        assert!(StatusCode::SERVICE_UNAVAILABLE.is_known_transient());
        assert!(!StatusCode::BAD_REQUEST.is_known_transient());
        assert!(!StatusCode::UNAUTHORIZED.is_known_transient());
    }
}
