use std::future::Future;
use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use teloxide::RequestError;
use tracing::warn;

use crate::error::Error;

/// How a failed outbound call should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Network error or transient server status.
    Transient,
    /// Server asked us to slow down, optionally saying for how long.
    RateLimited(Option<Duration>),
    Fatal,
}

/// Classifies an error for the retry loop.
pub trait Classify {
    fn classify(&self) -> Failure;
}

impl Classify for RequestError {
    fn classify(&self) -> Failure {
        match self {
            RequestError::RetryAfter(wait) => Failure::RateLimited(Some(wait.duration())),
            RequestError::Network(_) | RequestError::Io(_) => Failure::Transient,
            _ => Failure::Fatal,
        }
    }
}

impl Classify for Error {
    fn classify(&self) -> Failure {
        match self {
            Error::Transient { .. } => Failure::Transient,
            Error::RateLimited { retry_after } => Failure::RateLimited(*retry_after),
            Error::Telegram(e) => e.classify(),
            Error::Reqwest(e) if e.is_timeout() || e.is_connect() || e.is_request() => {
                Failure::Transient
            }
            _ => Failure::Fatal,
        }
    }
}

const TRANSIENT_STATUSES: [StatusCode; 4] = [
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    error_code: u16,
    #[serde(default)]
    parameters: Option<ApiErrorParameters>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

/// Maps a raw HTTP response status and body onto the error taxonomy.
///
/// A 429 carries the server's suggested wait in the Bot API error body
/// (`parameters.retry_after`, seconds); a body that is not a 429 error
/// is treated as fatal.
pub fn check_status(status: StatusCode, body: &[u8]) -> Result<(), Error> {
    if status.is_success() {
        return Ok(());
    }
    if TRANSIENT_STATUSES.contains(&status) {
        return Err(Error::transient(format!("server responded {status}")));
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return match serde_json::from_slice::<ApiErrorBody>(body) {
            Ok(parsed) if parsed.error_code == 429 => Err(Error::RateLimited {
                retry_after: parsed
                    .parameters
                    .and_then(|p| p.retry_after)
                    .filter(|secs| *secs > 0)
                    .map(Duration::from_secs),
            }),
            _ => Err(Error::fatal(format!("server responded {status}"))),
        };
    }
    Err(Error::fatal(format!("server responded {status}")))
}

/// Retries transient failures after a fixed wait and rate-limit failures
/// after the server-suggested wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            wait: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(retries: u32, wait: Duration) -> Self {
        Self { retries, wait }
    }

    /// Runs `request` until it succeeds, fails fatally, or the retry
    /// budget is spent. The last error is returned.
    pub async fn run<T, E, F, Fut>(&self, operation: &'static str, mut request: F) -> Result<T, E>
    where
        E: Classify + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0u32;
        loop {
            let err = match request().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let wait = match err.classify() {
                Failure::Fatal => return Err(err),
                Failure::Transient => self.wait,
                Failure::RateLimited(suggested) => suggested.unwrap_or(self.wait),
            };

            if attempt >= self.retries {
                warn!(
                    operation,
                    attempt,
                    max_retries = self.retries,
                    error = %err,
                    "outbound call still failing after retries"
                );
                return Err(err);
            }

            attempt += 1;
            warn!(
                operation,
                attempt,
                max_retries = self.retries,
                wait_ms = wait.as_millis() as u64,
                error = %err,
                "outbound call failed, waiting before retry"
            );
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(StatusCode::INTERNAL_SERVER_ERROR, Failure::Transient)]
    #[case(StatusCode::BAD_GATEWAY, Failure::Transient)]
    #[case(StatusCode::SERVICE_UNAVAILABLE, Failure::Transient)]
    #[case(StatusCode::GATEWAY_TIMEOUT, Failure::Transient)]
    #[case(StatusCode::BAD_REQUEST, Failure::Fatal)]
    #[case(StatusCode::FORBIDDEN, Failure::Fatal)]
    fn test_status_classification(#[case] status: StatusCode, #[case] expected: Failure) {
        let err = check_status(status, b"").unwrap_err();
        assert_eq!(err.classify(), expected);
    }

    #[test]
    fn test_too_many_requests_parses_retry_after() {
        let body = br#"{"ok":false,"error_code":429,"description":"Too Many Requests: retry after 7","parameters":{"retry_after":7}}"#;
        let err = check_status(StatusCode::TOO_MANY_REQUESTS, body).unwrap_err();
        assert_eq!(
            err.classify(),
            Failure::RateLimited(Some(Duration::from_secs(7)))
        );
    }

    #[test]
    fn test_too_many_requests_without_duration() {
        let body = br#"{"ok":false,"error_code":429}"#;
        let err = check_status(StatusCode::TOO_MANY_REQUESTS, body).unwrap_err();
        assert_eq!(err.classify(), Failure::RateLimited(None));
    }

    #[test]
    fn test_too_many_requests_with_foreign_body_is_fatal() {
        let err = check_status(StatusCode::TOO_MANY_REQUESTS, b"slow down").unwrap_err();
        assert_eq!(err.classify(), Failure::Fatal);
    }

    #[test]
    fn test_retry_after_request_error() {
        let err = RequestError::RetryAfter(teloxide::types::Seconds::from_seconds(42));
        assert_eq!(
            err.classify(),
            Failure::RateLimited(Some(Duration::from_secs(42)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_retried_until_success() {
        let policy = RetryPolicy::new(3, Duration::from_millis(500));
        let calls = Arc::new(AtomicU32::new(0));
        let started = tokio::time::Instant::now();

        let result = policy
            .run("test", || {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::transient("502"))
                    } else {
                        Ok(5)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 5);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_sleeps_suggested_duration() {
        let policy = RetryPolicy::new(3, Duration::from_millis(500));
        let calls = Arc::new(AtomicU32::new(0));
        let started = tokio::time::Instant::now();

        let result = policy
            .run("test", || {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(Error::RateLimited {
                            retry_after: Some(Duration::from_secs(4)),
                        })
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(started.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_budget() {
        let policy = RetryPolicy::new(2, Duration::from_millis(10));
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), Error> = policy
            .run("test", || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::transient("503"))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_not_retried() {
        let policy = RetryPolicy::default();
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), Error> = policy
            .run("test", || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::fatal("bad request"))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
