//! Per-call retry with exponential backoff.
//!
//! Every failure is classified before deciding to wait: transient faults
//! (timeouts, dropped connections, 5xx) are retried, everything else
//! (bad credentials, permission denial, unknown errors) stops immediately.

use std::error::Error as StdError;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::adapters::http::status_code;
use crate::domain::{codes, standardize_error, ErrorContext, ErrorKind, WorkflowError};

/// Codes the per-call layer treats as transient
pub const RETRYABLE_CODES: &[&str] = &[
    codes::TIMEOUT,
    codes::CONNECTION_RESET,
    codes::CONNECTION_REFUSED,
    codes::NETWORK,
    codes::SERVER_ERROR,
];

/// Retry policy for a single step call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = try once)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry, in seconds; doubles on each retry
    #[serde(default = "default_base_interval")]
    pub base_interval: f64,

    /// Add random jitter on top of the backoff delay
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_interval() -> f64 {
    1.0
}
fn default_jitter() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_interval: default_base_interval(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    /// Backoff before retry `retry_index` (0-indexed), without jitter
    pub fn backoff_delay(&self, retry_index: u32) -> Duration {
        let seconds = self.base_interval.max(0.0) * 2f64.powi(retry_index as i32);
        Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
    }

    /// Backoff including jitter when enabled
    pub fn delay_for_retry(&self, retry_index: u32) -> Duration {
        let delay = self.backoff_delay(retry_index);
        if self.jitter {
            delay.saturating_add(jitter_for(delay))
        } else {
            delay
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.base_interval.is_finite() || self.base_interval < 0.0 {
            anyhow::bail!(
                "retry base_interval must be a non-negative number, got {}",
                self.base_interval
            );
        }
        Ok(())
    }
}

/// Up to half of `delay`, derived from the clock's sub-second nanos
fn jitter_for(delay: Duration) -> Duration {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    let fraction = f64::from(nanos % 500) / 1000.0;
    delay.mul_f64(fraction)
}

/// Suspends the current task between attempts
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeper backed by the tokio timer
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Whether a failure is worth another attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Retryable,
    Terminal,
}

/// Classify a failure for the per-call retry layer
pub fn classify(err: &anyhow::Error) -> FailureClass {
    for cause in err.chain() {
        if let Some(domain) = cause.downcast_ref::<WorkflowError>() {
            if domain.kind() == ErrorKind::Configuration {
                return FailureClass::Terminal;
            }
            return match domain.code() {
                Some(code) if RETRYABLE_CODES.contains(&code) => FailureClass::Retryable,
                _ => FailureClass::Terminal,
            };
        }
        if let Some(code) = raw_fault_code(cause) {
            return if RETRYABLE_CODES.contains(&code) {
                FailureClass::Retryable
            } else {
                FailureClass::Terminal
            };
        }
    }
    FailureClass::Terminal
}

/// Fault code for a raw (non-domain) error anywhere in the chain
pub fn fault_code(err: &anyhow::Error) -> Option<&'static str> {
    err.chain().find_map(raw_fault_code)
}

fn raw_fault_code(cause: &(dyn StdError + 'static)) -> Option<&'static str> {
    if let Some(io) = cause.downcast_ref::<std::io::Error>() {
        use std::io::ErrorKind as Io;
        return match io.kind() {
            Io::TimedOut => Some(codes::TIMEOUT),
            Io::ConnectionReset | Io::ConnectionAborted | Io::BrokenPipe => {
                Some(codes::CONNECTION_RESET)
            }
            Io::ConnectionRefused => Some(codes::CONNECTION_REFUSED),
            Io::NotConnected | Io::AddrNotAvailable | Io::UnexpectedEof => Some(codes::NETWORK),
            _ => None,
        };
    }

    if let Some(http) = cause.downcast_ref::<reqwest::Error>() {
        if http.is_timeout() {
            return Some(codes::TIMEOUT);
        }
        if http.is_connect() {
            return Some(codes::CONNECTION_REFUSED);
        }
        if let Some(status) = http.status() {
            return Some(status_code(status));
        }
        if http.is_request() || http.is_body() {
            return Some(codes::NETWORK);
        }
        return None;
    }

    if cause.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
        return Some(codes::TIMEOUT);
    }

    if let Some(rusqlite::Error::SqliteFailure(failure, _)) = cause.downcast_ref::<rusqlite::Error>() {
        return match failure.code {
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                Some(codes::STORAGE_TIMEOUT)
            }
            _ => None,
        };
    }

    None
}

/// Runs a fallible operation under a [`RetryPolicy`]
#[derive(Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_sleeper(policy, Arc::new(TokioSleeper))
    }

    pub fn with_sleeper(policy: RetryPolicy, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { policy, sleeper }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Invoke `operation` until it succeeds, fails terminally, or the
    /// policy's retries are spent.
    ///
    /// The returned error reads `Operation failed after {N} retries: {msg}`
    /// where `N` is the number of retries actually performed.
    pub async fn retry_with<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, WorkflowError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut retries = 0u32;

        loop {
            let err = match call().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let class = classify(&err);
            if class == FailureClass::Terminal || retries >= self.policy.max_attempts {
                debug!(operation, retries, ?class, "Giving up");
                return Err(final_error(operation, retries, class, err));
            }

            let delay = self.policy.delay_for_retry(retries);
            warn!(
                operation,
                attempt = retries + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Call failed, retrying"
            );

            self.sleeper.sleep(delay).await;
            retries += 1;
        }
    }
}

fn final_error(operation: &str, retries: u32, class: FailureClass, err: anyhow::Error) -> WorkflowError {
    let original = standardize_error(err, ErrorContext::new());

    let mut context = original.context().clone();
    context
        .entry("operation".to_string())
        .or_insert_with(|| operation.to_string());
    context.insert("retries".to_string(), retries.to_string());
    if let Some(code) = original.code() {
        context.insert("cause_code".to_string(), code.to_string());
    }

    let message = format!("Operation failed after {} retries: {}", retries, original.message());
    let normalized = WorkflowError::new(original.kind(), message).with_context_map(context);

    match (class, original.code()) {
        (FailureClass::Retryable, _) => normalized.with_code(codes::RETRIES_EXHAUSTED),
        (FailureClass::Terminal, Some(code)) => normalized.with_code(code),
        (FailureClass::Terminal, None) => normalized,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_interval, 1.0);
        assert!(policy.jitter);
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy {
            base_interval: 0.5,
            jitter: false,
            ..Default::default()
        };

        assert_eq!(policy.backoff_delay(0), Duration::from_millis(500));
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_retry(2), Duration::from_secs(2));
    }

    #[test]
    fn test_jitter_stays_within_half_the_delay() {
        let policy = RetryPolicy {
            base_interval: 1.0,
            jitter: true,
            ..Default::default()
        };

        for _ in 0..20 {
            let delay = policy.delay_for_retry(1);
            assert!(delay >= Duration::from_secs(2));
            assert!(delay < Duration::from_secs(3));
        }
    }

    #[test]
    fn test_policy_yaml_defaults() {
        let policy: RetryPolicy = serde_yaml::from_str("max_attempts: 5").unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_interval, 1.0);
        assert!(policy.jitter);
    }

    #[test]
    fn test_negative_interval_is_invalid() {
        let policy = RetryPolicy {
            base_interval: -1.0,
            ..Default::default()
        };
        assert!(policy.validate().is_err());
        assert_eq!(policy.backoff_delay(0), Duration::ZERO);
    }

    #[test]
    fn test_classification_of_raw_errors() {
        let timeout = anyhow::Error::new(std::io::Error::new(std::io::ErrorKind::TimedOut, "t"));
        let reset = anyhow::Error::new(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "r"));
        let denied =
            anyhow::Error::new(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "p"));

        assert_eq!(classify(&timeout), FailureClass::Retryable);
        assert_eq!(classify(&reset), FailureClass::Retryable);
        assert_eq!(classify(&denied), FailureClass::Terminal);
        assert_eq!(classify(&anyhow::anyhow!("unknown")), FailureClass::Terminal);
    }

    #[test]
    fn test_classification_sees_through_context() {
        use anyhow::Context;

        let err = Err::<(), _>(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "c"))
            .context("Failed to reach Slack")
            .unwrap_err();
        assert_eq!(classify(&err), FailureClass::Retryable);
    }

    #[test]
    fn test_classification_of_domain_errors() {
        let server = WorkflowError::openai("502").with_code(codes::SERVER_ERROR);
        let auth = WorkflowError::slack("invalid_auth").with_code(codes::UNAUTHORIZED);
        let config = WorkflowError::configuration("no token").with_code(codes::TIMEOUT);

        assert_eq!(classify(&anyhow::Error::new(server)), FailureClass::Retryable);
        assert_eq!(classify(&anyhow::Error::new(auth)), FailureClass::Terminal);
        assert_eq!(classify(&anyhow::Error::new(config)), FailureClass::Terminal);
    }

    #[test]
    fn test_elapsed_is_a_timeout() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let _guard = rt.enter();
        let elapsed = rt
            .block_on(tokio::time::timeout(
                Duration::from_millis(1),
                std::future::pending::<()>(),
            ))
            .unwrap_err();

        assert_eq!(fault_code(&anyhow::Error::new(elapsed)), Some(codes::TIMEOUT));
    }

    #[test]
    fn test_busy_database_is_a_storage_timeout() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".to_string()),
        );
        let err = anyhow::Error::new(busy);

        assert_eq!(fault_code(&err), Some(codes::STORAGE_TIMEOUT));
        assert_eq!(classify(&err), FailureClass::Terminal);
    }

    #[test]
    fn test_final_error_keeps_kind_and_context() {
        let cause = WorkflowError::notion("notion.pages.create returned HTTP 403: no")
            .with_code(codes::FORBIDDEN)
            .with_context("operation", "notion.pages.create");

        let err = final_error("publish", 0, FailureClass::Terminal, anyhow::Error::new(cause));

        assert_eq!(err.kind(), ErrorKind::Notion);
        assert_eq!(
            err.message(),
            "Operation failed after 0 retries: notion.pages.create returned HTTP 403: no"
        );
        assert_eq!(err.code(), Some(codes::FORBIDDEN));
        assert_eq!(err.context().get("operation").unwrap(), "notion.pages.create");
        assert_eq!(err.context().get("retries").unwrap(), "0");
        assert_eq!(err.context().get("cause_code").unwrap(), codes::FORBIDDEN);
    }
}
