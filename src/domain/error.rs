//! Domain error taxonomy and normalization.
//!
//! Every failure that leaves the workflow engine is a [`WorkflowError`]:
//! a closed set of kinds, a human message, an optional machine code, and a
//! structured context map. Raw errors from libraries are folded into this
//! shape by [`standardize_error`].

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::error;

/// Machine-readable fault codes carried on [`WorkflowError::code`].
pub mod codes {
    pub const TIMEOUT: &str = "timeout";
    pub const CONNECTION_RESET: &str = "connection_reset";
    pub const CONNECTION_REFUSED: &str = "connection_refused";
    pub const NETWORK: &str = "network_error";
    pub const SERVER_ERROR: &str = "server_error";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const FORBIDDEN: &str = "forbidden";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const BAD_REQUEST: &str = "bad_request";
    pub const NOT_FOUND: &str = "not_found";
    pub const STORAGE_TIMEOUT: &str = "storage_timeout";
    pub const RETRIES_EXHAUSTED: &str = "retries_exhausted";
    pub const RUN_NOT_FOUND: &str = "run_not_found";
    pub const RUN_ALREADY_FINISHED: &str = "run_already_finished";
    pub const MISSING_CREDENTIALS: &str = "missing_credentials";
    pub const UNKNOWN_TEMPLATE: &str = "unknown_template";
    pub const INVALID_STEP_INPUT: &str = "invalid_step_input";
}

/// Structured context attached to an error (operation name, identifiers).
pub type ErrorContext = BTreeMap<String, String>;

/// Build an [`ErrorContext`] from key/value pairs.
pub fn error_context<I, K, V>(pairs: I) -> ErrorContext
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: ToString,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.to_string()))
        .collect()
}

/// Which collaborator (or layer) an error belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing or invalid setup; never retried
    Configuration,

    /// Slack API failure
    Slack,

    /// OpenAI API failure
    Openai,

    /// Notion API failure
    Notion,

    /// Catch-all for normalized unknown failures
    Generic,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Slack => "slack",
            Self::Openai => "openai",
            Self::Notion => "notion",
            Self::Generic => "generic",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified workflow failure.
///
/// Fields are private: once built and returned, an error is never mutated.
/// The builder methods consume `self`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct WorkflowError {
    kind: ErrorKind,
    message: String,
    code: Option<String>,
    context: ErrorContext,
}

impl WorkflowError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
            context: ErrorContext::new(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn slack(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Slack, message)
    }

    pub fn openai(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Openai, message)
    }

    pub fn notion(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Notion, message)
    }

    pub fn generic(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Generic, message)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.context.insert(key.into(), value.to_string());
        self
    }

    pub fn with_context_map(mut self, context: ErrorContext) -> Self {
        self.context.extend(context);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn context(&self) -> &ErrorContext {
        &self.context
    }

    pub fn has_code(&self, code: &str) -> bool {
        self.code.as_deref() == Some(code)
    }
}

/// Convert an arbitrary error into a [`WorkflowError`].
///
/// A domain error is returned unchanged and `context` is NOT merged into it:
/// the context recorded where the error was first classified wins.
/// Anything else becomes a `Generic` error with the raw message, the given
/// context, and a fault code when the raw cause is a recognizable transport
/// or storage fault.
pub fn standardize_error(raw: anyhow::Error, context: ErrorContext) -> WorkflowError {
    let raw = match raw.downcast::<WorkflowError>() {
        Ok(domain) => return domain,
        Err(raw) => raw,
    };

    let mut normalized = WorkflowError::generic(raw.to_string()).with_context_map(context);
    if let Some(code) = crate::core::retry::fault_code(&raw) {
        normalized = normalized.with_code(code);
    }
    normalized
}

/// Emit an error and its context to the log.
pub fn log_error(err: &WorkflowError) {
    let context = err
        .context()
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(" ");

    error!(
        kind = %err.kind(),
        code = err.code().unwrap_or("none"),
        workflow_run_id = err.context().get("workflow_run_id").map(String::as_str).unwrap_or("-"),
        step_name = err.context().get("step_name").map(String::as_str).unwrap_or("-"),
        component = err.context().get("component").map(String::as_str).unwrap_or("job_executor"),
        context = %context,
        "{}",
        err.message()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_error_passes_through_unchanged() {
        let original = WorkflowError::notion("page create failed")
            .with_code(codes::FORBIDDEN)
            .with_context("operation", "publish");

        let normalized = standardize_error(
            anyhow::Error::new(original.clone()),
            error_context([("operation", "workflow_execution")]),
        );

        assert_eq!(normalized, original);
        assert_eq!(normalized.context().get("operation").unwrap(), "publish");
    }

    #[test]
    fn test_plain_error_becomes_generic_with_context() {
        let normalized = standardize_error(
            anyhow::anyhow!("something odd"),
            error_context([("operation", "workflow_execution"), ("workflow_run_id", "abc")]),
        );

        assert_eq!(normalized.kind(), ErrorKind::Generic);
        assert_eq!(normalized.message(), "something odd");
        assert_eq!(normalized.code(), None);
        assert_eq!(normalized.context().get("workflow_run_id").unwrap(), "abc");
    }

    #[test]
    fn test_io_timeout_gets_fault_code() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "read timed out");
        let normalized = standardize_error(anyhow::Error::new(io), ErrorContext::new());

        assert_eq!(normalized.kind(), ErrorKind::Generic);
        assert!(normalized.has_code(codes::TIMEOUT));
    }

    #[test]
    fn test_display_is_message() {
        let err = WorkflowError::slack("channel_not_found").with_code(codes::NOT_FOUND);
        assert_eq!(err.to_string(), "channel_not_found");
        assert_eq!(err.kind().to_string(), "slack");
    }
}
