//! Shared HTTP plumbing for the service clients.
//!
//! Maps transport failures and non-success status codes onto classified
//! [`WorkflowError`]s so the retry executor can tell transient faults from
//! terminal ones.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::StatusCode;

use crate::domain::{codes, ErrorKind, WorkflowError};

/// Build a client with a request timeout
pub fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("Failed to build HTTP client")
}

/// Fault code for a non-success HTTP status
pub fn status_code(status: StatusCode) -> &'static str {
    match status {
        StatusCode::UNAUTHORIZED => codes::UNAUTHORIZED,
        StatusCode::FORBIDDEN => codes::FORBIDDEN,
        StatusCode::NOT_FOUND => codes::NOT_FOUND,
        StatusCode::TOO_MANY_REQUESTS => codes::RATE_LIMITED,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => codes::TIMEOUT,
        s if s.is_server_error() => codes::SERVER_ERROR,
        _ => codes::BAD_REQUEST,
    }
}

/// Error for a non-success HTTP response
pub fn status_error(kind: ErrorKind, operation: &str, status: StatusCode, body: &str) -> WorkflowError {
    WorkflowError::new(
        kind,
        format!("{} returned HTTP {}: {}", operation, status.as_u16(), truncate(body, 300)),
    )
    .with_code(status_code(status))
    .with_context("operation", operation)
    .with_context("http_status", status.as_u16())
}

/// Error for a request that never produced a response
pub fn transport_error(kind: ErrorKind, operation: &str, err: &reqwest::Error) -> WorkflowError {
    let code = if err.is_timeout() {
        codes::TIMEOUT
    } else if err.is_connect() {
        codes::CONNECTION_REFUSED
    } else if let Some(status) = err.status() {
        status_code(status)
    } else if err.is_decode() {
        codes::BAD_REQUEST
    } else {
        codes::NETWORK
    };

    WorkflowError::new(kind, format!("{} request failed: {}", operation, err))
        .with_code(code)
        .with_context("operation", operation)
}

/// Send a request and decode a JSON body, classifying every failure
pub async fn send_json<T>(
    kind: ErrorKind,
    operation: &str,
    request: reqwest::RequestBuilder,
) -> std::result::Result<T, WorkflowError>
where
    T: serde::de::DeserializeOwned,
{
    let response = request
        .send()
        .await
        .map_err(|e| transport_error(kind, operation, &e))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(status_error(kind, operation, status, &body));
    }

    response
        .json::<T>()
        .await
        .map_err(|e| transport_error(kind, operation, &e))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::retry::{classify, FailureClass};

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_code(StatusCode::UNAUTHORIZED), codes::UNAUTHORIZED);
        assert_eq!(status_code(StatusCode::FORBIDDEN), codes::FORBIDDEN);
        assert_eq!(status_code(StatusCode::BAD_GATEWAY), codes::SERVER_ERROR);
        assert_eq!(status_code(StatusCode::INTERNAL_SERVER_ERROR), codes::SERVER_ERROR);
        assert_eq!(status_code(StatusCode::GATEWAY_TIMEOUT), codes::TIMEOUT);
        assert_eq!(status_code(StatusCode::UNPROCESSABLE_ENTITY), codes::BAD_REQUEST);
    }

    #[test]
    fn test_server_errors_retry_auth_errors_do_not() {
        let unavailable = status_error(
            ErrorKind::Notion,
            "notion.pages.create",
            StatusCode::SERVICE_UNAVAILABLE,
            "try later",
        );
        let forbidden = status_error(
            ErrorKind::Notion,
            "notion.pages.create",
            StatusCode::FORBIDDEN,
            "no access",
        );

        assert_eq!(classify(&anyhow::Error::new(unavailable)), FailureClass::Retryable);
        assert_eq!(classify(&anyhow::Error::new(forbidden)), FailureClass::Terminal);
    }

    #[test]
    fn test_status_error_message() {
        let err = status_error(ErrorKind::Slack, "slack.chat.postMessage", StatusCode::BAD_GATEWAY, "oops");
        assert_eq!(err.message(), "slack.chat.postMessage returned HTTP 502: oops");
        assert_eq!(err.context().get("http_status").unwrap(), "502");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }
}
