//! Slack Web API client: captures threads and posts notifications.
//!
//! Slack reports most failures as HTTP 200 with `ok: false` and an error
//! string, so those are classified here as well as transport failures.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;

use super::http::{build_client, send_json};
use super::{Ack, Notifier, Receipt, ThreadCapture, ThreadContent, ThreadMessage, ThreadRef};
use crate::domain::{codes, ErrorKind, WorkflowError};

/// Slack Web API client
pub struct SlackClient {
    /// Bot token (xoxb-...)
    bot_token: String,
    /// API base URL
    api_base: String,
    /// HTTP client
    client: reqwest::Client,
}

/// Common envelope of every Slack Web API response
#[derive(Debug, Deserialize)]
struct SlackResponse<T> {
    ok: bool,
    error: Option<String>,
    #[serde(flatten)]
    body: Option<T>,
}

#[derive(Debug, Deserialize)]
struct RepliesBody {
    #[serde(default)]
    messages: Vec<RawMessage>,
    response_metadata: Option<ResponseMetadata>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    user: Option<String>,
    #[serde(default)]
    text: String,
    ts: String,
}

#[derive(Debug, Deserialize)]
struct ResponseMetadata {
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PostMessageBody {
    channel: Option<String>,
    ts: Option<String>,
}

impl SlackClient {
    pub fn new(bot_token: String, api_base: String, timeout: Duration) -> Result<Self> {
        Ok(Self {
            bot_token,
            api_base: api_base.trim_end_matches('/').to_string(),
            client: build_client(timeout)?,
        })
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/{}", self.api_base, method)
    }

    async fn call<T>(
        &self,
        method: &str,
        request: reqwest::RequestBuilder,
    ) -> std::result::Result<T, WorkflowError>
    where
        T: serde::de::DeserializeOwned,
    {
        let operation = format!("slack.{}", method);
        let response: SlackResponse<T> =
            send_json(ErrorKind::Slack, &operation, request.bearer_auth(&self.bot_token)).await?;

        if !response.ok {
            let error = response.error.unwrap_or_else(|| "unknown_error".to_string());
            return Err(WorkflowError::slack(format!("Slack API error in {}: {}", method, error))
                .with_code(slack_error_code(&error))
                .with_context("operation", operation));
        }

        response.body.ok_or_else(|| {
            WorkflowError::slack(format!("Slack API returned an empty body for {}", method))
                .with_context("operation", operation)
        })
    }
}

/// Map Slack's `error` strings onto fault codes
fn slack_error_code(error: &str) -> &'static str {
    match error {
        "invalid_auth" | "not_authed" | "account_inactive" | "token_revoked" | "token_expired" => {
            codes::UNAUTHORIZED
        }
        "missing_scope" | "not_in_channel" | "restricted_action" | "ekm_access_denied" => {
            codes::FORBIDDEN
        }
        "channel_not_found" | "thread_not_found" | "message_not_found" => codes::NOT_FOUND,
        "ratelimited" => codes::RATE_LIMITED,
        "internal_error" | "fatal_error" | "service_unavailable" => codes::SERVER_ERROR,
        "request_timeout" => codes::TIMEOUT,
        _ => codes::BAD_REQUEST,
    }
}

#[async_trait]
impl ThreadCapture for SlackClient {
    async fn capture(&self, thread: &ThreadRef) -> Result<ThreadContent> {
        let mut messages = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut query = vec![
                ("channel", thread.channel_id.clone()),
                ("ts", thread.thread_ts.clone()),
                ("limit", "200".to_string()),
            ];
            if let Some(ref c) = cursor {
                query.push(("cursor", c.clone()));
            }

            let request = self
                .client
                .get(self.api_url("conversations.replies"))
                .query(&query);
            let page: RepliesBody = self.call("conversations.replies", request).await?;

            messages.extend(page.messages.into_iter().map(|m| ThreadMessage {
                user: m.user,
                text: m.text,
                ts: m.ts,
            }));

            cursor = page
                .response_metadata
                .and_then(|m| m.next_cursor)
                .filter(|c| !c.is_empty());
            if cursor.is_none() {
                break;
            }
        }

        Ok(ThreadContent {
            thread: thread.clone(),
            messages,
        })
    }
}

#[async_trait]
impl Notifier for SlackClient {
    async fn notify(&self, receipt: &Receipt) -> Result<Ack> {
        let text = match &receipt.url {
            Some(url) => format!("Document published: {}", url),
            None => format!("Document published ({})", receipt.document_id),
        };

        let request = self
            .client
            .post(self.api_url("chat.postMessage"))
            .json(&serde_json::json!({
                "channel": receipt.source.channel_id,
                "thread_ts": receipt.source.thread_ts,
                "text": text,
            }));
        let posted: PostMessageBody = self.call("chat.postMessage", request).await?;

        Ok(Ack {
            channel_id: posted
                .channel
                .unwrap_or_else(|| receipt.source.channel_id.clone()),
            message_ts: posted.ts.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slack_error_codes() {
        assert_eq!(slack_error_code("invalid_auth"), codes::UNAUTHORIZED);
        assert_eq!(slack_error_code("missing_scope"), codes::FORBIDDEN);
        assert_eq!(slack_error_code("internal_error"), codes::SERVER_ERROR);
        assert_eq!(slack_error_code("thread_not_found"), codes::NOT_FOUND);
        assert_eq!(slack_error_code("something_new"), codes::BAD_REQUEST);
    }

    #[test]
    fn test_replies_envelope_parsing() {
        let json = r#"{
            "ok": true,
            "messages": [
                {"user": "U1", "text": "hello", "ts": "1.0"},
                {"text": "bot", "ts": "1.1", "bot_id": "B1"}
            ],
            "response_metadata": {"next_cursor": ""}
        }"#;

        let parsed: SlackResponse<RepliesBody> = serde_json::from_str(json).unwrap();
        assert!(parsed.ok);
        let body = parsed.body.unwrap();
        assert_eq!(body.messages.len(), 2);
        assert_eq!(body.messages[1].user, None);
    }

    #[test]
    fn test_error_envelope_parsing() {
        let json = r#"{"ok": false, "error": "not_in_channel"}"#;
        let parsed: SlackResponse<PostMessageBody> = serde_json::from_str(json).unwrap();

        assert!(!parsed.ok);
        assert_eq!(parsed.error.as_deref(), Some("not_in_channel"));
    }

    #[test]
    fn test_api_url_strips_trailing_slash() {
        let client = SlackClient::new(
            "xoxb-test".to_string(),
            "https://slack.com/api/".to_string(),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            client.api_url("chat.postMessage"),
            "https://slack.com/api/chat.postMessage"
        );
    }
}
