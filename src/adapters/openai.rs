//! OpenAI chat-completions client used for the transform step.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;

use super::http::{build_client, send_json};
use super::{Document, DocumentTemplate, DocumentTransformer, ThreadContent};
use crate::domain::{codes, ErrorKind, WorkflowError};

/// OpenAI API client
pub struct OpenAiClient {
    api_key: String,
    api_base: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl OpenAiClient {
    pub fn new(api_key: String, api_base: String, model: String, timeout: Duration) -> Result<Self> {
        Ok(Self {
            api_key,
            api_base: api_base.trim_end_matches('/').to_string(),
            model,
            client: build_client(timeout)?,
        })
    }
}

/// Split model output into a title (first non-empty line) and body
fn split_title(output: &str) -> (String, String) {
    let trimmed = output.trim();
    match trimmed.split_once('\n') {
        Some((first, rest)) => (
            first.trim_start_matches('#').trim().to_string(),
            rest.trim().to_string(),
        ),
        None => (trimmed.trim_start_matches('#').trim().to_string(), String::new()),
    }
}

#[async_trait]
impl DocumentTransformer for OpenAiClient {
    async fn transform(
        &self,
        content: &ThreadContent,
        template: &DocumentTemplate,
    ) -> Result<Document> {
        let operation = "openai.chat.completions";
        let request = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "model": self.model,
                "messages": [
                    {"role": "system", "content": template.prompt},
                    {"role": "user", "content": content.transcript()},
                ],
            }));

        let response: CompletionResponse = send_json(ErrorKind::Openai, operation, request).await?;

        let output = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| {
                WorkflowError::openai("OpenAI returned no completion content")
                    .with_code(codes::BAD_REQUEST)
                    .with_context("operation", operation)
                    .with_context("model", &self.model)
            })?;

        let (title, body) = split_title(&output);
        Ok(Document {
            title,
            body,
            source: content.thread.clone(),
        })
    }
}
