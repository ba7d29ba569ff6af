//! Collaborator interfaces for external services.
//!
//! The engine sees each service only through one narrow capability:
//! capture a thread, transform it into a document, publish the document,
//! notify the thread. Concrete HTTP clients live in the submodules.

pub mod http;
pub mod notion;
pub mod openai;
pub mod slack;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use notion::NotionClient;
pub use openai::OpenAiClient;
pub use slack::SlackClient;

/// Location of a conversation thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadRef {
    pub channel_id: String,
    pub thread_ts: String,
}

/// A single message captured from a thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadMessage {
    pub user: Option<String>,
    pub text: String,
    pub ts: String,
}

/// Captured thread content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadContent {
    pub thread: ThreadRef,
    pub messages: Vec<ThreadMessage>,
}

impl ThreadContent {
    /// Render the thread as a plain transcript, one message per line
    pub fn transcript(&self) -> String {
        self.messages
            .iter()
            .map(|m| match &m.user {
                Some(user) => format!("{}: {}", user, m.text),
                None => m.text.clone(),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Template driving the transform and publish steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentTemplate {
    /// Template identifier (matches `WorkflowRun::template_id`)
    pub id: String,

    /// System prompt for the transformation
    pub prompt: String,

    /// Where documents built from this template are published
    pub destination: String,
}

/// A generated document, still linked to its source thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub title: String,
    pub body: String,
    pub source: ThreadRef,
}

/// Proof that a document was published
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub document_id: String,
    pub url: Option<String>,
    pub source: ThreadRef,
}

/// Acknowledgement that the thread was notified
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub channel_id: String,
    pub message_ts: String,
}

/// Fetch the content of a thread
#[async_trait]
pub trait ThreadCapture: Send + Sync {
    async fn capture(&self, thread: &ThreadRef) -> Result<ThreadContent>;
}

/// Turn captured content into a document
#[async_trait]
pub trait DocumentTransformer: Send + Sync {
    async fn transform(&self, content: &ThreadContent, template: &DocumentTemplate)
        -> Result<Document>;
}

/// Publish a document to a destination
#[async_trait]
pub trait DocumentPublisher: Send + Sync {
    async fn publish(&self, document: &Document, destination: &str) -> Result<Receipt>;
}

/// Tell the source thread where the document went
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, receipt: &Receipt) -> Result<Ack>;
}
