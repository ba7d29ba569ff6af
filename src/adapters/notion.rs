//! Notion API client used for the publish step.
//!
//! Documents become pages in a database; the destination is the database id.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;

use super::http::{build_client, send_json};
use super::{Document, DocumentPublisher, Receipt};
use crate::domain::ErrorKind;

/// Notion rejects rich-text objects longer than this
const MAX_TEXT_CHARS: usize = 2000;

/// Notion caps the number of children per request
const MAX_BLOCKS: usize = 100;

/// Notion API client
pub struct NotionClient {
    api_key: String,
    api_base: String,
    api_version: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct PageResponse {
    id: String,
    url: Option<String>,
}

impl NotionClient {
    pub fn new(
        api_key: String,
        api_base: String,
        api_version: String,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            api_key,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_version,
            client: build_client(timeout)?,
        })
    }
}

/// Split text into paragraph chunks Notion accepts
fn chunk_text(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    for paragraph in text.split("\n\n").filter(|p| !p.trim().is_empty()) {
        let chars: Vec<char> = paragraph.chars().collect();
        for piece in chars.chunks(MAX_TEXT_CHARS) {
            chunks.push(piece.iter().collect());
        }
    }
    chunks.truncate(MAX_BLOCKS);
    chunks
}

fn paragraph_blocks(body: &str) -> Vec<serde_json::Value> {
    chunk_text(body)
        .into_iter()
        .map(|chunk| {
            serde_json::json!({
                "object": "block",
                "type": "paragraph",
                "paragraph": {
                    "rich_text": [{"type": "text", "text": {"content": chunk}}]
                }
            })
        })
        .collect()
}

#[async_trait]
impl DocumentPublisher for NotionClient {
    async fn publish(&self, document: &Document, destination: &str) -> Result<Receipt> {
        let title: String = document.title.chars().take(MAX_TEXT_CHARS).collect();
        let request = self
            .client
            .post(format!("{}/pages", self.api_base))
            .bearer_auth(&self.api_key)
            .header("Notion-Version", &self.api_version)
            .json(&serde_json::json!({
                "parent": {"database_id": destination},
                "properties": {
                    "title": {"title": [{"type": "text", "text": {"content": title}}]}
                },
                "children": paragraph_blocks(&document.body),
            }));

        let page: PageResponse = send_json(ErrorKind::Notion, "notion.pages.create", request).await?;

        Ok(Receipt {
            document_id: page.id,
            url: page.url,
            source: document.source.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunking_splits_paragraphs_and_long_text() {
        let long = "x".repeat(MAX_TEXT_CHARS + 10);
        let body = format!("first\n\n{}\n\n\n\nlast", long);

        let chunks = chunk_text(&body);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0], "first");
        assert_eq!(chunks[1].chars().count(), MAX_TEXT_CHARS);
        assert_eq!(chunks[2].chars().count(), 10);
    }

    #[test]
    fn test_block_shape() {
        let blocks = paragraph_blocks("hello");
        assert_eq!(blocks.len(), 1);
        assert_eq!(
            blocks[0]["paragraph"]["rich_text"][0]["text"]["content"],
            "hello"
        );
    }
}
