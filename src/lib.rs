//! threadflow - Slack thread to Notion document workflow engine
//!
//! Turns a Slack conversation thread into a structured Notion document:
//! capture the thread, transform it with OpenAI, publish to Notion, and
//! reply in the thread with the link.
//!
//! # Architecture
//!
//! Two independent retry layers:
//! - Each step call is retried in isolation with exponential backoff
//!   (`core::retry`)
//! - The job system re-runs a whole run, with a fixed wait, only for a
//!   short allow-list of transient faults (`core::job`)
//!
//! Every run is persisted at each transition, with an append-only step log.
//!
//! # Modules
//!
//! - `adapters`: Slack, OpenAI and Notion clients behind collaborator traits
//! - `core`: Retry, Pipeline, Orchestrator, Job and Worker
//! - `domain`: Data structures (WorkflowRun, Outcome, WorkflowError)
//! - `store`: Run persistence (SQLite)
//! - `config`: Configuration and credentials
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Register a run for a Slack message, then execute it
//! threadflow create --channel C024BE91L --message 1712345678.000100
//! threadflow execute <run-id>
//!
//! # Execute every pending run through the worker pool
//! threadflow work
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod store;

// Re-export main types at crate root for convenience
pub use config::{AppConfig, Credentials};
pub use core::{JobExecutor, JobRunner, Orchestrator, Pipeline, RetryExecutor, RetryPolicy};
pub use domain::{Outcome, RunStatus, WorkflowError, WorkflowRun};
pub use store::{RunStore, SqliteRunStore};
