//! Persistence for workflow runs.
//!
//! The engine needs only create / load / update-by-id on the run record;
//! listing helpers serve the CLI and the worker pool.

pub mod sqlite;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{NewRun, WorkflowRun};

pub use sqlite::SqliteRunStore;

/// Errors raised by a run store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Workflow run not found: {0}")]
    NotFound(Uuid),

    #[error("A run already exists for channel {channel_id} and {key} {value}")]
    Duplicate {
        channel_id: String,
        key: &'static str,
        value: String,
    },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt run record {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("Store connection lock poisoned")]
    Poisoned,

    #[error("Store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Storage for run records
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Create a pending run. Fails with [`StoreError::Duplicate`] when a run
    /// already exists for the trigger's correlation keys.
    async fn create(&self, new_run: NewRun) -> Result<WorkflowRun, StoreError>;

    /// Load a run by id
    async fn load(&self, id: Uuid) -> Result<Option<WorkflowRun>, StoreError>;

    /// Overwrite the stored record with `run`
    async fn update(&self, run: &WorkflowRun) -> Result<(), StoreError>;

    /// Most recently created runs first
    async fn list(&self, limit: usize) -> Result<Vec<WorkflowRun>, StoreError>;

    /// Ids of pending runs, oldest first
    async fn pending(&self, limit: usize) -> Result<Vec<Uuid>, StoreError>;
}
