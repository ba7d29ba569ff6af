//! Shared fakes for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use threadflow::core::{Sleeper, StepAction, StepContext};
use threadflow::domain::{codes, NewRun, WorkflowError, WorkflowRun};
use threadflow::store::{RunStore, SqliteRunStore, StoreError};

/// Records requested delays instead of sleeping
#[derive(Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn seconds(&self) -> Vec<f64> {
        self.delays
            .lock()
            .unwrap()
            .iter()
            .map(Duration::as_secs_f64)
            .collect()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.delays.lock().unwrap().push(duration);
    }
}

/// What a scripted step does when it fails
#[derive(Clone, Copy)]
pub enum Fault {
    /// Raw I/O timeout (retryable)
    Timeout,
    /// Slack rejected the credentials (terminal)
    Unauthorized,
    /// OpenAI answered HTTP 429
    RateLimited,
}

impl Fault {
    pub fn error(self) -> anyhow::Error {
        match self {
            Fault::Timeout => anyhow::Error::new(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connection timed out",
            )),
            Fault::Unauthorized => anyhow::Error::new(
                WorkflowError::slack("Slack rejected the token: invalid_auth")
                    .with_code(codes::UNAUTHORIZED),
            ),
            Fault::RateLimited => anyhow::Error::new(
                WorkflowError::openai("openai returned HTTP 429: slow down")
                    .with_code(codes::RATE_LIMITED),
            ),
        }
    }
}

/// Step that fails a fixed number of times, then appends its tag to the
/// input array
pub struct ScriptedStep {
    tag: &'static str,
    failures: usize,
    fault: Fault,
    calls: AtomicUsize,
}

impl ScriptedStep {
    pub fn ok(tag: &'static str) -> Arc<Self> {
        Self::failing(tag, 0, Fault::Timeout)
    }

    pub fn failing(tag: &'static str, failures: usize, fault: Fault) -> Arc<Self> {
        Arc::new(Self {
            tag,
            failures,
            fault,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn always(tag: &'static str, fault: Fault) -> Arc<Self> {
        Self::failing(tag, usize::MAX, fault)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepAction for ScriptedStep {
    async fn execute(&self, _ctx: &StepContext, input: &Value) -> Result<Value> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(self.fault.error());
        }

        let mut trail = input.as_array().cloned().unwrap_or_default();
        trail.push(Value::from(self.tag));
        Ok(Value::Array(trail))
    }
}

pub fn trigger(message_ts: &str) -> NewRun {
    NewRun {
        workflow_name: "thread_to_document".to_string(),
        slack_channel_id: "C024BE91L".to_string(),
        slack_message_id: message_ts.to_string(),
        slack_thread_ts: None,
        template_id: None,
        input_data: Some(Value::Array(vec![])),
    }
}

pub async fn seeded_store(message_ts: &str) -> (Arc<SqliteRunStore>, WorkflowRun) {
    let store = Arc::new(SqliteRunStore::open_in_memory().unwrap());
    let run = store.create(trigger(message_ts)).await.unwrap();
    (store, run)
}

fn busy() -> StoreError {
    StoreError::Database(rusqlite::Error::SqliteFailure(
        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
        Some("database is locked".to_string()),
    ))
}

/// Store that reports SQLITE_BUSY for its first `busy_loads` loads and,
/// optionally, for the nth (1-indexed) update
pub struct BusyStore {
    inner: Arc<SqliteRunStore>,
    busy_loads: usize,
    busy_update: Option<usize>,
    loads: AtomicUsize,
    updates: AtomicUsize,
}

impl BusyStore {
    pub fn new(inner: Arc<SqliteRunStore>, busy_loads: usize) -> Self {
        Self {
            inner,
            busy_loads,
            busy_update: None,
            loads: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
        }
    }

    pub fn failing_update(inner: Arc<SqliteRunStore>, nth: usize) -> Self {
        Self {
            busy_update: Some(nth),
            ..Self::new(inner, 0)
        }
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RunStore for BusyStore {
    async fn create(&self, new_run: NewRun) -> Result<WorkflowRun, StoreError> {
        self.inner.create(new_run).await
    }

    async fn load(&self, id: Uuid) -> Result<Option<WorkflowRun>, StoreError> {
        if self.loads.fetch_add(1, Ordering::SeqCst) < self.busy_loads {
            return Err(busy());
        }
        self.inner.load(id).await
    }

    async fn update(&self, run: &WorkflowRun) -> Result<(), StoreError> {
        let nth = self.updates.fetch_add(1, Ordering::SeqCst) + 1;
        if self.busy_update == Some(nth) {
            return Err(busy());
        }
        self.inner.update(run).await
    }

    async fn list(&self, limit: usize) -> Result<Vec<WorkflowRun>, StoreError> {
        self.inner.list(limit).await
    }

    async fn pending(&self, limit: usize) -> Result<Vec<Uuid>, StoreError> {
        self.inner.pending(limit).await
    }
}
