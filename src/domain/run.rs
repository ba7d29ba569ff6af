//! Workflow run record and its state machine.
//!
//! A WorkflowRun is one execution of the pipeline for one captured thread.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// A persisted pipeline execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Unique identifier for this run
    pub id: Uuid,

    /// Which pipeline definition applies
    pub workflow_name: String,

    /// Current status (monotonic once terminal)
    pub status: RunStatus,

    /// Trigger payload handed to the first step
    pub input_data: Option<serde_json::Value>,

    /// Output of the final step (set on completion)
    pub output_data: Option<serde_json::Value>,

    /// Human-readable failure message (set on failure)
    pub error_message: Option<String>,

    /// Append-only step log
    pub steps: Vec<StepLogEntry>,

    /// When the run entered `running`
    pub started_at: Option<DateTime<Utc>>,

    /// When the run entered a terminal status
    pub finished_at: Option<DateTime<Utc>>,

    pub slack_message_id: String,
    pub slack_channel_id: String,
    pub slack_thread_ts: Option<String>,

    /// Template configuration to use (weak reference)
    pub template_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything needed to create a new run record from a trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRun {
    pub workflow_name: String,
    pub slack_channel_id: String,
    pub slack_message_id: String,
    pub slack_thread_ts: Option<String>,
    pub template_id: Option<String>,
    pub input_data: Option<serde_json::Value>,
}

impl WorkflowRun {
    /// Build a pending run from a trigger
    pub fn new(id: Uuid, new_run: NewRun) -> Self {
        let now = Utc::now();
        Self {
            id,
            workflow_name: new_run.workflow_name,
            status: RunStatus::Pending,
            input_data: new_run.input_data,
            output_data: None,
            error_message: None,
            steps: Vec::new(),
            started_at: None,
            finished_at: None,
            slack_message_id: new_run.slack_message_id,
            slack_channel_id: new_run.slack_channel_id,
            slack_thread_ts: new_run.slack_thread_ts,
            template_id: new_run.template_id,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Enter `running`. Re-entering `running` (outer re-attempt) is allowed
    /// and keeps the original `started_at`; steps the interrupted execution
    /// left open are closed as `interrupted`.
    pub fn mark_running(&mut self) -> Result<(), TransitionError> {
        let reentry = self.status == RunStatus::Running;
        self.transition(RunStatus::Running)?;
        if reentry {
            self.close_interrupted_steps();
        }
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn mark_completed(&mut self, output: serde_json::Value) -> Result<(), TransitionError> {
        self.transition(RunStatus::Completed)?;
        self.output_data = Some(output);
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_failed(&mut self, error_message: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(RunStatus::Failed)?;
        self.error_message = Some(error_message.into());
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<(), TransitionError> {
        self.transition(RunStatus::Cancelled)?;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    fn transition(&mut self, to: RunStatus) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Append a `started` entry and return its index
    pub fn start_step(&mut self, name: impl Into<String>) -> usize {
        self.steps.push(StepLogEntry {
            name: name.into(),
            status: StepStatus::Started,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        });
        self.updated_at = Utc::now();
        self.steps.len() - 1
    }

    /// Finalize the entry at `index`. Entries are finalized once.
    pub fn finish_step(&mut self, index: usize, error: Option<String>) {
        if let Some(entry) = self.steps.get_mut(index) {
            if entry.finished_at.is_some() {
                return;
            }
            entry.status = if error.is_some() {
                StepStatus::Failed
            } else {
                StepStatus::Succeeded
            };
            entry.finished_at = Some(Utc::now());
            entry.error = error;
            self.updated_at = Utc::now();
        }
    }

    fn close_interrupted_steps(&mut self) {
        let now = Utc::now();
        for entry in self.steps.iter_mut().filter(|s| s.finished_at.is_none()) {
            entry.status = StepStatus::Interrupted;
            entry.finished_at = Some(now);
        }
    }

    /// Name of the last step that failed, if any
    pub fn failed_step(&self) -> Option<&str> {
        self.steps
            .iter()
            .rev()
            .find(|s| s.status == StepStatus::Failed)
            .map(|s| s.name.as_str())
    }
}

/// Status of a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, not yet picked up
    Pending,

    /// Currently executing
    Running,

    /// All steps succeeded
    Completed,

    /// A step failed terminally
    Failed,

    /// Cancelled before completion
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown run status: {}", other)),
        }
    }
}

/// One entry in a run's step log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepLogEntry {
    pub name: String,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Status of a single step execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Started,
    Succeeded,
    Failed,
    /// Left open by an execution that stopped before finishing it
    Interrupted,
}

/// Attempted to leave a terminal status
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid status transition: {from} -> {to}")]
pub struct TransitionError {
    pub from: RunStatus,
    pub to: RunStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_run() -> WorkflowRun {
        WorkflowRun::new(
            Uuid::new_v4(),
            NewRun {
                workflow_name: "thread_to_notion".to_string(),
                slack_channel_id: "C123".to_string(),
                slack_message_id: "1700000000.000100".to_string(),
                slack_thread_ts: Some("1700000000.000100".to_string()),
                template_id: None,
                input_data: None,
            },
        )
    }

    #[test]
    fn test_run_creation() {
        let run = new_run();

        assert_eq!(run.status, RunStatus::Pending);
        assert!(run.started_at.is_none());
        assert!(run.finished_at.is_none());
        assert!(run.steps.is_empty());
    }

    #[test]
    fn test_finished_at_tracks_terminal_status() {
        let mut run = new_run();
        run.mark_running().unwrap();
        assert!(run.started_at.is_some());
        assert!(run.finished_at.is_none());

        run.mark_completed(serde_json::json!({"ok": true})).unwrap();
        assert!(run.is_terminal());
        assert!(run.finished_at.is_some());
    }

    #[test]
    fn test_terminal_status_is_final() {
        let mut run = new_run();
        run.mark_running().unwrap();
        run.mark_failed("boom").unwrap();
        let finished_at = run.finished_at;

        let err = run.mark_running().unwrap_err();
        assert_eq!(err.from, RunStatus::Failed);
        assert!(run.mark_completed(serde_json::Value::Null).is_err());
        assert!(run.cancel().is_err());
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.finished_at, finished_at);
    }

    #[test]
    fn test_rerunning_keeps_started_at() {
        let mut run = new_run();
        run.mark_running().unwrap();
        let started_at = run.started_at;

        run.mark_running().unwrap();
        assert_eq!(run.started_at, started_at);
    }

    #[test]
    fn test_reentry_closes_open_steps() {
        let mut run = new_run();
        run.mark_running().unwrap();
        let done = run.start_step("capture");
        run.finish_step(done, None);
        run.start_step("transform");

        run.mark_running().unwrap();

        assert_eq!(run.steps.len(), 2);
        assert_eq!(run.steps[0].status, StepStatus::Succeeded);
        assert_eq!(run.steps[1].status, StepStatus::Interrupted);
        assert!(run.steps[1].finished_at.is_some());
        assert!(run.steps[1].error.is_none());
        assert_eq!(run.failed_step(), None);
    }

    #[test]
    fn test_step_log_is_append_only() {
        let mut run = new_run();
        let first = run.start_step("capture");
        run.finish_step(first, None);
        let second = run.start_step("transform");
        run.finish_step(second, Some("bad gateway".to_string()));

        // A finalized entry is not rewritten
        run.finish_step(first, Some("late".to_string()));

        assert_eq!(run.steps.len(), 2);
        assert_eq!(run.steps[0].status, StepStatus::Succeeded);
        assert!(run.steps[0].error.is_none());
        assert_eq!(run.steps[1].status, StepStatus::Failed);
        assert_eq!(run.failed_step(), Some("transform"));
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
    }
}
