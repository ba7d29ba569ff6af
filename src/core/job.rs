//! Job-level supervision of workflow runs.
//!
//! [`JobExecutor`] is the entry point the job system calls with a run id.
//! [`JobRunner`] is the job system's own retry loop: it re-invokes the whole
//! chain, with a fixed wait and a small attempt budget, for a short
//! allow-list of transient faults. That budget is independent of the
//! per-step retries spent inside the orchestrator.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::domain::{
    codes, error_context, log_error, standardize_error, Outcome, WorkflowError, WorkflowRun,
};
use crate::store::RunStore;

use super::orchestrator::Orchestrator;
use super::retry::{Sleeper, TokioSleeper};

const OPERATION: &str = "workflow_execution";

/// Loads a run and drives it through the orchestrator
pub struct JobExecutor {
    store: Arc<dyn RunStore>,
    orchestrator: Orchestrator,
}

impl JobExecutor {
    pub fn new(store: Arc<dyn RunStore>, orchestrator: Orchestrator) -> Self {
        Self {
            store,
            orchestrator,
        }
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// Execute the run with id `run_id`.
    ///
    /// Every error returned from here has been normalized and logged exactly
    /// once.
    pub async fn perform(&self, run_id: Uuid) -> Result<WorkflowRun, WorkflowError> {
        let context = || {
            error_context([
                ("operation", OPERATION.to_string()),
                ("workflow_run_id", run_id.to_string()),
            ])
        };

        let mut run = match self.store.load(run_id).await {
            Ok(Some(run)) => run,
            Ok(None) => {
                let err = WorkflowError::generic(format!("Workflow run {} not found", run_id))
                    .with_code(codes::RUN_NOT_FOUND)
                    .with_context_map(context());
                log_error(&err);
                return Err(err);
            }
            Err(e) => {
                let err = standardize_error(e.into(), context());
                log_error(&err);
                return Err(err);
            }
        };

        if run.is_terminal() {
            info!(
                workflow_run_id = %run_id,
                status = %run.status,
                component = "job_executor",
                "Run already finished, nothing to do"
            );
            return Ok(run);
        }

        let span = tracing::info_span!("workflow_run", workflow_run_id = %run_id);
        let outcome = self
            .orchestrator
            .execute_workflow(&mut run)
            .instrument(span)
            .await;

        let err = match outcome {
            Ok(Outcome::Success { data, .. }) => return Ok(data),
            Ok(Outcome::Failure { error, .. }) => standardize_error(error.into(), context()),
            Err(unexpected) => standardize_error(unexpected, context()),
        };

        log_error(&err);
        Err(err)
    }
}

/// Outer, whole-run retry policy of the job system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRetryPolicy {
    /// Total executions, including the first
    #[serde(default = "default_job_attempts")]
    pub max_attempts: u32,

    /// Fixed wait between executions, in seconds
    #[serde(default = "default_job_wait")]
    pub wait_seconds: u64,

    /// Error codes that warrant re-running the job
    #[serde(default = "default_retry_on")]
    pub retry_on: Vec<String>,
}

fn default_job_attempts() -> u32 {
    3
}
fn default_job_wait() -> u64 {
    5
}
fn default_retry_on() -> Vec<String> {
    [
        codes::TIMEOUT,
        codes::CONNECTION_RESET,
        codes::CONNECTION_REFUSED,
        codes::NETWORK,
        codes::STORAGE_TIMEOUT,
    ]
    .iter()
    .map(|c| c.to_string())
    .collect()
}

impl Default for JobRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_job_attempts(),
            wait_seconds: default_job_wait(),
            retry_on: default_retry_on(),
        }
    }
}

impl JobRetryPolicy {
    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_seconds)
    }

    /// Whether the job system should run the job again after `attempt`
    /// (1-indexed) failed with `err`
    pub fn should_retry(&self, attempt: u32, err: &WorkflowError) -> bool {
        attempt < self.max_attempts
            && err
                .code()
                .map(|code| self.retry_on.iter().any(|c| c == code))
                .unwrap_or(false)
    }
}

/// The job system's retry loop around [`JobExecutor::perform`]
#[derive(Clone)]
pub struct JobRunner {
    executor: Arc<JobExecutor>,
    policy: JobRetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl JobRunner {
    pub fn new(executor: Arc<JobExecutor>, policy: JobRetryPolicy) -> Self {
        Self {
            executor,
            policy,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn executor(&self) -> &Arc<JobExecutor> {
        &self.executor
    }

    /// Run the job, re-running it on allow-listed transient faults
    pub async fn run(&self, run_id: Uuid) -> Result<WorkflowRun, WorkflowError> {
        let mut attempt = 1u32;

        loop {
            match self.executor.perform(run_id).await {
                Ok(run) => return Ok(run),
                Err(err) if self.policy.should_retry(attempt, &err) => {
                    warn!(
                        workflow_run_id = %run_id,
                        component = "job_runner",
                        attempt,
                        code = err.code().unwrap_or("none"),
                        wait_secs = self.policy.wait_seconds,
                        "Job failed with a transient fault, re-running"
                    );
                    self.sleeper.sleep(self.policy.wait()).await;
                    attempt += 1;
                }
                Err(err) => {
                    warn!(
                        workflow_run_id = %run_id,
                        component = "job_runner",
                        attempt,
                        "Job failed permanently"
                    );
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_job_policy() {
        let policy = JobRetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.wait(), Duration::from_secs(5));
        assert!(policy.retry_on.iter().any(|c| c == codes::STORAGE_TIMEOUT));
    }

    #[test]
    fn test_should_retry_respects_allow_list_and_budget() {
        let policy = JobRetryPolicy::default();
        let transient = WorkflowError::generic("db busy").with_code(codes::STORAGE_TIMEOUT);
        let exhausted = WorkflowError::slack("Operation failed after 3 retries: timeout")
            .with_code(codes::RETRIES_EXHAUSTED);
        let uncoded = WorkflowError::generic("???");

        assert!(policy.should_retry(1, &transient));
        assert!(policy.should_retry(2, &transient));
        assert!(!policy.should_retry(3, &transient));
        assert!(!policy.should_retry(1, &exhausted));
        assert!(!policy.should_retry(1, &uncoded));
    }

    #[test]
    fn test_job_policy_yaml() {
        let policy: JobRetryPolicy =
            serde_yaml::from_str("max_attempts: 2\nretry_on: [timeout]").unwrap();
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.wait_seconds, 5);
        assert_eq!(policy.retry_on, vec!["timeout".to_string()]);
    }
}
