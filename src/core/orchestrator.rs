//! Main orchestrator for pipeline execution.
//!
//! Drives a run through the pipeline's steps in order, retrying each step
//! call in isolation, recording progress on the run's step log, and
//! persisting the run at every transition.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::domain::{codes, Outcome, WorkflowError, WorkflowRun};
use crate::store::RunStore;

use super::observer::{TracingObserver, WorkflowObserver};
use super::pipeline::{Pipeline, PipelineStep, StepContext};
use super::retry::{RetryExecutor, Sleeper, TokioSleeper};

/// Main pipeline orchestrator
pub struct Orchestrator {
    pipeline: Pipeline,
    store: Arc<dyn RunStore>,
    observer: Arc<dyn WorkflowObserver>,
    sleeper: Arc<dyn Sleeper>,
}

impl Orchestrator {
    /// Create a new orchestrator
    pub fn new(pipeline: Pipeline, store: Arc<dyn RunStore>) -> Self {
        Self {
            pipeline,
            store,
            observer: Arc::new(TracingObserver),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn WorkflowObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Replace the sleeper used between step retries
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Execute the pipeline for `run`.
    ///
    /// Expected failures (a step failing after its retries) come back as
    /// `Outcome::Failure` with the run already marked failed and persisted.
    /// `Err` is reserved for unexpected faults such as a store write failing.
    #[instrument(skip(self, run), fields(workflow_run_id = %run.id, pipeline = %self.pipeline.name))]
    pub async fn execute_workflow(&self, run: &mut WorkflowRun) -> Result<Outcome<WorkflowRun>> {
        if run.is_terminal() {
            warn!(status = %run.status, "Refusing to execute a finished run");
            return Ok(Outcome::failure(
                WorkflowError::generic(format!(
                    "Workflow run {} is already {}",
                    run.id, run.status
                ))
                .with_code(codes::RUN_ALREADY_FINISHED)
                .with_context("workflow_run_id", run.id),
            )
            .with_metadata("status", run.status.as_str()));
        }

        info!("Starting pipeline execution");
        run.mark_running()?;
        self.persist(run).await?;

        let mut carried = run.input_data.clone().unwrap_or(Value::Null);

        for step in &self.pipeline.steps {
            match self.execute_step(run, step, &carried).await? {
                Ok(output) => carried = output,
                Err(err) => return self.fail_run(run, step, err).await,
            }
        }

        self.complete_run(run, carried).await
    }

    /// Run one step under its retry policy and record the result on the
    /// step log. The outer `Result` carries persistence failures.
    async fn execute_step(
        &self,
        run: &mut WorkflowRun,
        step: &PipelineStep,
        input: &Value,
    ) -> Result<std::result::Result<Value, WorkflowError>> {
        let entry = run.start_step(&step.name);
        self.persist(run).await?;
        self.observer.step_started(run, &step.name);

        let ctx = StepContext::for_run(run, &step.name);
        let retry = RetryExecutor::with_sleeper(step.retry_policy.clone(), self.sleeper.clone());
        let step_start = Instant::now();

        let result = retry
            .retry_with(&step.name, || step.action.execute(&ctx, input))
            .await
            .map_err(|e| {
                e.with_context("step_name", &step.name)
                    .with_context("workflow_run_id", run.id)
                    .with_context("component", "orchestrator")
            });

        run.finish_step(entry, result.as_ref().err().map(|e| e.message().to_string()));
        self.observer
            .step_finished(run, &step.name, step_start.elapsed(), result.as_ref().err());

        Ok(result)
    }

    /// Mark the run failed, persist it, and return the failure outcome
    async fn fail_run(
        &self,
        run: &mut WorkflowRun,
        step: &PipelineStep,
        err: WorkflowError,
    ) -> Result<Outcome<WorkflowRun>> {
        info!(step_name = %step.name, status = "failed", "Run stopped at failed step");

        run.mark_failed(err.message())?;
        self.persist(run).await?;
        self.observer.run_finished(run);

        Ok(Outcome::failure(err)
            .with_metadata("failed_step", step.name.as_str())
            .with_metadata("steps_executed", run.steps.len()))
    }

    /// Complete a successful run
    async fn complete_run(&self, run: &mut WorkflowRun, output: Value) -> Result<Outcome<WorkflowRun>> {
        info!("Run completed successfully");

        run.mark_completed(output)?;
        self.persist(run).await?;
        self.observer.run_finished(run);

        let steps_executed = run.steps.len();
        Ok(Outcome::success(run.clone()).with_metadata("steps_executed", steps_executed))
    }

    async fn persist(&self, run: &WorkflowRun) -> Result<()> {
        self.store
            .update(run)
            .await
            .with_context(|| format!("Failed to persist workflow run {}", run.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pipeline::StepAction;
    use crate::core::retry::RetryPolicy;
    use crate::domain::{NewRun, RunStatus, StepStatus};
    use crate::store::SqliteRunStore;
    use async_trait::async_trait;

    struct Upper;

    #[async_trait]
    impl StepAction for Upper {
        async fn execute(&self, _ctx: &StepContext, input: &Value) -> Result<Value> {
            Ok(Value::from(input.as_str().unwrap_or_default().to_uppercase()))
        }
    }

    #[tokio::test]
    async fn test_output_is_carried_between_steps() {
        let store = Arc::new(SqliteRunStore::open_in_memory().unwrap());
        let mut run = store
            .create(NewRun {
                workflow_name: "shout".to_string(),
                slack_channel_id: "C1".to_string(),
                slack_message_id: "1.0".to_string(),
                slack_thread_ts: None,
                template_id: None,
                input_data: Some(Value::from("hello")),
            })
            .await
            .unwrap();

        let pipeline = Pipeline::new(
            "shout",
            vec![PipelineStep::new("upper", RetryPolicy::no_retry(), Arc::new(Upper))],
        );
        let orchestrator = Orchestrator::new(pipeline, store.clone());

        let outcome = orchestrator.execute_workflow(&mut run).await.unwrap();

        assert!(outcome.is_success());
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.output_data, Some(Value::from("HELLO")));
        assert_eq!(run.steps[0].status, StepStatus::Succeeded);

        let stored = store.load(run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Completed);
        assert_eq!(stored.output_data, run.output_data);
        assert_eq!(stored.steps, run.steps);
        assert_eq!(stored.finished_at, run.finished_at);
    }
}
