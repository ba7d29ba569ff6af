//! Lifecycle hooks invoked by the orchestrator.

use std::time::Duration;

use tracing::{info, warn};

use crate::domain::{WorkflowError, WorkflowRun};

/// Receives step and run lifecycle events.
///
/// All methods default to no-ops.
pub trait WorkflowObserver: Send + Sync {
    fn step_started(&self, _run: &WorkflowRun, _step_name: &str) {}

    fn step_finished(
        &self,
        _run: &WorkflowRun,
        _step_name: &str,
        _duration: Duration,
        _error: Option<&WorkflowError>,
    ) {
    }

    fn run_finished(&self, _run: &WorkflowRun) {}
}

/// Observer that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl WorkflowObserver for NoopObserver {}

/// Observer that writes each event to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl WorkflowObserver for TracingObserver {
    fn step_started(&self, run: &WorkflowRun, step_name: &str) {
        info!(
            workflow_run_id = %run.id,
            step_name,
            component = "orchestrator",
            "Step started"
        );
    }

    fn step_finished(
        &self,
        run: &WorkflowRun,
        step_name: &str,
        duration: Duration,
        error: Option<&WorkflowError>,
    ) {
        let duration_ms = duration.as_millis() as u64;
        match error {
            None => info!(
                workflow_run_id = %run.id,
                step_name,
                component = "orchestrator",
                duration_ms,
                "Step succeeded"
            ),
            Some(err) => warn!(
                workflow_run_id = %run.id,
                step_name,
                component = "orchestrator",
                duration_ms,
                code = err.code().unwrap_or("none"),
                "Step failed"
            ),
        }
    }

    fn run_finished(&self, run: &WorkflowRun) {
        info!(
            workflow_run_id = %run.id,
            component = "orchestrator",
            status = %run.status,
            steps = run.steps.len(),
            "Run finished"
        );
    }
}
