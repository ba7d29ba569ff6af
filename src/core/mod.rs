//! Core orchestration logic.
//!
//! This module contains:
//! - Retry: per-call retry policy and executor
//! - Pipeline: step definitions and the standard pipeline
//! - Orchestrator: drives a run through the pipeline
//! - Job: outer supervision and the job-level retry loop
//! - Worker: bounded pool draining a queue of runs

pub mod job;
pub mod observer;
pub mod orchestrator;
pub mod pipeline;
pub mod retry;
pub mod worker;

// Re-export commonly used types
pub use job::{JobExecutor, JobRetryPolicy, JobRunner};
pub use observer::{NoopObserver, TracingObserver, WorkflowObserver};
pub use orchestrator::Orchestrator;
pub use pipeline::{
    Collaborators, Pipeline, PipelineStep, StepAction, StepContext, StepPolicies,
    TemplateRegistry, STEP_CAPTURE, STEP_NOTIFY, STEP_PUBLISH, STEP_TRANSFORM,
};
pub use retry::{classify, FailureClass, RetryExecutor, RetryPolicy, Sleeper, TokioSleeper};
pub use worker::{PoolReport, WorkerPool};
