//! Domain types for the threadflow engine.
//!
//! This module contains the core data structures:
//! - WorkflowRun: the persisted run record and its state machine
//! - Outcome: success/failure value returned by the orchestrator
//! - WorkflowError: the error taxonomy and normalizer

pub mod error;
pub mod outcome;
pub mod run;

// Re-export commonly used types
pub use error::{
    codes, error_context, log_error, standardize_error, ErrorContext, ErrorKind, WorkflowError,
};
pub use outcome::{Metadata, Outcome};
pub use run::{NewRun, RunStatus, StepLogEntry, StepStatus, TransitionError, WorkflowRun};
