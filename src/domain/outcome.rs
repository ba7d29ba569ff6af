//! Two-variant success/failure value used on expected failure paths.

use serde_json::{Map, Value};

use super::error::WorkflowError;

/// Free-form metadata attached to an outcome
pub type Metadata = Map<String, Value>;

/// Outcome of a workflow operation.
///
/// A success always carries data and never an error; a failure always
/// carries an error and never data.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Success { data: T, metadata: Metadata },
    Failure { error: WorkflowError, metadata: Metadata },
}

impl<T> Outcome<T> {
    pub fn success(data: T) -> Self {
        Self::Success {
            data,
            metadata: Metadata::new(),
        }
    }

    pub fn failure(error: WorkflowError) -> Self {
        Self::Failure {
            error,
            metadata: Metadata::new(),
        }
    }

    /// Attach a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        match &mut self {
            Self::Success { metadata, .. } | Self::Failure { metadata, .. } => {
                metadata.insert(key.into(), value.into());
            }
        }
        self
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn is_failure(&self) -> bool {
        !self.is_success()
    }

    pub fn data(&self) -> Option<&T> {
        match self {
            Self::Success { data, .. } => Some(data),
            Self::Failure { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&WorkflowError> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { error, .. } => Some(error),
        }
    }

    pub fn metadata(&self) -> &Metadata {
        match self {
            Self::Success { metadata, .. } | Self::Failure { metadata, .. } => metadata,
        }
    }

    /// Drop the metadata and convert into a standard `Result`
    pub fn into_result(self) -> Result<T, WorkflowError> {
        match self {
            Self::Success { data, .. } => Ok(data),
            Self::Failure { error, .. } => Err(error),
        }
    }
}

impl<T> From<Result<T, WorkflowError>> for Outcome<T> {
    fn from(result: Result<T, WorkflowError>) -> Self {
        match result {
            Ok(data) => Self::success(data),
            Err(error) => Self::failure(error),
        }
    }
}
