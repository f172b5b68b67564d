//! Error types for the Beacon workflow core.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single problem found while validating a workflow definition.
///
/// The parser never stops at the first problem; callers receive the full
/// batch so an author can fix a definition in one pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationIssue {
    /// Path into the document, e.g. `steps[2].depends_on[0]`.
    pub location: String,

    /// Line number, when the underlying parse error carries one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,

    /// Column number, when the underlying parse error carries one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<usize>,

    /// Human-readable description of the problem.
    pub message: String,
}

impl ValidationIssue {
    /// Create an issue at a document path.
    pub fn at(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            line: None,
            column: None,
            message: message.into(),
        }
    }

    /// Attach a source position.
    pub fn with_position(mut self, line: usize, column: usize) -> Self {
        self.line = Some(line);
        self.column = Some(column);
        self
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.line, self.column) {
            (Some(l), Some(c)) => write!(f, "{} (line {}, col {}): {}", self.location, l, c, self.message),
            _ => write!(f, "{}: {}", self.location, self.message),
        }
    }
}

/// Core errors for workflow parsing, analysis, and execution.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Definition-time validation failure. The full batch is reported and
    /// the run never starts.
    #[error("workflow validation failed with {} issue(s)", .0.len())]
    Validation(Vec<ValidationIssue>),

    /// An expression token could not be resolved against the context.
    /// Fails only the owning step and its dependents.
    #[error("cannot resolve `{token}`: missing key in `{scope}` scope")]
    Resolution { token: String, scope: String },

    /// A condition expression was malformed or used an unsupported
    /// construct.
    #[error("condition evaluation failed: {0}")]
    ConditionEvaluation(String),

    /// The dependency graph contains a cycle. Fatal at validation time.
    #[error("dependency cycle detected: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),

    /// A loop ran past its iteration cap. Fatal for the run and never
    /// retried: it signals a logic or data problem, not transience.
    #[error("step `{step}` exceeded its loop limit of {limit} iterations")]
    LoopLimitExceeded { step: String, limit: u32 },

    /// The host's permission gate denied the run.
    #[error("run denied by permission gate for workflow `{0}`")]
    PermissionDenied(String),

    /// No run with the given id is known to the executor.
    #[error("run not found: {0}")]
    RunNotFound(String),

    /// No workflow with the given id is registered.
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    /// An external collaborator (AI invoker, file-op runner) reported a
    /// failure.
    #[error("collaborator error: {0}")]
    Collaborator(String),

    /// Invariant violation inside the engine itself.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether a step failure with this error may be retried under an
    /// attached retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Collaborator(_))
    }

    /// Convenience constructor for a single-issue validation error.
    pub fn validation(location: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Validation(vec![ValidationIssue::at(location, message)])
    }
}

/// Result type alias using EngineError.
pub type EngineResult<T> = Result<T, EngineError>;
