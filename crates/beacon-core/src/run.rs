//! Run and step result records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Step lifecycle state.
///
/// `Pending -> Ready -> Running` are live states; the rest are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    /// Whether the step has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::Skipped | StepStatus::Cancelled
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::Ready => "ready",
            StepStatus::Running => "running",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Run lifecycle state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Created => "created",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// One execution attempt of a step, kept for every retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based attempt number.
    pub attempt: u32,

    /// Error message when the attempt failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Attempt duration in milliseconds.
    pub duration_ms: u64,
}

/// Outcome of a single step within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// Step identifier.
    pub step_id: String,

    /// Terminal status.
    pub status: StepStatus,

    /// Step output, present on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,

    /// Error message, present on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Total wall-clock duration across attempts, in milliseconds.
    pub duration_ms: u64,

    /// Per-attempt history.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<AttemptRecord>,
}

impl StepResult {
    /// Create a succeeded result.
    pub fn succeeded(step_id: impl Into<String>, output: serde_json::Value, duration_ms: u64) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Succeeded,
            output: Some(output),
            error: None,
            duration_ms,
            attempts: Vec::new(),
        }
    }

    /// Create a failed result.
    pub fn failed(step_id: impl Into<String>, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Failed,
            output: None,
            error: Some(error.into()),
            duration_ms,
            attempts: Vec::new(),
        }
    }

    /// Create a skipped result with the reason it was skipped.
    pub fn skipped(step_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Skipped,
            output: None,
            error: Some(reason.into()),
            duration_ms: 0,
            attempts: Vec::new(),
        }
    }

    /// Create a cancelled result.
    pub fn cancelled(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Cancelled,
            output: None,
            error: None,
            duration_ms: 0,
            attempts: Vec::new(),
        }
    }

    /// Attach the attempt history.
    pub fn with_attempts(mut self, attempts: Vec<AttemptRecord>) -> Self {
        self.attempts = attempts;
        self
    }
}

/// One execution instance of a workflow.
///
/// Mutated only by the executor while live; immutable once the status is
/// terminal, at which point it is handed to the history store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Unique run identifier.
    pub run_id: String,

    /// Identifier of the workflow that was executed.
    pub workflow_id: String,

    /// Resolved run inputs after defaults were applied.
    pub inputs: serde_json::Value,

    /// When the run was created.
    pub started_at: DateTime<Utc>,

    /// When the run reached a terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    /// Run status.
    pub status: RunStatus,

    /// Ordered step results, in completion order.
    pub step_results: Vec<StepResult>,

    /// For each conditional step, whether the true branch was taken.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub taken_branches: BTreeMap<String, bool>,

    /// For each loop step, how many iterations ran.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub loop_iterations: BTreeMap<String, u32>,
}

impl WorkflowRun {
    /// Create a new run in the `Running` state.
    pub fn new(run_id: impl Into<String>, workflow_id: impl Into<String>, inputs: serde_json::Value) -> Self {
        Self {
            run_id: run_id.into(),
            workflow_id: workflow_id.into(),
            inputs,
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Running,
            step_results: Vec::new(),
            taken_branches: BTreeMap::new(),
            loop_iterations: BTreeMap::new(),
        }
    }

    /// Transition to a terminal status and stamp the finish time.
    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    /// Look up a step result by id.
    pub fn step_result(&self, step_id: &str) -> Option<&StepResult> {
        self.step_results.iter().find(|r| r.step_id == step_id)
    }

    /// Ids of steps that ended `Failed`.
    pub fn failed_steps(&self) -> Vec<&str> {
        self.step_results
            .iter()
            .filter(|r| r.status == StepStatus::Failed)
            .map(|r| r.step_id.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_status_terminal() {
        assert!(!StepStatus::Pending.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
        assert!(StepStatus::Succeeded.is_terminal());
        assert!(StepStatus::Skipped.is_terminal());
        assert!(StepStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_run_finish_stamps_time() {
        let mut run = WorkflowRun::new("r1", "wf1", serde_json::json!({}));
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.finished_at.is_none());

        run.finish(RunStatus::Completed);
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.finished_at.is_some());
    }

    #[test]
    fn test_failed_steps() {
        let mut run = WorkflowRun::new("r1", "wf1", serde_json::json!({}));
        run.step_results.push(StepResult::succeeded("a", serde_json::json!(1), 10));
        run.step_results.push(StepResult::failed("b", "boom", 5));
        run.step_results.push(StepResult::skipped("c", "dependency `b` failed"));

        assert_eq!(run.failed_steps(), vec!["b"]);
        assert_eq!(run.step_result("c").unwrap().status, StepStatus::Skipped);
    }

    #[test]
    fn test_step_result_serialization() {
        let result = StepResult::failed("x", "bad input", 12).with_attempts(vec![AttemptRecord {
            attempt: 1,
            error: Some("bad input".to_string()),
            duration_ms: 12,
        }]);

        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"status\":\"failed\""));
        assert!(json.contains("\"attempt\":1"));
    }
}
