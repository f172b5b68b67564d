//! Beacon workflow core.
//!
//! The definition side of the engine: parsing and serializing workflow
//! documents, resolving `${...}` expressions, evaluating safe boolean
//! conditions, and analyzing the step dependency graph into concurrent
//! execution waves. Execution itself lives in `beacon-engine`.

pub mod context;
pub mod error;
pub mod expr;
pub mod graph;
pub mod run;
pub mod workflow;

pub use context::{ExecutionContext, LoopFrame};
pub use error::{EngineError, EngineResult, ValidationIssue};
pub use expr::ConditionEvaluator;
pub use graph::{analyze, WavePlan};
pub use run::{AttemptRecord, RunStatus, StepResult, StepStatus, WorkflowRun};
pub use workflow::{
    parse_workflow, serialize_workflow, FileOpKind, InputSpec, InputType, RetryPolicy, StepKind,
    Workflow, WorkflowStep,
};
