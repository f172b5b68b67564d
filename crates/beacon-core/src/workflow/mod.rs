//! Workflow definitions: types, parsing, and serialization.

pub mod parser;
pub mod types;

pub use parser::{parse_workflow, serialize_workflow};
pub use types::{
    FileOpKind, InputSpec, InputType, RetryPolicy, StepKind, Workflow, WorkflowStep,
};
