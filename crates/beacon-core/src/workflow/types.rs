//! Workflow definition types.
//!
//! A workflow is a declarative, step-based definition:
//! - top-level `name`, `description`, `inputs`, `steps`, opaque `uiMetadata`
//! - a closed set of step kinds: script, ai_call, file_op, conditional, loop
//! - explicit `depends_on` edges plus implicit edges inferred from
//!   `${steps.X...}` references
//! - optional per-step `retry_policy`

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Declared type of a workflow input.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    #[default]
    String,
    Number,
    Boolean,
    Array,
    Object,
}

impl InputType {
    /// Whether a JSON value matches this declared type.
    pub fn matches(&self, value: &serde_json::Value) -> bool {
        match self {
            InputType::String => value.is_string(),
            InputType::Number => value.is_number(),
            InputType::Boolean => value.is_boolean(),
            InputType::Array => value.is_array(),
            InputType::Object => value.is_object(),
        }
    }
}

impl std::fmt::Display for InputType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InputType::String => "string",
            InputType::Number => "number",
            InputType::Boolean => "boolean",
            InputType::Array => "array",
            InputType::Object => "object",
        };
        write!(f, "{}", s)
    }
}

/// Declaration of one workflow input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputSpec {
    /// Declared value type.
    #[serde(rename = "type", default)]
    pub input_type: InputType,

    /// Whether the caller must supply a value.
    #[serde(default)]
    pub required: bool,

    /// Default applied when the caller omits the input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

/// Retry policy for a step: bounded attempts with exponential backoff.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt, in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Multiplier applied per subsequent attempt.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Ceiling on the inter-attempt delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before the given attempt (1-based):
    /// `min(initial * multiplier^(attempt-1), max)`.
    pub fn delay_before_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        let raw = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exp);
        let capped = raw.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

/// File operation kinds supported by a `file_op` step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileOpKind {
    Read,
    Write,
    Append,
    Copy,
    Delete,
    List,
}

impl std::fmt::Display for FileOpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FileOpKind::Read => "read",
            FileOpKind::Write => "write",
            FileOpKind::Append => "append",
            FileOpKind::Copy => "copy",
            FileOpKind::Delete => "delete",
            FileOpKind::List => "list",
        };
        write!(f, "{}", s)
    }
}

/// Default loop iteration cap.
pub const DEFAULT_MAX_ITERATIONS: u32 = 100;

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

/// Type-specific step configuration. Closed set: the executor implements
/// one exhaustive case per variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Run an external script inside the sandbox.
    Script {
        /// Script path, relative to the project root.
        script: String,

        /// Per-step timeout override in milliseconds.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },

    /// Invoke the host's AI provider with a resolved prompt.
    AiCall {
        /// Prompt template; may embed `${...}` tokens.
        prompt: String,

        /// Model hint passed through to the invoker.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },

    /// Run a file operation through the host's file-op runner.
    FileOp {
        operation: FileOpKind,

        /// Path, relative to the project root; may embed `${...}` tokens.
        path: String,

        /// Destination path for `copy`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,

        /// Content expression for `write`/`append`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },

    /// Evaluate a condition and schedule exactly one branch.
    Conditional {
        condition: String,

        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        then_steps: Vec<WorkflowStep>,

        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        else_steps: Vec<WorkflowStep>,
    },

    /// Iterate a body over a resolved sequence, bounded by
    /// `max_iterations`.
    Loop {
        /// Iteration source expression: array, object, or numeric range.
        over: String,

        #[serde(default = "default_max_iterations")]
        max_iterations: u32,

        body: Vec<WorkflowStep>,
    },
}

impl StepKind {
    /// Stable name of the variant, matching the definition format.
    pub fn type_name(&self) -> &'static str {
        match self {
            StepKind::Script { .. } => "script",
            StepKind::AiCall { .. } => "ai_call",
            StepKind::FileOp { .. } => "file_op",
            StepKind::Conditional { .. } => "conditional",
            StepKind::Loop { .. } => "loop",
        }
    }
}

/// One unit of work in a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowStep {
    /// Unique step identifier (unique across all nesting levels).
    pub id: String,

    /// Type-specific configuration, tagged by `type`.
    #[serde(flatten)]
    pub kind: StepKind,

    /// Explicit dependencies on same-level sibling steps.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// Named input expressions, resolved at dispatch time.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, serde_json::Value>,

    /// Retry policy for retryable failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
}

impl WorkflowStep {
    /// Nested step lists, if this is a control-flow step.
    pub fn nested_bodies(&self) -> Vec<&[WorkflowStep]> {
        match &self.kind {
            StepKind::Conditional { then_steps, else_steps, .. } => {
                vec![then_steps.as_slice(), else_steps.as_slice()]
            }
            StepKind::Loop { body, .. } => vec![body.as_slice()],
            _ => vec![],
        }
    }

    /// Every string in this step's own inputs and config that may contain
    /// `${...}` tokens. Nested bodies are not included.
    pub fn expression_strings(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for value in self.inputs.values() {
            collect_strings(value, &mut out);
        }
        match &self.kind {
            StepKind::Script { script, .. } => out.push(script),
            StepKind::AiCall { prompt, .. } => out.push(prompt),
            StepKind::FileOp { path, target, content, .. } => {
                out.push(path);
                if let Some(t) = target {
                    out.push(t);
                }
                if let Some(c) = content {
                    out.push(c);
                }
            }
            StepKind::Conditional { condition, .. } => out.push(condition),
            StepKind::Loop { over, .. } => out.push(over),
        }
        out
    }
}

fn collect_strings<'a>(value: &'a serde_json::Value, out: &mut Vec<&'a str>) {
    match value {
        serde_json::Value::String(s) => out.push(s),
        serde_json::Value::Array(items) => {
            for item in items {
                collect_strings(item, out);
            }
        }
        serde_json::Value::Object(map) => {
            for item in map.values() {
                collect_strings(item, out);
            }
        }
        _ => {}
    }
}

/// Complete workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workflow {
    /// Workflow identifier; defaults to `name` when the document omits it.
    pub id: String,

    /// Display name.
    pub name: String,

    /// Description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Declared inputs.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, InputSpec>,

    /// Ordered steps.
    pub steps: Vec<WorkflowStep>,

    /// Opaque editor metadata, preserved verbatim and never interpreted.
    #[serde(
        rename = "uiMetadata",
        default,
        skip_serializing_if = "serde_json::Value::is_null"
    )]
    pub ui_metadata: serde_json::Value,
}

impl Workflow {
    /// Look up a step by id, searching nested bodies too.
    pub fn find_step(&self, id: &str) -> Option<&WorkflowStep> {
        fn search<'a>(steps: &'a [WorkflowStep], id: &str) -> Option<&'a WorkflowStep> {
            for step in steps {
                if step.id == id {
                    return Some(step);
                }
                for body in step.nested_bodies() {
                    if let Some(found) = search(body, id) {
                        return Some(found);
                    }
                }
            }
            None
        }
        search(&self.steps, id)
    }

    /// Every step in definition order, nested bodies included.
    pub fn all_steps(&self) -> Vec<&WorkflowStep> {
        fn walk<'a>(steps: &'a [WorkflowStep], out: &mut Vec<&'a WorkflowStep>) {
            for step in steps {
                out.push(step);
                for body in step.nested_bodies() {
                    walk(body, out);
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.steps, &mut out);
        out
    }

    /// All step ids, nested included.
    pub fn step_ids(&self) -> Vec<&str> {
        self.all_steps().iter().map(|s| s.id.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_backoff_curve() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: 350,
        };

        assert_eq!(policy.delay_before_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_before_attempt(2), Duration::from_millis(200));
        // 400 capped at 350
        assert_eq!(policy.delay_before_attempt(3), Duration::from_millis(350));
        assert_eq!(policy.delay_before_attempt(4), Duration::from_millis(350));
    }

    #[test]
    fn test_input_type_matching() {
        assert!(InputType::String.matches(&serde_json::json!("x")));
        assert!(InputType::Number.matches(&serde_json::json!(3.5)));
        assert!(InputType::Boolean.matches(&serde_json::json!(true)));
        assert!(InputType::Array.matches(&serde_json::json!([1])));
        assert!(!InputType::Object.matches(&serde_json::json!([1])));
    }

    #[test]
    fn test_step_kind_tagged_serialization() {
        let step = WorkflowStep {
            id: "fetch".to_string(),
            kind: StepKind::Script {
                script: "scripts/fetch.py".to_string(),
                timeout_ms: None,
            },
            depends_on: vec![],
            inputs: BTreeMap::new(),
            retry_policy: None,
        };

        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["type"], "script");
        assert_eq!(json["script"], "scripts/fetch.py");

        let back: WorkflowStep = serde_json::from_value(json).unwrap();
        assert_eq!(back, step);
    }

    #[test]
    fn test_expression_strings_cover_config_and_inputs() {
        let mut inputs = BTreeMap::new();
        inputs.insert(
            "payload".to_string(),
            serde_json::json!({"user": "${steps.fetch.outputs.user}"}),
        );

        let step = WorkflowStep {
            id: "notify".to_string(),
            kind: StepKind::AiCall {
                prompt: "Summarize ${steps.fetch.outputs.body}".to_string(),
                model: None,
            },
            depends_on: vec![],
            inputs,
            retry_policy: None,
        };

        let strings = step.expression_strings();
        assert!(strings.contains(&"${steps.fetch.outputs.user}"));
        assert!(strings.contains(&"Summarize ${steps.fetch.outputs.body}"));
    }

    #[test]
    fn test_find_step_searches_nested_bodies() {
        let workflow = Workflow {
            id: "wf".to_string(),
            name: "wf".to_string(),
            description: None,
            inputs: BTreeMap::new(),
            steps: vec![WorkflowStep {
                id: "gate".to_string(),
                kind: StepKind::Conditional {
                    condition: "${workflow.inputs.enabled}".to_string(),
                    then_steps: vec![WorkflowStep {
                        id: "inner".to_string(),
                        kind: StepKind::Script {
                            script: "scripts/x.sh".to_string(),
                            timeout_ms: None,
                        },
                        depends_on: vec![],
                        inputs: BTreeMap::new(),
                        retry_policy: None,
                    }],
                    else_steps: vec![],
                },
                depends_on: vec![],
                inputs: BTreeMap::new(),
                retry_policy: None,
            }],
            ui_metadata: serde_json::Value::Null,
        };

        assert!(workflow.find_step("inner").is_some());
        assert_eq!(workflow.step_ids(), vec!["gate", "inner"]);
    }
}
