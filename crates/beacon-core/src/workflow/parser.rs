//! Workflow definition parser.
//!
//! Parses YAML definitions into [`Workflow`] structures. Parsing never
//! fails fast: a structurally readable document is walked fully and every
//! detectable problem is reported in one batch, so an author can fix a
//! definition in a single pass.
//!
//! Serialization is the inverse operation: `parse(serialize(parse(x)))`
//! is semantically equal to `parse(x)`, step order and `uiMetadata`
//! included.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::{EngineError, EngineResult, ValidationIssue};
use crate::expr::resolver;
use crate::workflow::types::{
    FileOpKind, InputSpec, InputType, RetryPolicy, StepKind, Workflow, WorkflowStep,
    DEFAULT_MAX_ITERATIONS,
};

/// Parse a YAML string into a validated workflow.
pub fn parse_workflow(text: &str) -> EngineResult<Workflow> {
    let yaml: serde_yaml::Value = match serde_yaml::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            let mut issue = ValidationIssue::at("document", e.to_string());
            if let Some(loc) = e.location() {
                issue = issue.with_position(loc.line(), loc.column());
            }
            return Err(EngineError::Validation(vec![issue]));
        }
    };

    let doc: serde_json::Value = match serde_json::to_value(&yaml) {
        Ok(v) => v,
        Err(e) => {
            return Err(EngineError::validation("document", e.to_string()));
        }
    };

    let mut issues = Vec::new();
    let workflow = build_workflow(&doc, &mut issues);

    if let Some(workflow) = &workflow {
        validate_workflow(workflow, &mut issues);
    }

    match (workflow, issues.is_empty()) {
        (Some(workflow), true) => Ok(workflow),
        (_, _) => Err(EngineError::Validation(issues)),
    }
}

/// Serialize a workflow back to YAML.
pub fn serialize_workflow(workflow: &Workflow) -> EngineResult<String> {
    serde_yaml::to_string(workflow).map_err(|e| EngineError::Internal(e.to_string()))
}

// ============================================================================
// Document walk
// ============================================================================

fn build_workflow(doc: &serde_json::Value, issues: &mut Vec<ValidationIssue>) -> Option<Workflow> {
    let root = match doc.as_object() {
        Some(map) => map,
        None => {
            issues.push(ValidationIssue::at("document", "workflow must be a mapping"));
            return None;
        }
    };

    let name = match root.get("name").and_then(|v| v.as_str()) {
        Some(n) if !n.is_empty() => n.to_string(),
        _ => {
            issues.push(ValidationIssue::at("name", "missing or empty `name`"));
            String::new()
        }
    };

    let id = match root.get("id") {
        None => name.clone(),
        Some(serde_json::Value::String(s)) if !s.is_empty() => s.clone(),
        Some(_) => {
            issues.push(ValidationIssue::at("id", "`id` must be a non-empty string"));
            name.clone()
        }
    };

    let description = match root.get("description") {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(_) => {
            issues.push(ValidationIssue::at("description", "`description` must be a string"));
            None
        }
    };

    let inputs = build_inputs(root.get("inputs"), issues);

    let steps = match root.get("steps") {
        Some(serde_json::Value::Array(items)) if !items.is_empty() => {
            build_steps("steps", items, issues)
        }
        Some(serde_json::Value::Array(_)) => {
            issues.push(ValidationIssue::at("steps", "`steps` must not be empty"));
            Vec::new()
        }
        _ => {
            issues.push(ValidationIssue::at("steps", "missing `steps` array"));
            Vec::new()
        }
    };

    let ui_metadata = root
        .get("uiMetadata")
        .cloned()
        .unwrap_or(serde_json::Value::Null);

    for key in root.keys() {
        if !matches!(
            key.as_str(),
            "id" | "name" | "description" | "inputs" | "steps" | "uiMetadata"
        ) {
            issues.push(ValidationIssue::at(key, "unknown top-level field"));
        }
    }

    Some(Workflow {
        id,
        name,
        description,
        inputs,
        steps,
        ui_metadata,
    })
}

fn build_inputs(
    value: Option<&serde_json::Value>,
    issues: &mut Vec<ValidationIssue>,
) -> BTreeMap<String, InputSpec> {
    let mut out = BTreeMap::new();
    let map = match value {
        None | Some(serde_json::Value::Null) => return out,
        Some(serde_json::Value::Object(map)) => map,
        Some(_) => {
            issues.push(ValidationIssue::at("inputs", "`inputs` must be a mapping"));
            return out;
        }
    };

    for (name, spec) in map {
        let location = format!("inputs.{name}");
        let spec_map = match spec.as_object() {
            Some(m) => m,
            None => {
                issues.push(ValidationIssue::at(&location, "input spec must be a mapping"));
                continue;
            }
        };

        let input_type = match spec_map.get("type") {
            None => InputType::default(),
            Some(serde_json::Value::String(s)) => match parse_input_type(s) {
                Some(t) => t,
                None => {
                    issues.push(ValidationIssue::at(
                        format!("{location}.type"),
                        format!("unknown input type `{s}`"),
                    ));
                    InputType::default()
                }
            },
            Some(_) => {
                issues.push(ValidationIssue::at(
                    format!("{location}.type"),
                    "`type` must be a string",
                ));
                InputType::default()
            }
        };

        let required = match spec_map.get("required") {
            None => false,
            Some(serde_json::Value::Bool(b)) => *b,
            Some(_) => {
                issues.push(ValidationIssue::at(
                    format!("{location}.required"),
                    "`required` must be a boolean",
                ));
                false
            }
        };

        let default = spec_map.get("default").cloned();
        if let Some(default) = &default {
            if !default.is_null() && !input_type.matches(default) {
                issues.push(ValidationIssue::at(
                    format!("{location}.default"),
                    format!("default does not match declared type `{input_type}`"),
                ));
            }
        }

        out.insert(
            name.clone(),
            InputSpec {
                input_type,
                required,
                default,
            },
        );
    }

    out
}

fn parse_input_type(s: &str) -> Option<InputType> {
    match s {
        "string" => Some(InputType::String),
        "number" => Some(InputType::Number),
        "boolean" => Some(InputType::Boolean),
        "array" => Some(InputType::Array),
        "object" => Some(InputType::Object),
        _ => None,
    }
}

fn build_steps(
    location: &str,
    items: &[serde_json::Value],
    issues: &mut Vec<ValidationIssue>,
) -> Vec<WorkflowStep> {
    let mut steps = Vec::new();
    for (index, item) in items.iter().enumerate() {
        let step_location = format!("{location}[{index}]");
        if let Some(step) = build_step(&step_location, item, issues) {
            steps.push(step);
        }
    }
    steps
}

fn build_step(
    location: &str,
    value: &serde_json::Value,
    issues: &mut Vec<ValidationIssue>,
) -> Option<WorkflowStep> {
    let map = match value.as_object() {
        Some(m) => m,
        None => {
            issues.push(ValidationIssue::at(location, "step must be a mapping"));
            return None;
        }
    };

    let id = match map.get("id").and_then(|v| v.as_str()) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => {
            issues.push(ValidationIssue::at(
                format!("{location}.id"),
                "missing or empty step `id`",
            ));
            return None;
        }
    };

    let kind = build_step_kind(location, &id, map, issues)?;

    let depends_on = match map.get("depends_on") {
        None => Vec::new(),
        Some(serde_json::Value::Array(items)) => {
            let mut deps = Vec::new();
            for (i, item) in items.iter().enumerate() {
                match item.as_str() {
                    Some(s) if !s.is_empty() => deps.push(s.to_string()),
                    _ => issues.push(ValidationIssue::at(
                        format!("{location}.depends_on[{i}]"),
                        "dependency must be a non-empty step id",
                    )),
                }
            }
            deps
        }
        Some(_) => {
            issues.push(ValidationIssue::at(
                format!("{location}.depends_on"),
                "`depends_on` must be an array of step ids",
            ));
            Vec::new()
        }
    };

    let inputs = match map.get("inputs") {
        None => BTreeMap::new(),
        Some(serde_json::Value::Object(obj)) => obj
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        Some(_) => {
            issues.push(ValidationIssue::at(
                format!("{location}.inputs"),
                "`inputs` must be a mapping",
            ));
            BTreeMap::new()
        }
    };

    let retry_policy = build_retry_policy(location, map.get("retry_policy"), issues);

    Some(WorkflowStep {
        id,
        kind,
        depends_on,
        inputs,
        retry_policy,
    })
}

fn build_step_kind(
    location: &str,
    id: &str,
    map: &serde_json::Map<String, serde_json::Value>,
    issues: &mut Vec<ValidationIssue>,
) -> Option<StepKind> {
    let step_type = match map.get("type").and_then(|v| v.as_str()) {
        Some(t) => t,
        None => {
            issues.push(ValidationIssue::at(
                format!("{location}.type"),
                format!("step `{id}` is missing `type`"),
            ));
            return None;
        }
    };

    let required_string = |field: &str, issues: &mut Vec<ValidationIssue>| -> Option<String> {
        match map.get(field).and_then(|v| v.as_str()) {
            Some(s) if !s.is_empty() => Some(s.to_string()),
            _ => {
                issues.push(ValidationIssue::at(
                    format!("{location}.{field}"),
                    format!("step `{id}` ({step_type}) requires a non-empty `{field}`"),
                ));
                None
            }
        }
    };

    let optional_string = |field: &str| -> Option<String> {
        map.get(field).and_then(|v| v.as_str()).map(|s| s.to_string())
    };

    match step_type {
        "script" => {
            let script = required_string("script", issues)?;
            let timeout_ms = match map.get("timeout_ms") {
                None => None,
                Some(v) => match v.as_u64() {
                    Some(ms) if ms > 0 => Some(ms),
                    _ => {
                        issues.push(ValidationIssue::at(
                            format!("{location}.timeout_ms"),
                            "`timeout_ms` must be a positive integer",
                        ));
                        None
                    }
                },
            };
            Some(StepKind::Script { script, timeout_ms })
        }
        "ai_call" => {
            let prompt = required_string("prompt", issues)?;
            Some(StepKind::AiCall {
                prompt,
                model: optional_string("model"),
            })
        }
        "file_op" => {
            let operation = match map.get("operation").and_then(|v| v.as_str()) {
                Some(op) => match parse_file_op(op) {
                    Some(kind) => kind,
                    None => {
                        issues.push(ValidationIssue::at(
                            format!("{location}.operation"),
                            format!("unknown file operation `{op}`"),
                        ));
                        return None;
                    }
                },
                None => {
                    issues.push(ValidationIssue::at(
                        format!("{location}.operation"),
                        format!("step `{id}` (file_op) requires `operation`"),
                    ));
                    return None;
                }
            };
            let path = required_string("path", issues)?;
            let target = optional_string("target");
            let content = optional_string("content");

            if operation == FileOpKind::Copy && target.is_none() {
                issues.push(ValidationIssue::at(
                    format!("{location}.target"),
                    "`copy` requires a `target` path",
                ));
            }
            if matches!(operation, FileOpKind::Write | FileOpKind::Append) && content.is_none() {
                issues.push(ValidationIssue::at(
                    format!("{location}.content"),
                    format!("`{operation}` requires `content`"),
                ));
            }

            Some(StepKind::FileOp {
                operation,
                path,
                target,
                content,
            })
        }
        "conditional" => {
            let condition = required_string("condition", issues)?;
            let then_steps = build_branch(location, "then_steps", map, issues);
            let else_steps = build_branch(location, "else_steps", map, issues);
            if then_steps.is_empty() && else_steps.is_empty() {
                issues.push(ValidationIssue::at(
                    location,
                    format!("conditional step `{id}` has no branch steps"),
                ));
            }
            Some(StepKind::Conditional {
                condition,
                then_steps,
                else_steps,
            })
        }
        "loop" => {
            let over = required_string("over", issues)?;
            let max_iterations = match map.get("max_iterations") {
                None => DEFAULT_MAX_ITERATIONS,
                Some(v) => match v.as_u64() {
                    Some(n) if n > 0 && n <= u32::MAX as u64 => n as u32,
                    _ => {
                        issues.push(ValidationIssue::at(
                            format!("{location}.max_iterations"),
                            "`max_iterations` must be a positive integer",
                        ));
                        DEFAULT_MAX_ITERATIONS
                    }
                },
            };
            let body = match map.get("body") {
                Some(serde_json::Value::Array(items)) if !items.is_empty() => {
                    build_steps(&format!("{location}.body"), items, issues)
                }
                _ => {
                    issues.push(ValidationIssue::at(
                        format!("{location}.body"),
                        format!("loop step `{id}` requires a non-empty `body`"),
                    ));
                    Vec::new()
                }
            };
            Some(StepKind::Loop {
                over,
                max_iterations,
                body,
            })
        }
        other => {
            issues.push(ValidationIssue::at(
                format!("{location}.type"),
                format!(
                    "unknown step type `{other}`; expected one of script, ai_call, file_op, conditional, loop"
                ),
            ));
            None
        }
    }
}

fn build_branch(
    location: &str,
    field: &str,
    map: &serde_json::Map<String, serde_json::Value>,
    issues: &mut Vec<ValidationIssue>,
) -> Vec<WorkflowStep> {
    match map.get(field) {
        None => Vec::new(),
        Some(serde_json::Value::Array(items)) => {
            build_steps(&format!("{location}.{field}"), items, issues)
        }
        Some(_) => {
            issues.push(ValidationIssue::at(
                format!("{location}.{field}"),
                format!("`{field}` must be an array of steps"),
            ));
            Vec::new()
        }
    }
}

fn build_retry_policy(
    location: &str,
    value: Option<&serde_json::Value>,
    issues: &mut Vec<ValidationIssue>,
) -> Option<RetryPolicy> {
    let map = match value {
        None | Some(serde_json::Value::Null) => return None,
        Some(serde_json::Value::Object(map)) => map,
        Some(_) => {
            issues.push(ValidationIssue::at(
                format!("{location}.retry_policy"),
                "`retry_policy` must be a mapping",
            ));
            return None;
        }
    };

    let mut policy = RetryPolicy::default();

    if let Some(v) = map.get("max_attempts") {
        match v.as_u64() {
            Some(n) if n > 0 => policy.max_attempts = n as u32,
            _ => issues.push(ValidationIssue::at(
                format!("{location}.retry_policy.max_attempts"),
                "`max_attempts` must be a positive integer",
            )),
        }
    }
    if let Some(v) = map.get("initial_delay_ms") {
        match v.as_u64() {
            Some(n) => policy.initial_delay_ms = n,
            None => issues.push(ValidationIssue::at(
                format!("{location}.retry_policy.initial_delay_ms"),
                "`initial_delay_ms` must be a non-negative integer",
            )),
        }
    }
    if let Some(v) = map.get("backoff_multiplier") {
        match v.as_f64() {
            Some(f) if f >= 1.0 => policy.backoff_multiplier = f,
            _ => issues.push(ValidationIssue::at(
                format!("{location}.retry_policy.backoff_multiplier"),
                "`backoff_multiplier` must be a number >= 1",
            )),
        }
    }
    if let Some(v) = map.get("max_delay_ms") {
        match v.as_u64() {
            Some(n) => policy.max_delay_ms = n,
            None => issues.push(ValidationIssue::at(
                format!("{location}.retry_policy.max_delay_ms"),
                "`max_delay_ms` must be a non-negative integer",
            )),
        }
    }

    Some(policy)
}

fn parse_file_op(s: &str) -> Option<FileOpKind> {
    match s {
        "read" => Some(FileOpKind::Read),
        "write" => Some(FileOpKind::Write),
        "append" => Some(FileOpKind::Append),
        "copy" => Some(FileOpKind::Copy),
        "delete" => Some(FileOpKind::Delete),
        "list" => Some(FileOpKind::List),
        _ => None,
    }
}

// ============================================================================
// Cross-step validation
// ============================================================================

fn validate_workflow(workflow: &Workflow, issues: &mut Vec<ValidationIssue>) {
    // Step ids must be unique across every nesting level.
    let mut seen: HashMap<&str, usize> = HashMap::new();
    for step in workflow.all_steps() {
        *seen.entry(step.id.as_str()).or_insert(0) += 1;
    }
    let mut duplicates: Vec<&&str> = seen
        .iter()
        .filter(|(_, count)| **count > 1)
        .map(|(id, _)| id)
        .collect();
    duplicates.sort();
    for id in duplicates {
        issues.push(ValidationIssue::at(
            "steps",
            format!("duplicate step id `{id}`"),
        ));
    }

    validate_step_level(&workflow.steps, issues);
}

fn validate_step_level(steps: &[WorkflowStep], issues: &mut Vec<ValidationIssue>) {
    let sibling_ids: HashSet<&str> = steps.iter().map(|s| s.id.as_str()).collect();

    for step in steps {
        for dep in &step.depends_on {
            if dep == &step.id {
                issues.push(ValidationIssue::at(
                    format!("step `{}`", step.id),
                    "step depends on itself",
                ));
            } else if !sibling_ids.contains(dep.as_str()) {
                issues.push(ValidationIssue::at(
                    format!("step `{}`", step.id),
                    format!("`depends_on` references unknown step `{dep}`"),
                ));
            }
        }

        for expr in step.expression_strings() {
            if let Err(msg) = resolver::check_balanced(expr) {
                issues.push(ValidationIssue::at(format!("step `{}`", step.id), msg));
            }
        }

        for body in step.nested_bodies() {
            validate_step_level(body, issues);
        }
    }
}
