//! `${...}` token resolution.
//!
//! A token names a scope and a dot-path into it:
//! `${workflow.inputs.region}`, `${steps.fetch.outputs.user.email}`,
//! `${env.HOME}`, `${loop.item.id}`. A missing key at any depth fails with
//! a resolution error naming the exact token and the failing scope.

use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

use crate::context::ExecutionContext;
use crate::error::{EngineError, EngineResult, ValidationIssue};
use crate::expr::condition;
use crate::workflow::types::{StepKind, Workflow, WorkflowStep};

fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([^{}]+)\}").unwrap())
}

/// Extract every token body (without the `${}` delimiters) from a string.
pub fn token_bodies(s: &str) -> Vec<&str> {
    token_re()
        .captures_iter(s)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect()
}

/// Check that every `${` in the string has a matching `}`.
pub fn check_balanced(s: &str) -> Result<(), String> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'$' && bytes[i + 1] == b'{' {
            match s[i + 2..].find('}') {
                Some(_) => i += 2,
                None => return Err(format!("unterminated `${{` at byte offset {}", i)),
            }
        } else {
            i += 1;
        }
    }
    Ok(())
}

/// Step ids referenced via `${steps.X...}` tokens in a string.
pub fn referenced_step_ids(s: &str) -> Vec<String> {
    let mut ids = Vec::new();
    for body in token_bodies(s) {
        let mut parts = body.split('.');
        if parts.next() == Some("steps") {
            if let Some(id) = parts.next() {
                if !id.is_empty() {
                    ids.push(id.to_string());
                }
            }
        }
    }
    ids
}

/// Resolve one token body against the context, returning the referenced
/// value.
pub fn resolve_token(body: &str, ctx: &ExecutionContext) -> EngineResult<serde_json::Value> {
    let token = format!("${{{}}}", body);
    let parts: Vec<&str> = body.split('.').collect();

    match parts.as_slice() {
        ["workflow", "inputs", rest @ ..] => {
            walk(ctx.inputs(), rest, &token, "workflow.inputs")
        }
        ["steps", id, "outputs", rest @ ..] => {
            let scope = format!("steps.{}.outputs", id);
            let base = ctx
                .output_of(id)
                .ok_or_else(|| EngineError::Resolution {
                    token: token.clone(),
                    scope: scope.clone(),
                })?;
            walk(base, rest, &token, &scope)
        }
        ["env", name] => ctx
            .env_var(name)
            .map(|v| serde_json::Value::String(v.to_string()))
            .ok_or_else(|| EngineError::Resolution {
                token,
                scope: "env".to_string(),
            }),
        ["loop", name, rest @ ..] => {
            let base = ctx.loop_var(name).ok_or_else(|| EngineError::Resolution {
                token: token.clone(),
                scope: "loop".to_string(),
            })?;
            walk(base, rest, &token, "loop")
        }
        _ => Err(EngineError::Resolution {
            token,
            scope: parts.first().copied().unwrap_or("").to_string(),
        }),
    }
}

fn walk(
    base: &serde_json::Value,
    path: &[&str],
    token: &str,
    scope: &str,
) -> EngineResult<serde_json::Value> {
    let mut current = base;
    for segment in path {
        let next = match current {
            serde_json::Value::Object(map) => map.get(*segment),
            serde_json::Value::Array(items) => segment
                .parse::<usize>()
                .ok()
                .and_then(|idx| items.get(idx)),
            _ => None,
        };
        current = next.ok_or_else(|| EngineError::Resolution {
            token: token.to_string(),
            scope: scope.to_string(),
        })?;
    }
    Ok(current.clone())
}

/// Resolve a string that may contain tokens.
///
/// A string that is exactly one token resolves to the referenced value's
/// native type; otherwise each token is interpolated into the string.
pub fn resolve_string(s: &str, ctx: &ExecutionContext) -> EngineResult<serde_json::Value> {
    if let Err(msg) = check_balanced(s) {
        return Err(EngineError::ConditionEvaluation(format!(
            "expression `{s}`: {msg}"
        )));
    }

    if let Some(caps) = token_re().captures(s) {
        let full = caps.get(0).map(|m| m.as_str()).unwrap_or("");
        if full == s {
            let body = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            return resolve_token(body, ctx);
        }
    } else {
        return Ok(serde_json::Value::String(s.to_string()));
    }

    let mut rendered = String::with_capacity(s.len());
    let mut last = 0;
    for caps in token_re().captures_iter(s) {
        let Some(m) = caps.get(0) else { continue };
        let body = caps.get(1).map(|c| c.as_str()).unwrap_or("");
        rendered.push_str(&s[last..m.start()]);
        rendered.push_str(&stringify(&resolve_token(body, ctx)?));
        last = m.end();
    }
    rendered.push_str(&s[last..]);
    Ok(serde_json::Value::String(rendered))
}

/// Resolve every token inside a JSON value, recursively.
pub fn resolve_value(
    value: &serde_json::Value,
    ctx: &ExecutionContext,
) -> EngineResult<serde_json::Value> {
    match value {
        serde_json::Value::String(s) => resolve_string(s, ctx),
        serde_json::Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), resolve_value(v, ctx)?);
            }
            Ok(serde_json::Value::Object(out))
        }
        serde_json::Value::Array(items) => {
            let resolved: Result<Vec<_>, _> =
                items.iter().map(|v| resolve_value(v, ctx)).collect();
            Ok(serde_json::Value::Array(resolved?))
        }
        _ => Ok(value.clone()),
    }
}

fn stringify(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Structural pre-execution check of every expression in a workflow.
///
/// Runs against declared (not yet valued) inputs and declared step ids, so
/// unknown scopes, unknown step ids, and loop references outside a loop
/// body surface before any step runs. Values depending on runtime state
/// re-resolve at dispatch.
pub fn preflight(workflow: &Workflow) -> EngineResult<()> {
    let declared_steps: HashSet<&str> = workflow.step_ids().into_iter().collect();
    let declared_inputs: HashSet<&str> = workflow.inputs.keys().map(|k| k.as_str()).collect();

    let mut issues = Vec::new();
    preflight_steps(
        &workflow.steps,
        &declared_steps,
        &declared_inputs,
        false,
        &mut issues,
    );

    if issues.is_empty() {
        Ok(())
    } else {
        Err(EngineError::Validation(issues))
    }
}

fn preflight_steps(
    steps: &[WorkflowStep],
    declared_steps: &HashSet<&str>,
    declared_inputs: &HashSet<&str>,
    in_loop: bool,
    issues: &mut Vec<ValidationIssue>,
) {
    for step in steps {
        for s in step.expression_strings() {
            if let Err(msg) = check_balanced(s) {
                issues.push(ValidationIssue::at(format!("step `{}`", step.id), msg));
                continue;
            }
            for body in token_bodies(s) {
                if let Err(msg) =
                    preflight_token(body, declared_steps, declared_inputs, in_loop)
                {
                    issues.push(ValidationIssue::at(format!("step `{}`", step.id), msg));
                }
            }
        }

        match &step.kind {
            StepKind::Conditional { condition, then_steps, else_steps } => {
                if let Err(err) = condition::validate(condition) {
                    issues.push(ValidationIssue::at(
                        format!("step `{}`.condition", step.id),
                        err.to_string(),
                    ));
                }
                preflight_steps(then_steps, declared_steps, declared_inputs, in_loop, issues);
                preflight_steps(else_steps, declared_steps, declared_inputs, in_loop, issues);
            }
            StepKind::Loop { body, .. } => {
                preflight_steps(body, declared_steps, declared_inputs, true, issues);
            }
            _ => {}
        }
    }
}

fn preflight_token(
    body: &str,
    declared_steps: &HashSet<&str>,
    declared_inputs: &HashSet<&str>,
    in_loop: bool,
) -> Result<(), String> {
    let parts: Vec<&str> = body.split('.').collect();
    match parts.as_slice() {
        ["workflow", "inputs"] => Ok(()),
        ["workflow", "inputs", name, ..] => {
            if declared_inputs.contains(name) {
                Ok(())
            } else {
                Err(format!("`${{{}}}` references undeclared input `{}`", body, name))
            }
        }
        ["steps", id, "outputs", ..] => {
            if declared_steps.contains(id) {
                Ok(())
            } else {
                Err(format!("`${{{}}}` references unknown step `{}`", body, id))
            }
        }
        ["env", name] if !name.is_empty() => Ok(()),
        ["loop", name, ..] if !name.is_empty() => {
            if in_loop {
                Ok(())
            } else {
                Err(format!("`${{{}}}` used outside a loop body", body))
            }
        }
        _ => Err(format!("`${{{}}}` has an unknown scope", body)),
    }
}
