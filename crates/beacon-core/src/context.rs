//! Execution context: the data an expression can see at dispatch time.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{EngineError, EngineResult};

/// Variables bound by one loop iteration.
///
/// Array sources bind `item` and `index`; object sources bind `key`,
/// `value`, and `index`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopFrame {
    vars: HashMap<String, serde_json::Value>,
}

impl LoopFrame {
    /// Frame for an array element.
    pub fn for_item(item: serde_json::Value, index: usize) -> Self {
        let mut vars = HashMap::new();
        vars.insert("item".to_string(), item);
        vars.insert("index".to_string(), serde_json::json!(index));
        Self { vars }
    }

    /// Frame for an object entry.
    pub fn for_entry(key: String, value: serde_json::Value, index: usize) -> Self {
        let mut vars = HashMap::new();
        vars.insert("key".to_string(), serde_json::json!(key));
        vars.insert("value".to_string(), value);
        vars.insert("index".to_string(), serde_json::json!(index));
        Self { vars }
    }

    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.vars.get(name)
    }
}

/// Context a step's expressions are resolved against.
///
/// `step_outputs` keys are written exactly once, by the owning step; the
/// executor merges a step's output only after that step completes.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExecutionContext {
    /// Resolved workflow inputs (defaults applied).
    inputs: serde_json::Value,

    /// Completed step outputs, keyed by step id.
    step_outputs: HashMap<String, serde_json::Value>,

    /// Environment snapshot, captured once at run start.
    env: HashMap<String, String>,

    /// Stack of loop frames; the innermost frame resolves first.
    loop_frames: Vec<LoopFrame>,
}

impl ExecutionContext {
    /// Create a context from resolved inputs and an environment snapshot.
    pub fn new(inputs: serde_json::Value, env: HashMap<String, String>) -> Self {
        Self {
            inputs,
            step_outputs: HashMap::new(),
            env,
            loop_frames: Vec::new(),
        }
    }

    /// Context seeded from the current process environment.
    pub fn with_process_env(inputs: serde_json::Value) -> Self {
        Self::new(inputs, std::env::vars().collect())
    }

    pub fn inputs(&self) -> &serde_json::Value {
        &self.inputs
    }

    /// Mutate one resolved input. Used by debug sessions while paused.
    pub fn set_input(&mut self, name: &str, value: serde_json::Value) {
        if let serde_json::Value::Object(map) = &mut self.inputs {
            map.insert(name.to_string(), value);
        }
    }

    pub fn output_of(&self, step_id: &str) -> Option<&serde_json::Value> {
        self.step_outputs.get(step_id)
    }

    pub fn env_var(&self, name: &str) -> Option<&str> {
        self.env.get(name).map(|s| s.as_str())
    }

    /// Record a completed step's output. Each key is written exactly once.
    pub fn record_output(&mut self, step_id: &str, output: serde_json::Value) -> EngineResult<()> {
        if self.step_outputs.contains_key(step_id) {
            return Err(EngineError::Internal(format!(
                "output for step `{}` was already recorded",
                step_id
            )));
        }
        self.step_outputs.insert(step_id.to_string(), output);
        Ok(())
    }

    /// Enter a loop iteration.
    pub fn push_frame(&mut self, frame: LoopFrame) {
        self.loop_frames.push(frame);
    }

    /// Leave a loop iteration.
    pub fn pop_frame(&mut self) -> Option<LoopFrame> {
        self.loop_frames.pop()
    }

    pub fn in_loop(&self) -> bool {
        !self.loop_frames.is_empty()
    }

    /// Resolve a loop variable, innermost frame first.
    pub fn loop_var(&self, name: &str) -> Option<&serde_json::Value> {
        self.loop_frames.iter().rev().find_map(|f| f.get(name))
    }

    /// Snapshot for inspection (debug sessions, event payloads).
    /// Environment values are withheld; only the variable names appear.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "inputs": self.inputs,
            "step_outputs": self.step_outputs,
            "env_keys": self.env.keys().collect::<Vec<_>>(),
            "loop_depth": self.loop_frames.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_output_is_write_once() {
        let mut ctx = ExecutionContext::new(serde_json::json!({}), HashMap::new());
        ctx.record_output("a", serde_json::json!(1)).unwrap();

        let err = ctx.record_output("a", serde_json::json!(2)).unwrap_err();
        assert!(err.to_string().contains("already recorded"));
        assert_eq!(ctx.output_of("a"), Some(&serde_json::json!(1)));
    }

    #[test]
    fn test_innermost_frame_resolves_first() {
        let mut ctx = ExecutionContext::default();
        ctx.push_frame(LoopFrame::for_item(serde_json::json!("outer"), 0));
        ctx.push_frame(LoopFrame::for_item(serde_json::json!("inner"), 3));

        assert_eq!(ctx.loop_var("item"), Some(&serde_json::json!("inner")));
        assert_eq!(ctx.loop_var("index"), Some(&serde_json::json!(3)));

        ctx.pop_frame();
        assert_eq!(ctx.loop_var("item"), Some(&serde_json::json!("outer")));
    }

    #[test]
    fn test_object_entry_frame() {
        let frame = LoopFrame::for_entry("region".to_string(), serde_json::json!("eu"), 1);
        assert_eq!(frame.get("key"), Some(&serde_json::json!("region")));
        assert_eq!(frame.get("value"), Some(&serde_json::json!("eu")));
    }

    #[test]
    fn test_snapshot_withholds_env_values() {
        let mut env = HashMap::new();
        env.insert("HOME".to_string(), "/home/someone".to_string());
        let ctx = ExecutionContext::new(serde_json::json!({"n": 1}), env);

        let snap = ctx.snapshot();
        assert_eq!(snap["inputs"]["n"], 1);
        assert!(snap["env_keys"].as_array().unwrap().contains(&serde_json::json!("HOME")));
        assert!(snap.to_string().find("/home/someone").is_none());
    }
}
