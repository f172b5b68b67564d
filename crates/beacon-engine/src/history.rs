//! Execution history store.
//!
//! Append-only, keyed by workflow id, retaining the N most recent
//! completed runs; inserting past the cap evicts the oldest by start time.
//! Sensitive values are redacted at write time, before a record is stored;
//! reads never redact.

use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use beacon_core::{EngineError, EngineResult, WorkflowRun};

const REDACTED: &str = "[REDACTED]";

/// Redacts sensitive values in run records.
#[derive(Debug)]
pub struct Redactor {
    key_pattern: Regex,
    value_patterns: Vec<Regex>,
}

impl Redactor {
    /// Compile a redactor from a key pattern and value patterns.
    pub fn new(key_pattern: &str, value_patterns: &[String]) -> EngineResult<Self> {
        let key_pattern = Regex::new(key_pattern)
            .map_err(|e| EngineError::Internal(format!("bad redaction key pattern: {e}")))?;
        let value_patterns = value_patterns
            .iter()
            .map(|p| {
                Regex::new(p)
                    .map_err(|e| EngineError::Internal(format!("bad redaction pattern: {e}")))
            })
            .collect::<EngineResult<Vec<_>>>()?;
        Ok(Self {
            key_pattern,
            value_patterns,
        })
    }

    /// Redact a whole run record in place.
    pub fn redact_run(&self, run: &mut WorkflowRun) {
        self.redact_value(&mut run.inputs);
        for result in &mut run.step_results {
            if let Some(output) = &mut result.output {
                self.redact_value(output);
            }
            if let Some(error) = &mut result.error {
                *error = self.redact_text(error);
            }
            for attempt in &mut result.attempts {
                if let Some(error) = &mut attempt.error {
                    *error = self.redact_text(error);
                }
            }
        }
    }

    fn redact_value(&self, value: &mut serde_json::Value) {
        match value {
            serde_json::Value::Object(map) => {
                for (key, child) in map.iter_mut() {
                    if self.key_pattern.is_match(key) {
                        *child = serde_json::Value::String(REDACTED.to_string());
                    } else {
                        self.redact_value(child);
                    }
                }
            }
            serde_json::Value::Array(items) => {
                for item in items {
                    self.redact_value(item);
                }
            }
            serde_json::Value::String(s) => {
                if self.value_patterns.iter().any(|re| re.is_match(s)) {
                    *s = REDACTED.to_string();
                }
            }
            _ => {}
        }
    }

    fn redact_text(&self, text: &str) -> String {
        let mut out = text.to_string();
        for re in &self.value_patterns {
            out = re.replace_all(&out, REDACTED).to_string();
        }
        out
    }
}

/// Bounded, append-only store of completed runs.
#[derive(Debug)]
pub struct ExecutionHistoryStore {
    capacity: usize,
    redactor: Redactor,
    records: Mutex<HashMap<String, VecDeque<WorkflowRun>>>,
}

impl ExecutionHistoryStore {
    pub fn new(capacity: usize, redactor: Redactor) -> Self {
        Self {
            capacity: capacity.max(1),
            redactor,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Insert a completed run, redacting sensitive values first. Evicts
    /// the oldest run by start time once the per-workflow cap is exceeded.
    pub fn insert(&self, mut run: WorkflowRun) {
        self.redactor.redact_run(&mut run);

        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let runs = records.entry(run.workflow_id.clone()).or_default();
        runs.push_back(run);

        while runs.len() > self.capacity {
            let oldest = runs
                .iter()
                .enumerate()
                .min_by_key(|(_, r)| r.started_at)
                .map(|(i, _)| i);
            match oldest {
                Some(index) => {
                    let evicted = runs.remove(index);
                    if let Some(evicted) = evicted {
                        tracing::debug!(
                            workflow_id = %evicted.workflow_id,
                            run_id = %evicted.run_id,
                            "evicted oldest run from history"
                        );
                    }
                }
                None => break,
            }
        }
    }

    /// Runs for a workflow, newest first.
    pub fn runs_for(&self, workflow_id: &str) -> Vec<WorkflowRun> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let mut runs: Vec<WorkflowRun> = records
            .get(workflow_id)
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs
    }

    /// The most recent run for a workflow.
    pub fn latest(&self, workflow_id: &str) -> Option<WorkflowRun> {
        self.runs_for(workflow_id).into_iter().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::{RunStatus, StepResult};
    use chrono::Duration;

    fn redactor() -> Redactor {
        let config = crate::config::EngineConfig::default();
        Redactor::new(&config.redact_key_pattern, &config.redact_value_patterns).unwrap()
    }

    fn run_with_start(workflow_id: &str, run_id: &str, offset_secs: i64) -> WorkflowRun {
        let mut run = WorkflowRun::new(run_id, workflow_id, serde_json::json!({}));
        run.started_at += Duration::seconds(offset_secs);
        run.finish(RunStatus::Completed);
        run
    }

    #[test]
    fn test_cap_evicts_oldest_by_start_time() {
        let store = ExecutionHistoryStore::new(5, redactor());
        for i in 0..6 {
            store.insert(run_with_start("wf", &format!("r{i}"), i));
        }

        let runs = store.runs_for("wf");
        assert_eq!(runs.len(), 5);
        assert!(runs.iter().all(|r| r.run_id != "r0"));
        assert_eq!(runs[0].run_id, "r5");
    }

    #[test]
    fn test_caps_are_per_workflow() {
        let store = ExecutionHistoryStore::new(2, redactor());
        for i in 0..3 {
            store.insert(run_with_start("alpha", &format!("a{i}"), i));
        }
        store.insert(run_with_start("beta", "b0", 0));

        assert_eq!(store.runs_for("alpha").len(), 2);
        assert_eq!(store.runs_for("beta").len(), 1);
    }

    #[test]
    fn test_sensitive_keys_redacted_at_write_time() {
        let store = ExecutionHistoryStore::new(5, redactor());
        let mut run = WorkflowRun::new(
            "r1",
            "wf",
            serde_json::json!({"api_key": "sk-abcdefghijklmnop123", "region": "eu"}),
        );
        run.step_results.push(StepResult::succeeded(
            "fetch",
            serde_json::json!({"auth": {"password": "hunter2"}, "rows": 3}),
            10,
        ));
        run.finish(RunStatus::Completed);
        store.insert(run);

        let stored = store.latest("wf").unwrap();
        assert_eq!(stored.inputs["api_key"], "[REDACTED]");
        assert_eq!(stored.inputs["region"], "eu");
        let output = stored.step_results[0].output.as_ref().unwrap();
        assert_eq!(output["auth"]["password"], "[REDACTED]");
        assert_eq!(output["rows"], 3);
    }

    #[test]
    fn test_value_patterns_redact_error_text() {
        let store = ExecutionHistoryStore::new(5, redactor());
        let mut run = WorkflowRun::new("r1", "wf", serde_json::json!({}));
        run.step_results.push(StepResult::failed(
            "call",
            "provider rejected Bearer abc.def-123",
            4,
        ));
        run.finish(RunStatus::Failed);
        store.insert(run);

        let stored = store.latest("wf").unwrap();
        let error = stored.step_results[0].error.as_ref().unwrap();
        assert!(error.contains("[REDACTED]"));
        assert!(!error.contains("abc.def-123"));
    }

    #[test]
    fn test_latest_is_newest() {
        let store = ExecutionHistoryStore::new(5, redactor());
        store.insert(run_with_start("wf", "old", 0));
        store.insert(run_with_start("wf", "new", 60));

        assert_eq!(store.latest("wf").unwrap().run_id, "new");
    }
}
