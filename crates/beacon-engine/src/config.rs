//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a [`crate::WorkflowExecutor`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Project root; scripts and file operations are confined to it.
    #[serde(default = "default_project_root")]
    pub project_root: PathBuf,

    /// Default script timeout in milliseconds.
    #[serde(default = "default_script_timeout_ms")]
    pub script_timeout_ms: u64,

    /// Grace period between SIGTERM and SIGKILL, in milliseconds.
    #[serde(default = "default_termination_grace_ms")]
    pub termination_grace_ms: u64,

    /// Completed runs retained per workflow id.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Upper bound on concurrently running steps within a wave.
    #[serde(default = "default_max_concurrent_steps")]
    pub max_concurrent_steps: usize,

    /// How long a debug pause may sit idle before the run is cancelled
    /// instead of leaking its resources.
    #[serde(default = "default_debug_idle_cap_ms")]
    pub debug_idle_cap_ms: u64,

    /// Key pattern whose values are redacted in history records.
    #[serde(default = "default_redact_key_pattern")]
    pub redact_key_pattern: String,

    /// Value patterns redacted in history records.
    #[serde(default = "default_redact_value_patterns")]
    pub redact_value_patterns: Vec<String>,
}

fn default_project_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_script_timeout_ms() -> u64 {
    30_000
}

fn default_termination_grace_ms() -> u64 {
    2_000
}

fn default_history_capacity() -> usize {
    5
}

fn default_max_concurrent_steps() -> usize {
    8
}

fn default_debug_idle_cap_ms() -> u64 {
    30 * 60 * 1000
}

fn default_redact_key_pattern() -> String {
    r"(?i)(password|passwd|secret|token|api[_-]?key|authorization|credential)".to_string()
}

fn default_redact_value_patterns() -> Vec<String> {
    vec![
        r"(?i)bearer\s+[A-Za-z0-9._\-]+".to_string(),
        r"\bsk-[A-Za-z0-9]{16,}\b".to_string(),
    ]
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            project_root: default_project_root(),
            script_timeout_ms: default_script_timeout_ms(),
            termination_grace_ms: default_termination_grace_ms(),
            history_capacity: default_history_capacity(),
            max_concurrent_steps: default_max_concurrent_steps(),
            debug_idle_cap_ms: default_debug_idle_cap_ms(),
            redact_key_pattern: default_redact_key_pattern(),
            redact_value_patterns: default_redact_value_patterns(),
        }
    }
}

impl EngineConfig {
    /// Config rooted at the given project directory.
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: root.into(),
            ..Self::default()
        }
    }

    /// Load overrides from `BEACON_*` environment variables on top of the
    /// defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(root) = std::env::var("BEACON_PROJECT_ROOT") {
            config.project_root = PathBuf::from(root);
        }
        if let Some(ms) = env_u64("BEACON_SCRIPT_TIMEOUT_MS") {
            config.script_timeout_ms = ms;
        }
        if let Some(ms) = env_u64("BEACON_TERMINATION_GRACE_MS") {
            config.termination_grace_ms = ms;
        }
        if let Some(n) = env_u64("BEACON_HISTORY_CAPACITY") {
            config.history_capacity = n as usize;
        }
        if let Some(n) = env_u64("BEACON_MAX_CONCURRENT_STEPS") {
            config.max_concurrent_steps = (n as usize).max(1);
        }
        config
    }

    pub fn script_timeout(&self) -> Duration {
        Duration::from_millis(self.script_timeout_ms)
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }

    pub fn debug_idle_cap(&self) -> Duration {
        Duration::from_millis(self.debug_idle_cap_ms)
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.script_timeout_ms, 30_000);
        assert_eq!(config.history_capacity, 5);
        assert!(config.max_concurrent_steps >= 1);
    }

    #[test]
    fn test_deserialization_fills_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"project_root": "/srv/project"}"#).unwrap();
        assert_eq!(config.project_root, PathBuf::from("/srv/project"));
        assert_eq!(config.history_capacity, 5);
    }
}
