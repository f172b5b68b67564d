//! Sandbox error types.

use thiserror::Error;

/// Errors from script sandbox validation and execution.
///
/// `Execution` and `MalformedOutput` are distinct so callers can tell a
/// script bug apart from a script that never produced a result.
#[derive(Error, Debug)]
pub enum SandboxError {
    /// The script path escapes the permitted project boundary. Fatal and
    /// never retried; no process is spawned.
    #[error("script path rejected: {0}")]
    Security(String),

    /// The script ran past its deadline and was terminated. Output
    /// captured up to that point is attached.
    #[error("script timed out after {timeout_ms} ms")]
    Timeout {
        timeout_ms: u64,
        partial_stdout: String,
        partial_stderr: String,
    },

    /// The script exited with a non-zero status.
    #[error("script exited with code {exit_code}")]
    Execution { exit_code: i32, stderr: String },

    /// The script exited cleanly but its stdout was not one JSON document.
    #[error("script produced malformed output: {0}")]
    MalformedOutput(String),

    /// Execution was cancelled from outside.
    #[error("script execution cancelled")]
    Cancelled {
        partial_stdout: String,
        partial_stderr: String,
    },

    /// Spawn or stream failure.
    #[error("sandbox io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Whether a step failure with this error may be retried under an
    /// attached retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SandboxError::Timeout { .. }
                | SandboxError::Execution { .. }
                | SandboxError::MalformedOutput(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryability() {
        assert!(SandboxError::Execution { exit_code: 1, stderr: String::new() }.is_retryable());
        assert!(SandboxError::Timeout {
            timeout_ms: 100,
            partial_stdout: String::new(),
            partial_stderr: String::new()
        }
        .is_retryable());
        assert!(!SandboxError::Security("escape".into()).is_retryable());
        assert!(!SandboxError::Cancelled {
            partial_stdout: String::new(),
            partial_stderr: String::new()
        }
        .is_retryable());
    }
}
