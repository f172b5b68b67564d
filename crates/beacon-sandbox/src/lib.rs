//! Beacon script sandbox.
//!
//! Runs externally-defined scripts as isolated, time-bounded subprocesses.
//! The contract with a script:
//! - step inputs arrive as one JSON document on stdin, then stdin closes
//! - the script prints one JSON document to stdout and exits 0
//! - stderr is captured as unstructured diagnostics
//!
//! A script path is validated against the project boundary before anything
//! is spawned. On timeout or cancellation the subprocess receives SIGTERM,
//! then SIGKILL after a grace period.

pub mod error;
pub mod path;

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub use error::SandboxError;

/// Default per-step script timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default grace period between SIGTERM and SIGKILL.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(2);

/// Successful script outcome.
#[derive(Debug, Clone)]
pub struct ScriptOutcome {
    /// The JSON document the script printed to stdout.
    pub output: serde_json::Value,

    /// Captured stderr diagnostics.
    pub stderr: String,

    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

/// Isolated, time-bounded script execution within a project boundary.
pub struct ScriptSandbox {
    root: PathBuf,
    timeout: Duration,
    grace: Duration,
}

impl ScriptSandbox {
    /// Create a sandbox rooted at the given project directory.
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self {
            root: root.as_ref().canonicalize()?,
            timeout: DEFAULT_TIMEOUT,
            grace: DEFAULT_GRACE,
        })
    }

    /// Override the default timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the SIGTERM-to-SIGKILL grace period.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// The canonical project root this sandbox enforces.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Validate a script path against the boundary without running it.
    pub fn resolve_script(&self, script: &str) -> Result<PathBuf, SandboxError> {
        path::validate_within(&self.root, script)
    }

    /// Execute a script with the given inputs.
    ///
    /// `timeout_override` replaces the sandbox default for this run;
    /// `cancel` aborts the run early when it flips to `true`.
    pub async fn execute(
        &self,
        script: &str,
        inputs: &serde_json::Value,
        timeout_override: Option<Duration>,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<ScriptOutcome, SandboxError> {
        let script_path = self.resolve_script(script)?;
        let timeout = timeout_override.unwrap_or(self.timeout);
        let start = std::time::Instant::now();

        let mut cmd = interpreter_for(&script_path);
        cmd.current_dir(&self.root)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(script = %script, timeout_ms = timeout.as_millis() as u64, "spawning script");

        let mut child = cmd.spawn()?;

        // Write the input document and close stdin so the script sees EOF.
        if let Some(mut stdin) = child.stdin.take() {
            let payload = serde_json::to_vec(inputs)
                .map_err(|e| SandboxError::MalformedOutput(format!("input serialization: {e}")))?;
            stdin.write_all(&payload).await?;
            stdin.shutdown().await?;
        }

        let stdout_task = capture_lines(child.stdout.take());
        let stderr_task = capture_lines(child.stderr.take());

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut cancel = cancel;

        let status = loop {
            tokio::select! {
                status = child.wait() => break status?,
                _ = &mut deadline => {
                    terminate(&mut child, self.grace).await;
                    let partial_stdout = stdout_task.await.unwrap_or_default();
                    let partial_stderr = stderr_task.await.unwrap_or_default();
                    tracing::warn!(script = %script, "script timed out");
                    return Err(SandboxError::Timeout {
                        timeout_ms: timeout.as_millis() as u64,
                        partial_stdout,
                        partial_stderr,
                    });
                }
                _ = cancelled(&mut cancel) => {
                    terminate(&mut child, self.grace).await;
                    let partial_stdout = stdout_task.await.unwrap_or_default();
                    let partial_stderr = stderr_task.await.unwrap_or_default();
                    return Err(SandboxError::Cancelled { partial_stdout, partial_stderr });
                }
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        let duration_ms = start.elapsed().as_millis() as u64;

        let exit_code = status.code().unwrap_or(-1);
        if exit_code != 0 {
            return Err(SandboxError::Execution { exit_code, stderr });
        }

        let trimmed = stdout.trim();
        let output: serde_json::Value = serde_json::from_str(trimmed).map_err(|_| {
            SandboxError::MalformedOutput(format!(
                "expected one JSON document on stdout, got: {}",
                truncate(trimmed, 200)
            ))
        })?;

        Ok(ScriptOutcome {
            output,
            stderr,
            duration_ms,
        })
    }
}

/// Pick the interpreter by file extension; anything else is executed
/// directly.
fn interpreter_for(script: &Path) -> Command {
    match script.extension().and_then(|e| e.to_str()) {
        Some("py") => {
            let mut cmd = Command::new("python3");
            cmd.arg(script);
            cmd
        }
        Some("sh") => {
            let mut cmd = Command::new("sh");
            cmd.arg(script);
            cmd
        }
        _ => Command::new(script),
    }
}

fn capture_lines(
    stream: Option<impl tokio::io::AsyncRead + Unpin + Send + 'static>,
) -> JoinHandle<String> {
    tokio::spawn(async move {
        let mut output = String::new();
        if let Some(stream) = stream {
            let mut reader = BufReader::new(stream).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                output.push_str(&line);
                output.push('\n');
            }
        }
        output
    })
}

/// Graceful-then-forceful termination: SIGTERM, wait out the grace period,
/// then SIGKILL.
async fn terminate(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGTERM,
        );
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
        tracing::warn!(pid, "script ignored SIGTERM, killing");
    }
    let _ = child.kill().await;
}

async fn cancelled(rx: &mut Option<watch::Receiver<bool>>) {
    match rx {
        Some(rx) => {
            if *rx.borrow() {
                return;
            }
            while rx.changed().await.is_ok() {
                if *rx.borrow() {
                    return;
                }
            }
            // Sender dropped without cancelling; never resolve.
            std::future::pending::<()>().await
        }
        None => std::future::pending::<()>().await,
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        s
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        &s[..end]
    }
}
