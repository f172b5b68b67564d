//! Debug sessions: breakpoints, pause-before-dispatch, and resume
//! signalling.
//!
//! A pause is modeled as an explicit state, not language-level suspension:
//! the executor parks in an "awaiting resume" state and an external signal
//! channel releases it. One pause is active per run, and resuming is
//! single-writer. No execution timeout is imposed on the pause itself, but
//! an idle cap bounds how long an unattended pause may hold run resources.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;

use beacon_core::{EngineError, EngineResult};

/// Signal a host sends to a paused run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugCommand {
    /// Continue under the current stepping mode.
    Resume,

    /// Run the pending step, then pause again before the next one.
    StepOver,

    /// Clear single-step mode and run to the next breakpoint.
    ContinueRun,
}

/// Snapshot of an active pause, for host inspection.
#[derive(Debug, Clone)]
pub struct PausedInfo {
    pub run_id: String,
    pub step_id: String,
    pub context: serde_json::Value,
}

/// How a pause ended, from the executor's point of view.
#[derive(Debug)]
pub enum PauseOutcome {
    /// A signal arrived; apply the queued input patches and continue.
    Resumed {
        patches: Vec<(String, serde_json::Value)>,
    },

    /// Nobody attended the pause within the idle cap.
    IdleTimeout,
}

struct PauseSlot {
    step_id: String,
    snapshot: serde_json::Value,
    tx: mpsc::Sender<DebugCommand>,
}

/// Breakpoint registry and pause coordination for an executor.
#[derive(Default)]
pub struct DebugController {
    breakpoints: Mutex<HashMap<String, HashSet<String>>>,
    single_step: Mutex<HashSet<String>>,
    paused: Mutex<HashMap<String, PauseSlot>>,
    patches: Mutex<HashMap<String, Vec<(String, serde_json::Value)>>>,
}

impl DebugController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or clear a breakpoint on a workflow step.
    pub fn set_breakpoint(&self, workflow_id: &str, step_id: &str, enabled: bool) {
        let mut breakpoints = self.breakpoints.lock().unwrap_or_else(|e| e.into_inner());
        let set = breakpoints.entry(workflow_id.to_string()).or_default();
        if enabled {
            set.insert(step_id.to_string());
        } else {
            set.remove(step_id);
        }
    }

    /// Put a run into single-step mode so it pauses before its next
    /// dispatch.
    pub fn pause(&self, run_id: &str) {
        self.single_step
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(run_id.to_string());
    }

    /// Whether the executor must pause before dispatching this step.
    pub fn should_pause(&self, workflow_id: &str, run_id: &str, step_id: &str) -> bool {
        let breakpoints = self.breakpoints.lock().unwrap_or_else(|e| e.into_inner());
        if breakpoints
            .get(workflow_id)
            .map(|set| set.contains(step_id))
            .unwrap_or(false)
        {
            return true;
        }
        drop(breakpoints);

        self.single_step
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(run_id)
    }

    /// The active pause for a run, if any.
    pub fn paused(&self, run_id: &str) -> Option<PausedInfo> {
        let paused = self.paused.lock().unwrap_or_else(|e| e.into_inner());
        paused.get(run_id).map(|slot| PausedInfo {
            run_id: run_id.to_string(),
            step_id: slot.step_id.clone(),
            context: slot.snapshot.clone(),
        })
    }

    /// Queue a mutation of a resolved workflow input; applied when the run
    /// resumes. Requires an active pause.
    pub fn patch_input(
        &self,
        run_id: &str,
        name: &str,
        value: serde_json::Value,
    ) -> EngineResult<()> {
        let paused = self.paused.lock().unwrap_or_else(|e| e.into_inner());
        if !paused.contains_key(run_id) {
            return Err(EngineError::RunNotFound(format!(
                "{run_id} (no active debug pause)"
            )));
        }
        drop(paused);

        self.patches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(run_id.to_string())
            .or_default()
            .push((name.to_string(), value));
        Ok(())
    }

    /// Send a signal to a paused run.
    pub fn send(&self, run_id: &str, command: DebugCommand) -> EngineResult<()> {
        let paused = self.paused.lock().unwrap_or_else(|e| e.into_inner());
        let slot = paused.get(run_id).ok_or_else(|| {
            EngineError::RunNotFound(format!("{run_id} (no active debug pause)"))
        })?;
        slot.tx
            .try_send(command)
            .map_err(|_| EngineError::Internal("debug resume already signalled".to_string()))
    }

    /// Executor side: park until a signal arrives or the idle cap expires.
    pub(crate) async fn wait_for_resume(
        &self,
        run_id: &str,
        step_id: &str,
        snapshot: serde_json::Value,
        idle_cap: Duration,
    ) -> PauseOutcome {
        let (tx, mut rx) = mpsc::channel(1);
        {
            let mut paused = self.paused.lock().unwrap_or_else(|e| e.into_inner());
            paused.insert(
                run_id.to_string(),
                PauseSlot {
                    step_id: step_id.to_string(),
                    snapshot,
                    tx,
                },
            );
        }

        let received = tokio::time::timeout(idle_cap, rx.recv()).await;

        {
            let mut paused = self.paused.lock().unwrap_or_else(|e| e.into_inner());
            paused.remove(run_id);
        }

        let command = match received {
            Ok(Some(command)) => command,
            Ok(None) => return PauseOutcome::IdleTimeout,
            Err(_) => {
                tracing::warn!(run_id, step_id, "debug pause hit its idle cap");
                return PauseOutcome::IdleTimeout;
            }
        };

        {
            let mut single_step = self.single_step.lock().unwrap_or_else(|e| e.into_inner());
            match command {
                DebugCommand::StepOver => {
                    single_step.insert(run_id.to_string());
                }
                DebugCommand::ContinueRun => {
                    single_step.remove(run_id);
                }
                DebugCommand::Resume => {}
            }
        }

        let patches = self
            .patches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(run_id)
            .unwrap_or_default();

        PauseOutcome::Resumed { patches }
    }

    /// Drop run-scoped state once a run finishes.
    pub(crate) fn forget_run(&self, run_id: &str) {
        self.single_step
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(run_id);
        self.patches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breakpoint_toggling() {
        let debug = DebugController::new();
        debug.set_breakpoint("wf", "risky", true);
        assert!(debug.should_pause("wf", "r1", "risky"));
        assert!(!debug.should_pause("wf", "r1", "safe"));

        debug.set_breakpoint("wf", "risky", false);
        assert!(!debug.should_pause("wf", "r1", "risky"));
    }

    #[test]
    fn test_single_step_mode_is_run_scoped() {
        let debug = DebugController::new();
        debug.pause("r1");
        assert!(debug.should_pause("wf", "r1", "any"));
        assert!(!debug.should_pause("wf", "r2", "any"));
    }

    #[tokio::test]
    async fn test_resume_releases_pause_and_hands_over_patches() {
        let debug = std::sync::Arc::new(DebugController::new());

        let waiter = {
            let debug = debug.clone();
            tokio::spawn(async move {
                debug
                    .wait_for_resume("r1", "s1", serde_json::json!({}), Duration::from_secs(5))
                    .await
            })
        };

        // Wait for the slot to appear, then inspect, patch, resume.
        while debug.paused("r1").is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let info = debug.paused("r1").unwrap();
        assert_eq!(info.step_id, "s1");

        debug.patch_input("r1", "limit", serde_json::json!(99)).unwrap();
        debug.send("r1", DebugCommand::ContinueRun).unwrap();

        match waiter.await.unwrap() {
            PauseOutcome::Resumed { patches } => {
                assert_eq!(patches, vec![("limit".to_string(), serde_json::json!(99))]);
            }
            PauseOutcome::IdleTimeout => panic!("expected resume"),
        }
        assert!(debug.paused("r1").is_none());
        assert!(!debug.should_pause("wf", "r1", "next"));
    }

    #[tokio::test]
    async fn test_step_over_keeps_single_step_mode() {
        let debug = std::sync::Arc::new(DebugController::new());
        let waiter = {
            let debug = debug.clone();
            tokio::spawn(async move {
                debug
                    .wait_for_resume("r1", "s1", serde_json::json!({}), Duration::from_secs(5))
                    .await
            })
        };

        while debug.paused("r1").is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        debug.send("r1", DebugCommand::StepOver).unwrap();
        waiter.await.unwrap();

        assert!(debug.should_pause("wf", "r1", "next"));
    }

    #[tokio::test]
    async fn test_idle_cap_expires_pause() {
        let debug = DebugController::new();
        let outcome = debug
            .wait_for_resume("r1", "s1", serde_json::json!({}), Duration::from_millis(50))
            .await;
        assert!(matches!(outcome, PauseOutcome::IdleTimeout));
        assert!(debug.paused("r1").is_none());
    }

    #[test]
    fn test_signals_require_active_pause() {
        let debug = DebugController::new();
        assert!(debug.send("ghost", DebugCommand::Resume).is_err());
        assert!(debug.patch_input("ghost", "x", serde_json::json!(1)).is_err());
    }
}
