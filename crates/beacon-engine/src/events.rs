//! Run event stream.
//!
//! Events are broadcast to external observers in causal order per run: a
//! step's start always precedes its completion, and a run's completion
//! event is always last. Emission never blocks step progress; a lagging
//! subscriber loses the oldest events rather than stalling the run.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use beacon_core::{RunStatus, StepStatus};

/// Event bus capacity; laggards drop oldest events past this.
const CHANNEL_CAPACITY: usize = 1024;

/// What happened.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEventKind {
    RunStarted,
    StepReady { step_id: String },
    StepStarted { step_id: String },
    StepRetrying { step_id: String, attempt: u32, delay_ms: u64 },
    StepCompleted { step_id: String, status: StepStatus },
    StepFailed { step_id: String, error: String },
    StepSkipped { step_id: String, reason: String },
    DebugPaused { step_id: String },
    DebugResumed { step_id: String },
    RunCompleted { status: RunStatus },
}

/// One event on the run stream.
#[derive(Debug, Clone, Serialize)]
pub struct RunEvent {
    pub run_id: String,
    pub workflow_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: RunEventKind,
}

/// Broadcast bus for run events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RunEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Emit an event. Never blocks; send failures (no subscribers) are
    /// ignored.
    pub fn emit(&self, run_id: &str, workflow_id: &str, kind: RunEventKind) {
        let event = RunEvent {
            run_id: run_id.to_string(),
            workflow_id: workflow_id.to_string(),
            timestamp: Utc::now(),
            kind,
        };
        tracing::debug!(run_id = %event.run_id, event = ?event.kind, "run event");
        let _ = self.tx.send(event);
    }

    /// Subscribe to every run's events.
    pub fn subscribe_all(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }

    /// Subscribe to one run's events.
    pub fn subscribe_run(&self, run_id: impl Into<String>) -> RunEvents {
        RunEvents {
            rx: self.tx.subscribe(),
            run_id: run_id.into(),
        }
    }
}

/// Filtered view of the bus for a single run.
pub struct RunEvents {
    rx: broadcast::Receiver<RunEvent>,
    run_id: String,
}

impl RunEvents {
    /// Next event for this run, or `None` once the bus closes.
    ///
    /// Lagged stretches are skipped, not treated as stream end.
    pub async fn next(&mut self) -> Option<RunEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.run_id == self.run_id => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
