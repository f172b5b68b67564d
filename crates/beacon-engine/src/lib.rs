//! Beacon workflow engine.
//!
//! Drives validated workflow definitions: wave-ordered concurrent step
//! dispatch, conditional branching, bounded loops, retry with exponential
//! backoff, sandboxed script execution, debug sessions, an ordered run
//! event stream, and a bounded execution history with write-time
//! redaction.

pub mod collab;
pub mod config;
pub mod debug;
pub mod events;
pub mod executor;
pub mod history;

pub use collab::{AiInvoker, CollabError, FileOpRunner, FileOperation, FsFileOps, PermissionGate};
pub use config::EngineConfig;
pub use debug::{DebugCommand, DebugController, PausedInfo};
pub use events::{EventBus, RunEvent, RunEventKind, RunEvents};
pub use executor::{resolve_run_inputs, WorkflowExecutor};
pub use history::{ExecutionHistoryStore, Redactor};
