//! Workflow executor.
//!
//! The single sequencing authority for a run. Waves are processed in
//! order; within a wave every eligible step is dispatched concurrently and
//! the executor advances only once the wave fully settles. A failed step
//! propagates `Skipped` to its transitive dependents and nothing else;
//! independent branches complete unaffected.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

use beacon_core::{
    analyze, AttemptRecord, ConditionEvaluator, EngineError, EngineResult, ExecutionContext,
    LoopFrame, RunStatus, StepKind, StepResult, StepStatus, ValidationIssue, Workflow,
    WorkflowRun, WorkflowStep,
};
use beacon_core::expr::resolver;
use beacon_sandbox::{ScriptSandbox, SandboxError};

use crate::collab::{AiInvoker, FileOpRunner, FileOperation, FsFileOps, PermissionGate};
use crate::config::EngineConfig;
use crate::debug::{DebugController, PauseOutcome};
use crate::events::{EventBus, RunEventKind, RunEvents};
use crate::history::{ExecutionHistoryStore, Redactor};

/// Handle for a live run.
struct RunHandle {
    cancel_tx: watch::Sender<bool>,
    join: Mutex<Option<JoinHandle<WorkflowRun>>>,
}

struct ExecutorInner {
    config: EngineConfig,
    sandbox: ScriptSandbox,
    ai: Mutex<Option<Arc<dyn AiInvoker>>>,
    file_ops: Mutex<Arc<dyn FileOpRunner>>,
    gate: Mutex<Option<Arc<dyn PermissionGate>>>,
    events: EventBus,
    history: ExecutionHistoryStore,
    debug: DebugController,
    workflows: Mutex<HashMap<String, Workflow>>,
    runs: Mutex<HashMap<String, Arc<RunHandle>>>,
    leaf_permits: Arc<Semaphore>,
}

/// The workflow execution engine.
pub struct WorkflowExecutor {
    inner: Arc<ExecutorInner>,
}

impl WorkflowExecutor {
    /// Create an executor over the configured project root.
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        let sandbox = ScriptSandbox::new(&config.project_root)
            .map_err(|e| EngineError::Internal(format!("project root: {e}")))?
            .with_timeout(config.script_timeout())
            .with_grace(config.termination_grace());

        let redactor = Redactor::new(&config.redact_key_pattern, &config.redact_value_patterns)?;
        let history = ExecutionHistoryStore::new(config.history_capacity, redactor);
        let leaf_permits = Arc::new(Semaphore::new(config.max_concurrent_steps.max(1)));

        Ok(Self {
            inner: Arc::new(ExecutorInner {
                config,
                sandbox,
                ai: Mutex::new(None),
                file_ops: Mutex::new(Arc::new(FsFileOps)),
                gate: Mutex::new(None),
                events: EventBus::new(),
                history,
                debug: DebugController::new(),
                workflows: Mutex::new(HashMap::new()),
                runs: Mutex::new(HashMap::new()),
                leaf_permits,
            }),
        })
    }

    /// Plug in the host's AI provider.
    pub fn with_ai_invoker(self, ai: Arc<dyn AiInvoker>) -> Self {
        *self.inner.ai.lock().unwrap_or_else(|e| e.into_inner()) = Some(ai);
        self
    }

    /// Replace the filesystem file-op runner.
    pub fn with_file_ops(self, file_ops: Arc<dyn FileOpRunner>) -> Self {
        *self.inner.file_ops.lock().unwrap_or_else(|e| e.into_inner()) = file_ops;
        self
    }

    /// Interpose a permission gate consulted before every run.
    pub fn with_permission_gate(self, gate: Arc<dyn PermissionGate>) -> Self {
        *self.inner.gate.lock().unwrap_or_else(|e| e.into_inner()) = Some(gate);
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn history(&self) -> &ExecutionHistoryStore {
        &self.inner.history
    }

    pub fn debug(&self) -> &DebugController {
        &self.inner.debug
    }

    /// Subscribe to one run's event stream.
    pub fn subscribe(&self, run_id: &str) -> RunEvents {
        self.inner.events.subscribe_run(run_id)
    }

    /// Register or set a breakpoint on a workflow step.
    pub fn set_breakpoint(&self, workflow_id: &str, step_id: &str, enabled: bool) {
        self.inner.debug.set_breakpoint(workflow_id, step_id, enabled);
    }

    /// Validate and register a workflow for execution by id.
    pub fn register(&self, workflow: Workflow) -> EngineResult<()> {
        resolver::preflight(&workflow)?;
        validate_graphs(&workflow.steps)?;

        let mut workflows = self.inner.workflows.lock().unwrap_or_else(|e| e.into_inner());
        workflows.insert(workflow.id.clone(), workflow);
        Ok(())
    }

    /// Start a run of a registered workflow. Returns the run id; progress
    /// is observable through [`Self::subscribe`] and the result through
    /// [`Self::wait`].
    pub async fn start(
        &self,
        workflow_id: &str,
        inputs: serde_json::Value,
    ) -> EngineResult<String> {
        let workflow = {
            let workflows = self.inner.workflows.lock().unwrap_or_else(|e| e.into_inner());
            workflows
                .get(workflow_id)
                .cloned()
                .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))?
        };

        let resolved_inputs = resolve_run_inputs(&workflow, &inputs)?;

        let gate = self
            .inner
            .gate
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(gate) = gate {
            if !gate.allow_run(&workflow.id).await {
                return Err(EngineError::PermissionDenied(workflow.id.clone()));
            }
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let inner = self.inner.clone();
        let task_run_id = run_id.clone();
        let join = tokio::spawn(async move {
            execute_run(inner, workflow, task_run_id, resolved_inputs, cancel_rx).await
        });

        let mut runs = self.inner.runs.lock().unwrap_or_else(|e| e.into_inner());
        runs.insert(
            run_id.clone(),
            Arc::new(RunHandle {
                cancel_tx,
                join: Mutex::new(Some(join)),
            }),
        );

        Ok(run_id)
    }

    /// Block until a started run finishes, returning its record.
    pub async fn wait(&self, run_id: &str) -> EngineResult<WorkflowRun> {
        let handle = {
            let runs = self.inner.runs.lock().unwrap_or_else(|e| e.into_inner());
            runs.get(run_id)
                .cloned()
                .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))?
        };

        let join = handle
            .join
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| EngineError::RunNotFound(format!("{run_id} (already waited)")))?;

        let run = join
            .await
            .map_err(|e| EngineError::Internal(format!("run task failed: {e}")))?;

        let mut runs = self.inner.runs.lock().unwrap_or_else(|e| e.into_inner());
        runs.remove(run_id);
        Ok(run)
    }

    /// Register, start, and wait in one call.
    pub async fn run_workflow(
        &self,
        workflow: Workflow,
        inputs: serde_json::Value,
    ) -> EngineResult<WorkflowRun> {
        let workflow_id = workflow.id.clone();
        self.register(workflow)?;
        let run_id = self.start(&workflow_id, inputs).await?;
        self.wait(&run_id).await
    }

    /// Cancel a live run. In-flight sandboxes are terminated and every
    /// non-terminal step transitions to `Cancelled`.
    pub fn cancel(&self, run_id: &str) -> EngineResult<()> {
        let runs = self.inner.runs.lock().unwrap_or_else(|e| e.into_inner());
        let handle = runs
            .get(run_id)
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))?;
        let _ = handle.cancel_tx.send(true);
        Ok(())
    }
}

/// Cycle-check every nesting level before a workflow is accepted.
fn validate_graphs(steps: &[WorkflowStep]) -> EngineResult<()> {
    analyze(steps)?;
    for step in steps {
        for body in step.nested_bodies() {
            validate_graphs(body)?;
        }
    }
    Ok(())
}

/// Check caller inputs against the declared specs, applying defaults.
/// Problems are reported as one validation batch and the run never starts.
pub fn resolve_run_inputs(
    workflow: &Workflow,
    provided: &serde_json::Value,
) -> EngineResult<serde_json::Value> {
    let mut issues = Vec::new();

    let provided_map = match provided {
        serde_json::Value::Object(map) => map.clone(),
        serde_json::Value::Null => serde_json::Map::new(),
        _ => {
            return Err(EngineError::validation(
                "inputs",
                "run inputs must be an object",
            ));
        }
    };

    let mut resolved = serde_json::Map::new();
    for (name, spec) in &workflow.inputs {
        match provided_map.get(name) {
            Some(value) if !value.is_null() => {
                if spec.input_type.matches(value) {
                    resolved.insert(name.clone(), value.clone());
                } else {
                    issues.push(ValidationIssue::at(
                        format!("inputs.{name}"),
                        format!("expected {}, got incompatible value", spec.input_type),
                    ));
                }
            }
            _ => {
                if let Some(default) = &spec.default {
                    resolved.insert(name.clone(), default.clone());
                } else if spec.required {
                    issues.push(ValidationIssue::at(
                        format!("inputs.{name}"),
                        "missing required input",
                    ));
                }
            }
        }
    }

    for name in provided_map.keys() {
        if !workflow.inputs.contains_key(name) {
            issues.push(ValidationIssue::at(
                format!("inputs.{name}"),
                "unknown input",
            ));
        }
    }

    if issues.is_empty() {
        Ok(serde_json::Value::Object(resolved))
    } else {
        Err(EngineError::Validation(issues))
    }
}

// ============================================================================
// Run loop
// ============================================================================

#[derive(Default)]
struct LevelOutcome {
    results: Vec<StepResult>,
    outputs: Vec<(String, serde_json::Value)>,
    branches: Vec<(String, bool)>,
    iterations: Vec<(String, u32)>,
    fatal: Option<String>,
    cancelled: bool,
}

struct StepExecution {
    result: StepResult,
    nested_results: Vec<StepResult>,
    outputs: Vec<(String, serde_json::Value)>,
    branches: Vec<(String, bool)>,
    iterations: Vec<(String, u32)>,
    fatal: Option<String>,
}

impl StepExecution {
    fn from_result(result: StepResult) -> Self {
        let mut outputs = Vec::new();
        if result.status == StepStatus::Succeeded {
            if let Some(output) = &result.output {
                outputs.push((result.step_id.clone(), output.clone()));
            }
        }
        Self {
            result,
            nested_results: Vec::new(),
            outputs,
            branches: Vec::new(),
            iterations: Vec::new(),
            fatal: None,
        }
    }

    fn set_result(&mut self, result: StepResult) {
        if result.status == StepStatus::Succeeded {
            if let Some(output) = &result.output {
                self.outputs.push((result.step_id.clone(), output.clone()));
            }
        }
        self.result = result;
    }
}

async fn execute_run(
    inner: Arc<ExecutorInner>,
    workflow: Workflow,
    run_id: String,
    inputs: serde_json::Value,
    cancel: watch::Receiver<bool>,
) -> WorkflowRun {
    tracing::info!(workflow_id = %workflow.id, run_id = %run_id, "run started");
    let mut run = WorkflowRun::new(&run_id, &workflow.id, inputs.clone());
    inner
        .events
        .emit(&run_id, &workflow.id, RunEventKind::RunStarted);

    let ctx = ExecutionContext::with_process_env(inputs);
    let level = run_level(
        inner.clone(),
        workflow.id.clone(),
        run_id.clone(),
        workflow.steps.clone(),
        ctx,
        cancel,
    )
    .await;

    run.step_results = level.results;
    run.taken_branches = level.branches.into_iter().collect();
    run.loop_iterations = level.iterations.into_iter().collect();

    let any_failed = run
        .step_results
        .iter()
        .any(|r| r.status == StepStatus::Failed);
    let status = if level.cancelled {
        RunStatus::Cancelled
    } else if level.fatal.is_some() || any_failed {
        RunStatus::Failed
    } else {
        RunStatus::Completed
    };
    run.finish(status);

    tracing::info!(workflow_id = %workflow.id, run_id = %run_id, status = %status, "run finished");
    inner
        .events
        .emit(&run_id, &workflow.id, RunEventKind::RunCompleted { status });
    inner.history.insert(run.clone());
    inner.debug.forget_run(&run_id);
    run
}

/// Execute one step list to completion. Boxed for recursion into
/// conditional branches and loop bodies.
fn run_level(
    inner: Arc<ExecutorInner>,
    workflow_id: String,
    run_id: String,
    steps: Vec<WorkflowStep>,
    ctx: ExecutionContext,
    cancel: watch::Receiver<bool>,
) -> Pin<Box<dyn Future<Output = LevelOutcome> + Send>> {
    Box::pin(run_level_inner(inner, workflow_id, run_id, steps, ctx, cancel))
}

async fn run_level_inner(
    inner: Arc<ExecutorInner>,
    workflow_id: String,
    run_id: String,
    steps: Vec<WorkflowStep>,
    mut ctx: ExecutionContext,
    cancel: watch::Receiver<bool>,
) -> LevelOutcome {
    let mut outcome = LevelOutcome::default();

    let plan = match analyze(&steps) {
        Ok(plan) => plan,
        Err(e) => {
            outcome.fatal = Some(e.to_string());
            return outcome;
        }
    };

    let step_index: HashMap<&str, &WorkflowStep> =
        steps.iter().map(|s| (s.id.as_str(), s)).collect();
    let mut statuses: HashMap<String, StepStatus> = steps
        .iter()
        .map(|s| (s.id.clone(), StepStatus::Pending))
        .collect();

    'waves: for wave in &plan.waves {
        if *cancel.borrow() {
            outcome.cancelled = true;
            break 'waves;
        }

        let mut join_set: JoinSet<StepExecution> = JoinSet::new();

        for step_id in wave {
            let step = step_index[step_id.as_str()];

            // Eligibility: every dependency must have succeeded.
            let unsatisfied = plan.dependencies[step_id]
                .iter()
                .find(|dep| statuses.get(*dep) != Some(&StepStatus::Succeeded));
            if let Some(dep) = unsatisfied {
                let dep_status = statuses
                    .get(dep)
                    .copied()
                    .unwrap_or(StepStatus::Pending);
                let reason = format!("dependency `{dep}` {dep_status}");
                statuses.insert(step_id.clone(), StepStatus::Skipped);
                inner.events.emit(
                    &run_id,
                    &workflow_id,
                    RunEventKind::StepSkipped {
                        step_id: step_id.clone(),
                        reason: reason.clone(),
                    },
                );
                outcome.results.push(StepResult::skipped(step_id, reason));
                continue;
            }

            // Debug gate: suspend before dispatch, resume on signal.
            if inner.debug.should_pause(&workflow_id, &run_id, step_id) {
                inner.events.emit(
                    &run_id,
                    &workflow_id,
                    RunEventKind::DebugPaused {
                        step_id: step_id.clone(),
                    },
                );
                let pause = inner
                    .debug
                    .wait_for_resume(
                        &run_id,
                        step_id,
                        ctx.snapshot(),
                        inner.config.debug_idle_cap(),
                    )
                    .await;
                match pause {
                    PauseOutcome::Resumed { patches } => {
                        for (name, value) in patches {
                            ctx.set_input(&name, value);
                        }
                        inner.events.emit(
                            &run_id,
                            &workflow_id,
                            RunEventKind::DebugResumed {
                                step_id: step_id.clone(),
                            },
                        );
                    }
                    PauseOutcome::IdleTimeout => {
                        statuses.insert(step_id.clone(), StepStatus::Cancelled);
                        outcome.results.push(StepResult::cancelled(step_id));
                        outcome.cancelled = true;
                        break;
                    }
                }
            }

            inner.events.emit(
                &run_id,
                &workflow_id,
                RunEventKind::StepReady {
                    step_id: step_id.clone(),
                },
            );

            statuses.insert(step_id.clone(), StepStatus::Running);
            inner.events.emit(
                &run_id,
                &workflow_id,
                RunEventKind::StepStarted {
                    step_id: step_id.clone(),
                },
            );

            // Each task reads a context snapshot resolved before dispatch;
            // outputs merge only after completion, under the owner's key.
            join_set.spawn(run_step(
                inner.clone(),
                workflow_id.clone(),
                run_id.clone(),
                step.clone(),
                ctx.clone(),
                cancel.clone(),
            ));
        }

        // Settle the wave.
        while let Some(joined) = join_set.join_next().await {
            let exec = match joined {
                Ok(exec) => exec,
                Err(e) => {
                    tracing::error!(error = %e, "step task failed to join");
                    outcome.fatal = Some(format!("internal: step task failed: {e}"));
                    continue;
                }
            };

            statuses.insert(exec.result.step_id.clone(), exec.result.status);

            for (sid, value) in &exec.outputs {
                if let Err(e) = ctx.record_output(sid, value.clone()) {
                    tracing::error!(step_id = %sid, error = %e, "output merge rejected");
                }
            }

            match &exec.result.status {
                StepStatus::Failed => inner.events.emit(
                    &run_id,
                    &workflow_id,
                    RunEventKind::StepFailed {
                        step_id: exec.result.step_id.clone(),
                        error: exec
                            .result
                            .error
                            .clone()
                            .unwrap_or_else(|| "unknown error".to_string()),
                    },
                ),
                status => inner.events.emit(
                    &run_id,
                    &workflow_id,
                    RunEventKind::StepCompleted {
                        step_id: exec.result.step_id.clone(),
                        status: *status,
                    },
                ),
            }

            if exec.result.status == StepStatus::Cancelled {
                outcome.cancelled = true;
            }
            if exec.fatal.is_some() {
                outcome.fatal = exec.fatal;
            }

            outcome.outputs.extend(exec.outputs);
            outcome.branches.extend(exec.branches);
            outcome.iterations.extend(exec.iterations);
            outcome.results.extend(exec.nested_results);
            outcome.results.push(exec.result);
        }

        if outcome.fatal.is_some() || outcome.cancelled {
            break 'waves;
        }
    }

    // Anything still pending was cut off by cancellation or a fatal error.
    for step in &steps {
        let status = statuses
            .get(&step.id)
            .copied()
            .unwrap_or(StepStatus::Pending);
        if status.is_terminal() || status == StepStatus::Running {
            continue;
        }
        if outcome.cancelled {
            inner.events.emit(
                &run_id,
                &workflow_id,
                RunEventKind::StepCompleted {
                    step_id: step.id.clone(),
                    status: StepStatus::Cancelled,
                },
            );
            outcome.results.push(StepResult::cancelled(&step.id));
        } else if outcome.fatal.is_some() {
            let reason = "run aborted".to_string();
            inner.events.emit(
                &run_id,
                &workflow_id,
                RunEventKind::StepSkipped {
                    step_id: step.id.clone(),
                    reason: reason.clone(),
                },
            );
            outcome.results.push(StepResult::skipped(&step.id, reason));
        }
    }

    outcome
}

// ============================================================================
// Step dispatch
// ============================================================================

async fn run_step(
    inner: Arc<ExecutorInner>,
    workflow_id: String,
    run_id: String,
    step: WorkflowStep,
    ctx: ExecutionContext,
    cancel: watch::Receiver<bool>,
) -> StepExecution {
    match &step.kind {
        StepKind::Script { .. } | StepKind::AiCall { .. } | StepKind::FileOp { .. } => {
            let result = run_leaf(&inner, &workflow_id, &run_id, &step, &ctx, &cancel).await;
            StepExecution::from_result(result)
        }
        StepKind::Conditional {
            condition,
            then_steps,
            else_steps,
        } => {
            run_conditional(
                &inner,
                &workflow_id,
                &run_id,
                &step,
                condition,
                then_steps,
                else_steps,
                &ctx,
                &cancel,
            )
            .await
        }
        StepKind::Loop {
            over,
            max_iterations,
            body,
        } => {
            run_loop(
                &inner,
                &workflow_id,
                &run_id,
                &step,
                over,
                *max_iterations,
                body,
                &ctx,
                &cancel,
            )
            .await
        }
    }
}

enum LeafError {
    Cancelled,
    Fail { message: String, retryable: bool },
}

/// Run a leaf action (script, AI call, file op) with retry handling.
async fn run_leaf(
    inner: &Arc<ExecutorInner>,
    workflow_id: &str,
    run_id: &str,
    step: &WorkflowStep,
    ctx: &ExecutionContext,
    cancel: &watch::Receiver<bool>,
) -> StepResult {
    let total_start = Instant::now();

    let inputs_value = serde_json::Value::Object(
        step.inputs
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    );
    let resolved_inputs = match resolver::resolve_value(&inputs_value, ctx) {
        Ok(v) => v,
        Err(e) => {
            return StepResult::failed(
                &step.id,
                e.to_string(),
                total_start.elapsed().as_millis() as u64,
            )
        }
    };

    let max_attempts = step
        .retry_policy
        .as_ref()
        .map(|p| p.max_attempts)
        .unwrap_or(1)
        .max(1);
    let mut attempts: Vec<AttemptRecord> = Vec::new();
    let mut attempt = 1u32;

    loop {
        if *cancel.borrow() {
            return StepResult::cancelled(&step.id).with_attempts(attempts);
        }

        let attempt_start = Instant::now();
        let outcome = perform_action(inner, step, &resolved_inputs, ctx, cancel).await;
        let duration_ms = attempt_start.elapsed().as_millis() as u64;

        match outcome {
            Ok(output) => {
                attempts.push(AttemptRecord {
                    attempt,
                    error: None,
                    duration_ms,
                });
                return StepResult::succeeded(
                    &step.id,
                    output,
                    total_start.elapsed().as_millis() as u64,
                )
                .with_attempts(attempts);
            }
            Err(LeafError::Cancelled) => {
                return StepResult::cancelled(&step.id).with_attempts(attempts);
            }
            Err(LeafError::Fail { message, retryable }) => {
                attempts.push(AttemptRecord {
                    attempt,
                    error: Some(message.clone()),
                    duration_ms,
                });

                let policy = step.retry_policy.as_ref();
                let can_retry = retryable && policy.is_some() && attempt < max_attempts;
                if !can_retry {
                    return StepResult::failed(
                        &step.id,
                        message,
                        total_start.elapsed().as_millis() as u64,
                    )
                    .with_attempts(attempts);
                }

                let delay = policy
                    .map(|p| p.delay_before_attempt(attempt))
                    .unwrap_or(Duration::ZERO);
                tracing::debug!(
                    step_id = %step.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying step"
                );
                inner.events.emit(
                    run_id,
                    workflow_id,
                    RunEventKind::StepRetrying {
                        step_id: step.id.clone(),
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                    },
                );

                let mut cancel_watch = cancel.clone();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel_watch.changed() => {
                        if *cancel_watch.borrow() {
                            return StepResult::cancelled(&step.id).with_attempts(attempts);
                        }
                    }
                }
                attempt += 1;
            }
        }
    }
}

async fn perform_action(
    inner: &Arc<ExecutorInner>,
    step: &WorkflowStep,
    resolved_inputs: &serde_json::Value,
    ctx: &ExecutionContext,
    cancel: &watch::Receiver<bool>,
) -> Result<serde_json::Value, LeafError> {
    let _permit = inner
        .leaf_permits
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| LeafError::Cancelled)?;

    match &step.kind {
        StepKind::Script { script, timeout_ms } => {
            let script = resolve_to_string(script, ctx)?;
            let timeout = timeout_ms.map(Duration::from_millis);
            match inner
                .sandbox
                .execute(&script, resolved_inputs, timeout, Some(cancel.clone()))
                .await
            {
                Ok(outcome) => Ok(outcome.output),
                Err(SandboxError::Cancelled { .. }) => Err(LeafError::Cancelled),
                Err(e) => {
                    let retryable = e.is_retryable();
                    let message = match &e {
                        SandboxError::Timeout { partial_stdout, .. } if !partial_stdout.is_empty() => {
                            format!("{e}; partial output: {}", partial_stdout.trim_end())
                        }
                        _ => e.to_string(),
                    };
                    Err(LeafError::Fail { message, retryable })
                }
            }
        }
        StepKind::AiCall { prompt, model } => {
            let prompt = resolve_to_string(prompt, ctx)?;
            let ai = inner
                .ai
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
                .ok_or_else(|| LeafError::Fail {
                    message: "no AI invoker configured".to_string(),
                    retryable: false,
                })?;

            let mut cancel_watch = cancel.clone();
            tokio::select! {
                result = ai.invoke(&prompt, model.as_deref()) => {
                    result.map_err(|e| LeafError::Fail {
                        retryable: e.is_retryable(),
                        message: format!("AI call failed: {e}"),
                    })
                }
                _ = cancel_watch.changed() => Err(LeafError::Cancelled),
            }
        }
        StepKind::FileOp {
            operation,
            path,
            target,
            content,
        } => {
            let path = resolve_to_string(path, ctx)?;
            let root = inner.sandbox.root();

            // Write targets may not exist yet; everything else must.
            let validated_path = match operation {
                beacon_core::FileOpKind::Write | beacon_core::FileOpKind::Append => {
                    beacon_sandbox::path::validate_target_within(root, &path)
                }
                _ => beacon_sandbox::path::validate_within(root, &path),
            }
            .map_err(sandbox_path_error)?;

            let validated_target = match target {
                Some(target) => {
                    let target = resolve_to_string(target, ctx)?;
                    Some(
                        beacon_sandbox::path::validate_target_within(root, &target)
                            .map_err(sandbox_path_error)?,
                    )
                }
                None => None,
            };

            let resolved_content = match content {
                Some(content) => Some(resolve_to_string(content, ctx)?),
                None => None,
            };

            let op = FileOperation {
                kind: *operation,
                path: validated_path,
                target: validated_target,
                content: resolved_content,
            };
            let file_ops = inner
                .file_ops
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            file_ops.run(&op).await.map_err(|e| LeafError::Fail {
                retryable: e.is_retryable(),
                message: format!("file operation failed: {e}"),
            })
        }
        _ => Err(LeafError::Fail {
            message: "not a leaf step".to_string(),
            retryable: false,
        }),
    }
}

fn sandbox_path_error(e: SandboxError) -> LeafError {
    LeafError::Fail {
        message: e.to_string(),
        retryable: false,
    }
}

fn resolve_to_string(expr: &str, ctx: &ExecutionContext) -> Result<String, LeafError> {
    match resolver::resolve_string(expr, ctx) {
        Ok(serde_json::Value::String(s)) => Ok(s),
        Ok(other) => Ok(other.to_string()),
        Err(e) => Err(LeafError::Fail {
            message: e.to_string(),
            retryable: false,
        }),
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_conditional(
    inner: &Arc<ExecutorInner>,
    workflow_id: &str,
    run_id: &str,
    step: &WorkflowStep,
    condition: &str,
    then_steps: &[WorkflowStep],
    else_steps: &[WorkflowStep],
    ctx: &ExecutionContext,
    cancel: &watch::Receiver<bool>,
) -> StepExecution {
    let start = Instant::now();
    let evaluator = ConditionEvaluator::new();

    let taken = match evaluator.evaluate(condition, ctx) {
        Ok(b) => b,
        Err(e) => {
            return StepExecution::from_result(StepResult::failed(
                &step.id,
                e.to_string(),
                start.elapsed().as_millis() as u64,
            ))
        }
    };

    let (chosen, untaken) = if taken {
        (then_steps, else_steps)
    } else {
        (else_steps, then_steps)
    };

    let mut exec = StepExecution {
        result: StepResult::cancelled(&step.id),
        nested_results: Vec::new(),
        outputs: Vec::new(),
        branches: vec![(step.id.clone(), taken)],
        iterations: Vec::new(),
        fatal: None,
    };

    // The untaken branch is never dispatched; its steps (nested included)
    // are marked Skipped and excluded from dependency waiting.
    for skipped in flatten_steps(untaken) {
        inner.events.emit(
            run_id,
            workflow_id,
            RunEventKind::StepSkipped {
                step_id: skipped.id.clone(),
                reason: "branch not taken".to_string(),
            },
        );
        exec.nested_results
            .push(StepResult::skipped(&skipped.id, "branch not taken"));
    }

    let level = run_level(
        inner.clone(),
        workflow_id.to_string(),
        run_id.to_string(),
        chosen.to_vec(),
        ctx.clone(),
        cancel.clone(),
    )
    .await;

    let branch_failed = level
        .results
        .iter()
        .any(|r| r.status == StepStatus::Failed)
        || level.fatal.is_some();
    let branch_cancelled = level.cancelled;

    exec.outputs.extend(level.outputs.iter().cloned());
    exec.nested_results.extend(level.results);
    exec.branches.extend(level.branches);
    exec.iterations.extend(level.iterations);
    exec.fatal = level.fatal;

    let duration_ms = start.elapsed().as_millis() as u64;
    let result = if branch_cancelled {
        StepResult::cancelled(&step.id)
    } else if branch_failed {
        StepResult::failed(&step.id, "branch step failed", duration_ms)
    } else {
        let output = serde_json::json!({
            "branch": if taken { "then" } else { "else" },
            "condition": taken,
        });
        StepResult::succeeded(&step.id, output, duration_ms)
    };
    exec.set_result(result);

    exec
}

#[allow(clippy::too_many_arguments)]
async fn run_loop(
    inner: &Arc<ExecutorInner>,
    workflow_id: &str,
    run_id: &str,
    step: &WorkflowStep,
    over: &str,
    max_iterations: u32,
    body: &[WorkflowStep],
    ctx: &ExecutionContext,
    cancel: &watch::Receiver<bool>,
) -> StepExecution {
    let start = Instant::now();

    let source = match resolver::resolve_string(over, ctx) {
        Ok(v) => v,
        Err(e) => {
            return StepExecution::from_result(StepResult::failed(
                &step.id,
                e.to_string(),
                start.elapsed().as_millis() as u64,
            ))
        }
    };
    let frames = match iteration_frames(&source) {
        Ok(frames) => frames,
        Err(msg) => {
            return StepExecution::from_result(StepResult::failed(
                &step.id,
                msg,
                start.elapsed().as_millis() as u64,
            ))
        }
    };

    let mut exec = StepExecution {
        result: StepResult::cancelled(&step.id),
        nested_results: Vec::new(),
        outputs: Vec::new(),
        branches: Vec::new(),
        iterations: Vec::new(),
        fatal: None,
    };

    let mut collected: Vec<serde_json::Value> = Vec::new();
    let mut completed: u32 = 0;
    let mut failure: Option<String> = None;
    let mut cancelled = false;

    for (index, frame) in frames.into_iter().enumerate() {
        if index as u32 >= max_iterations {
            // The cap is a hard limit: exceeding it fails the whole run,
            // not just this step.
            let err = EngineError::LoopLimitExceeded {
                step: step.id.clone(),
                limit: max_iterations,
            };
            exec.fatal = Some(err.to_string());
            failure = Some(err.to_string());
            break;
        }
        if *cancel.borrow() {
            cancelled = true;
            break;
        }

        // Body steps run against an iteration-scoped child context; their
        // outputs live and die with the iteration, while the loop step
        // owns the single aggregated output.
        let mut child = ctx.clone();
        child.push_frame(frame);

        let level = run_level(
            inner.clone(),
            workflow_id.to_string(),
            run_id.to_string(),
            body.to_vec(),
            child,
            cancel.clone(),
        )
        .await;

        if level.cancelled {
            cancelled = true;
            break;
        }

        let iteration_output: serde_json::Map<String, serde_json::Value> =
            level.outputs.into_iter().collect();
        collected.push(serde_json::Value::Object(iteration_output));

        if let Some(fatal) = level.fatal {
            exec.fatal = Some(fatal.clone());
            failure = Some(fatal);
            break;
        }
        if let Some(failed) = level.results.iter().find(|r| r.status == StepStatus::Failed) {
            failure = Some(format!(
                "iteration {index}: step `{}` failed: {}",
                failed.step_id,
                failed.error.as_deref().unwrap_or("unknown error")
            ));
            break;
        }

        completed += 1;
    }

    exec.iterations.push((step.id.clone(), completed));
    let duration_ms = start.elapsed().as_millis() as u64;

    let result = if cancelled {
        StepResult::cancelled(&step.id)
    } else if let Some(message) = failure {
        let mut result = StepResult::failed(&step.id, message, duration_ms);
        // Keep what the completed iterations produced for debugging.
        if !collected.is_empty() {
            result.output = Some(serde_json::json!({ "partial_results": collected }));
        }
        result
    } else {
        let output = serde_json::json!({
            "iterations": completed,
            "results": collected,
        });
        StepResult::succeeded(&step.id, output, duration_ms)
    };
    exec.set_result(result);

    exec
}

/// Coerce a resolved iteration source into an ordered frame sequence:
/// arrays iterate items, objects iterate entries, numbers iterate `0..n`.
fn iteration_frames(source: &serde_json::Value) -> Result<Vec<LoopFrame>, String> {
    match source {
        serde_json::Value::Array(items) => Ok(items
            .iter()
            .enumerate()
            .map(|(i, item)| LoopFrame::for_item(item.clone(), i))
            .collect()),
        serde_json::Value::Object(map) => Ok(map
            .iter()
            .enumerate()
            .map(|(i, (k, v))| LoopFrame::for_entry(k.clone(), v.clone(), i))
            .collect()),
        serde_json::Value::Number(n) => {
            let count = n
                .as_u64()
                .ok_or_else(|| format!("numeric loop source must be a non-negative integer, got {n}"))?;
            Ok((0..count)
                .map(|i| LoopFrame::for_item(serde_json::json!(i), i as usize))
                .collect())
        }
        serde_json::Value::String(s) => {
            let parsed: serde_json::Value = serde_json::from_str(s)
                .map_err(|_| format!("loop source did not resolve to an iterable: {s}"))?;
            match parsed {
                serde_json::Value::String(_) => {
                    Err("loop source did not resolve to an iterable".to_string())
                }
                other => iteration_frames(&other),
            }
        }
        other => Err(format!(
            "loop source did not resolve to an iterable: {other}"
        )),
    }
}

fn flatten_steps(steps: &[WorkflowStep]) -> Vec<&WorkflowStep> {
    let mut out = Vec::new();
    fn walk<'a>(steps: &'a [WorkflowStep], out: &mut Vec<&'a WorkflowStep>) {
        for step in steps {
            out.push(step);
            for body in step.nested_bodies() {
                walk(body, out);
            }
        }
    }
    walk(steps, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::parse_workflow;

    #[test]
    fn test_resolve_run_inputs_applies_defaults_and_types() {
        let workflow = parse_workflow(
            r#"
name: wf
inputs:
  region:
    type: string
    required: true
  limit:
    type: number
    default: 10
steps:
  - id: noop
    type: file_op
    operation: list
    path: "."
"#,
        )
        .unwrap();

        let resolved =
            resolve_run_inputs(&workflow, &serde_json::json!({"region": "eu"})).unwrap();
        assert_eq!(resolved["region"], "eu");
        assert_eq!(resolved["limit"], 10);

        let err = resolve_run_inputs(&workflow, &serde_json::json!({})).unwrap_err();
        assert!(err.to_string().contains("1 issue"));

        let err =
            resolve_run_inputs(&workflow, &serde_json::json!({"region": 5, "extra": 1}))
                .unwrap_err();
        match err {
            EngineError::Validation(issues) => assert_eq!(issues.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_iteration_frames_coercion() {
        let frames = iteration_frames(&serde_json::json!(["a", "b"])).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].get("item"), Some(&serde_json::json!("b")));
        assert_eq!(frames[1].get("index"), Some(&serde_json::json!(1)));

        let frames = iteration_frames(&serde_json::json!({"x": 1, "y": 2})).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].get("key"), Some(&serde_json::json!("x")));

        let frames = iteration_frames(&serde_json::json!(3)).unwrap();
        assert_eq!(frames.len(), 3);

        assert!(iteration_frames(&serde_json::json!(true)).is_err());
        assert!(iteration_frames(&serde_json::json!("not json")).is_err());
    }

    #[test]
    fn test_validate_graphs_recurses_into_bodies() {
        let workflow = parse_workflow(
            r#"
name: nested-cycle
steps:
  - id: outer
    type: loop
    over: "3"
    body:
      - id: x
        type: file_op
        operation: list
        path: "."
        depends_on: [y]
      - id: y
        type: file_op
        operation: list
        path: "."
        depends_on: [x]
"#,
        )
        .unwrap();

        let err = validate_graphs(&workflow.steps).unwrap_err();
        assert!(matches!(err, EngineError::CycleDetected(_)));
    }
}
