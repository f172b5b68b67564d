//! End-to-end executor tests: wave scheduling, control flow, retries,
//! sandboxing, cancellation, history.

use std::sync::Arc;
use std::time::{Duration, Instant};

use beacon_core::{parse_workflow, RunStatus, StepStatus};
use beacon_engine::{
    AiInvoker, CollabError, EngineConfig, PermissionGate, RunEventKind, WorkflowExecutor,
};

fn project_with_scripts() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let scripts = dir.path().join("scripts");
    std::fs::create_dir(&scripts).unwrap();

    std::fs::write(scripts.join("ok.sh"), "cat > /dev/null\nprintf '{\"ok\": true}'\n").unwrap();
    std::fs::write(scripts.join("echo.sh"), "cat\n").unwrap();
    std::fs::write(
        scripts.join("emit_score.sh"),
        "cat > /dev/null\nprintf '{\"score\": 90}'\n",
    )
    .unwrap();
    std::fs::write(scripts.join("fail.sh"), "cat > /dev/null\nexit 1\n").unwrap();
    std::fs::write(
        scripts.join("slow.sh"),
        "cat > /dev/null\nsleep 1\nprintf '{\"ok\": true}'\n",
    )
    .unwrap();
    std::fs::write(
        scripts.join("hang.sh"),
        "cat > /dev/null\necho starting\nsleep 30\nprintf '{\"ok\": true}'\n",
    )
    .unwrap();

    dir
}

fn executor_for(dir: &tempfile::TempDir) -> WorkflowExecutor {
    let mut config = EngineConfig::rooted_at(dir.path());
    config.termination_grace_ms = 300;
    WorkflowExecutor::new(config).unwrap()
}

#[tokio::test]
async fn independent_branch_survives_a_failure() {
    let dir = project_with_scripts();
    let executor = executor_for(&dir);
    let mut all_events = executor.events().subscribe_all();

    let workflow = parse_workflow(
        r#"
name: partial-failure
steps:
  - id: a
    type: script
    script: scripts/fail.sh
  - id: b
    type: script
    script: scripts/ok.sh
    depends_on: [a]
  - id: c
    type: script
    script: scripts/ok.sh
"#,
    )
    .unwrap();

    let run = executor
        .run_workflow(workflow, serde_json::json!({}))
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.step_result("a").unwrap().status, StepStatus::Failed);
    assert_eq!(run.step_result("b").unwrap().status, StepStatus::Skipped);
    assert_eq!(run.step_result("c").unwrap().status, StepStatus::Succeeded);
    assert!(run
        .step_result("b")
        .unwrap()
        .error
        .as_deref()
        .unwrap()
        .contains("dependency `a`"));

    // Causal order: run start first, run completion last, every step's
    // start before its terminal event.
    let mut kinds = Vec::new();
    while let Ok(event) = all_events.try_recv() {
        kinds.push(event.kind);
    }
    assert!(matches!(kinds.first(), Some(RunEventKind::RunStarted)));
    assert!(matches!(kinds.last(), Some(RunEventKind::RunCompleted { .. })));
    let started_a = kinds
        .iter()
        .position(|k| matches!(k, RunEventKind::StepStarted { step_id } if step_id == "a"))
        .unwrap();
    let failed_a = kinds
        .iter()
        .position(|k| matches!(k, RunEventKind::StepFailed { step_id, .. } if step_id == "a"))
        .unwrap();
    assert!(started_a < failed_a);
}

#[tokio::test]
async fn same_wave_steps_run_concurrently() {
    let dir = project_with_scripts();
    let executor = executor_for(&dir);

    let workflow = parse_workflow(
        r#"
name: concurrent-wave
steps:
  - id: left
    type: script
    script: scripts/slow.sh
  - id: right
    type: script
    script: scripts/slow.sh
"#,
    )
    .unwrap();

    let start = Instant::now();
    let run = executor
        .run_workflow(workflow, serde_json::json!({}))
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    // Two one-second scripts in the same wave; serial execution would
    // need two seconds.
    assert!(start.elapsed() < Duration::from_millis(1900));
}

#[tokio::test]
async fn conditional_dispatches_only_the_selected_branch() {
    let dir = project_with_scripts();
    let executor = executor_for(&dir);
    let mut all_events = executor.events().subscribe_all();

    let workflow = parse_workflow(
        r#"
name: branching
steps:
  - id: score
    type: script
    script: scripts/emit_score.sh
  - id: gate
    type: conditional
    condition: "${steps.score.outputs.score} > 80"
    depends_on: [score]
    then_steps:
      - id: celebrate
        type: script
        script: scripts/ok.sh
    else_steps:
      - id: investigate
        type: script
        script: scripts/ok.sh
"#,
    )
    .unwrap();

    let run = executor
        .run_workflow(workflow, serde_json::json!({}))
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.taken_branches.get("gate"), Some(&true));
    assert_eq!(
        run.step_result("celebrate").unwrap().status,
        StepStatus::Succeeded
    );
    let skipped = run.step_result("investigate").unwrap();
    assert_eq!(skipped.status, StepStatus::Skipped);
    assert_eq!(skipped.error.as_deref(), Some("branch not taken"));

    // The untaken branch is never dispatched.
    while let Ok(event) = all_events.try_recv() {
        assert!(
            !matches!(&event.kind, RunEventKind::StepStarted { step_id } if step_id == "investigate")
        );
    }
}

#[tokio::test]
async fn loop_observes_index_sequence_within_limit() {
    let dir = project_with_scripts();
    let executor = executor_for(&dir);

    let workflow = parse_workflow(
        r#"
name: bounded-loop
inputs:
  items:
    type: array
steps:
  - id: each
    type: loop
    over: "${workflow.inputs.items}"
    max_iterations: 3
    body:
      - id: echo
        type: script
        script: scripts/echo.sh
        inputs:
          index: "${loop.index}"
          item: "${loop.item}"
"#,
    )
    .unwrap();

    let run = executor
        .run_workflow(workflow, serde_json::json!({"items": ["x", "y", "z"]}))
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.loop_iterations.get("each"), Some(&3));

    let output = run.step_result("each").unwrap().output.as_ref().unwrap();
    let results = output["results"].as_array().unwrap();
    assert_eq!(results.len(), 3);
    let indexes: Vec<i64> = results
        .iter()
        .map(|r| r["echo"]["index"].as_i64().unwrap())
        .collect();
    assert_eq!(indexes, vec![0, 1, 2]);
    assert_eq!(results[1]["echo"]["item"], "y");
}

#[tokio::test]
async fn loop_limit_is_fatal_for_the_run() {
    let dir = project_with_scripts();
    let executor = executor_for(&dir);

    let workflow = parse_workflow(
        r#"
name: runaway-loop
inputs:
  items:
    type: array
steps:
  - id: each
    type: loop
    over: "${workflow.inputs.items}"
    max_iterations: 3
    body:
      - id: echo
        type: script
        script: scripts/echo.sh
        inputs:
          index: "${loop.index}"
  - id: after
    type: script
    script: scripts/ok.sh
    depends_on: [each]
"#,
    )
    .unwrap();

    let run = executor
        .run_workflow(
            workflow,
            serde_json::json!({"items": ["a", "b", "c", "d", "e"]}),
        )
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    let each = run.step_result("each").unwrap();
    assert_eq!(each.status, StepStatus::Failed);
    assert!(each.error.as_deref().unwrap().contains("loop limit of 3"));
    // The three completed iterations are preserved for debugging.
    assert_eq!(
        each.output.as_ref().unwrap()["partial_results"]
            .as_array()
            .unwrap()
            .len(),
        3
    );
    assert_ne!(run.step_result("after").unwrap().status, StepStatus::Succeeded);
}

#[tokio::test]
async fn retry_policy_runs_exact_attempts_with_backoff() {
    let dir = project_with_scripts();
    let executor = executor_for(&dir);

    let workflow = parse_workflow(
        r#"
name: retried
steps:
  - id: flaky
    type: script
    script: scripts/fail.sh
    retry_policy:
      max_attempts: 3
      initial_delay_ms: 100
      backoff_multiplier: 2
"#,
    )
    .unwrap();

    let start = Instant::now();
    let run = executor
        .run_workflow(workflow, serde_json::json!({}))
        .await
        .unwrap();
    let elapsed = start.elapsed();

    assert_eq!(run.status, RunStatus::Failed);
    let flaky = run.step_result("flaky").unwrap();
    assert_eq!(flaky.status, StepStatus::Failed);
    assert_eq!(flaky.attempts.len(), 3);
    assert!(flaky.attempts.iter().all(|a| a.error.is_some()));
    // Backoff of ~100ms then ~200ms between the three attempts.
    assert!(elapsed >= Duration::from_millis(290), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3));
}

#[tokio::test]
async fn security_rejection_is_never_retried() {
    let dir = project_with_scripts();
    let executor = executor_for(&dir);

    let workflow = parse_workflow(
        r#"
name: escape-attempt
steps:
  - id: sneaky
    type: script
    script: ../../etc/passwd
    retry_policy:
      max_attempts: 3
      initial_delay_ms: 10
"#,
    )
    .unwrap();

    let run = executor
        .run_workflow(workflow, serde_json::json!({}))
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    let sneaky = run.step_result("sneaky").unwrap();
    assert_eq!(sneaky.status, StepStatus::Failed);
    assert!(sneaky.error.as_deref().unwrap().contains("rejected"));
    assert_eq!(sneaky.attempts.len(), 1);
}

#[tokio::test]
async fn script_timeout_attaches_partial_output() {
    let dir = project_with_scripts();
    let executor = executor_for(&dir);

    let workflow = parse_workflow(
        r#"
name: deadline
steps:
  - id: stuck
    type: script
    script: scripts/hang.sh
    timeout_ms: 500
"#,
    )
    .unwrap();

    let start = Instant::now();
    let run = executor
        .run_workflow(workflow, serde_json::json!({}))
        .await
        .unwrap();

    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(run.status, RunStatus::Failed);
    let error = run.step_result("stuck").unwrap().error.clone().unwrap();
    assert!(error.contains("timed out"));
    assert!(error.contains("starting"));
}

#[tokio::test]
async fn cancellation_stops_in_flight_steps() {
    let dir = project_with_scripts();
    let executor = executor_for(&dir);

    let workflow = parse_workflow(
        r#"
name: cancellable
steps:
  - id: stuck
    type: script
    script: scripts/hang.sh
  - id: after
    type: script
    script: scripts/ok.sh
    depends_on: [stuck]
"#,
    )
    .unwrap();

    executor.register(workflow).unwrap();
    let run_id = executor
        .start("cancellable", serde_json::json!({}))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    executor.cancel(&run_id).unwrap();

    let start = Instant::now();
    let run = executor.wait(&run_id).await.unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));

    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(run.step_result("stuck").unwrap().status, StepStatus::Cancelled);
    assert_eq!(run.step_result("after").unwrap().status, StepStatus::Cancelled);
}

#[tokio::test]
async fn history_keeps_five_runs_and_redacts_at_write_time() {
    let dir = project_with_scripts();
    let executor = executor_for(&dir);

    let workflow = parse_workflow(
        r#"
name: audited
inputs:
  api_key:
    type: string
    required: true
steps:
  - id: work
    type: script
    script: scripts/ok.sh
"#,
    )
    .unwrap();
    executor.register(workflow.clone()).unwrap();

    let mut last_live_inputs = serde_json::Value::Null;
    for i in 0..6 {
        let run_id = executor
            .start("audited", serde_json::json!({"api_key": format!("swordfish-{i}")}))
            .await
            .unwrap();
        let run = executor.wait(&run_id).await.unwrap();
        last_live_inputs = run.inputs.clone();
    }

    // The live record keeps the value; the stored one is redacted.
    assert_eq!(last_live_inputs["api_key"], "swordfish-5");
    let stored = executor.history().runs_for("audited");
    assert_eq!(stored.len(), 5);
    for record in &stored {
        assert_eq!(record.inputs["api_key"], "[REDACTED]");
    }
}

#[tokio::test]
async fn file_ops_write_then_read_within_boundary() {
    let dir = project_with_scripts();
    let executor = executor_for(&dir);

    let workflow = parse_workflow(
        r#"
name: files
inputs:
  note:
    type: string
    required: true
steps:
  - id: save
    type: file_op
    operation: write
    path: out/note.txt
    content: "${workflow.inputs.note}"
  - id: load
    type: file_op
    operation: read
    path: out/note.txt
    depends_on: [save]
"#,
    )
    .unwrap();

    let run = executor
        .run_workflow(workflow, serde_json::json!({"note": "hello waves"}))
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    let loaded = run.step_result("load").unwrap().output.as_ref().unwrap();
    assert_eq!(loaded["content"], "hello waves");
}

struct CannedAi;

#[async_trait::async_trait]
impl AiInvoker for CannedAi {
    async fn invoke(
        &self,
        prompt: &str,
        _model: Option<&str>,
    ) -> Result<serde_json::Value, CollabError> {
        Ok(serde_json::json!({"text": format!("summary of: {prompt}")}))
    }
}

#[tokio::test]
async fn ai_call_receives_resolved_prompt() {
    let dir = project_with_scripts();
    let executor = executor_for(&dir).with_ai_invoker(Arc::new(CannedAi));

    let workflow = parse_workflow(
        r#"
name: summarized
steps:
  - id: score
    type: script
    script: scripts/emit_score.sh
  - id: summary
    type: ai_call
    prompt: "Score was ${steps.score.outputs.score}"
"#,
    )
    .unwrap();

    let run = executor
        .run_workflow(workflow, serde_json::json!({}))
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    let output = run.step_result("summary").unwrap().output.as_ref().unwrap();
    assert_eq!(output["text"], "summary of: Score was 90");
}

struct DenyAll;

#[async_trait::async_trait]
impl PermissionGate for DenyAll {
    async fn allow_run(&self, _workflow_id: &str) -> bool {
        false
    }
}

#[tokio::test]
async fn permission_gate_blocks_run_start() {
    let dir = project_with_scripts();
    let executor = executor_for(&dir).with_permission_gate(Arc::new(DenyAll));

    let workflow = parse_workflow(
        r#"
name: gated
steps:
  - id: work
    type: script
    script: scripts/ok.sh
"#,
    )
    .unwrap();
    executor.register(workflow).unwrap();

    let err = executor
        .start("gated", serde_json::json!({}))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("denied"));
    assert!(executor.history().runs_for("gated").is_empty());
}

#[tokio::test]
async fn cyclic_workflow_is_rejected_before_start() {
    let dir = project_with_scripts();
    let executor = executor_for(&dir);

    let workflow = parse_workflow(
        r#"
name: tangled
steps:
  - id: a
    type: script
    script: scripts/ok.sh
    depends_on: [b]
  - id: b
    type: script
    script: scripts/ok.sh
    depends_on: [a]
"#,
    )
    .unwrap();

    let err = executor.register(workflow).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("cycle"));
    assert!(message.contains("a") && message.contains("b"));
    assert!(executor.history().runs_for("tangled").is_empty());
}

#[tokio::test]
async fn breakpoint_pauses_before_dispatch_until_continued() {
    let dir = project_with_scripts();
    let executor = executor_for(&dir);

    let workflow = parse_workflow(
        r#"
name: debugged
steps:
  - id: first
    type: script
    script: scripts/ok.sh
  - id: second
    type: script
    script: scripts/ok.sh
    depends_on: [first]
"#,
    )
    .unwrap();
    executor.register(workflow).unwrap();
    executor.set_breakpoint("debugged", "second", true);

    let run_id = executor
        .start("debugged", serde_json::json!({}))
        .await
        .unwrap();

    // The run parks before dispatching `second`.
    let deadline = Instant::now() + Duration::from_secs(5);
    let paused = loop {
        if let Some(paused) = executor.debug().paused(&run_id) {
            break paused;
        }
        assert!(Instant::now() < deadline, "run never paused");
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    assert_eq!(paused.step_id, "second");
    assert!(paused.context["step_outputs"]["first"]["ok"].as_bool().unwrap());

    executor
        .debug()
        .send(&run_id, beacon_engine::DebugCommand::ContinueRun)
        .unwrap();

    let run = executor.wait(&run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.step_result("second").unwrap().status, StepStatus::Succeeded);
}
