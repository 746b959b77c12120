//! Control-flow nodes: branching, loops, failure boundaries, fork/join,
//! routing, event waits and nested pipelines.

mod common;

use std::sync::Arc;
use std::time::Duration;

use arbor_config::{
  ExecutionType, IteratorSpec, NodeDef, RetryPolicy, StructuralType, SubPipelineRef,
  VariableScope,
};
use arbor_ledger::NodeEventStatus;
use arbor_orchestrator::codes;
use arbor_plugin::{Capability, CapabilityError, CapabilityOutput, CapabilityRequest, error_codes};
use async_trait::async_trait;
use common::*;
use serde_json::json;
use tokio::sync::Barrier;

fn conditional(condition: &str) -> NodeDef {
  let mut branch = node(
    "check",
    StructuralType::If,
    vec![NodeDef::plugin("high", "high"), NodeDef::plugin("low", "low")],
  );
  branch.condition = Some(condition.to_string());
  seq("root", vec![branch])
}

#[tokio::test]
async fn test_if_takes_then_branch() {
  let harness = Harness::new();
  harness.capability("high", Fixed::new(json!({})));
  harness.capability("low", Fixed::new(json!({})));
  harness.pipeline(
    "qa",
    pipeline(conditional("score > 5"), vec![var("score", VariableScope::In)]),
  );

  harness.run("run-if", "qa", json!({ "score": 7 })).await.unwrap();
  assert_eq!(harness.succeeded("run-if").await, vec!["high"]);

  harness.run("run-else", "qa", json!({ "score": 2 })).await.unwrap();
  assert_eq!(harness.succeeded("run-else").await, vec!["low"]);
}

#[tokio::test]
async fn test_invalid_condition_fails_node() {
  let harness = Harness::new();
  harness.capability("high", Fixed::new(json!({})));
  harness.capability("low", Fixed::new(json!({})));
  harness.pipeline("qa", pipeline(conditional("score >"), vec![]));

  let err = harness.run("run-bad-if", "qa", json!({})).await.unwrap_err();
  assert_eq!(node_code(&err), Some(codes::INVALID_NODE));
}

fn switch_pipeline() -> arbor_config::PipelineDef {
  let mut case_a = node("case-a", StructuralType::Case, vec![NodeDef::plugin("a", "echo")]);
  case_a.case_value = Some(json!("a"));
  let fallback = node(
    "case-default",
    StructuralType::Case,
    vec![NodeDef::plugin("fallback", "echo")],
  );
  let mut switch = node("switch", StructuralType::Switch, vec![case_a, fallback]);
  switch.switch_on = Some("kind".to_string());
  pipeline(seq("root", vec![switch]), vec![var("kind", VariableScope::In)])
}

#[tokio::test]
async fn test_switch_selects_matching_case() {
  let harness = Harness::new();
  harness.pipeline("qa", switch_pipeline());

  harness.run("run-a", "qa", json!({ "kind": "a" })).await.unwrap();
  assert_eq!(harness.succeeded("run-a").await, vec!["a"]);
}

#[tokio::test]
async fn test_switch_falls_back_to_default_case() {
  let harness = Harness::new();
  harness.pipeline("qa", switch_pipeline());

  harness.run("run-b", "qa", json!({ "kind": "b" })).await.unwrap();
  assert_eq!(harness.succeeded("run-b").await, vec!["fallback"]);
}

fn iterator_pipeline() -> arbor_config::PipelineDef {
  let mut each = node(
    "each",
    StructuralType::Iterator,
    vec![
      NodeDef::plugin("shout", "template")
        .with_input("template", "template")
        .with_input("item", "item")
        .with_input("i", "i")
        .with_output("text", "shouted"),
    ],
  );
  each.iterate = Some(IteratorSpec {
    items: "items".to_string(),
    item: "item".to_string(),
    index: Some("i".to_string()),
    collect_from: Some("shouted".to_string()),
    collect_into: Some("results".to_string()),
  });
  pipeline(
    seq("root", vec![each, NodeDef::plugin("after", "echo")]),
    vec![
      var("items", VariableScope::In),
      var("template", VariableScope::In),
      var("results", VariableScope::Out),
    ],
  )
}

#[tokio::test]
async fn test_iterator_collects_every_item() {
  let harness = Harness::new();
  harness.pipeline("qa", iterator_pipeline());

  let output = harness
    .run(
      "run-loop",
      "qa",
      json!({ "items": ["a", "b", "c"], "template": "{{ item }}#{{ i }}" }),
    )
    .await
    .unwrap();
  assert_eq!(output.output, json!({ "results": ["a#0", "b#1", "c#2"] }));
  assert_eq!(
    harness.succeeded("run-loop").await,
    vec!["shout", "shout", "shout", "after"]
  );
}

#[tokio::test]
async fn test_iterator_over_empty_items_skips_body() {
  let harness = Harness::new();
  harness.pipeline("qa", iterator_pipeline());

  let output = harness
    .run("run-empty", "qa", json!({ "items": [], "template": "x" }))
    .await
    .unwrap();
  assert_eq!(output.output, json!({ "results": [] }));
  assert_eq!(harness.succeeded("run-empty").await, vec!["after"]);
}

#[tokio::test]
async fn test_iterator_rejects_non_array_items() {
  let harness = Harness::new();
  harness.pipeline("qa", iterator_pipeline());

  let err = harness
    .run("run-scalar", "qa", json!({ "items": "oops", "template": "x" }))
    .await
    .unwrap_err();
  assert_eq!(node_code(&err), Some(codes::INVALID_NODE));
}

fn guarded(risky: &str, execution_type: ExecutionType) -> arbor_config::PipelineDef {
  let mut guard = node(
    "guard",
    StructuralType::TryCatch,
    vec![
      NodeDef::plugin("risky", risky),
      NodeDef::plugin("fallback", "rescue").with_output("status", "status"),
    ],
  );
  guard.error_variable = Some("lastError".to_string());
  let mut definition = pipeline(
    seq("root", vec![guard, NodeDef::plugin("after", "echo")]),
    vec![var("lastError", VariableScope::Out), var("status", VariableScope::Out)],
  );
  definition.execution.execution_type = execution_type;
  definition
}

#[tokio::test]
async fn test_try_catch_recovers_and_records_error() {
  for (run_id, execution_type) in [
    ("run-catch-seq", ExecutionType::Sequential),
    ("run-catch-par", ExecutionType::Parallel),
  ] {
    let harness = Harness::new();
    harness.capability("broken", Broken::new("BOOM"));
    harness.capability("rescue", Fixed::new(json!({ "status": "recovered" })));
    harness.pipeline("qa", guarded("broken", execution_type));

    let output = harness.run(run_id, "qa", json!({})).await.unwrap();
    assert_eq!(output.output["status"], json!("recovered"));
    let error = output.output["lastError"].as_str().unwrap();
    assert!(error.contains("BOOM"), "{error}");
    assert_eq!(harness.succeeded(run_id).await, vec!["fallback", "after"]);
  }
}

#[tokio::test]
async fn test_try_catch_skips_catch_branch_without_failure() {
  let harness = Harness::new();
  harness.capability("fine", Fixed::new(json!({})));
  harness.capability("rescue", Fixed::new(json!({ "status": "recovered" })));
  harness.pipeline("qa", guarded("fine", ExecutionType::Sequential));

  let output = harness.run("run-nocatch", "qa", json!({})).await.unwrap();
  assert_eq!(output.output, json!({}));
  assert_eq!(harness.succeeded("run-nocatch").await, vec!["risky", "after"]);
}

fn retried(capability_ref: &str, max_attempts: u32) -> arbor_config::PipelineDef {
  let mut retry = node(
    "retry",
    StructuralType::Retry,
    vec![NodeDef::plugin("work", capability_ref).with_output("attempts", "attempts")],
  );
  retry.retry = Some(RetryPolicy {
    max_attempts,
    initial_backoff_ms: 1,
    ..RetryPolicy::default()
  });
  pipeline(seq("root", vec![retry]), vec![var("attempts", VariableScope::Out)])
}

#[tokio::test]
async fn test_retry_reruns_body_until_success() {
  let harness = Harness::new();
  let flaky = Flaky::new(2);
  harness.capability("flaky", flaky.clone());
  harness.pipeline("qa", retried("flaky", 3));

  let output = harness.run("run-retry", "qa", json!({})).await.unwrap();
  assert_eq!(output.output, json!({ "attempts": 3 }));
  assert_eq!(flaky.calls(), 3);

  let events = harness.ledger.all_events();
  let attempts: Vec<i64> = events
    .iter()
    .filter(|e| e.run_id == "run-retry" && e.status == NodeEventStatus::Running)
    .map(|e| e.replay.as_ref().unwrap().0.attempt)
    .collect();
  assert_eq!(attempts, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_retry_exhausted_fails_run() {
  let harness = Harness::new();
  let flaky = Flaky::new(5);
  harness.capability("flaky", flaky.clone());
  harness.pipeline("qa", retried("flaky", 2));

  let err = harness.run("run-exhausted", "qa", json!({})).await.unwrap_err();
  assert_eq!(node_code(&err), Some(error_codes::CAPABILITY_FAILED));
  assert_eq!(flaky.calls(), 2);
}

fn forked(left: &str, right: &str, execution_type: ExecutionType) -> arbor_config::PipelineDef {
  let mut definition = pipeline(
    seq(
      "root",
      vec![
        node(
          "fork",
          StructuralType::Fork,
          vec![NodeDef::plugin("left", left), NodeDef::plugin("right", right)],
        ),
        NodeDef::new("join", StructuralType::Join).with_output("branches", "branches"),
      ],
    ),
    vec![var("branches", VariableScope::Out)],
  );
  definition.execution.execution_type = execution_type;
  definition
}

#[tokio::test]
async fn test_join_waits_for_every_branch() {
  let harness = Harness::new();
  harness.pipeline("qa", forked("echo", "echo", ExecutionType::Sequential));

  let output = harness.run("run-join", "qa", json!({})).await.unwrap();
  assert_eq!(output.output, json!({ "branches": ["left", "right"] }));
  assert_eq!(
    harness.succeeded("run-join").await,
    vec!["left", "right", "join"]
  );
}

#[tokio::test]
async fn test_failed_branch_fails_join() {
  let harness = Harness::new();
  harness.capability("broken", Broken::new("BOOM"));
  harness.pipeline("qa", forked("broken", "echo", ExecutionType::Sequential));

  let err = harness.run("run-branch", "qa", json!({})).await.unwrap_err();
  assert_eq!(node_code(&err), Some(codes::BRANCH_FAILED));
  // the sibling branch still ran
  assert_eq!(harness.succeeded("run-branch").await, vec!["right"]);
  assert!(
    harness
      .events("run-branch")
      .await
      .contains(&("join".to_string(), NodeEventStatus::Failed))
  );
}

#[tokio::test]
async fn test_fork_without_join_propagates_failure() {
  let harness = Harness::new();
  harness.capability("broken", Broken::new("BOOM"));
  harness.pipeline(
    "qa",
    pipeline(
      seq(
        "root",
        vec![node(
          "fork",
          StructuralType::Fork,
          vec![NodeDef::plugin("left", "broken"), NodeDef::plugin("right", "echo")],
        )],
      ),
      vec![],
    ),
  );

  let err = harness.run("run-nojoin", "qa", json!({})).await.unwrap_err();
  assert_eq!(node_code(&err), Some("BOOM"));
}

/// Completes only once every party has arrived.
struct Rendezvous {
  barrier: Barrier,
}

#[async_trait]
impl Capability for Rendezvous {
  async fn execute(&self, _request: CapabilityRequest) -> Result<CapabilityOutput, CapabilityError> {
    self.barrier.wait().await;
    Ok(CapabilityOutput::from_value(json!({ "met": true })))
  }
}

#[tokio::test]
async fn test_parallel_mode_runs_branches_concurrently() {
  let harness = Harness::new();
  harness.capability("meet", Arc::new(Rendezvous { barrier: Barrier::new(2) }));
  let mut definition = forked("meet", "meet", ExecutionType::Parallel);
  definition.execution.timeout_ms = 2_000;
  harness.pipeline("qa", definition);

  let output = tokio::time::timeout(
    Duration::from_secs(5),
    harness.run("run-parallel", "qa", json!({})),
  )
  .await
  .unwrap()
  .unwrap();
  assert_eq!(output.output, json!({ "branches": ["left", "right"] }));

  let mut branches = harness.succeeded("run-parallel").await;
  assert_eq!(branches.pop().as_deref(), Some("join"));
  branches.sort();
  assert_eq!(branches, vec!["left", "right"]);
}

/// Fails with a non-retryable error after a delay.
struct Late {
  delay: Duration,
}

#[async_trait]
impl Capability for Late {
  async fn execute(&self, _request: CapabilityRequest) -> Result<CapabilityOutput, CapabilityError> {
    tokio::time::sleep(self.delay).await;
    Err(CapabilityError::new("BOOM", "late").non_retryable())
  }
}

#[tokio::test]
async fn test_try_catch_around_concurrent_fork_lets_running_branch_finish() {
  let harness = Harness::new();
  harness.capability("late", Arc::new(Late { delay: Duration::from_millis(20) }));
  harness.capability("slow", Slow::new(Duration::from_millis(200)));
  harness.capability("rescue", Fixed::new(json!({ "status": "recovered" })));

  let mut guard = node(
    "guard",
    StructuralType::TryCatch,
    vec![
      node(
        "fork",
        StructuralType::Fork,
        vec![NodeDef::plugin("left", "late"), NodeDef::plugin("right", "slow")],
      ),
      NodeDef::plugin("fallback", "rescue").with_output("status", "status"),
    ],
  );
  guard.error_variable = Some("lastError".to_string());
  let mut definition = pipeline(
    seq("root", vec![guard]),
    vec![var("lastError", VariableScope::Out), var("status", VariableScope::Out)],
  );
  definition.execution.execution_type = ExecutionType::Parallel;
  harness.pipeline("qa", definition);

  let output = harness.run("run-catch-fork", "qa", json!({})).await.unwrap();
  assert_eq!(output.output["status"], json!("recovered"));
  let error = output.output["lastError"].as_str().unwrap();
  assert!(error.contains("BOOM"), "{error}");

  // the sibling was already running when the try branch was abandoned
  assert_eq!(harness.succeeded("run-catch-fork").await, vec!["right", "fallback"]);
  let record = harness.run_record("run-catch-fork").await;
  assert_eq!(record.status, arbor_ledger::RunStatus::Completed);
}

fn routed(node_type: StructuralType, capability_ref: &str) -> arbor_config::PipelineDef {
  let mut refund = NodeDef::plugin("refund", "echo");
  refund.display_name = "Refund".to_string();
  let mut escalate = NodeDef::plugin("escalate", "echo");
  escalate.display_name = "Escalate".to_string();

  let mut router = node("route", node_type, vec![refund, escalate]);
  router.plugin_ref = Some(capability_ref.to_string());
  pipeline(seq("root", vec![router]), vec![])
}

#[tokio::test]
async fn test_llm_decision_routes_by_display_name() {
  let harness = Harness::new();
  harness.capability("decider", Fixed::new(json!({ "decision": "Refund" })));
  harness.pipeline("qa", routed(StructuralType::LlmDecision, "decider"));

  harness.run("run-decide", "qa", json!({})).await.unwrap();
  assert_eq!(harness.succeeded("run-decide").await, vec!["route", "refund"]);
}

#[tokio::test]
async fn test_tool_router_routes_by_id() {
  let harness = Harness::new();
  harness.capability("picker", Fixed::new(json!({ "tool": "escalate" })));
  harness.pipeline("qa", routed(StructuralType::ToolRouter, "picker"));

  harness.run("run-tool", "qa", json!({})).await.unwrap();
  assert_eq!(harness.succeeded("run-tool").await, vec!["route", "escalate"]);
}

#[tokio::test]
async fn test_router_without_match_skips_all_children() {
  let harness = Harness::new();
  harness.capability("picker", Fixed::new(json!({ "tool": "nope" })));
  harness.pipeline("qa", routed(StructuralType::ToolRouter, "picker"));

  harness.run("run-nomatch", "qa", json!({})).await.unwrap();
  assert_eq!(harness.succeeded("run-nomatch").await, vec!["route"]);
}

fn waiting(timeout_ms: Option<u64>) -> arbor_config::PipelineDef {
  let mut wait = NodeDef::new("wait", StructuralType::EventWait).with_output("approved", "approved");
  wait.event = Some("approval".to_string());
  wait.timeout_ms = timeout_ms;
  pipeline(seq("root", vec![wait]), vec![var("approved", VariableScope::Out)])
}

#[tokio::test]
async fn test_event_wait_resumes_on_signal() {
  let harness = Harness::new();
  harness.pipeline("qa", waiting(None));

  let signals = harness.orchestrator.signals().clone();
  tokio::spawn(async move {
    tokio::time::sleep(Duration::from_millis(20)).await;
    signals.signal("run-wait", "approval", json!({ "approved": true }));
  });

  let output = harness.run("run-wait", "qa", json!({})).await.unwrap();
  assert_eq!(output.output, json!({ "approved": true }));
}

#[tokio::test]
async fn test_event_wait_consumes_early_signal() {
  let harness = Harness::new();
  harness.pipeline("qa", waiting(None));
  harness
    .orchestrator
    .signals()
    .signal("run-early", "approval", json!({ "approved": false }));

  let output = harness.run("run-early", "qa", json!({})).await.unwrap();
  assert_eq!(output.output, json!({ "approved": false }));
  assert!(!harness.orchestrator.signals().is_pending("run-early", "approval"));
}

#[tokio::test]
async fn test_event_wait_times_out() {
  let harness = Harness::new();
  harness.pipeline("qa", waiting(Some(20)));

  let err = harness.run("run-nowait", "qa", json!({})).await.unwrap_err();
  assert_eq!(node_code(&err), Some(error_codes::TIMEOUT));
}

fn calling_child() -> arbor_config::PipelineDef {
  let mut call = NodeDef::new("call", StructuralType::SubPipeline)
    .with_input("name", "user")
    .with_output("greeting", "greeting");
  call.sub_pipeline = Some(SubPipelineRef {
    queue: "child".to_string(),
    version: None,
  });
  pipeline(
    seq("root", vec![call]),
    vec![var("user", VariableScope::In), var("greeting", VariableScope::Out)],
  )
}

#[tokio::test]
async fn test_sub_pipeline_runs_nested() {
  let harness = Harness::new();
  harness.pipeline("parent", calling_child());
  harness.pipeline(
    "child",
    pipeline(
      seq(
        "child-root",
        vec![
          NodeDef::plugin("child-echo", "echo")
            .with_input("name", "name")
            .with_output("name", "greeting"),
        ],
      ),
      vec![var("name", VariableScope::In), var("greeting", VariableScope::Out)],
    ),
  );

  let output = harness
    .run("run-parent", "parent", json!({ "user": "ada" }))
    .await
    .unwrap();
  assert_eq!(output.output, json!({ "greeting": "ada" }));
  assert_eq!(harness.succeeded("run-parent").await, vec!["call"]);

  let nested = harness
    .ledger
    .all_events()
    .into_iter()
    .find(|e| e.node_id == "child-echo" && e.status == NodeEventStatus::Success)
    .unwrap();
  assert!(nested.run_id.starts_with("call:"));
}

#[tokio::test]
async fn test_failed_sub_pipeline_fails_node() {
  let harness = Harness::new();
  harness.capability("broken", Broken::new("BOOM"));
  harness.pipeline("parent", calling_child());
  harness.pipeline(
    "child",
    pipeline(seq("child-root", vec![NodeDef::plugin("bad", "broken")]), vec![]),
  );

  let err = harness
    .run("run-parent-fail", "parent", json!({ "user": "ada" }))
    .await
    .unwrap_err();
  assert_eq!(node_code(&err), Some(codes::SUB_PIPELINE_FAILED));
}
