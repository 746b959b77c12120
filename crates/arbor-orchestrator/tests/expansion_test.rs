//! PLANNER nodes attaching dynamically planned children at runtime.

mod common;

use arbor_config::{IteratorSpec, NodeDef, StructuralType, VariableScope};
use arbor_ledger::{Ledger, NodeEventStatus};
use arbor_orchestrator::{OrchestratorError, RunRequest, StepOutcome};
use common::*;
use serde_json::{Value, json};

fn planner(id: &str) -> NodeDef {
  let mut planner = NodeDef::new(id, StructuralType::Planner);
  planner.plugin_ref = Some("planner".to_string());
  planner
}

fn planned(content: Value) -> Harness {
  let harness = Harness::new();
  harness.capability("planner", Fixed::new(json!({ "content": content })));
  harness.pipeline("qa", pipeline(seq("root", vec![planner("plan")]), vec![]));
  harness
}

#[tokio::test]
async fn test_planner_attaches_and_runs_children() {
  let harness = planned(json!(
    r#"[{"capabilityRef": "echo", "displayName": "lookup"}, {"capabilityRef": "echo"}]"#
  ));

  harness.run("run-plan", "qa", json!({})).await.unwrap();
  assert_eq!(
    harness.succeeded("run-plan").await,
    vec!["plan", "plan-dyn-1", "plan-dyn-2"]
  );

  let events = harness.ledger.node_events("run-plan").await.unwrap();
  let started = events
    .iter()
    .find(|e| e.node_id == "plan-dyn-1" && e.status == NodeEventStatus::Running)
    .unwrap();
  let replay = &started.replay.as_ref().unwrap().0;
  assert!(replay.dynamic);
  assert_eq!(replay.parent_id.as_deref(), Some("plan"));
}

#[tokio::test]
async fn test_planner_output_reports_attachment() {
  let harness = planned(json!({
    "attachTo": "plan",
    "children": [{ "capabilityRef": "echo" }]
  }));

  harness.run("run-attach", "qa", json!({})).await.unwrap();
  let events = harness.ledger.node_events("run-attach").await.unwrap();
  let output = events
    .iter()
    .find(|e| e.node_id == "plan" && e.status == NodeEventStatus::Success)
    .and_then(|e| e.output.clone())
    .unwrap();
  assert_eq!(
    output.0,
    json!({ "attachedTo": "plan", "nodeIds": ["plan-dyn-1"] })
  );
}

#[tokio::test]
async fn test_planner_accepts_fenced_json() {
  let harness = planned(json!(
    "Here is the plan:\n```json\n{\"attachTo\": \"plan\", \"children\": [{\"capabilityRef\": \"echo\"}]}\n```\n"
  ));

  harness.run("run-fenced", "qa", json!({})).await.unwrap();
  assert_eq!(harness.succeeded("run-fenced").await, vec!["plan", "plan-dyn-1"]);
}

#[tokio::test]
async fn test_empty_plan_leaves_tree_unchanged() {
  let harness = planned(json!("[]"));

  let mut snapshot = harness
    .orchestrator
    .start(RunRequest::new(TENANT, "qa", json!({})).with_run_id("run-noplan"))
    .await
    .unwrap();
  let nodes = snapshot.tree.len();

  loop {
    match harness.orchestrator.step(snapshot).await.unwrap() {
      StepOutcome::Advanced { snapshot: next, .. } => {
        assert_eq!(next.tree.len(), nodes);
        snapshot = next;
      }
      StepOutcome::Finished(_) => break,
    }
  }
  assert_eq!(harness.succeeded("run-noplan").await, vec!["plan"]);
}

#[tokio::test]
async fn test_invalid_plan_fails_with_expansion_error() {
  let harness = planned(json!("I could not come up with a plan"));

  let err = harness.run("run-badplan", "qa", json!({})).await.unwrap_err();
  assert!(matches!(err, OrchestratorError::Expansion { ref node_id, .. } if node_id == "plan"));
  assert!(
    harness
      .events("run-badplan")
      .await
      .contains(&("plan".to_string(), NodeEventStatus::Failed))
  );
}

#[tokio::test]
async fn test_plan_child_without_capability_is_rejected() {
  let harness = planned(json!([{ "displayName": "nothing to call" }]));

  let err = harness.run("run-noref", "qa", json!({})).await.unwrap_err();
  assert!(matches!(err, OrchestratorError::Expansion { .. }));
}

#[tokio::test]
async fn test_plan_attaching_to_unknown_node_is_rejected() {
  let harness = planned(json!({
    "attachTo": "elsewhere",
    "children": [{ "capabilityRef": "echo" }]
  }));

  let err = harness.run("run-elsewhere", "qa", json!({})).await.unwrap_err();
  assert!(matches!(err, OrchestratorError::Expansion { .. }));
}

#[tokio::test]
async fn test_planner_in_loop_expands_once() {
  let harness = Harness::new();
  let planner_capability = Fixed::new(json!({ "content": [{ "capabilityRef": "echo" }] }));
  harness.capability("planner", planner_capability.clone());

  let mut each = node("each", StructuralType::Iterator, vec![planner("plan")]);
  each.iterate = Some(IteratorSpec {
    items: "items".to_string(),
    item: "item".to_string(),
    index: None,
    collect_from: None,
    collect_into: None,
  });
  harness.pipeline(
    "qa",
    pipeline(seq("root", vec![each]), vec![var("items", VariableScope::In)]),
  );

  harness
    .run("run-loop-plan", "qa", json!({ "items": [1, 2] }))
    .await
    .unwrap();
  assert_eq!(planner_capability.calls().len(), 1);
  assert_eq!(
    harness.succeeded("run-loop-plan").await,
    vec!["plan", "plan-dyn-1", "plan", "plan-dyn-1"]
  );
}
