use arbor_config::NodeDef;
use serde::{Deserialize, Serialize};

/// Execution status of a single node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
  NotStarted,
  Completed,
  Skipped,
  Failed,
}

impl NodeStatus {
  pub fn is_terminal(&self) -> bool {
    !matches!(self, NodeStatus::NotStarted)
  }
}

/// Cursor of an ITERATOR node over its resolved items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationState {
  pub items: Vec<serde_json::Value>,
  pub index: usize,
  pub finished: bool,
}

impl IterationState {
  pub fn new(items: Vec<serde_json::Value>) -> Self {
    Self {
      items,
      index: 0,
      finished: false,
    }
  }

  pub fn current(&self) -> Option<&serde_json::Value> {
    self.items.get(self.index)
  }

  pub fn has_next(&self) -> bool {
    self.index + 1 < self.items.len()
  }
}

/// Mutable per-run state of one node.
///
/// `definition` is the node's own definition with its children detached; the
/// children are separate states referenced through `child_ids`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeNodeState {
  pub definition: NodeDef,
  pub parent_id: Option<String>,
  pub child_ids: Vec<String>,
  pub status: NodeStatus,
  pub dynamic: bool,
  /// A FAILED node whose failure was absorbed by a TRY_CATCH.
  #[serde(default)]
  pub recovered: bool,
  /// Body re-runs performed by a RETRY node.
  #[serde(default)]
  pub attempts: u32,
  /// Error caught by a TRY_CATCH node.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub caught_error: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub iteration: Option<IterationState>,
}

impl RuntimeNodeState {
  pub(crate) fn new(definition: NodeDef, parent_id: Option<String>, dynamic: bool) -> Self {
    Self {
      definition,
      parent_id,
      child_ids: Vec::new(),
      status: NodeStatus::NotStarted,
      dynamic,
      recovered: false,
      attempts: 0,
      caught_error: None,
      iteration: None,
    }
  }

  pub fn id(&self) -> &str {
    &self.definition.id
  }

  pub(crate) fn reset(&mut self) {
    self.status = NodeStatus::NotStarted;
    self.recovered = false;
    self.attempts = 0;
    self.caught_error = None;
    self.iteration = None;
  }
}
