use std::collections::{BTreeMap, BTreeSet};

use arbor_config::{NodeDef, StructuralType};
use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;
use crate::state::{NodeStatus, RuntimeNodeState};

/// Mutable, arena-style execution tree for one run.
///
/// Nodes are stored in a flat id → state map and linked by id, so planner
/// nodes can append children to an already partially walked tree without
/// any ownership juggling. Child lists only ever grow (except through an
/// explicit subtree reset, which changes statuses, never linkage).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeExecutionTree {
  root_id: String,
  nodes: BTreeMap<String, RuntimeNodeState>,
  expanded_planners: BTreeSet<String>,
}

impl RuntimeExecutionTree {
  /// Build the runtime tree for a static definition.
  pub fn build(root: &NodeDef) -> Result<Self, WorkflowError> {
    let mut tree = Self {
      root_id: root.id.clone(),
      nodes: BTreeMap::new(),
      expanded_planners: BTreeSet::new(),
    };
    tree.insert_subtree(root, None, false)?;
    Ok(tree)
  }

  fn insert_subtree(
    &mut self,
    definition: &NodeDef,
    parent_id: Option<&str>,
    dynamic: bool,
  ) -> Result<(), WorkflowError> {
    if self.nodes.contains_key(&definition.id) {
      return Err(WorkflowError::DuplicateNodeId(definition.id.clone()));
    }

    let mut own = definition.clone();
    let children = std::mem::take(&mut own.children);
    let mut state = RuntimeNodeState::new(own, parent_id.map(str::to_string), dynamic);
    state.child_ids = children.iter().map(|c| c.id.clone()).collect();
    self.nodes.insert(definition.id.clone(), state);

    for child in &children {
      self.insert_subtree(child, Some(&definition.id), dynamic)?;
    }
    Ok(())
  }

  pub fn root_id(&self) -> &str {
    &self.root_id
  }

  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }

  pub fn contains(&self, node_id: &str) -> bool {
    self.nodes.contains_key(node_id)
  }

  pub fn get(&self, node_id: &str) -> Option<&RuntimeNodeState> {
    self.nodes.get(node_id)
  }

  pub fn get_mut(&mut self, node_id: &str) -> Option<&mut RuntimeNodeState> {
    self.nodes.get_mut(node_id)
  }

  fn node(&self, node_id: &str) -> Result<&RuntimeNodeState, WorkflowError> {
    self
      .nodes
      .get(node_id)
      .ok_or_else(|| WorkflowError::NodeNotFound(node_id.to_string()))
  }

  pub fn status(&self, node_id: &str) -> Option<NodeStatus> {
    self.nodes.get(node_id).map(|n| n.status)
  }

  pub fn children(&self, node_id: &str) -> &[String] {
    self
      .nodes
      .get(node_id)
      .map(|n| n.child_ids.as_slice())
      .unwrap_or(&[])
  }

  pub fn parent(&self, node_id: &str) -> Option<&str> {
    self.nodes.get(node_id).and_then(|n| n.parent_id.as_deref())
  }

  /// Move a NOT_STARTED node into a terminal status.
  pub fn transition(&mut self, node_id: &str, to: NodeStatus) -> Result<(), WorkflowError> {
    let node = self
      .nodes
      .get_mut(node_id)
      .ok_or_else(|| WorkflowError::NodeNotFound(node_id.to_string()))?;
    if node.status.is_terminal() || !to.is_terminal() {
      return Err(WorkflowError::InvalidTransition {
        node_id: node_id.to_string(),
        from: node.status,
        to,
      });
    }
    node.status = to;
    Ok(())
  }

  /// Whether `node_id` may run now: NOT_STARTED with a COMPLETED parent.
  pub fn is_eligible(&self, node_id: &str) -> bool {
    let Some(node) = self.nodes.get(node_id) else {
      return false;
    };
    if node.status != NodeStatus::NotStarted {
      return false;
    }
    match &node.parent_id {
      None => true,
      Some(parent) => self.status(parent) == Some(NodeStatus::Completed),
    }
  }

  /// First eligible node in depth-first order from the root.
  pub fn find_next_executable(&self) -> Option<String> {
    self.find_next_executable_from(&self.root_id)
  }

  /// First eligible node in depth-first order within the subtree at `scope_id`.
  ///
  /// COMPLETED and SKIPPED nodes are descended into, earlier-declared children
  /// first; FAILED nodes are not.
  pub fn find_next_executable_from(&self, scope_id: &str) -> Option<String> {
    let mut stack = vec![scope_id];
    while let Some(id) = stack.pop() {
      let Some(node) = self.nodes.get(id) else {
        continue;
      };
      match node.status {
        NodeStatus::NotStarted => {
          if self.is_eligible(id) {
            return Some(id.to_string());
          }
        }
        NodeStatus::Completed | NodeStatus::Skipped => {
          stack.extend(node.child_ids.iter().rev().map(String::as_str));
        }
        NodeStatus::Failed => {}
      }
    }
    None
  }

  /// Append dynamically planned children to `parent_id`.
  ///
  /// Definitions whose id is already present, or whose subtree repeats an id,
  /// are ignored, so repeating the same attachment never duplicates nodes. An unknown parent or an empty list
  /// is a no-op. Returns the ids that were attached.
  pub fn attach_children(&mut self, parent_id: &str, definitions: &[NodeDef]) -> Vec<String> {
    if !self.nodes.contains_key(parent_id) {
      return Vec::new();
    }

    let mut attached = Vec::new();
    for definition in definitions {
      if self.nodes.contains_key(&definition.id) {
        continue;
      }
      let mut ids = Vec::new();
      definition.walk(&mut |d| ids.push(d.id.clone()));
      let mut seen = BTreeSet::new();
      if ids
        .iter()
        .any(|id| self.nodes.contains_key(id) || !seen.insert(id.as_str()))
      {
        continue;
      }
      if self.insert_subtree(definition, Some(parent_id), true).is_err() {
        continue;
      }
      if let Some(parent) = self.nodes.get_mut(parent_id) {
        parent.child_ids.push(definition.id.clone());
      }
      attached.push(definition.id.clone());
    }
    attached
  }

  pub fn mark_planner_expanded(&mut self, node_id: &str) {
    self.expanded_planners.insert(node_id.to_string());
  }

  pub fn has_planner_expanded(&self, node_id: &str) -> bool {
    self.expanded_planners.contains(node_id)
  }

  /// Reset a node and every static or dynamic descendant to NOT_STARTED.
  pub fn reset_subtree_to_not_started(&mut self, node_id: &str) -> Result<(), WorkflowError> {
    for id in self.descendants(node_id)? {
      if let Some(node) = self.nodes.get_mut(&id) {
        node.reset();
      }
    }
    Ok(())
  }

  /// Mark every NOT_STARTED node of the subtree (including `node_id`) SKIPPED.
  pub fn skip_subtree(&mut self, node_id: &str) -> Result<Vec<String>, WorkflowError> {
    let mut skipped = Vec::new();
    for id in self.descendants(node_id)? {
      let Some(node) = self.nodes.get_mut(&id) else {
        continue;
      };
      if node.status == NodeStatus::NotStarted {
        node.status = NodeStatus::Skipped;
        skipped.push(id);
      }
    }
    Ok(skipped)
  }

  /// The node and all its descendants, depth-first pre-order.
  pub fn descendants(&self, node_id: &str) -> Result<Vec<String>, WorkflowError> {
    self.node(node_id)?;
    let mut out = Vec::new();
    let mut stack = vec![node_id.to_string()];
    while let Some(id) = stack.pop() {
      if let Some(node) = self.nodes.get(&id) {
        stack.extend(node.child_ids.iter().rev().cloned());
      }
      out.push(id);
    }
    Ok(out)
  }

  /// Ancestors of `node_id`, nearest first.
  pub fn ancestors(&self, node_id: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = self.parent(node_id);
    while let Some(id) = current {
      out.push(id.to_string());
      current = self.parent(id);
    }
    out
  }

  /// Whether `ancestor_id` is a strict ancestor of `node_id`.
  pub fn is_descendant(&self, node_id: &str, ancestor_id: &str) -> bool {
    let mut current = self.parent(node_id);
    while let Some(id) = current {
      if id == ancestor_id {
        return true;
      }
      current = self.parent(id);
    }
    false
  }

  /// Whether nothing in the subtree can still run.
  ///
  /// FAILED and SKIPPED nodes settle their whole subtree; a COMPLETED node is
  /// settled once all of its children are.
  pub fn subtree_settled(&self, node_id: &str) -> bool {
    let Some(node) = self.nodes.get(node_id) else {
      return true;
    };
    match node.status {
      NodeStatus::NotStarted => false,
      NodeStatus::Failed | NodeStatus::Skipped => true,
      NodeStatus::Completed => node.child_ids.iter().all(|c| self.subtree_settled(c)),
    }
  }

  /// FAILED nodes in the subtree whose failure has not been absorbed.
  pub fn failed_unrecovered_in(&self, node_id: &str) -> Vec<String> {
    self
      .descendants(node_id)
      .unwrap_or_default()
      .into_iter()
      .filter(|id| {
        self
          .nodes
          .get(id)
          .is_some_and(|n| n.status == NodeStatus::Failed && !n.recovered)
      })
      .collect()
  }

  /// The FORK a JOIN closes: explicit `joinOf`, else the nearest preceding FORK sibling.
  pub fn paired_fork(&self, join_id: &str) -> Option<String> {
    let join = self.nodes.get(join_id)?;
    if let Some(fork) = &join.definition.join_of {
      return self.nodes.contains_key(fork).then(|| fork.clone());
    }
    let siblings = self.children(join.parent_id.as_deref()?);
    let position = siblings.iter().position(|s| s == join_id)?;
    siblings[..position]
      .iter()
      .rev()
      .find(|s| {
        self
          .nodes
          .get(*s)
          .is_some_and(|n| n.definition.node_type == StructuralType::Fork)
      })
      .cloned()
  }

  /// Barrier check: a JOIN may run once every branch of its fork is settled.
  pub fn join_ready(&self, join_id: &str) -> bool {
    match self.paired_fork(join_id) {
      Some(fork) => {
        self.status(&fork).is_some_and(|s| s.is_terminal()) && self.subtree_settled(&fork)
      }
      None => true,
    }
  }

  /// Nodes that block a successful finish: NOT_STARTED ones and unrecovered failures.
  pub fn unfinished(&self) -> Vec<String> {
    self
      .descendants(&self.root_id)
      .unwrap_or_default()
      .into_iter()
      .filter(|id| {
        self.nodes.get(id).is_some_and(|n| match n.status {
          NodeStatus::NotStarted => true,
          NodeStatus::Failed => !n.recovered,
          NodeStatus::Completed | NodeStatus::Skipped => false,
        })
      })
      .collect()
  }

  /// Whether every node is COMPLETED, SKIPPED, or a recovered failure.
  pub fn is_complete(&self) -> bool {
    self.unfinished().is_empty()
  }

  /// Whether `id` is free to use for a new node.
  pub fn is_free_id(&self, id: &str) -> bool {
    !self.nodes.contains_key(id)
  }
}
