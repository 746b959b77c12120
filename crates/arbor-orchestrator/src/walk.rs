//! Node selection and the in-process walk.
//!
//! [`Orchestrator::advance`] is the single primitive both the in-process walk
//! and step mode are built on: continue finished loop bodies, pick the next
//! executable node under the structural gates, execute it.

use arbor_config::StructuralType;
use arbor_workflow::{NodeStatus, RuntimeExecutionTree, WorkflowError};
use serde_json::{Value, json};
use tracing::debug;

use crate::error::{NodeError, OrchestratorError, codes};
use crate::orchestrator::Orchestrator;
use crate::run::RunState;
use crate::variables::VariableError;

/// Structural verdict on a node the depth-first search picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Gate {
  Open,
  /// A JOIN whose fork is still running.
  Closed,
  /// A catch branch whose TRY_CATCH caught nothing.
  Skip,
}

pub(crate) fn gate(tree: &RuntimeExecutionTree, node_id: &str) -> Gate {
  let Some(node) = tree.get(node_id) else {
    return Gate::Closed;
  };
  if node.definition.node_type == StructuralType::Join && !tree.join_ready(node_id) {
    return Gate::Closed;
  }
  if let Some(parent) = node.parent_id.as_deref().and_then(|p| tree.get(p))
    && parent.definition.node_type == StructuralType::TryCatch
    && parent.child_ids.get(1).is_some_and(|c| c == node_id)
    && parent.caught_error.is_none()
  {
    return Gate::Skip;
  }
  Gate::Open
}

/// Skip every child of `parent_id` except `chosen`.
pub(crate) fn keep_only(
  tree: &mut RuntimeExecutionTree,
  parent_id: &str,
  chosen: Option<&str>,
) -> Result<(), WorkflowError> {
  for child in tree.children(parent_id).to_vec() {
    if chosen != Some(child.as_str()) {
      tree.skip_subtree(&child)?;
    }
  }
  Ok(())
}

/// What to do with an ITERATOR whose body settled.
enum LoopStep {
  Finish,
  Next { item: Value, index: usize },
}

impl Orchestrator {
  /// Execute the next executable node inside `scope_id`.
  ///
  /// Returns the id of the executed node, or `None` when nothing in the scope
  /// can run right now.
  pub(crate) async fn advance(
    &self,
    run: &RunState,
    scope_id: &str,
  ) -> Result<Option<String>, OrchestratorError> {
    if run.cancel.is_cancelled() {
      return Err(OrchestratorError::Cancelled);
    }

    self.resume_loops(run, scope_id)?;
    let Some(node_id) = self.select_next(run, scope_id)? else {
      return Ok(None);
    };
    self.execute(run, &node_id).await?;
    Ok(Some(node_id))
  }

  /// Advance until nothing inside `scope_id` can run.
  pub(crate) async fn walk(&self, run: &RunState, scope_id: &str) -> Result<(), OrchestratorError> {
    while self.advance(run, scope_id).await?.is_some() {}
    Ok(())
  }

  fn select_next(&self, run: &RunState, scope_id: &str) -> Result<Option<String>, OrchestratorError> {
    run.with_tree(|tree| {
      loop {
        let Some(node_id) = tree.find_next_executable_from(scope_id) else {
          return Ok(None);
        };
        match gate(tree, &node_id) {
          Gate::Open => return Ok(Some(node_id)),
          Gate::Closed => {
            debug!(run_id = %run.run_id, node_id = %node_id, "join_waiting");
            return Ok(None);
          }
          Gate::Skip => {
            tree.skip_subtree(&node_id)?;
            debug!(run_id = %run.run_id, node_id = %node_id, "catch_branch_skipped");
          }
        }
      }
    })
  }

  /// Continue or finish every ITERATOR in the scope whose current body settled.
  ///
  /// Inner loops are handled before the loops enclosing them.
  fn resume_loops(&self, run: &RunState, scope_id: &str) -> Result<(), OrchestratorError> {
    let loops = run.with_tree(|tree| {
      tree.descendants(scope_id).map(|ids| {
        ids
          .into_iter()
          .filter(|id| {
            tree.get(id).is_some_and(|n| {
              n.definition.node_type == StructuralType::Iterator
                && n.status == NodeStatus::Completed
                && n.iteration.as_ref().is_some_and(|it| !it.finished)
            })
          })
          .collect::<Vec<_>>()
      })
    })?;

    for loop_id in loops.iter().rev() {
      self.resume_loop(run, loop_id)?;
    }
    Ok(())
  }

  fn resume_loop(&self, run: &RunState, loop_id: &str) -> Result<(), OrchestratorError> {
    let Some((spec, settled, failed)) = run.with_tree(|tree| {
      let node = tree.get(loop_id)?;
      let spec = node.definition.iterate.clone()?;
      let children = node.child_ids.clone();
      let settled = children.iter().all(|c| tree.subtree_settled(c));
      let failed = children
        .iter()
        .any(|c| !tree.failed_unrecovered_in(c).is_empty());
      Some((spec, settled, failed))
    }) else {
      return Ok(());
    };
    if !settled {
      return Ok(());
    }

    if let (Some(from), Some(into)) = (&spec.collect_from, &spec.collect_into) {
      let mut variables = run.variables_mut();
      let value = variables.get(from).cloned().unwrap_or(Value::Null);
      variables.append(into, value).map_err(|e| {
        NodeError::new(loop_id, codes::VARIABLE_REJECTED, e.to_string()).non_retryable()
      })?;
    }

    let step = run.with_tree(|tree| -> Result<LoopStep, WorkflowError> {
      let Some(iteration) = tree.get_mut(loop_id).and_then(|n| n.iteration.as_mut()) else {
        return Ok(LoopStep::Finish);
      };
      if failed || !iteration.has_next() {
        iteration.finished = true;
        return Ok(LoopStep::Finish);
      }
      iteration.index += 1;
      let index = iteration.index;
      let item = iteration.current().cloned().unwrap_or(Value::Null);
      for child in tree.children(loop_id).to_vec() {
        tree.reset_subtree_to_not_started(&child)?;
      }
      Ok(LoopStep::Next { item, index })
    })?;

    match step {
      LoopStep::Finish => {
        debug!(run_id = %run.run_id, node_id = %loop_id, "iteration_finished");
      }
      LoopStep::Next { item, index } => {
        debug!(run_id = %run.run_id, node_id = %loop_id, index, "iteration_advanced");
        self.bind_item(run, loop_id, &spec.item, spec.index.as_deref(), item, index)?;
      }
    }
    Ok(())
  }

  pub(crate) fn bind_item(
    &self,
    run: &RunState,
    loop_id: &str,
    item_variable: &str,
    index_variable: Option<&str>,
    item: Value,
    index: usize,
  ) -> Result<(), OrchestratorError> {
    let rejected = |e: VariableError| {
      NodeError::new(loop_id, codes::VARIABLE_REJECTED, e.to_string()).non_retryable()
    };

    let mut variables = run.variables_mut();
    variables.set(item_variable, item).map_err(rejected)?;
    if let Some(name) = index_variable {
      variables.set(name, json!(index)).map_err(rejected)?;
    }
    Ok(())
  }
}
