//! Failure propagation through RETRY, TRY_CATCH and FORK boundaries.

use std::collections::BTreeSet;
use std::time::Duration;

use arbor_config::StructuralType;
use arbor_workflow::{NodeStatus, RuntimeExecutionTree, WorkflowError};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{NodeError, OrchestratorError, codes};
use crate::orchestrator::Orchestrator;
use crate::run::RunState;

/// The enclosing node that absorbs a failure.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Boundary {
  /// Re-run the body of a RETRY node.
  Retry {
    retry_id: String,
    attempt: u32,
    delay: Duration,
  },
  /// Abandon the try branch and run the catch branch.
  TryCatch {
    try_catch_id: String,
    try_branch: String,
    error_variable: Option<String>,
  },
  /// Abandon one branch; the fork's JOIN reports it.
  Fork { fork_id: String, branch: String },
}

/// Skip what is left of `branch_id` and stop any loop inside it.
///
/// Nodes in `running` are left alone; their bodies are still executing on a
/// concurrent branch. Returns the ones found inside the branch.
pub(crate) fn abandon(
  tree: &mut RuntimeExecutionTree,
  branch_id: &str,
  running: &BTreeSet<String>,
) -> Result<Vec<String>, WorkflowError> {
  let mut still_running = Vec::new();
  for id in tree.descendants(branch_id)? {
    if running.contains(&id) {
      still_running.push(id);
      continue;
    }
    let Some(node) = tree.get_mut(&id) else {
      continue;
    };
    if node.status == NodeStatus::NotStarted {
      node.status = NodeStatus::Skipped;
    }
    if let Some(iteration) = node.iteration.as_mut() {
      iteration.finished = true;
    }
  }
  Ok(still_running)
}

fn has_join(tree: &RuntimeExecutionTree, fork_id: &str) -> bool {
  tree
    .descendants(tree.root_id())
    .unwrap_or_default()
    .iter()
    .any(|id| {
      tree
        .get(id)
        .is_some_and(|n| n.definition.node_type == StructuralType::Join)
        && tree.paired_fork(id).as_deref() == Some(fork_id)
    })
}

impl Orchestrator {
  /// Nearest enclosing boundary of `node_id` that accepts `error`.
  pub(crate) fn find_boundary(
    &self,
    run: &RunState,
    node_id: &str,
    error: &OrchestratorError,
  ) -> Option<Boundary> {
    run.with_tree(|tree| {
      let mut path = node_id.to_string();
      for ancestor_id in tree.ancestors(node_id) {
        let ancestor = tree.get(&ancestor_id)?;
        match ancestor.definition.node_type {
          StructuralType::Retry => {
            let policy = ancestor
              .definition
              .retry
              .clone()
              .unwrap_or_else(|| run.pipeline.execution.retry.clone());
            if error.is_retryable(&policy) && ancestor.attempts + 1 < policy.max_attempts {
              return Some(Boundary::Retry {
                retry_id: ancestor_id,
                attempt: ancestor.attempts + 1,
                delay: policy.backoff(ancestor.attempts + 2),
              });
            }
          }
          StructuralType::TryCatch => {
            if ancestor.child_ids.first() == Some(&path) && ancestor.caught_error.is_none() {
              return Some(Boundary::TryCatch {
                try_catch_id: ancestor_id,
                try_branch: path,
                error_variable: ancestor.definition.error_variable.clone(),
              });
            }
          }
          StructuralType::Fork => {
            if has_join(tree, &ancestor_id) {
              return Some(Boundary::Fork {
                fork_id: ancestor_id,
                branch: path,
              });
            }
          }
          _ => {}
        }
        path = ancestor_id;
      }
      None
    })
  }

  /// Mark `node_id` FAILED and hand `error` to the nearest boundary.
  ///
  /// Returns `Ok` when a boundary absorbed the failure and the run goes on;
  /// otherwise the error is returned and ends the run.
  pub(crate) async fn fail(
    &self,
    run: &RunState,
    node_id: &str,
    error: OrchestratorError,
  ) -> Result<(), OrchestratorError> {
    run.with_tree(|tree| {
      tree.transition(node_id, NodeStatus::Failed)?;
      tree.skip_subtree(node_id).map(|_| ())
    })?;

    if !error.is_node_level() {
      return Err(error);
    }

    match self.find_boundary(run, node_id, &error) {
      Some(Boundary::Retry {
        retry_id,
        attempt,
        delay,
      }) => {
        warn!(
          run_id = %run.run_id,
          node_id = %node_id,
          retry_id = %retry_id,
          attempt,
          error = %error,
          "retrying_body"
        );
        tokio::select! {
          _ = tokio::time::sleep(delay) => {}
          _ = run.cancel.cancelled() => return Err(OrchestratorError::Cancelled),
        }
        run.with_tree(|tree| {
          for child in tree.children(&retry_id).to_vec() {
            tree.reset_subtree_to_not_started(&child)?;
          }
          if let Some(retry) = tree.get_mut(&retry_id) {
            retry.attempts = attempt;
          }
          Ok::<_, WorkflowError>(())
        })?;
        Ok(())
      }
      Some(Boundary::TryCatch {
        try_catch_id,
        try_branch,
        error_variable,
      }) => {
        let message = error.to_string();
        let running = run.in_flight();
        let still_running = run.with_tree(|tree| {
          let still_running = abandon(tree, &try_branch, &running)?;
          for failed in tree.failed_unrecovered_in(&try_branch) {
            if let Some(node) = tree.get_mut(&failed) {
              node.recovered = true;
            }
          }
          if let Some(try_catch) = tree.get_mut(&try_catch_id) {
            try_catch.caught_error = Some(message.clone());
          }
          Ok::<_, WorkflowError>(still_running)
        })?;
        run.abandon_in_flight(still_running);

        if let Some(name) = error_variable {
          run
            .variables_mut()
            .set(&name, Value::String(message))
            .map_err(|e| {
              NodeError::new(&try_catch_id, codes::VARIABLE_REJECTED, e.to_string()).non_retryable()
            })?;
        }
        info!(
          run_id = %run.run_id,
          node_id = %node_id,
          try_catch_id = %try_catch_id,
          "failure_caught"
        );
        Ok(())
      }
      Some(Boundary::Fork { fork_id, branch }) => {
        let running = run.in_flight();
        let still_running = run.with_tree(|tree| abandon(tree, &branch, &running))?;
        run.abandon_in_flight(still_running);
        warn!(
          run_id = %run.run_id,
          node_id = %node_id,
          fork_id = %fork_id,
          branch = %branch,
          "branch_failed"
        );
        Ok(())
      }
      None => Err(error),
    }
  }
}
