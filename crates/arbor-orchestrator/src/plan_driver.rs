//! Parallel execution driven by the compiled plan.

use arbor_workflow::{ActivityScope, ExecutionPlan, RuntimeExecutionTree};
use futures::future::join_all;
use tracing::{debug, info};

use crate::error::OrchestratorError;
use crate::orchestrator::Orchestrator;
use crate::run::RunState;
use crate::walk::{Gate, gate};

/// Step to continue at after `index` when a TRY_CATCH caught a failure while
/// its try branch was running.
fn catch_jump(plan: &ExecutionPlan, tree: &RuntimeExecutionTree, index: usize) -> Option<usize> {
  plan
    .catch_points
    .iter()
    .filter(|point| {
      let try_end = point.catch_step.unwrap_or(point.resume_step);
      point.try_step <= index
        && index < try_end
        && tree
          .get(&point.try_catch_id)
          .is_some_and(|n| n.caught_error.is_some())
    })
    .max_by_key(|point| point.try_step)
    .map(|point| point.catch_step.unwrap_or(point.resume_step))
}

impl Orchestrator {
  /// Run the plan step by step; FORK branches of a concurrent step run at once.
  ///
  /// Activities owned by a composite node are executed by their owner's
  /// subtree walk. A final walk from the root picks up anything the static
  /// plan does not list, such as children attached outside a planner.
  pub(crate) async fn drive_plan(&self, run: &RunState) -> Result<(), OrchestratorError> {
    let plan = ExecutionPlan::build(&run.pipeline.tree);
    info!(run_id = %run.run_id, steps = plan.len(), shape = ?plan.shape, "plan_started");

    let mut index = 0;
    while let Some(step) = plan.steps.get(index) {
      if step.concurrent {
        let branches = step
          .activities
          .iter()
          .map(|activity| self.walk(run, &activity.node_id));
        for result in join_all(branches).await {
          result?;
        }
      } else {
        for activity in step.activities.iter().filter(|a| a.owner.is_none()) {
          match activity.scope {
            ActivityScope::Subtree => self.walk(run, &activity.node_id).await?,
            ActivityScope::Node => self.run_activity(run, &activity.node_id).await?,
          }
        }
      }

      index = match run.with_tree(|tree| catch_jump(&plan, tree, index)) {
        Some(target) if target > index + 1 => {
          debug!(run_id = %run.run_id, from = index, to = target, "plan_jump");
          target
        }
        _ => index + 1,
      };
    }

    self.walk(run, &run.root_id()).await
  }

  async fn run_activity(&self, run: &RunState, node_id: &str) -> Result<(), OrchestratorError> {
    if run.cancel.is_cancelled() {
      return Err(OrchestratorError::Cancelled);
    }
    let verdict = run.with_tree(|tree| {
      if !tree.is_eligible(node_id) {
        return Ok(None);
      }
      match gate(tree, node_id) {
        Gate::Skip => tree.skip_subtree(node_id).map(|_| None),
        verdict => Ok(Some(verdict)),
      }
    })?;

    match verdict {
      Some(Gate::Open) => self.execute(run, node_id).await,
      _ => Ok(()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use arbor_config::{NodeDef, StructuralType};

  #[test]
  fn test_catch_jump_targets_catch_step() {
    let try_catch = NodeDef::new("guard", StructuralType::TryCatch).with_children(vec![
      NodeDef::new("try", StructuralType::Sequence)
        .with_children(vec![NodeDef::plugin("a", "echo"), NodeDef::plugin("b", "echo")]),
      NodeDef::plugin("fallback", "echo"),
    ]);
    let root = NodeDef::new("root", StructuralType::Sequence).with_children(vec![try_catch]);
    let plan = ExecutionPlan::build(&root);
    let mut tree = RuntimeExecutionTree::build(&root).unwrap();

    let a = plan.step_of("a").unwrap();
    assert_eq!(catch_jump(&plan, &tree, a), None);

    tree.get_mut("guard").unwrap().caught_error = Some("boom".to_string());
    assert_eq!(catch_jump(&plan, &tree, a), plan.step_of("fallback"));
    assert_eq!(catch_jump(&plan, &tree, plan.step_of("fallback").unwrap()), None);
  }
}
