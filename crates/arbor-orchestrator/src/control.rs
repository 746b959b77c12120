//! Bodies of the control-flow node types.

use arbor_config::{NodeDef, StructuralType};
use arbor_plugin::CapabilityError;
use arbor_workflow::IterationState;
use minijinja::Environment;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::error::{NodeError, OrchestratorError, codes};
use crate::orchestrator::Orchestrator;
use crate::run::RunState;
use crate::walk::keep_only;

/// Output key LLM_DECISION nodes route on unless `routeKey` says otherwise.
pub const DEFAULT_DECISION_KEY: &str = "decision";
/// Output key TOOL_ROUTER nodes route on unless `routeKey` says otherwise.
pub const DEFAULT_TOOL_KEY: &str = "tool";

impl Orchestrator {
  /// IF: evaluate the condition against the variables, keep one branch.
  pub(crate) fn branch_if(&self, run: &RunState, def: &NodeDef) -> Result<Value, OrchestratorError> {
    let Some(condition) = def.condition.as_deref() else {
      return Err(NodeError::invalid(&def.id, "IF node has no condition").into());
    };

    let variables = run.variables().to_object();
    let env = Environment::new();
    let expression = env.compile_expression(condition).map_err(|e| {
      NodeError::invalid(&def.id, format!("invalid condition '{}': {}", condition, e))
    })?;
    let taken = expression
      .eval(&variables)
      .map_err(|e| NodeError::invalid(&def.id, format!("condition failed: {}", e)))?
      .is_true();

    run.with_tree(|tree| {
      let branch = if taken { 0 } else { 1 };
      let chosen = tree.children(&def.id).get(branch).cloned();
      keep_only(tree, &def.id, chosen.as_deref())
    })?;

    debug!(run_id = %run.run_id, node_id = %def.id, taken, "condition_evaluated");
    Ok(json!({ "condition": taken }))
  }

  /// SWITCH: keep the first CASE matching the variable, else the default CASE.
  pub(crate) fn branch_switch(
    &self,
    run: &RunState,
    def: &NodeDef,
  ) -> Result<Value, OrchestratorError> {
    let Some(variable) = def.switch_on.as_deref() else {
      return Err(NodeError::invalid(&def.id, "SWITCH node has no switchOn").into());
    };
    let value = run.variables().get(variable).cloned().unwrap_or(Value::Null);

    let chosen = run.with_tree(|tree| {
      let cases: Vec<(String, Option<Value>)> = tree
        .children(&def.id)
        .iter()
        .filter_map(|id| {
          let node = tree.get(id)?;
          (node.definition.node_type == StructuralType::Case)
            .then(|| (id.clone(), node.definition.case_value.clone()))
        })
        .collect();

      let chosen = cases
        .iter()
        .find(|(_, case)| case.as_ref() == Some(&value))
        .or_else(|| cases.iter().find(|(_, case)| case.is_none()))
        .map(|(id, _)| id.clone());
      keep_only(tree, &def.id, chosen.as_deref()).map(|()| chosen)
    })?;

    if chosen.is_none() {
      warn!(run_id = %run.run_id, node_id = %def.id, value = %value, "no_case_matched");
    }
    Ok(json!({ "value": value, "case": chosen }))
  }

  /// LLM_DECISION / TOOL_ROUTER: keep the child named by the capability output.
  ///
  /// A child matches by id or display name. Without a match every child is
  /// skipped.
  pub(crate) fn route(
    &self,
    run: &RunState,
    def: &NodeDef,
    output: &Value,
  ) -> Result<(), OrchestratorError> {
    let key = def
      .route_key
      .as_deref()
      .unwrap_or(match def.node_type {
        StructuralType::LlmDecision => DEFAULT_DECISION_KEY,
        _ => DEFAULT_TOOL_KEY,
      });
    let selected = output.get(key).and_then(Value::as_str);

    let chosen = run.with_tree(|tree| {
      let chosen = selected.and_then(|selected| {
        tree
          .children(&def.id)
          .iter()
          .find(|id| {
            id.as_str() == selected
              || tree
                .get(id)
                .is_some_and(|n| n.definition.display_name == selected)
          })
          .cloned()
      });
      keep_only(tree, &def.id, chosen.as_deref()).map(|()| chosen)
    })?;

    match &chosen {
      Some(child) => info!(run_id = %run.run_id, node_id = %def.id, route = %child, "route_selected"),
      None => warn!(run_id = %run.run_id, node_id = %def.id, route = ?selected, "no_route_matched"),
    }
    Ok(())
  }

  /// ITERATOR: resolve the items, bind the first one and start the body.
  ///
  /// Later items are bound by the walk once the body settles.
  pub(crate) fn start_iterator(
    &self,
    run: &RunState,
    def: &NodeDef,
  ) -> Result<Value, OrchestratorError> {
    let Some(spec) = &def.iterate else {
      return Err(NodeError::invalid(&def.id, "ITERATOR node has no iterate").into());
    };

    let items = match run.variables().get(&spec.items).cloned() {
      None | Some(Value::Null) => Vec::new(),
      Some(Value::Array(items)) => items,
      Some(other) => {
        return Err(
          NodeError::invalid(
            &def.id,
            format!("variable '{}' is not an array: {}", spec.items, other),
          )
          .into(),
        );
      }
    };
    let count = items.len();

    if let Some(into) = &spec.collect_into {
      run.variables_mut().set(into, json!([])).map_err(|e| {
        NodeError::new(&def.id, codes::VARIABLE_REJECTED, e.to_string()).non_retryable()
      })?;
    }
    if let Some(first) = items.first() {
      self.bind_item(run, &def.id, &spec.item, spec.index.as_deref(), first.clone(), 0)?;
    }

    run.with_tree(|tree| {
      let mut iteration = IterationState::new(items);
      if count == 0 {
        iteration.finished = true;
        keep_only(tree, &def.id, None)?;
      }
      if let Some(node) = tree.get_mut(&def.id) {
        node.iteration = Some(iteration);
      }
      Ok::<_, arbor_workflow::WorkflowError>(())
    })?;

    debug!(run_id = %run.run_id, node_id = %def.id, items = count, "iteration_started");
    Ok(json!({ "items": count }))
  }

  /// JOIN: report the paired fork's branches; fail when one failed unrecovered.
  pub(crate) fn join(&self, run: &RunState, def: &NodeDef) -> Result<Value, OrchestratorError> {
    let (branches, failed) = run.with_tree(|tree| {
      let branches = tree
        .paired_fork(&def.id)
        .map(|fork| tree.children(&fork).to_vec())
        .unwrap_or_default();
      let failed: Vec<String> = branches
        .iter()
        .filter(|b| !tree.failed_unrecovered_in(b).is_empty())
        .cloned()
        .collect();
      (branches, failed)
    });

    if !failed.is_empty() {
      return Err(
        NodeError::new(
          &def.id,
          codes::BRANCH_FAILED,
          format!("branches failed: {}", failed.join(", ")),
        )
        .into(),
      );
    }
    Ok(json!({ "branches": branches, "failed": failed }))
  }

  /// EVENT_WAIT: block until the event is signalled for this run.
  pub(crate) async fn wait_for_event(
    &self,
    run: &RunState,
    def: &NodeDef,
  ) -> Result<Value, OrchestratorError> {
    let Some(event) = def.event.as_deref() else {
      return Err(NodeError::invalid(&def.id, "EVENT_WAIT node has no event").into());
    };
    let timeout = self.effective_timeout(run, def);
    info!(run_id = %run.run_id, node_id = %def.id, event = %event, "event_wait_started");

    tokio::select! {
      result = tokio::time::timeout(timeout, self.signals.wait(&run.run_id, event)) => {
        result.map_err(|_| {
          OrchestratorError::from(NodeError::from_capability(&def.id, &CapabilityError::timeout(timeout)))
        })
      }
      _ = run.cancel.cancelled() => Err(OrchestratorError::Cancelled),
    }
  }
}
