//! Executing one node: hooks, ledger events, input resolution, the body
//! and output write-back.

use std::time::{Duration, Instant};

use arbor_config::{DEFAULT_TIMEOUT_MS, NodeDef, StructuralType};
use arbor_features::{HookError, NodeContext, NodeOutcome, ResolutionContext};
use arbor_ledger::{AiMetrics, NodeEndRecord, NodeEventStatus, NodeStartRecord, ReplayMetadata};
use arbor_plugin::{CapabilityError, CapabilityRequest, InstanceKey, Parameters};
use arbor_workflow::{ActivityType, NodeStatus, WorkflowError};
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::error::{NodeError, OrchestratorError, codes};
use crate::expansion::{self, DEFAULT_PARSER, ExpansionResult};
use crate::orchestrator::Orchestrator;
use crate::run::RunState;

/// Whether nodes of this type get `node_started` / `node_ended` ledger events.
fn is_recorded(node_type: StructuralType) -> bool {
  ActivityType::from(node_type) != ActivityType::Control
}

impl Orchestrator {
  /// Execute one eligible node and settle its status.
  ///
  /// A failing node is handed to [`Orchestrator::fail`]; `Ok` means the run
  /// may continue.
  #[instrument(name = "node", skip(self, run), fields(run_id = %run.run_id))]
  pub(crate) async fn execute(
    &self,
    run: &RunState,
    node_id: &str,
  ) -> Result<(), OrchestratorError> {
    let definition = run
      .with_tree(|tree| tree.get(node_id).map(|n| n.definition.clone()))
      .ok_or_else(|| WorkflowError::NodeNotFound(node_id.to_string()))?;
    let recorded = is_recorded(definition.node_type);
    let root_id = run.root_id();
    run.node_started(node_id);

    let hooks = self.hooks.resolve(
      &definition,
      ResolutionContext {
        scope: &run.pipeline.scope,
        queue: &run.key.queue,
      },
    );
    let mut ctx = NodeContext {
      run_id: run.run_id.clone(),
      node_id: node_id.to_string(),
      node_type: definition.node_type,
      tenant: run.key.tenant.clone(),
      queue: run.key.queue.clone(),
      plugin_ref: definition.plugin_ref.clone(),
      is_root: !run.nested && node_id == root_id,
      success: false,
      settings: run.settings.clone(),
    };
    let started = Instant::now();

    if let Err(e) = hooks.run_before(&ctx).await {
      let elapsed = started.elapsed();
      hooks
        .run_finally(&ctx, &NodeOutcome::failed(e.to_string(), elapsed))
        .await;
      let error = if matches!(e, HookError::QuotaExceeded { .. }) {
        OrchestratorError::QuotaExceeded(e)
      } else {
        NodeError::hook_aborted(node_id, &e).into()
      };
      if recorded {
        self
          .record_end(run, &definition, elapsed, Err(&error))
          .await?;
      }
      warn!(node_id = %node_id, error = %error, "node_aborted");
      if run.node_returned(node_id) {
        return self.settle_abandoned(run, node_id, false);
      }
      return self.fail(run, node_id, error).await;
    }

    let input = self.resolve_input(run, &definition);
    if recorded {
      let replay = self.replay_metadata(run, &definition, &input);
      self
        .ledger
        .node_started(&NodeStartRecord {
          run_id: run.run_id.clone(),
          node_id: node_id.to_string(),
          node_type: definition.node_type.to_string(),
          capability_ref: definition.plugin_ref.clone(),
          started_at: Utc::now(),
          replay,
        })
        .await?;
    }
    debug!(node_id = %node_id, node_type = %definition.node_type, "node_started");

    let result = match self.run_body(run, &definition, input).await {
      Ok(output) => self
        .write_outputs(run, &definition, &output)
        .map(|()| output),
      Err(e) => Err(e),
    };
    let elapsed = started.elapsed();

    ctx.success = result.is_ok();
    let outcome = match &result {
      Ok(output) => NodeOutcome::succeeded(output.clone(), elapsed),
      Err(e) => NodeOutcome::failed(e.to_string(), elapsed),
    };
    hooks.run_after(&ctx, &outcome).await;

    if recorded {
      self
        .record_end(run, &definition, elapsed, result.as_ref())
        .await?;
    }

    if run.node_returned(node_id) {
      return self.settle_abandoned(run, node_id, result.is_ok());
    }

    match result {
      Ok(_) => {
        run.with_tree(|tree| tree.transition(node_id, NodeStatus::Completed))?;
        info!(
          node_id = %node_id,
          node_type = %definition.node_type,
          duration_ms = elapsed.as_millis() as u64,
          "node_completed"
        );
        Ok(())
      }
      Err(e) => {
        warn!(node_id = %node_id, error = %e, "node_failed");
        self.fail(run, node_id, e).await
      }
    }
  }

  /// Settle a node whose branch was abandoned while it ran. Its result is
  /// recorded but can no longer fail the run.
  fn settle_abandoned(
    &self,
    run: &RunState,
    node_id: &str,
    succeeded: bool,
  ) -> Result<(), OrchestratorError> {
    run.with_tree(|tree| {
      if succeeded {
        tree.transition(node_id, NodeStatus::Completed)?;
      } else {
        tree.transition(node_id, NodeStatus::Failed)?;
        if let Some(node) = tree.get_mut(node_id) {
          node.recovered = true;
        }
      }
      tree.skip_subtree(node_id).map(|_| ())
    })?;
    info!(node_id = %node_id, succeeded, "abandoned_node_settled");
    Ok(())
  }

  async fn run_body(
    &self,
    run: &RunState,
    def: &NodeDef,
    input: Parameters,
  ) -> Result<Value, OrchestratorError> {
    match def.node_type {
      StructuralType::Plugin | StructuralType::Evaluation | StructuralType::Reflection => {
        self.invoke_capability(run, def, input).await
      }
      StructuralType::LlmDecision | StructuralType::ToolRouter => {
        let output = self.invoke_capability(run, def, input).await?;
        self.route(run, def, &output)?;
        Ok(output)
      }
      StructuralType::Planner => self.expand(run, def, input).await,
      StructuralType::SubPipeline => self.run_sub_pipeline(run, def, input).await,
      StructuralType::EventWait => self.wait_for_event(run, def).await,
      StructuralType::If => self.branch_if(run, def),
      StructuralType::Switch => self.branch_switch(run, def),
      StructuralType::Iterator => self.start_iterator(run, def),
      StructuralType::Join => self.join(run, def),
      StructuralType::Sequence
      | StructuralType::Case
      | StructuralType::Fork
      | StructuralType::TryCatch
      | StructuralType::Retry => Ok(Value::Null),
      StructuralType::Unknown => Err(
        NodeError::new(&def.id, codes::UNSUPPORTED_NODE, "node type is not supported")
          .non_retryable()
          .into(),
      ),
    }
  }

  /// Input parameters from the input mappings. Unset variables are left out.
  fn resolve_input(&self, run: &RunState, def: &NodeDef) -> Parameters {
    let variables = run.variables();
    def
      .input_mappings
      .iter()
      .filter_map(|m| {
        variables
          .get(&m.variable_name)
          .map(|v| (m.parameter_name.clone(), v.clone()))
      })
      .collect()
  }

  /// Write mapped output parameters back to variables.
  fn write_outputs(
    &self,
    run: &RunState,
    def: &NodeDef,
    output: &Value,
  ) -> Result<(), OrchestratorError> {
    if def.output_mappings.is_empty() {
      return Ok(());
    }
    let mut variables = run.variables_mut();
    for mapping in &def.output_mappings {
      let Some(value) = output.get(&mapping.parameter_name) else {
        continue;
      };
      variables
        .set(&mapping.variable_name, value.clone())
        .map_err(|e| {
          NodeError::new(&def.id, codes::VARIABLE_REJECTED, e.to_string()).non_retryable()
        })?;
    }
    Ok(())
  }

  fn replay_metadata(&self, run: &RunState, def: &NodeDef, input: &Parameters) -> ReplayMetadata {
    run.with_tree(|tree| {
      let attempt = tree
        .ancestors(&def.id)
        .iter()
        .filter_map(|id| tree.get(id))
        .find(|n| n.definition.node_type == StructuralType::Retry)
        .map(|n| n.attempts)
        .unwrap_or(0);
      let node = tree.get(&def.id);
      ReplayMetadata {
        attempt: i64::from(attempt) + 1,
        dynamic: node.is_some_and(|n| n.dynamic),
        parent_id: node.and_then(|n| n.parent_id.clone()),
        input: Value::Object(input.clone()),
      }
    })
  }

  async fn record_end(
    &self,
    run: &RunState,
    def: &NodeDef,
    elapsed: Duration,
    result: Result<&Value, &OrchestratorError>,
  ) -> Result<(), OrchestratorError> {
    let (status, output, ai_metrics, failure) = match result {
      Ok(output) => {
        let metrics = AiMetrics::from_output(output);
        if let Some(metrics) = &metrics {
          run.add_usage(metrics);
        }
        (NodeEventStatus::Success, Some(output.clone()), metrics, None)
      }
      Err(e) => (NodeEventStatus::Failed, None, None, Some(e.failure_metadata())),
    };

    self
      .ledger
      .node_ended(&NodeEndRecord {
        run_id: run.run_id.clone(),
        node_id: def.id.clone(),
        node_type: def.node_type.to_string(),
        capability_ref: def.plugin_ref.clone(),
        status,
        ended_at: Utc::now(),
        duration_ms: elapsed.as_millis() as i64,
        output,
        ai_metrics,
        failure,
      })
      .await?;
    Ok(())
  }

  /// Timeout of a node: its own, else the nearest ancestor's, else the pipeline's.
  pub(crate) fn effective_timeout(&self, run: &RunState, def: &NodeDef) -> Duration {
    let inherited = def.timeout_ms.or_else(|| {
      run.with_tree(|tree| {
        tree
          .ancestors(&def.id)
          .iter()
          .find_map(|id| tree.get(id).and_then(|n| n.definition.timeout_ms))
      })
    });
    let millis = inherited.unwrap_or(match run.pipeline.execution.timeout_ms {
      0 => DEFAULT_TIMEOUT_MS,
      millis => millis,
    });
    Duration::from_millis(millis)
  }

  /// Call the node's capability with timeout, cancellation and the retry policy.
  async fn invoke_capability(
    &self,
    run: &RunState,
    def: &NodeDef,
    parameters: Parameters,
  ) -> Result<Value, OrchestratorError> {
    let Some(capability_ref) = def.plugin_ref.as_deref() else {
      let message = format!("{} node has no pluginRef", def.node_type);
      return Err(NodeError::invalid(&def.id, message).into());
    };
    if !run.pipeline.scope.allows_capability(capability_ref) {
      return Err(
        NodeError::new(
          &def.id,
          codes::CAPABILITY_NOT_ALLOWED,
          format!("capability '{}' is not in the pipeline scope", capability_ref),
        )
        .non_retryable()
        .into(),
      );
    }

    let instance = self
      .instances
      .get_or_create(
        &self.plugins,
        &InstanceKey::new(&run.run_id, &def.id),
        capability_ref,
      )
      .map_err(|e| NodeError::from_plugin(&def.id, &e))?;

    let policy = def
      .retry
      .clone()
      .unwrap_or_else(|| run.pipeline.execution.retry.clone());
    let timeout = self.effective_timeout(run, def);
    let request = CapabilityRequest {
      run_id: run.run_id.clone(),
      node_id: def.id.clone(),
      capability_ref: capability_ref.to_string(),
      tenant: run.key.tenant.clone(),
      parameters,
    };

    let mut attempt = 1;
    loop {
      let result = tokio::select! {
        result = tokio::time::timeout(timeout, instance.execute(request.clone())) => {
          result.unwrap_or_else(|_| Err(CapabilityError::timeout(timeout)))
        }
        _ = run.cancel.cancelled() => return Err(OrchestratorError::Cancelled),
      };

      match result {
        Ok(output) => return Ok(output.into_value()),
        Err(e) if e.retryable && policy.is_retryable(&e.code) && attempt < policy.max_attempts => {
          let delay = policy.backoff(attempt + 1);
          warn!(
            node_id = %def.id,
            capability_ref = %capability_ref,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %e,
            "capability_retry"
          );
          tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = run.cancel.cancelled() => return Err(OrchestratorError::Cancelled),
          }
          attempt += 1;
        }
        Err(e) => return Err(NodeError::from_capability(&def.id, &e).into()),
      }
    }
  }

  /// PLANNER: run the capability and attach the children it asks for.
  ///
  /// A planner that already expanded (a re-run inside a loop or retry) keeps
  /// its children and skips the call.
  async fn expand(
    &self,
    run: &RunState,
    def: &NodeDef,
    input: Parameters,
  ) -> Result<Value, OrchestratorError> {
    let expanded = run.with_tree(|tree| {
      tree
        .has_planner_expanded(&def.id)
        .then(|| tree.children(&def.id).to_vec())
    });
    if let Some(node_ids) = expanded {
      debug!(node_id = %def.id, "planner_already_expanded");
      return Ok(expansion_output(ExpansionResult {
        attached_to: def.id.clone(),
        node_ids,
      }));
    }

    let output = self.invoke_capability(run, def, input).await?;
    let failed = |message: String| OrchestratorError::Expansion {
      node_id: def.id.clone(),
      message,
    };

    let content = output.get("content").unwrap_or(&output);
    let parser_name = def.parser.as_deref().unwrap_or(DEFAULT_PARSER);
    let parser = self
      .parsers
      .get(parser_name)
      .ok_or_else(|| failed(format!("unknown expansion parser '{}'", parser_name)))?;
    let request = parser.parse(&def.id, content).map_err(failed)?;

    let result = run.with_tree(|tree| -> Result<ExpansionResult, String> {
      expansion::validate(tree, &request)?;
      let children = expansion::build_children(
        tree,
        &def.id,
        &request,
        &self.hooks,
        ResolutionContext {
          scope: &run.pipeline.scope,
          queue: &run.key.queue,
        },
      );
      let node_ids = tree.attach_children(&request.attach_to, &children);
      tree.mark_planner_expanded(&def.id);
      tree.mark_planner_expanded(&request.attach_to);
      Ok(ExpansionResult {
        attached_to: request.attach_to.clone(),
        node_ids,
      })
    });
    let result = result.map_err(failed)?;

    info!(
      node_id = %def.id,
      attached_to = %result.attached_to,
      children = result.node_ids.len(),
      "planner_expanded"
    );
    Ok(expansion_output(result))
  }
}

fn expansion_output(result: ExpansionResult) -> Value {
  serde_json::to_value(result).unwrap_or(Value::Null)
}
