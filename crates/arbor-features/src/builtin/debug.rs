use async_trait::async_trait;
use tracing::debug;

use crate::error::HookError;
use crate::hook::{FeatureHook, HookPhase, NodeContext, NodeOutcome};

/// Dumps node context and outputs at debug level. Added automatically on
/// queues ending in `-debug`.
pub struct DebugHook;

#[async_trait]
impl FeatureHook for DebugHook {
  fn name(&self) -> &str {
    "debug"
  }

  fn phase(&self) -> HookPhase {
    HookPhase::PreFinally
  }

  async fn before(&self, ctx: &NodeContext) -> Result<(), HookError> {
    debug!(
      run_id = %ctx.run_id,
      node_id = %ctx.node_id,
      node_type = %ctx.node_type,
      plugin_ref = ctx.plugin_ref.as_deref().unwrap_or_default(),
      is_root = ctx.is_root,
      settings = %serde_json::Value::Object((*ctx.settings).clone()),
      "debug_node_before"
    );
    Ok(())
  }

  async fn after(&self, ctx: &NodeContext, outcome: &NodeOutcome) -> Result<(), HookError> {
    debug!(
      run_id = %ctx.run_id,
      node_id = %ctx.node_id,
      success = outcome.success,
      output = %outcome.output.clone().unwrap_or_default(),
      error = outcome.error.as_deref().unwrap_or_default(),
      "debug_node_after"
    );
    Ok(())
  }
}
