use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::HookError;
use crate::hook::{FeatureHook, HookPhase, NodeContext, NodeOutcome};

/// Logs node entry and exit.
pub struct LoggingHook;

#[async_trait]
impl FeatureHook for LoggingHook {
  fn name(&self) -> &str {
    "logging"
  }

  fn phase(&self) -> HookPhase {
    HookPhase::PrePost
  }

  async fn before(&self, ctx: &NodeContext) -> Result<(), HookError> {
    info!(
      run_id = %ctx.run_id,
      node_id = %ctx.node_id,
      node_type = %ctx.node_type,
      tenant = %ctx.tenant,
      queue = %ctx.queue,
      "node_entered"
    );
    Ok(())
  }

  async fn after(&self, ctx: &NodeContext, outcome: &NodeOutcome) -> Result<(), HookError> {
    let duration_ms = outcome.duration.as_millis() as u64;
    if outcome.success {
      info!(run_id = %ctx.run_id, node_id = %ctx.node_id, duration_ms, "node_exited");
    } else {
      warn!(
        run_id = %ctx.run_id,
        node_id = %ctx.node_id,
        duration_ms,
        error = outcome.error.as_deref().unwrap_or_default(),
        "node_exited_with_failure"
      );
    }
    Ok(())
  }
}
