use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::HookError;
use crate::hook::{FeatureHook, HookPhase, NodeContext, NodeOutcome};
use crate::resolver::ResolvedNames;

/// Hooks resolved for one node, ready to dispatch.
#[derive(Clone, Default)]
pub struct ResolvedHooks {
  pub pre: Vec<Arc<dyn FeatureHook>>,
  pub post: Vec<Arc<dyn FeatureHook>>,
}

impl ResolvedHooks {
  pub fn names(&self) -> ResolvedNames {
    ResolvedNames {
      pre: self.pre.iter().map(|h| h.name().to_string()).collect(),
      post: self.post.iter().map(|h| h.name().to_string()).collect(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.pre.is_empty() && self.post.is_empty()
  }

  /// Run before-calls in order. The first failure aborts the node.
  pub async fn run_before(&self, ctx: &NodeContext) -> Result<(), HookError> {
    for hook in &self.pre {
      if let Err(e) = hook.before(ctx).await {
        warn!(node_id = %ctx.node_id, hook = %hook.name(), error = %e, "pre_hook_failed");
        return Err(e);
      }
      debug!(node_id = %ctx.node_id, hook = %hook.name(), "pre_hook_completed");
    }
    Ok(())
  }

  /// Run after-calls in order once the node body ran. Failures are logged only.
  pub async fn run_after(&self, ctx: &NodeContext, outcome: &NodeOutcome) {
    for hook in &self.post {
      Self::after_logged(hook, ctx, outcome).await;
    }
  }

  /// After-calls for a node a PRE hook aborted: only PRE_FINALLY hooks run.
  pub async fn run_finally(&self, ctx: &NodeContext, outcome: &NodeOutcome) {
    for hook in self.post.iter().filter(|h| h.phase() == HookPhase::PreFinally) {
      Self::after_logged(hook, ctx, outcome).await;
    }
  }

  async fn after_logged(hook: &Arc<dyn FeatureHook>, ctx: &NodeContext, outcome: &NodeOutcome) {
    if let Err(e) = hook.after(ctx, outcome).await {
      warn!(node_id = %ctx.node_id, hook = %hook.name(), error = %e, "post_hook_failed");
    }
  }
}
