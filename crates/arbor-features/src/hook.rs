use std::sync::Arc;
use std::time::Duration;

use arbor_config::StructuralType;
use async_trait::async_trait;

use crate::error::HookError;
use crate::pattern::pattern_matches;

/// When a hook runs relative to the node body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
  /// Before the node; a failure aborts the node.
  Pre,
  /// After the node body ran.
  Post,
  /// Both before and after.
  PrePost,
  /// Before, and after regardless of outcome (even when a PRE hook aborted).
  PreFinally,
}

impl HookPhase {
  pub fn runs_before(&self) -> bool {
    matches!(self, HookPhase::Pre | HookPhase::PrePost | HookPhase::PreFinally)
  }

  pub fn runs_after(&self) -> bool {
    matches!(self, HookPhase::Post | HookPhase::PrePost | HookPhase::PreFinally)
  }
}

/// What a hook knows about the node it is attached to.
#[derive(Debug, Clone)]
pub struct NodeContext {
  pub run_id: String,
  pub node_id: String,
  pub node_type: StructuralType,
  pub tenant: String,
  pub queue: String,
  pub plugin_ref: Option<String>,
  pub is_root: bool,
  /// Set once the node body finished; `false` during before-calls.
  pub success: bool,
  /// The tenant's configuration settings.
  pub settings: Arc<serde_json::Map<String, serde_json::Value>>,
}

/// Result of the node body handed to after-calls.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeOutcome {
  pub success: bool,
  pub output: Option<serde_json::Value>,
  pub error: Option<String>,
  pub duration: Duration,
}

impl NodeOutcome {
  pub fn succeeded(output: serde_json::Value, duration: Duration) -> Self {
    Self {
      success: true,
      output: Some(output),
      error: None,
      duration,
    }
  }

  pub fn failed(error: impl Into<String>, duration: Duration) -> Self {
    Self {
      success: false,
      output: None,
      error: Some(error.into()),
      duration,
    }
  }
}

/// A named, phase-scoped, pattern-applicable piece of cross-cutting behavior.
#[async_trait]
pub trait FeatureHook: Send + Sync {
  /// Name the hook is referenced by in configuration.
  fn name(&self) -> &str;

  fn phase(&self) -> HookPhase;

  /// Applicability patterns over `TYPE` / `TYPE.pluginRef`. Defaults to all nodes.
  fn patterns(&self) -> &[&str] {
    &["*"]
  }

  fn applies_to(&self, node_type: StructuralType, plugin_ref: Option<&str>) -> bool {
    self
      .patterns()
      .iter()
      .any(|p| pattern_matches(p, node_type, plugin_ref))
  }

  async fn before(&self, _ctx: &NodeContext) -> Result<(), HookError> {
    Ok(())
  }

  async fn after(&self, _ctx: &NodeContext, _outcome: &NodeOutcome) -> Result<(), HookError> {
    Ok(())
  }

  /// Release resources at process exit.
  async fn cleanup(&self) -> Result<(), HookError> {
    Ok(())
  }
}
