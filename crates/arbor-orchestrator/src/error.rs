//! Orchestrator errors.

use arbor_config::RetryPolicy;
use arbor_features::HookError;
use arbor_ledger::{FailureMetadata, FailureStage, LedgerError};
use arbor_plugin::{CapabilityError, PluginError};
use arbor_resolver::ConfigurationError;
use arbor_workflow::WorkflowError;

use crate::variables::VariableError;

/// Error codes the orchestrator assigns to node failures it raises itself.
pub mod codes {
  pub const HOOK_ABORTED: &str = "HOOK_ABORTED";
  pub const BRANCH_FAILED: &str = "BRANCH_FAILED";
  pub const INVALID_NODE: &str = "INVALID_NODE";
  pub const UNSUPPORTED_NODE: &str = "UNSUPPORTED_NODE";
  pub const CAPABILITY_NOT_FOUND: &str = "CAPABILITY_NOT_FOUND";
  pub const CAPABILITY_NOT_ALLOWED: &str = "CAPABILITY_NOT_ALLOWED";
  pub const VARIABLE_REJECTED: &str = "VARIABLE_REJECTED";
  pub const SUB_PIPELINE_FAILED: &str = "SUB_PIPELINE_FAILED";
}

/// Failure of a single node.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("node '{node_id}' failed: {code}: {message}")]
pub struct NodeError {
  pub node_id: String,
  pub code: String,
  pub message: String,
  pub retryable: bool,
}

impl NodeError {
  pub fn new(node_id: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
    Self {
      node_id: node_id.into(),
      code: code.into(),
      message: message.into(),
      retryable: true,
    }
  }

  pub fn non_retryable(mut self) -> Self {
    self.retryable = false;
    self
  }

  pub fn invalid(node_id: &str, message: impl Into<String>) -> Self {
    Self::new(node_id, codes::INVALID_NODE, message).non_retryable()
  }

  pub fn from_capability(node_id: &str, error: &CapabilityError) -> Self {
    Self {
      node_id: node_id.to_string(),
      code: error.code.clone(),
      message: error.message.clone(),
      retryable: error.retryable,
    }
  }

  pub fn from_plugin(node_id: &str, error: &PluginError) -> Self {
    Self::new(node_id, codes::CAPABILITY_NOT_FOUND, error.to_string()).non_retryable()
  }

  pub fn hook_aborted(node_id: &str, error: &HookError) -> Self {
    Self::new(node_id, codes::HOOK_ABORTED, error.to_string()).non_retryable()
  }
}

/// Errors that end a run, or fail a node when raised inside one.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
  /// Tenant, queue or pipeline could not be resolved. Never retried.
  #[error(transparent)]
  Configuration(#[from] ConfigurationError),

  /// A planner's output could not be turned into an expansion.
  #[error("expansion failed at node '{node_id}': {message}")]
  Expansion { node_id: String, message: String },

  /// The tenant's quota refused the run.
  #[error("quota exceeded")]
  QuotaExceeded(#[source] HookError),

  #[error(transparent)]
  NodeExecution(#[from] NodeError),

  /// Nothing is executable but the tree is not complete.
  #[error("run stalled with unfinished nodes: {}", unfinished.join(", "))]
  Stall { unfinished: Vec<String> },

  #[error(transparent)]
  Variable(#[from] VariableError),

  #[error("ledger write failed")]
  Ledger(#[from] LedgerError),

  #[error("execution tree error")]
  Workflow(#[from] WorkflowError),

  #[error("run cancelled")]
  Cancelled,
}

impl OrchestratorError {
  /// Failures that belong to one node and may be absorbed by a RETRY,
  /// TRY_CATCH or FORK boundary. Everything else ends the run.
  pub fn is_node_level(&self) -> bool {
    matches!(
      self,
      OrchestratorError::Expansion { .. } | OrchestratorError::NodeExecution(_)
    )
  }

  /// Whether a RETRY node with `policy` may re-run its body after this error.
  pub fn is_retryable(&self, policy: &RetryPolicy) -> bool {
    match self {
      OrchestratorError::NodeExecution(e) => e.retryable && policy.is_retryable(&e.code),
      OrchestratorError::Expansion { .. } => true,
      _ => false,
    }
  }

  pub fn failure_stage(&self) -> FailureStage {
    match self {
      OrchestratorError::Configuration(_) | OrchestratorError::Variable(_) => {
        FailureStage::Initializing
      }
      OrchestratorError::QuotaExceeded(_) => FailureStage::Quota,
      OrchestratorError::Stall { .. } => FailureStage::Stall,
      OrchestratorError::Cancelled => FailureStage::Cancelled,
      OrchestratorError::Expansion { .. }
      | OrchestratorError::NodeExecution(_)
      | OrchestratorError::Ledger(_)
      | OrchestratorError::Workflow(_) => FailureStage::Node,
    }
  }

  /// Failure sub-record for the node ledger event.
  pub fn failure_metadata(&self) -> FailureMetadata {
    match self {
      OrchestratorError::NodeExecution(e) => FailureMetadata {
        code: e.code.clone(),
        message: e.message.clone(),
        retryable: e.retryable,
      },
      OrchestratorError::Expansion { message, .. } => FailureMetadata {
        code: "EXPANSION_FAILED".to_string(),
        message: message.clone(),
        retryable: true,
      },
      OrchestratorError::QuotaExceeded(e) => FailureMetadata {
        code: "QUOTA_EXCEEDED".to_string(),
        message: e.to_string(),
        retryable: false,
      },
      other => FailureMetadata {
        code: "INTERNAL".to_string(),
        message: other.to_string(),
        retryable: false,
      },
    }
  }

  /// Message recorded on the run: the error and its sources.
  pub fn report(&self) -> String {
    let mut message = self.to_string();
    let mut source = std::error::Error::source(self);
    while let Some(e) = source {
      message.push_str(": ");
      message.push_str(&e.to_string());
      source = e.source();
    }
    message
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_node_level_errors() {
    let node = OrchestratorError::from(NodeError::new("a", "CAPABILITY_FAILED", "boom"));
    assert!(node.is_node_level());
    assert_eq!(node.failure_stage(), FailureStage::Node);

    let stall = OrchestratorError::Stall {
      unfinished: vec!["b".to_string()],
    };
    assert!(!stall.is_node_level());
    assert_eq!(stall.failure_stage(), FailureStage::Stall);
  }

  #[test]
  fn test_retryability_follows_policy() {
    let policy = RetryPolicy {
      non_retryable: vec!["INVALID_INPUT".to_string()],
      ..RetryPolicy::default()
    };
    let failed = OrchestratorError::from(NodeError::new("a", "CAPABILITY_FAILED", "boom"));
    let invalid = OrchestratorError::from(NodeError::new("a", "INVALID_INPUT", "bad"));
    let timeout = OrchestratorError::from(
      NodeError::new("a", "TIMEOUT", "timed out after 5ms").non_retryable(),
    );

    assert!(failed.is_retryable(&policy));
    assert!(!invalid.is_retryable(&policy));
    assert!(!timeout.is_retryable(&policy));
  }

  #[test]
  fn test_report_includes_sources() {
    let err = OrchestratorError::QuotaExceeded(HookError::QuotaExceeded {
      tenant: "acme".to_string(),
      usage: 6,
      limit: 5,
    });
    assert_eq!(
      err.report(),
      "quota exceeded: quota exceeded for tenant 'acme': usage 6 >= limit 5"
    );
  }
}
