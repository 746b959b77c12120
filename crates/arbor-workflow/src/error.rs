use thiserror::Error;

use crate::state::NodeStatus;

#[derive(Debug, Error)]
pub enum WorkflowError {
  #[error("node not found: {0}")]
  NodeNotFound(String),

  #[error("duplicate node id: {0}")]
  DuplicateNodeId(String),

  #[error("invalid status transition for node '{node_id}': {from:?} -> {to:?}")]
  InvalidTransition {
    node_id: String,
    from: NodeStatus,
    to: NodeStatus,
  },

  #[error("invalid tree structure: {message}")]
  InvalidStructure { message: String },
}
