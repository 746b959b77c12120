/// Errors raised by feature hooks.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HookError {
  /// A tenant's quota would be exceeded by starting another run.
  #[error("quota exceeded for tenant '{tenant}': usage {usage} >= limit {limit}")]
  QuotaExceeded {
    tenant: String,
    usage: u64,
    limit: u64,
  },

  /// A hook refused to let the node run.
  #[error("hook '{hook}' aborted node: {message}")]
  Aborted { hook: String, message: String },

  /// A hook failed without an opinion on the node.
  #[error("hook '{hook}' failed: {message}")]
  Failed { hook: String, message: String },
}
