use thiserror::Error;

/// Errors that fail run initialization. Never retried.
#[derive(Debug, Error)]
pub enum ConfigurationError {
  #[error("no pipeline configured for tenant '{tenant}' queue '{queue}'")]
  PipelineNotFound { tenant: String, queue: String },

  #[error(
    "pipeline version mismatch for tenant '{tenant}' queue '{queue}': requested {requested}, loaded {loaded}"
  )]
  VersionMismatch {
    tenant: String,
    queue: String,
    requested: String,
    loaded: String,
  },

  #[error("tenant not configured: {tenant}")]
  TenantNotFound { tenant: String },

  #[error("tenant '{tenant}' is not served by this worker")]
  TenantNotAllowed { tenant: String },

  #[error("queue '{queue}' is not allowed for tenant '{tenant}'")]
  QueueNotAllowed { tenant: String, queue: String },

  #[error("configuration source '{source_name}' failed: {message}")]
  Source { source_name: String, message: String },

  #[error("invalid configuration: {message}")]
  Invalid { message: String },
}
