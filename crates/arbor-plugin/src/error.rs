use std::path::PathBuf;

/// Errors raised while locating or instantiating capabilities.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
  #[error("capability not registered: {capability_ref}")]
  NotFound { capability_ref: String },

  #[error("invalid package at '{}': {message}", path.display())]
  InvalidPackage { path: PathBuf, message: String },

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),
}
