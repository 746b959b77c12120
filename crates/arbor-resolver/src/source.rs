use arbor_config::{PipelineDef, TenantConfig};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// Identifies the pipeline a run uses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineKey {
  pub tenant: String,
  pub queue: String,
  /// Requested version. `None` means whatever is current.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub version: Option<String>,
}

impl PipelineKey {
  pub fn new(tenant: impl Into<String>, queue: impl Into<String>) -> Self {
    Self {
      tenant: tenant.into(),
      queue: queue.into(),
      version: None,
    }
  }

  pub fn with_version(mut self, version: impl Into<String>) -> Self {
    self.version = Some(version.into());
    self
  }
}

impl std::fmt::Display for PipelineKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}/{}", self.tenant, self.queue)?;
    if let Some(version) = &self.version {
      write!(f, "@{}", version)?;
    }
    Ok(())
  }
}

/// One layer of pipeline configuration (cache, store or file default).
#[async_trait]
pub trait PipelineSource: Send + Sync {
  /// Name used in logs and errors.
  fn name(&self) -> &str;

  async fn load(&self, key: &PipelineKey) -> Result<Option<PipelineDef>, ConfigurationError>;

  async fn store(&self, key: &PipelineKey, pipeline: &PipelineDef) -> Result<(), ConfigurationError>;
}

/// Source of per-tenant configuration.
#[async_trait]
pub trait TenantSource: Send + Sync {
  async fn tenant(&self, tenant: &str) -> Result<Option<TenantConfig>, ConfigurationError>;
}
