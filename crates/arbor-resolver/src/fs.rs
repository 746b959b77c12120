use std::path::{Path, PathBuf};

use arbor_config::{PipelineDef, TenantConfig};
use async_trait::async_trait;
use tokio::fs;

use crate::error::ConfigurationError;
use crate::source::{PipelineKey, PipelineSource, TenantSource};

/// Pipeline definitions stored as JSON files.
///
/// Layout:
/// ```text
/// {root}/
/// └── acme/
///     ├── qa.json        (default for queue "qa")
///     └── qa@3.json      (pinned version "3")
/// ```
pub struct FsPipelineSource {
  name: String,
  root: PathBuf,
}

impl FsPipelineSource {
  pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
    Self {
      name: name.into(),
      root: root.into(),
    }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn default_path(&self, key: &PipelineKey) -> PathBuf {
    self.root.join(&key.tenant).join(format!("{}.json", key.queue))
  }

  fn versioned_path(&self, key: &PipelineKey, version: &str) -> PathBuf {
    self
      .root
      .join(&key.tenant)
      .join(format!("{}@{}.json", key.queue, version))
  }

  fn source_error(&self, path: &Path, e: impl std::fmt::Display) -> ConfigurationError {
    ConfigurationError::Source {
      source_name: self.name.clone(),
      message: format!("{}: {}", path.display(), e),
    }
  }

  async fn read(&self, path: &Path) -> Result<Option<PipelineDef>, ConfigurationError> {
    if !path.exists() {
      return Ok(None);
    }
    let content = fs::read_to_string(path)
      .await
      .map_err(|e| self.source_error(path, e))?;
    let pipeline = serde_json::from_str(&content).map_err(|e| self.source_error(path, e))?;
    Ok(Some(pipeline))
  }
}

#[async_trait]
impl PipelineSource for FsPipelineSource {
  fn name(&self) -> &str {
    &self.name
  }

  async fn load(&self, key: &PipelineKey) -> Result<Option<PipelineDef>, ConfigurationError> {
    if let Some(version) = &key.version
      && let Some(pipeline) = self.read(&self.versioned_path(key, version)).await?
    {
      return Ok(Some(pipeline));
    }
    self.read(&self.default_path(key)).await
  }

  async fn store(&self, key: &PipelineKey, pipeline: &PipelineDef) -> Result<(), ConfigurationError> {
    let path = self.versioned_path(key, &pipeline.version);
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent)
        .await
        .map_err(|e| self.source_error(parent, e))?;
    }
    let content =
      serde_json::to_string_pretty(pipeline).map_err(|e| self.source_error(&path, e))?;
    fs::write(&path, content)
      .await
      .map_err(|e| self.source_error(&path, e))?;
    Ok(())
  }
}

/// Tenant configurations stored as `{root}/{tenant}.json`.
pub struct FsTenantSource {
  root: PathBuf,
}

impl FsTenantSource {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }
}

#[async_trait]
impl TenantSource for FsTenantSource {
  async fn tenant(&self, tenant: &str) -> Result<Option<TenantConfig>, ConfigurationError> {
    let path = self.root.join(format!("{}.json", tenant));
    if !path.exists() {
      return Ok(None);
    }
    let content = fs::read_to_string(&path)
      .await
      .map_err(|e| ConfigurationError::Invalid {
        message: format!("{}: {}", path.display(), e),
      })?;
    let mut config: TenantConfig =
      serde_json::from_str(&content).map_err(|e| ConfigurationError::Invalid {
        message: format!("{}: {}", path.display(), e),
      })?;
    if config.tenant.is_empty() {
      config.tenant = tenant.to_string();
    }
    Ok(Some(config))
  }
}
