use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use arbor_config::{PipelineDef, TenantConfig};
use async_trait::async_trait;

use crate::error::ConfigurationError;
use crate::source::{PipelineKey, PipelineSource, TenantSource};

#[derive(Default)]
struct QueueEntry {
  versions: BTreeMap<String, PipelineDef>,
  current: Option<String>,
}

/// In-process pipeline layer, used as the cache in front of slower layers.
#[derive(Default)]
pub struct MemoryPipelineSource {
  name: String,
  entries: RwLock<HashMap<(String, String), QueueEntry>>,
}

impl MemoryPipelineSource {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      entries: RwLock::default(),
    }
  }

  /// Seed a pipeline as the current version of `(tenant, queue)`.
  pub fn insert(&self, tenant: &str, queue: &str, pipeline: PipelineDef) {
    let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
    let entry = entries
      .entry((tenant.to_string(), queue.to_string()))
      .or_default();
    entry.current = Some(pipeline.version.clone());
    entry.versions.insert(pipeline.version.clone(), pipeline);
  }

  pub fn contains(&self, key: &PipelineKey) -> bool {
    self.lookup(key).is_some()
  }

  fn lookup(&self, key: &PipelineKey) -> Option<PipelineDef> {
    let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
    let entry = entries.get(&(key.tenant.clone(), key.queue.clone()))?;
    let version = key.version.as_ref().or(entry.current.as_ref())?;
    entry.versions.get(version).cloned()
  }
}

#[async_trait]
impl PipelineSource for MemoryPipelineSource {
  fn name(&self) -> &str {
    &self.name
  }

  async fn load(&self, key: &PipelineKey) -> Result<Option<PipelineDef>, ConfigurationError> {
    Ok(self.lookup(key))
  }

  async fn store(&self, key: &PipelineKey, pipeline: &PipelineDef) -> Result<(), ConfigurationError> {
    let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
    let entry = entries
      .entry((key.tenant.clone(), key.queue.clone()))
      .or_default();
    if key.version.is_none() || entry.current.is_none() {
      entry.current = Some(pipeline.version.clone());
    }
    entry
      .versions
      .insert(pipeline.version.clone(), pipeline.clone());
    Ok(())
  }
}

/// Fixed set of tenant configurations.
#[derive(Default)]
pub struct MemoryTenantSource {
  tenants: RwLock<HashMap<String, TenantConfig>>,
}

impl MemoryTenantSource {
  pub fn new(tenants: impl IntoIterator<Item = TenantConfig>) -> Self {
    Self {
      tenants: RwLock::new(tenants.into_iter().map(|t| (t.tenant.clone(), t)).collect()),
    }
  }

  pub fn insert(&self, tenant: TenantConfig) {
    let mut tenants = self.tenants.write().unwrap_or_else(PoisonError::into_inner);
    tenants.insert(tenant.tenant.clone(), tenant);
  }
}

#[async_trait]
impl TenantSource for MemoryTenantSource {
  async fn tenant(&self, tenant: &str) -> Result<Option<TenantConfig>, ConfigurationError> {
    let tenants = self.tenants.read().unwrap_or_else(PoisonError::into_inner);
    Ok(tenants.get(tenant).cloned())
  }
}
