//! Per-run capability instance caching.
//!
//! Repeated invocations of the same node within one run (retries, loop
//! iterations) reuse the instance created for that node.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::capability::Capability;
use crate::error::PluginError;
use crate::registry::PluginRegistry;

/// Cache key for capability instances.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct InstanceKey {
  pub run_id: String,
  pub node_id: String,
}

impl InstanceKey {
  pub fn new(run_id: impl Into<String>, node_id: impl Into<String>) -> Self {
    Self {
      run_id: run_id.into(),
      node_id: node_id.into(),
    }
  }
}

#[derive(Clone, Default)]
pub struct InstanceCache {
  cache: Arc<RwLock<HashMap<InstanceKey, Arc<dyn Capability>>>>,
}

impl InstanceCache {
  pub fn new() -> Self {
    Self::default()
  }

  /// Get the instance for `key`, or create it from the registry and cache it.
  pub fn get_or_create(
    &self,
    registry: &PluginRegistry,
    key: &InstanceKey,
    capability_ref: &str,
  ) -> Result<Arc<dyn Capability>, PluginError> {
    {
      let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
      if let Some(instance) = cache.get(key) {
        return Ok(instance.clone());
      }
    }

    let instance = registry.create(capability_ref)?;

    let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
    Ok(cache.entry(key.clone()).or_insert(instance).clone())
  }

  pub fn len(&self) -> usize {
    self.cache.read().unwrap_or_else(PoisonError::into_inner).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Remove and return every instance created for `run_id`.
  pub fn evict_run(&self, run_id: &str) -> Vec<Arc<dyn Capability>> {
    let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
    let keys: Vec<InstanceKey> = cache
      .keys()
      .filter(|key| key.run_id == run_id)
      .cloned()
      .collect();
    keys.iter().filter_map(|key| cache.remove(key)).collect()
  }

  /// Remove and return every cached instance.
  pub fn drain(&self) -> Vec<Arc<dyn Capability>> {
    let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
    cache.drain().map(|(_, instance)| instance).collect()
  }
}
