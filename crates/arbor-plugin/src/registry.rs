use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use crate::capability::Capability;
use crate::error::PluginError;

/// Creates a fresh capability instance.
pub type CapabilityFactory = Arc<dyn Fn() -> Arc<dyn Capability> + Send + Sync>;

struct RegisteredPlugin {
  version: String,
  factory: CapabilityFactory,
}

/// Maps capability references to factories and versions.
#[derive(Default)]
pub struct PluginRegistry {
  plugins: RwLock<HashMap<String, RegisteredPlugin>>,
}

impl PluginRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register (or replace) the factory for `capability_ref`.
  pub fn register(
    &self,
    capability_ref: impl Into<String>,
    version: impl Into<String>,
    factory: CapabilityFactory,
  ) {
    let mut plugins = self.plugins.write().unwrap_or_else(PoisonError::into_inner);
    plugins.insert(
      capability_ref.into(),
      RegisteredPlugin {
        version: version.into(),
        factory,
      },
    );
  }

  /// Register a single shared instance returned for every request.
  pub fn register_instance(
    &self,
    capability_ref: impl Into<String>,
    version: impl Into<String>,
    instance: Arc<dyn Capability>,
  ) {
    self.register(capability_ref, version, Arc::new(move || instance.clone()));
  }

  pub fn contains(&self, capability_ref: &str) -> bool {
    let plugins = self.plugins.read().unwrap_or_else(PoisonError::into_inner);
    plugins.contains_key(capability_ref)
  }

  /// Instantiate the capability registered under `capability_ref`.
  pub fn create(&self, capability_ref: &str) -> Result<Arc<dyn Capability>, PluginError> {
    let plugins = self.plugins.read().unwrap_or_else(PoisonError::into_inner);
    let plugin = plugins
      .get(capability_ref)
      .ok_or_else(|| PluginError::NotFound {
        capability_ref: capability_ref.to_string(),
      })?;
    Ok((plugin.factory)())
  }

  pub fn version(&self, capability_ref: &str) -> Option<String> {
    let plugins = self.plugins.read().unwrap_or_else(PoisonError::into_inner);
    plugins.get(capability_ref).map(|p| p.version.clone())
  }

  /// Versions of the given references, for run ledger records. Unknown refs are omitted.
  pub fn versions_of<'a>(
    &self,
    capability_refs: impl IntoIterator<Item = &'a String>,
  ) -> BTreeMap<String, String> {
    let plugins = self.plugins.read().unwrap_or_else(PoisonError::into_inner);
    capability_refs
      .into_iter()
      .filter_map(|r| plugins.get(r).map(|p| (r.clone(), p.version.clone())))
      .collect()
  }

  /// Registered references, sorted.
  pub fn capability_refs(&self) -> Vec<String> {
    let plugins = self.plugins.read().unwrap_or_else(PoisonError::into_inner);
    let mut refs: Vec<String> = plugins.keys().cloned().collect();
    refs.sort();
    refs
  }
}
