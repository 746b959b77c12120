use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::warn;

use crate::builtin::{DebugHook, LoggingHook, MetricsHook, QuotaHook};
use crate::hook::FeatureHook;

/// Name-keyed hook lookup.
#[derive(Default)]
pub struct HookRegistry {
  hooks: RwLock<HashMap<String, Arc<dyn FeatureHook>>>,
}

impl HookRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// A registry holding `logging`, `debug`, `metrics` and `quota`.
  pub fn with_builtins() -> Self {
    let registry = Self::new();
    registry.register(Arc::new(LoggingHook));
    registry.register(Arc::new(DebugHook));
    registry.register(Arc::new(MetricsHook::new()));
    registry.register(Arc::new(QuotaHook::new()));
    registry
  }

  /// Register a hook under its own name, replacing any previous one.
  pub fn register(&self, hook: Arc<dyn FeatureHook>) {
    let mut hooks = self.hooks.write().unwrap_or_else(PoisonError::into_inner);
    hooks.insert(hook.name().to_string(), hook);
  }

  pub fn get(&self, name: &str) -> Option<Arc<dyn FeatureHook>> {
    let hooks = self.hooks.read().unwrap_or_else(PoisonError::into_inner);
    hooks.get(name).cloned()
  }

  /// Registered hook names, sorted.
  pub fn names(&self) -> Vec<String> {
    let hooks = self.hooks.read().unwrap_or_else(PoisonError::into_inner);
    let mut names: Vec<String> = hooks.keys().cloned().collect();
    names.sort();
    names
  }

  /// Run every hook's cleanup, logging and swallowing individual failures.
  /// Returns the number of hooks whose cleanup failed.
  pub async fn cleanup_all(&self) -> usize {
    let hooks: Vec<Arc<dyn FeatureHook>> = {
      let hooks = self.hooks.read().unwrap_or_else(PoisonError::into_inner);
      hooks.values().cloned().collect()
    };

    let mut failures = 0;
    for hook in hooks {
      if let Err(e) = hook.cleanup().await {
        warn!(hook = %hook.name(), error = %e, "hook_cleanup_failed");
        failures += 1;
      }
    }
    failures
  }
}
