use serde::{Deserialize, Serialize};

/// Per-tenant configuration consumed at run initialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantConfig {
  pub tenant: String,
  /// Queues the tenant may run. Empty means any queue.
  #[serde(default)]
  pub queues: Vec<String>,
  /// Free-form settings handed to feature hooks (quota limits, model keys, ...).
  #[serde(default)]
  pub settings: serde_json::Map<String, serde_json::Value>,
}

impl TenantConfig {
  pub fn new(tenant: impl Into<String>) -> Self {
    Self {
      tenant: tenant.into(),
      ..Self::default()
    }
  }

  pub fn allows_queue(&self, queue: &str) -> bool {
    self.queues.is_empty() || self.queues.iter().any(|q| q == queue)
  }
}
