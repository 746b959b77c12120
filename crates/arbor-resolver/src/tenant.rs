use std::collections::HashSet;
use std::sync::Arc;

use arbor_config::TenantConfig;
use tracing::debug;

use crate::error::ConfigurationError;
use crate::source::TenantSource;

/// Loads tenant configuration and enforces the worker's allow-lists.
pub struct TenantResolver {
  source: Arc<dyn TenantSource>,
  allowed_tenants: Option<HashSet<String>>,
  allowed_queues: Option<HashSet<String>>,
}

impl TenantResolver {
  pub fn new(source: Arc<dyn TenantSource>) -> Self {
    Self {
      source,
      allowed_tenants: None,
      allowed_queues: None,
    }
  }

  /// Restrict the worker to these tenants. An empty list leaves it unrestricted.
  pub fn with_allowed_tenants(mut self, tenants: impl IntoIterator<Item = String>) -> Self {
    let tenants: HashSet<String> = tenants.into_iter().collect();
    self.allowed_tenants = (!tenants.is_empty()).then_some(tenants);
    self
  }

  /// Restrict the worker to these task queues. An empty list leaves it unrestricted.
  pub fn with_allowed_queues(mut self, queues: impl IntoIterator<Item = String>) -> Self {
    let queues: HashSet<String> = queues.into_iter().collect();
    self.allowed_queues = (!queues.is_empty()).then_some(queues);
    self
  }

  pub async fn resolve(&self, tenant: &str, queue: &str) -> Result<TenantConfig, ConfigurationError> {
    if let Some(allowed) = &self.allowed_tenants
      && !allowed.contains(tenant)
    {
      return Err(ConfigurationError::TenantNotAllowed {
        tenant: tenant.to_string(),
      });
    }

    let config = self
      .source
      .tenant(tenant)
      .await?
      .ok_or_else(|| ConfigurationError::TenantNotFound {
        tenant: tenant.to_string(),
      })?;

    let worker_allows = self
      .allowed_queues
      .as_ref()
      .is_none_or(|queues| queues.contains(queue));
    if !worker_allows || !config.allows_queue(queue) {
      return Err(ConfigurationError::QueueNotAllowed {
        tenant: tenant.to_string(),
        queue: queue.to_string(),
      });
    }

    debug!(tenant = %tenant, queue = %queue, "tenant_resolved");
    Ok(config)
  }
}
