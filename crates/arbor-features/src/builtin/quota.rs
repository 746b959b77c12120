use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::HookError;
use crate::hook::{FeatureHook, HookPhase, NodeContext};

/// Soft limits may be exceeded by this factor before runs are refused.
const SOFT_BURST_FACTOR: f64 = 1.05;

/// Per-tenant limits, read from the tenant's `quota` setting:
/// `{"quota": {"hardLimit": 100, "softLimit": 80}}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaLimits {
  pub hard: Option<u64>,
  pub soft: Option<u64>,
}

impl QuotaLimits {
  pub fn from_settings(settings: &serde_json::Map<String, serde_json::Value>) -> Self {
    let Some(quota) = settings.get("quota") else {
      return Self::default();
    };
    Self {
      hard: quota.get("hardLimit").and_then(|v| v.as_u64()),
      soft: quota.get("softLimit").and_then(|v| v.as_u64()),
    }
  }

  /// Usage at or above which a new reservation is refused.
  ///
  /// The soft limit allows a 5% burst, and the tighter of the two limits wins.
  pub fn ceiling(&self) -> Option<u64> {
    // TODO: confirm with product whether the soft-limit burst should still
    // apply to tenants that have no hard limit configured.
    let burst = self
      .soft
      .map(|soft| (soft as f64 * SOFT_BURST_FACTOR).floor() as u64);
    match (self.hard, burst) {
      (Some(hard), Some(burst)) => Some(hard.min(burst)),
      (hard, burst) => hard.or(burst),
    }
  }
}

/// Cross-run usage counters, one atomic per tenant.
#[derive(Default)]
pub struct QuotaCounters {
  usage: RwLock<HashMap<String, Arc<AtomicU64>>>,
}

impl QuotaCounters {
  pub fn new() -> Self {
    Self::default()
  }

  fn counter(&self, tenant: &str) -> Arc<AtomicU64> {
    {
      let usage = self.usage.read().unwrap_or_else(PoisonError::into_inner);
      if let Some(counter) = usage.get(tenant) {
        return counter.clone();
      }
    }
    let mut usage = self.usage.write().unwrap_or_else(PoisonError::into_inner);
    usage.entry(tenant.to_string()).or_default().clone()
  }

  pub fn usage(&self, tenant: &str) -> u64 {
    self.counter(tenant).load(Ordering::Acquire)
  }

  /// Overwrite a tenant's usage, e.g. when seeding from an external store.
  pub fn set_usage(&self, tenant: &str, usage: u64) {
    self.counter(tenant).store(usage, Ordering::Release);
  }

  /// Reserve one unit for `tenant` unless that would cross the ceiling.
  ///
  /// Check and increment happen in a single compare-and-set loop, so
  /// concurrent reservations can never push usage past the ceiling.
  pub fn try_reserve(&self, tenant: &str, limits: QuotaLimits) -> Result<u64, HookError> {
    let counter = self.counter(tenant);
    let ceiling = limits.ceiling();
    let mut current = counter.load(Ordering::Acquire);
    loop {
      if let Some(limit) = ceiling
        && current >= limit
      {
        return Err(HookError::QuotaExceeded {
          tenant: tenant.to_string(),
          usage: current,
          limit,
        });
      }
      match counter.compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => return Ok(current + 1),
        Err(actual) => current = actual,
      }
    }
  }
}

/// Refuses to start a run when the tenant is over quota.
///
/// Only acts on the root node, so a run is refused before any other node
/// executes.
pub struct QuotaHook {
  counters: Arc<QuotaCounters>,
}

impl QuotaHook {
  pub fn new() -> Self {
    Self::with_counters(Arc::new(QuotaCounters::new()))
  }

  pub fn with_counters(counters: Arc<QuotaCounters>) -> Self {
    Self { counters }
  }

  pub fn counters(&self) -> &Arc<QuotaCounters> {
    &self.counters
  }
}

impl Default for QuotaHook {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl FeatureHook for QuotaHook {
  fn name(&self) -> &str {
    "quota"
  }

  fn phase(&self) -> HookPhase {
    HookPhase::Pre
  }

  async fn before(&self, ctx: &NodeContext) -> Result<(), HookError> {
    if !ctx.is_root {
      return Ok(());
    }

    let limits = QuotaLimits::from_settings(&ctx.settings);
    match self.counters.try_reserve(&ctx.tenant, limits) {
      Ok(usage) => {
        debug!(tenant = %ctx.tenant, usage, "quota_reserved");
        Ok(())
      }
      Err(e) => {
        warn!(tenant = %ctx.tenant, error = %e, "quota_exceeded");
        Err(e)
      }
    }
  }
}
