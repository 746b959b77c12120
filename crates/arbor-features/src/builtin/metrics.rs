use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use arbor_ledger::AiMetrics;
use async_trait::async_trait;
use serde::Serialize;

use crate::error::HookError;
use crate::hook::{FeatureHook, HookPhase, NodeContext, NodeOutcome};

#[derive(Default)]
struct Counters {
  invocations: AtomicU64,
  failures: AtomicU64,
  duration_ms: AtomicU64,
  tokens: AtomicU64,
}

/// Point-in-time counters for one capability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityMetrics {
  pub invocations: u64,
  pub failures: u64,
  pub duration_ms: u64,
  pub tokens: u64,
}

/// Counts invocations, failures, time and tokens per capability across runs.
#[derive(Default)]
pub struct MetricsHook {
  counters: RwLock<HashMap<String, Arc<Counters>>>,
}

impl MetricsHook {
  pub fn new() -> Self {
    Self::default()
  }

  fn counters_for(&self, key: &str) -> Arc<Counters> {
    {
      let counters = self.counters.read().unwrap_or_else(PoisonError::into_inner);
      if let Some(c) = counters.get(key) {
        return c.clone();
      }
    }
    let mut counters = self.counters.write().unwrap_or_else(PoisonError::into_inner);
    counters.entry(key.to_string()).or_default().clone()
  }

  pub fn snapshot(&self) -> BTreeMap<String, CapabilityMetrics> {
    let counters = self.counters.read().unwrap_or_else(PoisonError::into_inner);
    counters
      .iter()
      .map(|(key, c)| {
        (
          key.clone(),
          CapabilityMetrics {
            invocations: c.invocations.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            duration_ms: c.duration_ms.load(Ordering::Relaxed),
            tokens: c.tokens.load(Ordering::Relaxed),
          },
        )
      })
      .collect()
  }
}

/// Total tokens reported under `usage`, read the same way the ledger reads them.
fn reported_tokens(output: &serde_json::Value) -> u64 {
  AiMetrics::from_output(output)
    .map(|metrics| metrics.total_tokens.max(0) as u64)
    .unwrap_or(0)
}

#[async_trait]
impl FeatureHook for MetricsHook {
  fn name(&self) -> &str {
    "metrics"
  }

  fn phase(&self) -> HookPhase {
    HookPhase::PreFinally
  }

  fn patterns(&self) -> &[&str] {
    &[
      "PLUGIN.*",
      "LLM_DECISION.*",
      "TOOL_ROUTER.*",
      "EVALUATION.*",
      "REFLECTION.*",
      "PLANNER.*",
    ]
  }

  async fn after(&self, ctx: &NodeContext, outcome: &NodeOutcome) -> Result<(), HookError> {
    let key = ctx
      .plugin_ref
      .clone()
      .unwrap_or_else(|| ctx.node_type.to_string());
    let counters = self.counters_for(&key);

    counters.invocations.fetch_add(1, Ordering::Relaxed);
    if !outcome.success {
      counters.failures.fetch_add(1, Ordering::Relaxed);
    }
    counters
      .duration_ms
      .fetch_add(outcome.duration.as_millis() as u64, Ordering::Relaxed);
    if let Some(output) = &outcome.output {
      counters
        .tokens
        .fetch_add(reported_tokens(output), Ordering::Relaxed);
    }
    Ok(())
  }
}
