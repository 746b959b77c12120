//! Per-run state and the values crossing the orchestrator boundary.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use arbor_config::{PipelineDef, TenantConfig};
use arbor_ledger::AiMetrics;
use arbor_resolver::PipelineKey;
use arbor_workflow::RuntimeExecutionTree;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::variables::VariableTable;

/// A request to run the pipeline of `(tenant, queue)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
  /// Generated when absent.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub run_id: Option<String>,
  pub tenant: String,
  pub queue: String,
  /// Pipeline version to pin. The currently configured version when absent.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub version: Option<String>,
  #[serde(default)]
  pub input: serde_json::Value,
}

impl RunRequest {
  pub fn new(tenant: impl Into<String>, queue: impl Into<String>, input: serde_json::Value) -> Self {
    Self {
      run_id: None,
      tenant: tenant.into(),
      queue: queue.into(),
      version: None,
      input,
    }
  }

  pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
    self.run_id = Some(run_id.into());
    self
  }

  pub fn with_version(mut self, version: impl Into<String>) -> Self {
    self.version = Some(version.into());
    self
  }
}

/// Model usage summed over a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageTotals {
  pub total_tokens: i64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub total_cost: Option<f64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub currency: Option<String>,
}

impl UsageTotals {
  pub fn add(&mut self, metrics: &AiMetrics) {
    self.total_tokens += metrics.total_tokens;
    if let Some(cost) = metrics.cost {
      self.total_cost = Some(self.total_cost.unwrap_or(0.0) + cost);
    }
    if self.currency.is_none() {
      self.currency = metrics.currency.clone();
    }
  }
}

/// Result of a completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutput {
  pub run_id: String,
  pub output: serde_json::Value,
  pub usage: UsageTotals,
}

/// Everything needed to continue a run in another process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
  pub run_id: String,
  /// Pipeline key with the version pinned at start.
  pub key: PipelineKey,
  /// Definition pinned at start. Publishing a new version never reaches a
  /// run already in flight.
  pub pipeline: PipelineDef,
  pub tree: RuntimeExecutionTree,
  pub variables: VariableTable,
  #[serde(default)]
  pub usage: UsageTotals,
  pub started_at: DateTime<Utc>,
}

/// Result of executing one step of an externally driven run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StepOutcome {
  /// One node executed; feed the snapshot to the next step.
  Advanced { node_id: String, snapshot: RunSnapshot },
  /// Nothing was left to execute and the run completed.
  Finished(RunOutput),
}

/// Mutable state of one run. Never shared across runs.
///
/// Guards are taken for short synchronous sections only and never held across
/// an await point.
pub(crate) struct RunState {
  pub run_id: String,
  pub key: PipelineKey,
  pub pipeline: Arc<PipelineDef>,
  pub tenant: Arc<TenantConfig>,
  pub settings: Arc<serde_json::Map<String, serde_json::Value>>,
  /// Nested runs (sub-pipelines) do not count as a root for quota purposes.
  pub nested: bool,
  pub started_at: DateTime<Utc>,
  pub cancel: CancellationToken,
  tree: Mutex<RuntimeExecutionTree>,
  variables: RwLock<VariableTable>,
  usage: Mutex<UsageTotals>,
  /// Nodes whose body is running; they stay NOT_STARTED until it returns.
  in_flight: Mutex<BTreeSet<String>>,
  /// In-flight nodes whose branch was abandoned while they ran.
  abandoned: Mutex<BTreeSet<String>>,
}

pub(crate) struct RunParts {
  pub run_id: String,
  pub key: PipelineKey,
  pub pipeline: Arc<PipelineDef>,
  pub tenant: Arc<TenantConfig>,
  pub nested: bool,
  pub started_at: DateTime<Utc>,
  pub cancel: CancellationToken,
  pub tree: RuntimeExecutionTree,
  pub variables: VariableTable,
  pub usage: UsageTotals,
}

impl RunState {
  pub fn new(parts: RunParts) -> Self {
    Self {
      settings: Arc::new(parts.tenant.settings.clone()),
      run_id: parts.run_id,
      key: parts.key,
      pipeline: parts.pipeline,
      tenant: parts.tenant,
      nested: parts.nested,
      started_at: parts.started_at,
      cancel: parts.cancel,
      tree: Mutex::new(parts.tree),
      variables: RwLock::new(parts.variables),
      usage: Mutex::new(parts.usage),
      in_flight: Mutex::new(BTreeSet::new()),
      abandoned: Mutex::new(BTreeSet::new()),
    }
  }

  /// Run `f` with exclusive access to the tree.
  pub fn with_tree<R>(&self, f: impl FnOnce(&mut RuntimeExecutionTree) -> R) -> R {
    let mut tree = self.tree.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut tree)
  }

  pub fn variables(&self) -> RwLockReadGuard<'_, VariableTable> {
    self.variables.read().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn variables_mut(&self) -> RwLockWriteGuard<'_, VariableTable> {
    self.variables.write().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn add_usage(&self, metrics: &AiMetrics) {
    let mut usage = self.usage.lock().unwrap_or_else(PoisonError::into_inner);
    usage.add(metrics);
  }

  pub fn usage(&self) -> UsageTotals {
    self.usage.lock().unwrap_or_else(PoisonError::into_inner).clone()
  }

  pub fn node_started(&self, node_id: &str) {
    let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
    in_flight.insert(node_id.to_string());
  }

  pub fn in_flight(&self) -> BTreeSet<String> {
    self.in_flight.lock().unwrap_or_else(PoisonError::into_inner).clone()
  }

  /// Mark in-flight nodes whose branch was given up on.
  pub fn abandon_in_flight(&self, node_ids: impl IntoIterator<Item = String>) {
    let mut abandoned = self.abandoned.lock().unwrap_or_else(PoisonError::into_inner);
    abandoned.extend(node_ids);
  }

  /// Take `node_id` out of flight. True when its branch was abandoned meanwhile.
  pub fn node_returned(&self, node_id: &str) -> bool {
    self
      .in_flight
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .remove(node_id);
    self
      .abandoned
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .remove(node_id)
  }

  pub fn root_id(&self) -> String {
    self.with_tree(|tree| tree.root_id().to_string())
  }

  pub fn snapshot(&self) -> RunSnapshot {
    RunSnapshot {
      run_id: self.run_id.clone(),
      key: self.key.clone(),
      pipeline: self.pipeline.as_ref().clone(),
      tree: self.with_tree(|tree| tree.clone()),
      variables: self.variables().clone(),
      usage: self.usage(),
      started_at: self.started_at,
    }
  }
}
