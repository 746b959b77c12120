use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use sqlx::types::Json;

use crate::{
  Ledger, LedgerError, NodeEndRecord, NodeEvent, NodeStartRecord, RunEndRecord, RunRecord,
  RunStartRecord, RunStatus,
};

#[derive(Default)]
struct Inner {
  runs: HashMap<String, RunRecord>,
  events: Vec<NodeEvent>,
}

/// Process-local ledger for tests and dry runs.
#[derive(Default)]
pub struct MemoryLedger {
  inner: Mutex<Inner>,
}

impl MemoryLedger {
  pub fn new() -> Self {
    Self::default()
  }

  /// Every node event recorded so far, across runs.
  pub fn all_events(&self) -> Vec<NodeEvent> {
    let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
    inner.events.clone()
  }
}

#[async_trait]
impl Ledger for MemoryLedger {
  async fn ensure_schema(&self) -> Result<(), LedgerError> {
    Ok(())
  }

  async fn run_started(&self, record: &RunStartRecord) -> Result<(), LedgerError> {
    let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
    inner.runs.insert(
      record.run_id.clone(),
      RunRecord {
        run_id: record.run_id.clone(),
        tenant: record.tenant.clone(),
        queue: record.queue.clone(),
        pipeline_version: Some(record.pipeline_version.clone()),
        plugin_versions: Json(record.plugin_versions.clone()),
        input: Json(record.input.clone()),
        status: RunStatus::Running,
        output: None,
        failure_stage: None,
        error: None,
        started_at: record.started_at,
        ended_at: None,
        duration_ms: None,
        total_tokens: 0,
        total_cost: None,
        currency: None,
      },
    );
    Ok(())
  }

  async fn run_ended(&self, record: &RunEndRecord) -> Result<(), LedgerError> {
    let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
    let run = inner
      .runs
      .entry(record.run_id.clone())
      .or_insert_with(|| RunRecord {
        run_id: record.run_id.clone(),
        tenant: record.tenant.clone(),
        queue: record.queue.clone(),
        pipeline_version: None,
        plugin_versions: Json(Default::default()),
        input: Json(serde_json::Value::Null),
        status: RunStatus::Running,
        output: None,
        failure_stage: None,
        error: None,
        started_at: record.ended_at,
        ended_at: None,
        duration_ms: None,
        total_tokens: 0,
        total_cost: None,
        currency: None,
      });
    run.status = record.status;
    run.output = record.output.clone().map(Json);
    run.failure_stage = record.failure_stage;
    run.error = record.error.clone();
    run.ended_at = Some(record.ended_at);
    run.duration_ms = Some(record.duration_ms);
    run.total_tokens = record.total_tokens;
    run.total_cost = record.total_cost;
    run.currency = record.currency.clone();
    Ok(())
  }

  async fn node_started(&self, record: &NodeStartRecord) -> Result<(), LedgerError> {
    let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
    inner.events.push(NodeEvent::from(record));
    Ok(())
  }

  async fn node_ended(&self, record: &NodeEndRecord) -> Result<(), LedgerError> {
    let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
    inner.events.push(NodeEvent::from(record));
    Ok(())
  }

  async fn get_run(&self, run_id: &str) -> Result<RunRecord, LedgerError> {
    let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
    inner
      .runs
      .get(run_id)
      .cloned()
      .ok_or_else(|| LedgerError::NotFound(run_id.to_string()))
  }

  async fn node_events(&self, run_id: &str) -> Result<Vec<NodeEvent>, LedgerError> {
    let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
    Ok(
      inner
        .events
        .iter()
        .filter(|e| e.run_id == run_id)
        .cloned()
        .collect(),
    )
  }
}
