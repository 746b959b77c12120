use async_trait::async_trait;
use sqlx::SqlitePool;
use sqlx::types::Json;

use crate::{
  Ledger, LedgerError, NodeEndRecord, NodeEvent, NodeStartRecord, RunEndRecord, RunRecord,
  RunStartRecord, RunStatus,
};

const SCHEMA: &[&str] = &[
  r#"
  CREATE TABLE IF NOT EXISTS ledger_runs (
    run_id TEXT PRIMARY KEY NOT NULL,
    tenant TEXT NOT NULL,
    queue TEXT NOT NULL,
    pipeline_version TEXT,
    plugin_versions TEXT NOT NULL DEFAULT '{}',
    input TEXT NOT NULL DEFAULT 'null',
    status TEXT NOT NULL,
    output TEXT,
    failure_stage TEXT,
    error TEXT,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    duration_ms INTEGER,
    total_tokens INTEGER NOT NULL DEFAULT 0,
    total_cost REAL,
    currency TEXT
  )
  "#,
  r#"
  CREATE TABLE IF NOT EXISTS ledger_node_events (
    event_id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    node_id TEXT NOT NULL,
    node_type TEXT NOT NULL,
    capability_ref TEXT,
    status TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    duration_ms INTEGER,
    output TEXT,
    ai_metrics TEXT,
    replay TEXT,
    failure TEXT
  )
  "#,
  r#"
  CREATE INDEX IF NOT EXISTS idx_ledger_node_events_run ON ledger_node_events (run_id)
  "#,
];

/// SQLite-based ledger implementation.
pub struct SqliteLedger {
  pool: SqlitePool,
}

impl SqliteLedger {
  /// Create a new SQLite ledger with the given connection pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Connect to `url` (e.g. `sqlite://ledger.db?mode=rwc`) and create the schema.
  pub async fn connect(url: &str) -> Result<Self, LedgerError> {
    let pool = SqlitePool::connect(url).await?;
    let ledger = Self::new(pool);
    ledger.ensure_schema().await?;
    Ok(ledger)
  }

  async fn insert_event(&self, event: &NodeEvent) -> Result<(), LedgerError> {
    sqlx::query(
      r#"
      INSERT INTO ledger_node_events
        (run_id, node_id, node_type, capability_ref, status, recorded_at, duration_ms, output, ai_metrics, replay, failure)
      VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
      "#,
    )
    .bind(&event.run_id)
    .bind(&event.node_id)
    .bind(&event.node_type)
    .bind(&event.capability_ref)
    .bind(event.status)
    .bind(event.recorded_at)
    .bind(event.duration_ms)
    .bind(&event.output)
    .bind(&event.ai_metrics)
    .bind(&event.replay)
    .bind(&event.failure)
    .execute(&self.pool)
    .await?;

    Ok(())
  }
}

#[async_trait]
impl Ledger for SqliteLedger {
  async fn ensure_schema(&self) -> Result<(), LedgerError> {
    for statement in SCHEMA {
      sqlx::query(*statement).execute(&self.pool).await?;
    }
    Ok(())
  }

  async fn run_started(&self, record: &RunStartRecord) -> Result<(), LedgerError> {
    sqlx::query(
      r#"
      INSERT INTO ledger_runs
        (run_id, tenant, queue, pipeline_version, plugin_versions, input, status, started_at)
      VALUES (?, ?, ?, ?, ?, ?, ?, ?)
      "#,
    )
    .bind(&record.run_id)
    .bind(&record.tenant)
    .bind(&record.queue)
    .bind(&record.pipeline_version)
    .bind(Json(&record.plugin_versions))
    .bind(Json(&record.input))
    .bind(RunStatus::Running)
    .bind(record.started_at)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn run_ended(&self, record: &RunEndRecord) -> Result<(), LedgerError> {
    sqlx::query(
      r#"
      INSERT INTO ledger_runs
        (run_id, tenant, queue, status, output, failure_stage, error, started_at, ended_at,
         duration_ms, total_tokens, total_cost, currency)
      VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
      ON CONFLICT (run_id) DO UPDATE SET
        status = excluded.status,
        output = excluded.output,
        failure_stage = excluded.failure_stage,
        error = excluded.error,
        ended_at = excluded.ended_at,
        duration_ms = excluded.duration_ms,
        total_tokens = excluded.total_tokens,
        total_cost = excluded.total_cost,
        currency = excluded.currency
      "#,
    )
    .bind(&record.run_id)
    .bind(&record.tenant)
    .bind(&record.queue)
    .bind(record.status)
    .bind(record.output.as_ref().map(Json))
    .bind(record.failure_stage)
    .bind(&record.error)
    .bind(record.ended_at)
    .bind(record.ended_at)
    .bind(record.duration_ms)
    .bind(record.total_tokens)
    .bind(record.total_cost)
    .bind(&record.currency)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn node_started(&self, record: &NodeStartRecord) -> Result<(), LedgerError> {
    self.insert_event(&NodeEvent::from(record)).await
  }

  async fn node_ended(&self, record: &NodeEndRecord) -> Result<(), LedgerError> {
    self.insert_event(&NodeEvent::from(record)).await
  }

  async fn get_run(&self, run_id: &str) -> Result<RunRecord, LedgerError> {
    sqlx::query_as(
      r#"
      SELECT run_id, tenant, queue, pipeline_version, plugin_versions, input, status, output,
             failure_stage, error, started_at, ended_at, duration_ms, total_tokens, total_cost, currency
      FROM ledger_runs
      WHERE run_id = ?
      "#,
    )
    .bind(run_id)
    .fetch_optional(&self.pool)
    .await?
    .ok_or_else(|| LedgerError::NotFound(run_id.to_string()))
  }

  async fn node_events(&self, run_id: &str) -> Result<Vec<NodeEvent>, LedgerError> {
    let events = sqlx::query_as(
      r#"
      SELECT run_id, node_id, node_type, capability_ref, status, recorded_at, duration_ms,
             output, ai_metrics, replay, failure
      FROM ledger_node_events
      WHERE run_id = ?
      ORDER BY event_id ASC
      "#,
    )
    .bind(run_id)
    .fetch_all(&self.pool)
    .await?;

    Ok(events)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{AiMetrics, FailureStage, NodeEventStatus, ReplayMetadata};
  use chrono::Utc;
  use serde_json::json;
  use sqlx::sqlite::SqlitePoolOptions;
  use std::collections::BTreeMap;

  async fn ledger() -> SqliteLedger {
    let pool = SqlitePoolOptions::new()
      .max_connections(1)
      .connect("sqlite::memory:")
      .await
      .unwrap();
    let ledger = SqliteLedger::new(pool);
    ledger.ensure_schema().await.unwrap();
    ledger
  }

  #[tokio::test]
  async fn test_ensure_schema_is_idempotent() {
    let ledger = ledger().await;
    ledger.ensure_schema().await.unwrap();
    ledger.ensure_schema().await.unwrap();
  }

  #[tokio::test]
  async fn test_run_and_node_round_trip() {
    let ledger = ledger().await;
    let started_at = Utc::now();

    ledger
      .run_started(&RunStartRecord {
        run_id: "run-1".to_string(),
        tenant: "acme".to_string(),
        queue: "qa".to_string(),
        pipeline_version: "3".to_string(),
        plugin_versions: BTreeMap::from([("llm/chat".to_string(), "1.2.0".to_string())]),
        input: json!({ "userQuery": "hi" }),
        started_at,
      })
      .await
      .unwrap();

    ledger
      .node_started(&NodeStartRecord {
        run_id: "run-1".to_string(),
        node_id: "ask".to_string(),
        node_type: "PLUGIN".to_string(),
        capability_ref: Some("llm/chat".to_string()),
        started_at,
        replay: ReplayMetadata {
          attempt: 1,
          dynamic: false,
          parent_id: Some("root".to_string()),
          input: json!({ "prompt": "hi" }),
        },
      })
      .await
      .unwrap();

    let metrics = AiMetrics {
      input_tokens: 3,
      output_tokens: 4,
      total_tokens: 7,
      ..AiMetrics::default()
    };
    ledger
      .node_ended(&NodeEndRecord {
        run_id: "run-1".to_string(),
        node_id: "ask".to_string(),
        node_type: "PLUGIN".to_string(),
        capability_ref: Some("llm/chat".to_string()),
        status: NodeEventStatus::Success,
        ended_at: Utc::now(),
        duration_ms: 12,
        output: Some(json!({ "responseText": "hello" })),
        ai_metrics: Some(metrics.clone()),
        failure: None,
      })
      .await
      .unwrap();

    ledger
      .run_ended(&RunEndRecord {
        run_id: "run-1".to_string(),
        tenant: "acme".to_string(),
        queue: "qa".to_string(),
        status: RunStatus::Completed,
        output: Some(json!({ "answer": "hello" })),
        failure_stage: None,
        error: None,
        ended_at: Utc::now(),
        duration_ms: 15,
        total_tokens: 7,
        total_cost: None,
        currency: None,
      })
      .await
      .unwrap();

    let run = ledger.get_run("run-1").await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.pipeline_version.as_deref(), Some("3"));
    assert_eq!(run.plugin_versions.0["llm/chat"], "1.2.0");
    assert_eq!(run.input.0, json!({ "userQuery": "hi" }));
    assert_eq!(run.output.unwrap().0, json!({ "answer": "hello" }));
    assert_eq!(run.total_tokens, 7);

    let events = ledger.node_events("run-1").await.unwrap();
    let statuses: Vec<NodeEventStatus> = events.iter().map(|e| e.status).collect();
    assert_eq!(statuses, vec![NodeEventStatus::Running, NodeEventStatus::Success]);
    assert_eq!(events[0].replay.as_ref().unwrap().0.attempt, 1);
    assert_eq!(events[1].ai_metrics.as_ref().unwrap().0, metrics);
  }

  #[tokio::test]
  async fn test_run_ended_without_start_records_failure() {
    let ledger = ledger().await;
    ledger
      .run_ended(&RunEndRecord {
        run_id: "run-2".to_string(),
        tenant: "ghost".to_string(),
        queue: "qa".to_string(),
        status: RunStatus::Failed,
        output: None,
        failure_stage: Some(FailureStage::Initializing),
        error: Some("tenant not configured: ghost".to_string()),
        ended_at: Utc::now(),
        duration_ms: 0,
        total_tokens: 0,
        total_cost: None,
        currency: None,
      })
      .await
      .unwrap();

    let run = ledger.get_run("run-2").await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.failure_stage, Some(FailureStage::Initializing));
    assert!(run.pipeline_version.is_none());
  }

  #[tokio::test]
  async fn test_get_missing_run() {
    let ledger = ledger().await;
    assert!(matches!(
      ledger.get_run("nope").await,
      Err(LedgerError::NotFound(_))
    ));
  }
}
