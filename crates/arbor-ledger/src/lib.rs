//! Arbor Ledger
//!
//! This crate provides the audit ledger for pipeline runs. Every run writes a
//! run record when it starts and when it ends, and every executed node appends
//! a `RUNNING` event when it starts and a terminal event when it ends.
//!
//! The [`Ledger`] trait defines operations for:
//! - Idempotent schema creation, safe at every process start
//! - Run start/end records with plugin versions, input, output and failure stage
//! - Per-node events with AI metrics, replay metadata and failure metadata
//! - Reading a run and its node events back

mod memory;
mod sqlite;
mod types;

pub use memory::MemoryLedger;
pub use sqlite::SqliteLedger;
pub use types::{
  AiMetrics, FailureMetadata, FailureStage, NodeEndRecord, NodeEvent, NodeEventStatus,
  NodeStartRecord, ReplayMetadata, RunEndRecord, RunRecord, RunStartRecord, RunStatus,
};

use async_trait::async_trait;

/// Error type for ledger operations.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
  /// The requested record was not found.
  #[error("not found: {0}")]
  NotFound(String),

  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),
}

/// Durable, append/update audit store for run and node lifecycle events.
#[async_trait]
pub trait Ledger: Send + Sync {
  /// Create tables if they do not exist.
  async fn ensure_schema(&self) -> Result<(), LedgerError>;

  async fn run_started(&self, record: &RunStartRecord) -> Result<(), LedgerError>;

  /// Close a run. Creates the run record if the run never got as far as
  /// `run_started` (initialization failures).
  async fn run_ended(&self, record: &RunEndRecord) -> Result<(), LedgerError>;

  async fn node_started(&self, record: &NodeStartRecord) -> Result<(), LedgerError>;

  async fn node_ended(&self, record: &NodeEndRecord) -> Result<(), LedgerError>;

  async fn get_run(&self, run_id: &str) -> Result<RunRecord, LedgerError>;

  /// Node events of a run in the order they were recorded.
  async fn node_events(&self, run_id: &str) -> Result<Vec<NodeEvent>, LedgerError>;
}
