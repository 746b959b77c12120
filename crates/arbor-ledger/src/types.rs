use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;

/// Status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum RunStatus {
  Running,
  Completed,
  Failed,
}

/// Status carried by a node event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeEventStatus {
  Running,
  Success,
  Failed,
}

/// Where a failed run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum FailureStage {
  Initializing,
  Quota,
  Node,
  Stall,
  Cancelled,
}

/// Model usage reported by a capability in its `usage` output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiMetrics {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub model: Option<String>,
  pub input_tokens: i64,
  pub output_tokens: i64,
  pub total_tokens: i64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub cost: Option<f64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub currency: Option<String>,
}

impl AiMetrics {
  /// Extract metrics from a capability output with a `usage` object.
  ///
  /// Accepts camelCase and snake_case keys. Returns `None` without `usage`.
  pub fn from_output(output: &serde_json::Value) -> Option<Self> {
    let usage = output.get("usage")?.as_object()?;
    let int = |names: [&str; 2]| {
      names
        .iter()
        .find_map(|n| usage.get(*n).and_then(|v| v.as_i64()))
    };
    let text = |name: &str| {
      usage
        .get(name)
        .or_else(|| output.get(name))
        .and_then(|v| v.as_str())
        .map(str::to_string)
    };

    let input_tokens = int(["inputTokens", "input_tokens"]).unwrap_or(0);
    let output_tokens = int(["outputTokens", "output_tokens"]).unwrap_or(0);
    Some(Self {
      model: text("model"),
      input_tokens,
      output_tokens,
      total_tokens: int(["totalTokens", "total_tokens"]).unwrap_or(input_tokens + output_tokens),
      cost: usage.get("cost").and_then(|v| v.as_f64()),
      currency: text("currency"),
    })
  }
}

/// What a replay of the node needs: attempt number, placement and resolved inputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayMetadata {
  pub attempt: i64,
  pub dynamic: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub parent_id: Option<String>,
  pub input: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureMetadata {
  pub code: String,
  pub message: String,
  pub retryable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStartRecord {
  pub run_id: String,
  pub tenant: String,
  pub queue: String,
  pub pipeline_version: String,
  pub plugin_versions: BTreeMap<String, String>,
  pub input: serde_json::Value,
  pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEndRecord {
  pub run_id: String,
  pub tenant: String,
  pub queue: String,
  pub status: RunStatus,
  pub output: Option<serde_json::Value>,
  pub failure_stage: Option<FailureStage>,
  pub error: Option<String>,
  pub ended_at: DateTime<Utc>,
  pub duration_ms: i64,
  pub total_tokens: i64,
  pub total_cost: Option<f64>,
  pub currency: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStartRecord {
  pub run_id: String,
  pub node_id: String,
  pub node_type: String,
  pub capability_ref: Option<String>,
  pub started_at: DateTime<Utc>,
  pub replay: ReplayMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEndRecord {
  pub run_id: String,
  pub node_id: String,
  pub node_type: String,
  pub capability_ref: Option<String>,
  pub status: NodeEventStatus,
  pub ended_at: DateTime<Utc>,
  pub duration_ms: i64,
  pub output: Option<serde_json::Value>,
  pub ai_metrics: Option<AiMetrics>,
  pub failure: Option<FailureMetadata>,
}

/// A run as stored in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct RunRecord {
  pub run_id: String,
  pub tenant: String,
  pub queue: String,
  pub pipeline_version: Option<String>,
  pub plugin_versions: Json<BTreeMap<String, String>>,
  pub input: Json<serde_json::Value>,
  pub status: RunStatus,
  pub output: Option<Json<serde_json::Value>>,
  pub failure_stage: Option<FailureStage>,
  pub error: Option<String>,
  pub started_at: DateTime<Utc>,
  pub ended_at: Option<DateTime<Utc>>,
  pub duration_ms: Option<i64>,
  pub total_tokens: i64,
  pub total_cost: Option<f64>,
  pub currency: Option<String>,
}

/// One node lifecycle event as stored in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct NodeEvent {
  pub run_id: String,
  pub node_id: String,
  pub node_type: String,
  pub capability_ref: Option<String>,
  pub status: NodeEventStatus,
  pub recorded_at: DateTime<Utc>,
  pub duration_ms: Option<i64>,
  pub output: Option<Json<serde_json::Value>>,
  pub ai_metrics: Option<Json<AiMetrics>>,
  pub replay: Option<Json<ReplayMetadata>>,
  pub failure: Option<Json<FailureMetadata>>,
}

impl From<&NodeStartRecord> for NodeEvent {
  fn from(record: &NodeStartRecord) -> Self {
    Self {
      run_id: record.run_id.clone(),
      node_id: record.node_id.clone(),
      node_type: record.node_type.clone(),
      capability_ref: record.capability_ref.clone(),
      status: NodeEventStatus::Running,
      recorded_at: record.started_at,
      duration_ms: None,
      output: None,
      ai_metrics: None,
      replay: Some(Json(record.replay.clone())),
      failure: None,
    }
  }
}

impl From<&NodeEndRecord> for NodeEvent {
  fn from(record: &NodeEndRecord) -> Self {
    Self {
      run_id: record.run_id.clone(),
      node_id: record.node_id.clone(),
      node_type: record.node_type.clone(),
      capability_ref: record.capability_ref.clone(),
      status: record.status,
      recorded_at: record.ended_at,
      duration_ms: Some(record.duration_ms),
      output: record.output.clone().map(Json),
      ai_metrics: record.ai_metrics.clone().map(Json),
      replay: None,
      failure: record.failure.clone().map(Json),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_ai_metrics_from_usage() {
    let metrics = AiMetrics::from_output(&json!({
      "responseText": "hello",
      "model": "small-1",
      "usage": { "input_tokens": 12, "output_tokens": 30, "cost": 0.002, "currency": "USD" }
    }))
    .unwrap();

    assert_eq!(metrics.model.as_deref(), Some("small-1"));
    assert_eq!(metrics.total_tokens, 42);
    assert_eq!(metrics.cost, Some(0.002));
    assert_eq!(metrics.currency.as_deref(), Some("USD"));
  }

  #[test]
  fn test_ai_metrics_absent_without_usage() {
    assert!(AiMetrics::from_output(&json!({ "responseText": "hello" })).is_none());
    assert!(AiMetrics::from_output(&json!("text")).is_none());
  }
}
