use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::node::NodeDef;

/// Global default node timeout when neither node, ancestors nor pipeline set one.
pub const DEFAULT_TIMEOUT_MS: u64 = 300_000;

/// How the orchestrator schedules a pipeline's nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionType {
  /// One node at a time, depth-first with parent gating.
  #[default]
  Sequential,
  /// Driven by the compiled plan; FORK branches run concurrently.
  Parallel,
}

/// Retry settings applied around a single node invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
  /// Total attempts, including the first one.
  pub max_attempts: u32,
  pub initial_backoff_ms: u64,
  pub backoff_multiplier: f64,
  pub max_backoff_ms: u64,
  /// Error codes that are never retried.
  pub non_retryable: Vec<String>,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 1,
      initial_backoff_ms: 200,
      backoff_multiplier: 2.0,
      max_backoff_ms: 10_000,
      non_retryable: Vec::new(),
    }
  }
}

impl RetryPolicy {
  /// Backoff before attempt `attempt` (1-based; the first retry is attempt 2).
  pub fn backoff(&self, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(2) as i32;
    let millis = self.initial_backoff_ms as f64 * self.backoff_multiplier.max(1.0).powi(exponent);
    Duration::from_millis((millis as u64).min(self.max_backoff_ms))
  }

  pub fn is_retryable(&self, code: &str) -> bool {
    !self.non_retryable.iter().any(|c| c == code)
  }
}

/// Pipeline-wide execution defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionDefaults {
  pub execution_type: ExecutionType,
  pub timeout_ms: u64,
  pub retry: RetryPolicy,
}

impl Default for ExecutionDefaults {
  fn default() -> Self {
    Self {
      execution_type: ExecutionType::Sequential,
      timeout_ms: DEFAULT_TIMEOUT_MS,
      retry: RetryPolicy::default(),
    }
  }
}

/// Capabilities and features a pipeline may use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineScope {
  /// Allowed capability references. Empty means unrestricted.
  pub capabilities: Vec<String>,
  /// Feature hooks applied to every node of the pipeline.
  pub features: Vec<String>,
}

impl PipelineScope {
  pub fn allows_capability(&self, capability_ref: &str) -> bool {
    self.capabilities.is_empty() || self.capabilities.iter().any(|c| c == capability_ref)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VariableScope {
  In,
  Internal,
  Out,
}

/// One entry of the variable registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableDef {
  pub name: String,
  pub scope: VariableScope,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub default: Option<serde_json::Value>,
  #[serde(default)]
  pub required: bool,
}

impl VariableDef {
  pub fn new(name: impl Into<String>, scope: VariableScope) -> Self {
    Self {
      name: name.into(),
      scope,
      default: None,
      required: false,
    }
  }
}

/// Projects a variable into the run output under `output_parameter`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMapping {
  pub variable: String,
  pub output_parameter: String,
}

impl ResultMapping {
  pub fn new(variable: impl Into<String>, output_parameter: impl Into<String>) -> Self {
    Self {
      variable: variable.into(),
      output_parameter: output_parameter.into(),
    }
  }
}

/// A complete pipeline definition for one `(tenant, queue)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineDef {
  pub name: String,
  pub version: String,
  #[serde(default)]
  pub execution: ExecutionDefaults,
  #[serde(default)]
  pub scope: PipelineScope,
  #[serde(default)]
  pub variables: Vec<VariableDef>,
  pub tree: NodeDef,
  #[serde(default)]
  pub result_mapping: Vec<ResultMapping>,
}

impl PipelineDef {
  pub fn new(name: impl Into<String>, version: impl Into<String>, tree: NodeDef) -> Self {
    Self {
      name: name.into(),
      version: version.into(),
      execution: ExecutionDefaults::default(),
      scope: PipelineScope::default(),
      variables: Vec::new(),
      tree,
      result_mapping: Vec::new(),
    }
  }

  pub fn variable(&self, name: &str) -> Option<&VariableDef> {
    self.variables.iter().find(|v| v.name == name)
  }

  /// Capability references used by the static tree, sorted and deduplicated.
  pub fn capability_refs(&self) -> Vec<String> {
    let mut refs = Vec::new();
    self.tree.walk(&mut |node| {
      if let Some(plugin_ref) = &node.plugin_ref {
        refs.push(plugin_ref.clone());
      }
    });
    refs.sort();
    refs.dedup();
    refs
  }
}
