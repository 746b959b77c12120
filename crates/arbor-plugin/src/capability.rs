//! Capability execution contract.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Named input or output parameters of a capability call.
pub type Parameters = serde_json::Map<String, serde_json::Value>;

/// Well-known [`CapabilityError`] codes.
pub mod error_codes {
  pub const CAPABILITY_FAILED: &str = "CAPABILITY_FAILED";
  pub const TIMEOUT: &str = "TIMEOUT";
  pub const INVALID_INPUT: &str = "INVALID_INPUT";
  pub const INVALID_OUTPUT: &str = "INVALID_OUTPUT";
  pub const PROCESS_FAILED: &str = "PROCESS_FAILED";
  pub const CANCELLED: &str = "CANCELLED";
}

/// One invocation of a capability on behalf of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityRequest {
  pub run_id: String,
  pub node_id: String,
  pub capability_ref: String,
  pub tenant: String,
  pub parameters: Parameters,
}

impl CapabilityRequest {
  pub fn parameter(&self, name: &str) -> Option<&serde_json::Value> {
    self.parameters.get(name)
  }

  /// A string parameter, or an `INVALID_INPUT` error when absent or not a string.
  pub fn require_str(&self, name: &str) -> Result<&str, CapabilityError> {
    self
      .parameters
      .get(name)
      .and_then(|v| v.as_str())
      .ok_or_else(|| {
        CapabilityError::new(
          error_codes::INVALID_INPUT,
          format!("missing string parameter '{}'", name),
        )
      })
  }
}

/// Output parameters of a successful call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityOutput {
  pub values: Parameters,
}

impl CapabilityOutput {
  pub fn new(values: Parameters) -> Self {
    Self { values }
  }

  /// Wrap a JSON value; objects become the parameter map, anything else lands
  /// under `result`.
  pub fn from_value(value: serde_json::Value) -> Self {
    match value {
      serde_json::Value::Object(values) => Self { values },
      other => {
        let mut values = Parameters::new();
        values.insert("result".to_string(), other);
        Self { values }
      }
    }
  }

  pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
    self.values.get(name)
  }

  pub fn into_value(self) -> serde_json::Value {
    serde_json::Value::Object(self.values)
  }
}

/// Typed failure of a capability call.
///
/// Besides the code and message it carries the call duration, whether a retry
/// may help, and arbitrary output keys a failing capability still reported.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct CapabilityError {
  pub code: String,
  pub message: String,
  pub retryable: bool,
  pub duration: Duration,
  pub outputs: Parameters,
}

impl CapabilityError {
  pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
    Self {
      code: code.into(),
      message: message.into(),
      retryable: true,
      duration: Duration::ZERO,
      outputs: Parameters::new(),
    }
  }

  pub fn failed(message: impl Into<String>) -> Self {
    Self::new(error_codes::CAPABILITY_FAILED, message)
  }

  pub fn timeout(after: Duration) -> Self {
    Self {
      retryable: false,
      duration: after,
      ..Self::new(
        error_codes::TIMEOUT,
        format!("timed out after {}ms", after.as_millis()),
      )
    }
  }

  pub fn non_retryable(mut self) -> Self {
    self.retryable = false;
    self
  }

  pub fn with_duration(mut self, duration: Duration) -> Self {
    self.duration = duration;
    self
  }

  pub fn with_outputs(mut self, outputs: Parameters) -> Self {
    self.outputs = outputs;
    self
  }

  /// Always `false`; mirrors the success flag recorded for successful calls.
  pub fn success(&self) -> bool {
    false
  }

  pub fn is_timeout(&self) -> bool {
    self.code == error_codes::TIMEOUT
  }
}

/// An executable capability.
///
/// Instances are created by a [`crate::PluginRegistry`] factory and reused for
/// every invocation of the same node within a run.
#[async_trait]
pub trait Capability: Send + Sync {
  async fn execute(&self, request: CapabilityRequest) -> Result<CapabilityOutput, CapabilityError>;

  /// Release resources held by the instance. Called at most once, when its
  /// run ends or at process exit.
  async fn cleanup(&self) -> Result<(), CapabilityError> {
    Ok(())
  }
}
