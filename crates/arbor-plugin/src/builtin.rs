//! Capabilities shipped with the binary.

use std::sync::Arc;

use async_trait::async_trait;
use minijinja::Environment;

use crate::capability::{
  Capability, CapabilityError, CapabilityOutput, CapabilityRequest, Parameters, error_codes,
};
use crate::registry::PluginRegistry;

const BUILTIN_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns its input parameters unchanged.
pub struct EchoCapability;

#[async_trait]
impl Capability for EchoCapability {
  async fn execute(&self, request: CapabilityRequest) -> Result<CapabilityOutput, CapabilityError> {
    Ok(CapabilityOutput::new(request.parameters))
  }
}

/// Renders the `template` parameter with minijinja, using the remaining
/// parameters as context. The rendered string is returned as `text`.
pub struct TemplateCapability;

#[async_trait]
impl Capability for TemplateCapability {
  async fn execute(&self, request: CapabilityRequest) -> Result<CapabilityOutput, CapabilityError> {
    let source = request.require_str("template")?;

    let mut context = request.parameters.clone();
    context.remove("template");

    let env = Environment::new();
    let text = env
      .render_str(source, serde_json::Value::Object(context))
      .map_err(|e| {
        CapabilityError::new(error_codes::INVALID_INPUT, format!("template error: {}", e))
          .non_retryable()
      })?;

    let mut values = Parameters::new();
    values.insert("text".to_string(), serde_json::Value::String(text));
    Ok(CapabilityOutput::new(values))
  }
}

/// Register `echo` and `template`.
pub fn register_builtins(registry: &PluginRegistry) {
  registry.register(
    "echo",
    BUILTIN_VERSION,
    Arc::new(|| Arc::new(EchoCapability) as Arc<dyn Capability>),
  );
  registry.register(
    "template",
    BUILTIN_VERSION,
    Arc::new(|| Arc::new(TemplateCapability) as Arc<dyn Capability>),
  );
}
