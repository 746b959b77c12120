//! Shared fixtures for orchestrator integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arbor_config::{NodeDef, PipelineDef, StructuralType, TenantConfig, VariableDef, VariableScope};
use arbor_features::HookRegistry;
use arbor_ledger::{Ledger, MemoryLedger, NodeEventStatus, RunRecord};
use arbor_orchestrator::{Orchestrator, OrchestratorError, RunOutput, RunRequest};
use arbor_plugin::{
  Capability, CapabilityError, CapabilityOutput, CapabilityRequest, Parameters, PluginRegistry,
  register_builtins,
};
use arbor_resolver::{LayeredResolver, MemoryPipelineSource, MemoryTenantSource, TenantResolver};
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

pub const TENANT: &str = "acme";

/// Orchestrator wired to in-memory pipelines, tenants and ledger.
pub struct Harness {
  pub orchestrator: Orchestrator,
  pub ledger: Arc<MemoryLedger>,
  pub pipelines: Arc<MemoryPipelineSource>,
  pub plugins: Arc<PluginRegistry>,
}

impl Harness {
  pub fn new() -> Self {
    Self::with(TenantConfig::new(TENANT), Arc::new(HookRegistry::with_builtins()))
  }

  pub fn with(tenant: TenantConfig, hooks: Arc<HookRegistry>) -> Self {
    let ledger = Arc::new(MemoryLedger::new());
    let pipelines = Arc::new(MemoryPipelineSource::new("memory"));
    let plugins = Arc::new(PluginRegistry::new());
    register_builtins(&plugins);

    let orchestrator = Orchestrator::new(
      plugins.clone(),
      hooks,
      ledger.clone(),
      Arc::new(LayeredResolver::new(vec![pipelines.clone()])),
      Arc::new(TenantResolver::new(Arc::new(MemoryTenantSource::new([tenant])))),
    );

    Self {
      orchestrator,
      ledger,
      pipelines,
      plugins,
    }
  }

  pub fn pipeline(&self, queue: &str, pipeline: PipelineDef) {
    self.pipelines.insert(TENANT, queue, pipeline);
  }

  pub fn capability(&self, capability_ref: &str, capability: Arc<dyn Capability>) {
    self.plugins.register_instance(capability_ref, "1.0.0", capability);
  }

  pub async fn run(&self, run_id: &str, queue: &str, input: Value) -> Result<RunOutput, OrchestratorError> {
    self
      .orchestrator
      .run(
        RunRequest::new(TENANT, queue, input).with_run_id(run_id),
        CancellationToken::new(),
      )
      .await
  }

  /// `(node_id, status)` of every node event of a run, in order.
  pub async fn events(&self, run_id: &str) -> Vec<(String, NodeEventStatus)> {
    self
      .ledger
      .node_events(run_id)
      .await
      .unwrap()
      .into_iter()
      .map(|e| (e.node_id, e.status))
      .collect()
  }

  /// Ids of nodes that got a SUCCESS event, in order.
  pub async fn succeeded(&self, run_id: &str) -> Vec<String> {
    self
      .events(run_id)
      .await
      .into_iter()
      .filter(|(_, status)| *status == NodeEventStatus::Success)
      .map(|(id, _)| id)
      .collect()
  }

  pub async fn run_record(&self, run_id: &str) -> RunRecord {
    self.ledger.get_run(run_id).await.unwrap()
  }
}

pub fn seq(id: &str, children: Vec<NodeDef>) -> NodeDef {
  NodeDef::new(id, StructuralType::Sequence).with_children(children)
}

pub fn node(id: &str, node_type: StructuralType, children: Vec<NodeDef>) -> NodeDef {
  NodeDef::new(id, node_type).with_children(children)
}

pub fn pipeline(tree: NodeDef, variables: Vec<VariableDef>) -> PipelineDef {
  let mut pipeline = PipelineDef::new("test", "1", tree);
  pipeline.variables = variables;
  pipeline
}

pub fn var(name: &str, scope: VariableScope) -> VariableDef {
  VariableDef::new(name, scope)
}

pub fn node_code(error: &OrchestratorError) -> Option<&str> {
  match error {
    OrchestratorError::NodeExecution(e) => Some(e.code.as_str()),
    _ => None,
  }
}

/// Returns a fixed output and remembers the parameters of every call.
pub struct Fixed {
  output: Value,
  calls: Mutex<Vec<Parameters>>,
}

impl Fixed {
  pub fn new(output: Value) -> Arc<Self> {
    Arc::new(Self {
      output,
      calls: Mutex::new(Vec::new()),
    })
  }

  pub fn calls(&self) -> Vec<Parameters> {
    self.calls.lock().unwrap().clone()
  }
}

#[async_trait]
impl Capability for Fixed {
  async fn execute(&self, request: CapabilityRequest) -> Result<CapabilityOutput, CapabilityError> {
    self.calls.lock().unwrap().push(request.parameters);
    Ok(CapabilityOutput::from_value(self.output.clone()))
  }
}

/// Fails with a retryable error until `failures` calls have failed.
pub struct Flaky {
  failures: u32,
  calls: AtomicU32,
}

impl Flaky {
  pub fn new(failures: u32) -> Arc<Self> {
    Arc::new(Self {
      failures,
      calls: AtomicU32::new(0),
    })
  }

  pub fn calls(&self) -> u32 {
    self.calls.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl Capability for Flaky {
  async fn execute(&self, _request: CapabilityRequest) -> Result<CapabilityOutput, CapabilityError> {
    let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
    if call <= self.failures {
      return Err(CapabilityError::failed(format!("flaky failure {}", call)));
    }
    Ok(CapabilityOutput::from_value(serde_json::json!({ "attempts": call })))
  }
}

/// Always fails with `code`.
pub struct Broken {
  code: &'static str,
}

impl Broken {
  pub fn new(code: &'static str) -> Arc<Self> {
    Arc::new(Self { code })
  }
}

#[async_trait]
impl Capability for Broken {
  async fn execute(&self, _request: CapabilityRequest) -> Result<CapabilityOutput, CapabilityError> {
    Err(CapabilityError::new(self.code, "it broke").non_retryable())
  }
}

/// Sleeps before echoing its parameters.
pub struct Slow {
  delay: Duration,
}

impl Slow {
  pub fn new(delay: Duration) -> Arc<Self> {
    Arc::new(Self { delay })
  }
}

#[async_trait]
impl Capability for Slow {
  async fn execute(&self, request: CapabilityRequest) -> Result<CapabilityOutput, CapabilityError> {
    tokio::time::sleep(self.delay).await;
    Ok(CapabilityOutput::new(request.parameters))
  }
}
