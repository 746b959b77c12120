//! Run lifecycle: initialization, driving, conclusion and step mode.

use std::sync::Arc;

use arbor_config::{ExecutionType, NodeDef, TenantConfig};
use arbor_features::{FeatureHookResolver, HookRegistry};
use arbor_ledger::{AiMetrics, Ledger, RunEndRecord, RunStartRecord, RunStatus};
use arbor_plugin::{InstanceCache, Parameters, PluginRegistry};
use arbor_resolver::{ConfigurationError, LayeredResolver, PipelineKey, TenantResolver};
use arbor_workflow::RuntimeExecutionTree;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::error::{NodeError, OrchestratorError, codes};
use crate::expansion::ExpansionParsers;
use crate::run::{RunOutput, RunParts, RunRequest, RunSnapshot, RunState, StepOutcome, UsageTotals};
use crate::signal::SignalHub;
use crate::variables::VariableTable;

/// Executes pipelines for many tenants.
///
/// Holds only shared services; every run gets its own [`RunState`], so one
/// orchestrator can drive any number of runs at once.
pub struct Orchestrator {
  pub(crate) plugins: Arc<PluginRegistry>,
  pub(crate) instances: InstanceCache,
  pub(crate) hooks: FeatureHookResolver,
  pub(crate) ledger: Arc<dyn Ledger>,
  pub(crate) pipelines: Arc<LayeredResolver>,
  pub(crate) tenants: Arc<TenantResolver>,
  pub(crate) parsers: ExpansionParsers,
  pub(crate) signals: Arc<SignalHub>,
}

impl Orchestrator {
  pub fn new(
    plugins: Arc<PluginRegistry>,
    hooks: Arc<HookRegistry>,
    ledger: Arc<dyn Ledger>,
    pipelines: Arc<LayeredResolver>,
    tenants: Arc<TenantResolver>,
  ) -> Self {
    Self {
      plugins,
      instances: InstanceCache::new(),
      hooks: FeatureHookResolver::new(hooks),
      ledger,
      pipelines,
      tenants,
      parsers: ExpansionParsers::new(),
      signals: Arc::new(SignalHub::new()),
    }
  }

  pub fn with_parsers(mut self, parsers: ExpansionParsers) -> Self {
    self.parsers = parsers;
    self
  }

  pub fn with_signals(mut self, signals: Arc<SignalHub>) -> Self {
    self.signals = signals;
    self
  }

  pub fn signals(&self) -> &Arc<SignalHub> {
    &self.signals
  }

  /// Capability instances of runs still in flight, for cleanup at exit.
  pub fn instances(&self) -> &InstanceCache {
    &self.instances
  }

  pub fn hook_registry(&self) -> &Arc<HookRegistry> {
    self.hooks.registry()
  }

  /// Run a pipeline to completion in this process.
  ///
  /// A `run_ended` ledger record is written whatever the outcome, including
  /// failures during initialization.
  #[instrument(
    name = "run",
    skip(self, request, cancel),
    fields(tenant = %request.tenant, queue = %request.queue)
  )]
  pub async fn run(
    &self,
    request: RunRequest,
    cancel: CancellationToken,
  ) -> Result<RunOutput, OrchestratorError> {
    let run_id = request
      .run_id
      .clone()
      .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let started_at = Utc::now();

    let run = match self.initialize(run_id.clone(), &request, cancel).await {
      Ok(run) => run,
      Err(e) => {
        self
          .record_failure(&run_id, &request.tenant, &request.queue, started_at, UsageTotals::default(), &e)
          .await;
        return Err(e);
      }
    };

    let result = self.drive(&run).await;
    self.conclude(&run, result).await
  }

  /// Initialize a run for external, one-node-at-a-time driving.
  #[instrument(
    name = "run_start",
    skip(self, request),
    fields(tenant = %request.tenant, queue = %request.queue)
  )]
  pub async fn start(&self, request: RunRequest) -> Result<RunSnapshot, OrchestratorError> {
    let run_id = request
      .run_id
      .clone()
      .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let started_at = Utc::now();

    match self
      .initialize(run_id.clone(), &request, CancellationToken::new())
      .await
    {
      Ok(run) => Ok(run.snapshot()),
      Err(e) => {
        self
          .record_failure(&run_id, &request.tenant, &request.queue, started_at, UsageTotals::default(), &e)
          .await;
        Err(e)
      }
    }
  }

  /// Execute exactly one node of a snapshotted run.
  ///
  /// The snapshot carries the pinned pipeline definition, so the step does
  /// not depend on what the config chain serves now. Runs the same primitive the in-process walk loops over, so stepping a
  /// run until it finishes reproduces [`Orchestrator::run`] for sequential
  /// pipelines.
  #[instrument(name = "run_step", skip(self, snapshot), fields(run_id = %snapshot.run_id))]
  pub async fn step(&self, snapshot: RunSnapshot) -> Result<StepOutcome, OrchestratorError> {
    let run = self.restore(snapshot).await?;
    let root = run.root_id();
    match self.advance(&run, &root).await {
      Ok(Some(node_id)) => Ok(StepOutcome::Advanced {
        node_id,
        snapshot: run.snapshot(),
      }),
      Ok(None) => self.conclude(&run, Ok(())).await.map(StepOutcome::Finished),
      Err(e) => self.conclude(&run, Err(e)).await.map(StepOutcome::Finished),
    }
  }

  /// Close a snapshotted run: COMPLETED when the tree is complete, otherwise a stall.
  pub async fn finish(&self, snapshot: RunSnapshot) -> Result<RunOutput, OrchestratorError> {
    let run = self.restore(snapshot).await?;
    self.conclude(&run, Ok(())).await
  }

  async fn initialize(
    &self,
    run_id: String,
    request: &RunRequest,
    cancel: CancellationToken,
  ) -> Result<RunState, OrchestratorError> {
    let tenant = self.tenants.resolve(&request.tenant, &request.queue).await?;
    self
      .open_run(run_id, Arc::new(tenant), request, cancel, false)
      .await
  }

  /// Resolve and pin the pipeline, seed variables, build the tree and open the ledger record.
  async fn open_run(
    &self,
    run_id: String,
    tenant: Arc<TenantConfig>,
    request: &RunRequest,
    cancel: CancellationToken,
    nested: bool,
  ) -> Result<RunState, OrchestratorError> {
    let started_at = Utc::now();
    let key = PipelineKey {
      tenant: tenant.tenant.clone(),
      queue: request.queue.clone(),
      version: request.version.clone(),
    };
    let pipeline = self.pipelines.resolve(&key).await?;
    let key = key.with_version(pipeline.version.clone());

    let variables = VariableTable::seed(&pipeline.variables, &request.input)?;
    let tree = RuntimeExecutionTree::build(&pipeline.tree)?;

    let capability_refs = pipeline.capability_refs();
    self
      .ledger
      .run_started(&RunStartRecord {
        run_id: run_id.clone(),
        tenant: key.tenant.clone(),
        queue: key.queue.clone(),
        pipeline_version: pipeline.version.clone(),
        plugin_versions: self.plugins.versions_of(capability_refs.iter()),
        input: request.input.clone(),
        started_at,
      })
      .await?;

    info!(run_id = %run_id, key = %key, nodes = tree.len(), "run_started");

    Ok(RunState::new(RunParts {
      run_id,
      key,
      pipeline: Arc::new(pipeline),
      tenant,
      nested,
      started_at,
      cancel,
      tree,
      variables,
      usage: UsageTotals::default(),
    }))
  }

  /// Rebuild run state from a snapshot.
  ///
  /// The run keeps the definition it was started with; only the tenant is
  /// resolved again, so a revoked tenant or queue stops the run.
  async fn restore(&self, snapshot: RunSnapshot) -> Result<RunState, OrchestratorError> {
    let checked = async {
      if snapshot.key.version.as_deref() != Some(snapshot.pipeline.version.as_str()) {
        return Err(OrchestratorError::from(ConfigurationError::VersionMismatch {
          tenant: snapshot.key.tenant.clone(),
          queue: snapshot.key.queue.clone(),
          requested: snapshot.key.version.clone().unwrap_or_default(),
          loaded: snapshot.pipeline.version.clone(),
        }));
      }
      let tenant = self
        .tenants
        .resolve(&snapshot.key.tenant, &snapshot.key.queue)
        .await?;
      Ok(tenant)
    }
    .await;

    let tenant = match checked {
      Ok(tenant) => tenant,
      Err(e) => {
        self
          .record_failure(
            &snapshot.run_id,
            &snapshot.key.tenant,
            &snapshot.key.queue,
            snapshot.started_at,
            snapshot.usage.clone(),
            &e,
          )
          .await;
        return Err(e);
      }
    };

    Ok(RunState::new(RunParts {
      run_id: snapshot.run_id,
      key: snapshot.key,
      pipeline: Arc::new(snapshot.pipeline),
      tenant: Arc::new(tenant),
      nested: false,
      started_at: snapshot.started_at,
      cancel: CancellationToken::new(),
      tree: snapshot.tree,
      variables: snapshot.variables,
      usage: snapshot.usage,
    }))
  }

  async fn drive(&self, run: &RunState) -> Result<(), OrchestratorError> {
    match run.pipeline.execution.execution_type {
      ExecutionType::Sequential => self.walk(run, &run.root_id()).await,
      ExecutionType::Parallel => self.drive_plan(run).await,
    }
  }

  fn drive_boxed<'a>(&'a self, run: &'a RunState) -> BoxFuture<'a, Result<(), OrchestratorError>> {
    Box::pin(self.drive(run))
  }

  /// Turn the drive result into the run's final outcome and write `run_ended`.
  async fn conclude(
    &self,
    run: &RunState,
    result: Result<(), OrchestratorError>,
  ) -> Result<RunOutput, OrchestratorError> {
    self.release_instances(&run.run_id).await;

    let result = result.and_then(|()| {
      let unfinished = run.with_tree(|tree| tree.unfinished());
      if !unfinished.is_empty() {
        return Err(OrchestratorError::Stall { unfinished });
      }
      Ok(run.variables().export(&run.pipeline.result_mapping))
    });

    let output = match result {
      Ok(output) => output,
      Err(e) => {
        self
          .record_failure(
            &run.run_id,
            &run.key.tenant,
            &run.key.queue,
            run.started_at,
            run.usage(),
            &e,
          )
          .await;
        return Err(e);
      }
    };

    let usage = run.usage();
    let ended_at = Utc::now();
    self
      .ledger
      .run_ended(&RunEndRecord {
        run_id: run.run_id.clone(),
        tenant: run.key.tenant.clone(),
        queue: run.key.queue.clone(),
        status: RunStatus::Completed,
        output: Some(output.clone()),
        failure_stage: None,
        error: None,
        ended_at,
        duration_ms: (ended_at - run.started_at).num_milliseconds(),
        total_tokens: usage.total_tokens,
        total_cost: usage.total_cost,
        currency: usage.currency.clone(),
      })
      .await?;

    info!(run_id = %run.run_id, total_tokens = usage.total_tokens, "run_completed");
    Ok(RunOutput {
      run_id: run.run_id.clone(),
      output,
      usage,
    })
  }

  /// Clean up the capability instances a finished run created.
  async fn release_instances(&self, run_id: &str) {
    for instance in self.instances.evict_run(run_id) {
      if let Err(e) = instance.cleanup().await {
        warn!(run_id = %run_id, error = %e, "capability_cleanup_failed");
      }
    }
  }

  async fn record_failure(
    &self,
    run_id: &str,
    tenant: &str,
    queue: &str,
    started_at: DateTime<Utc>,
    usage: UsageTotals,
    failure: &OrchestratorError,
  ) {
    let stage = failure.failure_stage();
    let message = failure.report();
    error!(run_id = %run_id, stage = ?stage, error = %message, "run_failed");

    let ended_at = Utc::now();
    let record = RunEndRecord {
      run_id: run_id.to_string(),
      tenant: tenant.to_string(),
      queue: queue.to_string(),
      status: RunStatus::Failed,
      output: None,
      failure_stage: Some(stage),
      error: Some(message),
      ended_at,
      duration_ms: (ended_at - started_at).num_milliseconds(),
      total_tokens: usage.total_tokens,
      total_cost: usage.total_cost,
      currency: usage.currency,
    };
    if let Err(e) = self.ledger.run_ended(&record).await {
      warn!(run_id = %run_id, error = %e, "run_end_record_failed");
    }
  }

  /// Run the pipeline a SUB_PIPELINE node points at as a nested run of the same tenant.
  pub(crate) async fn run_sub_pipeline(
    &self,
    parent: &RunState,
    definition: &NodeDef,
    parameters: Parameters,
  ) -> Result<Value, OrchestratorError> {
    let Some(reference) = &definition.sub_pipeline else {
      return Err(NodeError::invalid(&definition.id, "SUB_PIPELINE node has no subPipeline").into());
    };
    let failed = |message: String| -> OrchestratorError {
      NodeError::new(&definition.id, codes::SUB_PIPELINE_FAILED, message).into()
    };
    if !parent.tenant.allows_queue(&reference.queue) {
      return Err(failed(format!(
        "queue '{}' is not allowed for tenant '{}'",
        reference.queue, parent.tenant.tenant
      )));
    }

    let run_id = format!("{}:{}", definition.id, uuid::Uuid::new_v4());
    let request = RunRequest {
      run_id: Some(run_id.clone()),
      tenant: parent.key.tenant.clone(),
      queue: reference.queue.clone(),
      version: reference.version.clone(),
      input: Value::Object(parameters),
    };
    info!(run_id = %parent.run_id, node_id = %definition.id, sub_run_id = %run_id, "sub_pipeline_started");

    let started_at = Utc::now();
    let nested = match self
      .open_run(
        run_id.clone(),
        parent.tenant.clone(),
        &request,
        parent.cancel.child_token(),
        true,
      )
      .await
    {
      Ok(nested) => nested,
      Err(e) => {
        self
          .record_failure(&run_id, &request.tenant, &request.queue, started_at, UsageTotals::default(), &e)
          .await;
        return Err(failed(e.report()));
      }
    };

    let result = self.drive_boxed(&nested).await;
    match self.conclude(&nested, result).await {
      Ok(output) => {
        parent.add_usage(&AiMetrics {
          total_tokens: output.usage.total_tokens,
          cost: output.usage.total_cost,
          currency: output.usage.currency.clone(),
          ..AiMetrics::default()
        });
        Ok(output.output)
      }
      Err(OrchestratorError::Cancelled) => Err(OrchestratorError::Cancelled),
      Err(e) => Err(failed(e.report())),
    }
  }
}
