use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use arbor_features::HookRegistry;
use arbor_ledger::{Ledger, SqliteLedger};
use arbor_orchestrator::{Orchestrator, RunRequest, RunSnapshot};
use arbor_plugin::{Capability, FsPackageRegistry, PluginRegistry, register_builtins};
use arbor_resolver::{
  FsPipelineSource, FsTenantSource, LayeredResolver, MemoryPipelineSource, PipelineKey,
  PipelineSource, TenantResolver,
};
use arbor_workflow::ExecutionPlan;

mod logging;

/// Arbor - runs execution-tree pipelines for many tenants
#[derive(Parser)]
#[command(name = "arbor")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.arbor)
  #[arg(long, global = true, env = "ARBOR_DATA_DIR")]
  data_dir: Option<PathBuf>,

  /// Directory scanned for capability packages (default: <data-dir>/packages)
  #[arg(long, global = true, env = "ARBOR_PACKAGES_DIR")]
  packages_dir: Option<PathBuf>,

  /// Ledger database URL (default: SQLite file in the data directory)
  #[arg(long, global = true, env = "ARBOR_LEDGER_URL")]
  ledger_url: Option<String>,

  /// Tenants this worker serves, comma separated. Empty serves every tenant.
  #[arg(long, global = true, env = "ARBOR_TENANTS", value_delimiter = ',')]
  tenants: Vec<String>,

  /// Task queues this worker serves, comma separated. Empty serves every queue.
  #[arg(long, global = true, env = "ARBOR_TASK_QUEUES", value_delimiter = ',')]
  task_queues: Vec<String>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Run a pipeline to completion; input JSON is read from stdin
  Run {
    tenant: String,
    queue: String,

    /// Pipeline version to pin
    #[arg(long)]
    version: Option<String>,

    #[arg(long)]
    run_id: Option<String>,
  },

  /// Print the execution plan compiled from a pipeline
  Plan {
    tenant: String,
    queue: String,

    #[arg(long)]
    version: Option<String>,
  },

  /// Start a run for external stepping and print its snapshot
  Start {
    tenant: String,
    queue: String,

    #[arg(long)]
    version: Option<String>,

    #[arg(long)]
    run_id: Option<String>,
  },

  /// Execute one node of the snapshot read from stdin
  Step,

  /// Open the ledger and create its schema if it does not exist
  Schema,
}

/// Everything the commands share, wired from the CLI settings.
struct Worker {
  orchestrator: Orchestrator,
  ledger: Arc<dyn Ledger>,
  pipelines: Arc<LayeredResolver>,
}

fn main() -> Result<()> {
  logging::init();
  let cli = Cli::parse();

  let Some(command) = cli.command else {
    println!("arbor - use --help to see available commands");
    return Ok(());
  };

  let rt = tokio::runtime::Runtime::new()?;
  rt.block_on(async {
    let worker = build_worker(
      &cli.data_dir,
      &cli.packages_dir,
      &cli.ledger_url,
      &cli.tenants,
      &cli.task_queues,
    )
    .await?;
    let result = run_command(&worker, command).await;
    cleanup(&worker.orchestrator).await;
    result
  })
}

async fn build_worker(
  data_dir: &Option<PathBuf>,
  packages_dir: &Option<PathBuf>,
  ledger_url: &Option<String>,
  tenants: &[String],
  task_queues: &[String],
) -> Result<Worker> {
  let data_dir = match data_dir {
    Some(dir) => dir.clone(),
    None => dirs::home_dir()
      .context("could not determine home directory")?
      .join(".arbor"),
  };
  tokio::fs::create_dir_all(&data_dir)
    .await
    .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

  let plugins = Arc::new(PluginRegistry::new());
  register_builtins(&plugins);
  let packages_dir = packages_dir
    .clone()
    .unwrap_or_else(|| data_dir.join("packages"));
  let packages = FsPackageRegistry::new(&packages_dir)
    .register_all(&plugins)
    .await
    .with_context(|| format!("failed to scan packages: {}", packages_dir.display()))?;
  info!(packages = packages.len(), "packages_registered");

  let ledger_url = ledger_url
    .clone()
    .unwrap_or_else(|| format!("sqlite://{}?mode=rwc", data_dir.join("ledger.db").display()));
  let ledger: Arc<dyn Ledger> = Arc::new(
    SqliteLedger::connect(&ledger_url)
      .await
      .with_context(|| format!("failed to open ledger: {}", ledger_url))?,
  );

  let layers: Vec<Arc<dyn PipelineSource>> = vec![
    Arc::new(MemoryPipelineSource::new("cache")),
    Arc::new(FsPipelineSource::new("files", data_dir.join("pipelines"))),
  ];
  let pipelines = Arc::new(LayeredResolver::new(layers));
  let tenant_resolver = TenantResolver::new(Arc::new(FsTenantSource::new(data_dir.join("tenants"))))
    .with_allowed_tenants(tenants.iter().cloned())
    .with_allowed_queues(task_queues.iter().cloned());

  let orchestrator = Orchestrator::new(
    plugins,
    Arc::new(HookRegistry::with_builtins()),
    ledger.clone(),
    pipelines.clone(),
    Arc::new(tenant_resolver),
  );

  Ok(Worker {
    orchestrator,
    ledger,
    pipelines,
  })
}

async fn run_command(worker: &Worker, command: Commands) -> Result<()> {
  match command {
    Commands::Run {
      tenant,
      queue,
      version,
      run_id,
    } => {
      let input = read_json_from_stdin()?;
      let request = request(tenant, queue, version, run_id, input);

      let cancel = CancellationToken::new();
      let on_interrupt = cancel.clone();
      tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
          on_interrupt.cancel();
        }
      });

      let output = worker
        .orchestrator
        .run(request, cancel)
        .await
        .context("pipeline run failed")?;
      eprintln!("Run completed: {}", output.run_id);
      println!("{}", serde_json::to_string_pretty(&output)?);
    }
    Commands::Plan {
      tenant,
      queue,
      version,
    } => {
      let mut key = PipelineKey::new(tenant, queue);
      if let Some(version) = version {
        key = key.with_version(version);
      }
      let pipeline = worker
        .pipelines
        .resolve(&key)
        .await
        .with_context(|| format!("failed to resolve pipeline {}", key))?;
      let plan = ExecutionPlan::build(&pipeline.tree);
      println!("{}", serde_json::to_string_pretty(&plan)?);
    }
    Commands::Start {
      tenant,
      queue,
      version,
      run_id,
    } => {
      let input = read_json_from_stdin()?;
      let snapshot = worker
        .orchestrator
        .start(request(tenant, queue, version, run_id, input))
        .await
        .context("failed to start run")?;
      eprintln!("Run started: {}", snapshot.run_id);
      println!("{}", serde_json::to_string(&snapshot)?);
    }
    Commands::Step => {
      let snapshot: RunSnapshot = serde_json::from_value(read_json_from_stdin()?)
        .context("stdin is not a run snapshot")?;
      let outcome = worker
        .orchestrator
        .step(snapshot)
        .await
        .context("step failed")?;
      println!("{}", serde_json::to_string(&outcome)?);
    }
    Commands::Schema => {
      worker
        .ledger
        .ensure_schema()
        .await
        .context("failed to create ledger schema")?;
      eprintln!("Ledger schema ready");
    }
  }
  Ok(())
}

fn request(
  tenant: String,
  queue: String,
  version: Option<String>,
  run_id: Option<String>,
  input: serde_json::Value,
) -> RunRequest {
  let mut request = RunRequest::new(tenant, queue, input);
  request.version = version;
  request.run_id = run_id;
  request
}

/// Best-effort release of hook and capability resources. Failures are
/// logged and the remaining cleanups still run.
async fn cleanup(orchestrator: &Orchestrator) {
  orchestrator.hook_registry().cleanup_all().await;
  for instance in orchestrator.instances().drain() {
    if let Err(e) = instance.cleanup().await {
      warn!(error = %e, "capability_cleanup_failed");
    }
  }
}

fn read_json_from_stdin() -> Result<serde_json::Value> {
  use std::io::IsTerminal;

  if io::stdin().is_terminal() {
    // Nothing piped in
    Ok(serde_json::json!({}))
  } else {
    let mut input = String::new();
    io::stdin()
      .read_to_string(&mut input)
      .context("failed to read JSON from stdin")?;

    if input.trim().is_empty() {
      Ok(serde_json::json!({}))
    } else {
      serde_json::from_str(&input).context("failed to parse JSON from stdin")
    }
  }
}
