//! Arbor Orchestrator
//!
//! Executes pipelines: resolves the tenant's pipeline, seeds the variable
//! table, builds the runtime execution tree and walks it node by node.
//!
//! Sequential pipelines are walked depth-first, one node at a time, with
//! parent gating. Parallel pipelines are driven by the compiled
//! [`arbor_workflow::ExecutionPlan`], running FORK branches concurrently with
//! JOIN as the only barrier. Both modes share the same per-node primitive, so
//! a run can also be driven externally, one node per call, through
//! [`Orchestrator::start`] and [`Orchestrator::step`].

mod control;
mod error;
mod expansion;
mod failure;
mod node;
mod orchestrator;
mod plan_driver;
mod run;
mod signal;
mod variables;
mod walk;

pub use control::{DEFAULT_DECISION_KEY, DEFAULT_TOOL_KEY};
pub use error::{NodeError, OrchestratorError, codes};
pub use expansion::{
  ChildKind, ChildSpec, DEFAULT_PARSER, ExpansionParser, ExpansionParsers, ExpansionRequest,
  ExpansionResult, JsonExpansionParser,
};
pub use orchestrator::Orchestrator;
pub use run::{RunOutput, RunRequest, RunSnapshot, StepOutcome, UsageTotals};
pub use signal::SignalHub;
pub use variables::{VariableError, VariableTable};
