//! Arbor Workflow
//!
//! This crate provides the runtime representation of a pipeline's execution
//! tree and the compiler that turns a static tree into an execution plan.
//!
//! Key differences from `arbor-config`:
//! - Nodes live in a flat arena keyed by id, linked by parent/child ids
//! - Every node carries a mutable status (NOT_STARTED → COMPLETED | SKIPPED | FAILED)
//! - Planner nodes can attach new children while the tree is being walked
//! - The plan groups FORK branches into concurrent steps and records
//!   try/catch recovery points

mod error;
mod plan;
mod state;
mod tree;

pub use error::WorkflowError;
pub use plan::{Activity, ActivityScope, ActivityType, CatchPoint, ExecutionPlan, PlanShape, PlanStep};
pub use state::{IterationState, NodeStatus, RuntimeNodeState};
pub use tree::RuntimeExecutionTree;
