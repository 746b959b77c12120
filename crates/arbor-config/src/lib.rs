//! Arbor Config
//!
//! This crate contains the serializable pipeline configuration types for Arbor.
//! These types describe a pipeline before it is loaded into a run: the static
//! execution tree, the variable registry, scope, execution defaults and the
//! result mapping.
//!
//! Configuration can be loaded from:
//! - JSON files (via CLI or the file fallback of the resolver)
//! - Cache or store layers (as JSON blobs)
//!
//! Definitions are immutable once loaded. The orchestrator deep-copies the
//! pipeline at run start so later configuration changes never reach an
//! in-flight run.

mod node;
mod pipeline;
mod tenant;

pub use node::{
  IteratorSpec, NodeDef, ParameterMapping, StructuralType, SubPipelineRef,
};
pub use pipeline::{
  DEFAULT_TIMEOUT_MS, ExecutionDefaults, ExecutionType, PipelineDef, PipelineScope, ResultMapping,
  RetryPolicy, VariableDef, VariableScope,
};
pub use tenant::TenantConfig;
