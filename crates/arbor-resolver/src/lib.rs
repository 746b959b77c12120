//! Arbor Resolver
//!
//! Resolves the pipeline definition and tenant configuration a run needs.
//!
//! Pipelines are looked up by `(tenant, queue, version)` through an ordered
//! chain of [`PipelineSource`] layers (typically cache, then store, then file
//! default). A hit is written back to every earlier layer. A loaded version
//! that differs from the requested one is a hard error.

mod error;
mod fs;
mod layered;
mod memory;
mod source;
mod tenant;

pub use error::ConfigurationError;
pub use fs::{FsPipelineSource, FsTenantSource};
pub use layered::LayeredResolver;
pub use memory::{MemoryPipelineSource, MemoryTenantSource};
pub use source::{PipelineKey, PipelineSource, TenantSource};
pub use tenant::TenantResolver;
