//! Arbor Plugin
//!
//! Capabilities are the external units of work a node invokes by reference
//! (`pluginRef`). This crate defines the execution contract, the registry that
//! maps references to factories, the per-run instance cache, the built-in
//! capabilities and the on-disk package registry.

mod builtin;
mod cache;
mod capability;
mod error;
mod package;
mod registry;

pub use builtin::{EchoCapability, TemplateCapability, register_builtins};
pub use cache::{InstanceCache, InstanceKey};
pub use capability::{
  Capability, CapabilityError, CapabilityOutput, CapabilityRequest, Parameters, error_codes,
};
pub use error::PluginError;
pub use package::{FsPackageRegistry, InstalledPackage, PackageManifest, ProcessCapability};
pub use registry::{CapabilityFactory, PluginRegistry};
