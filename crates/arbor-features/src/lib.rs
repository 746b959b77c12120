//! Arbor Features
//!
//! Feature hooks are named pieces of cross-cutting behavior (logging, quota,
//! metrics, debug output) that attach to nodes by configuration rather than by
//! code. This crate provides:
//! - The [`FeatureHook`] contract and the [`NodeContext`] hooks receive
//! - A name-keyed [`HookRegistry`]
//! - The [`FeatureHookResolver`], which turns a node definition plus pipeline
//!   scope and queue into ordered PRE and POST hook lists
//! - [`ResolvedHooks`] dispatch with PRE abort and PRE_FINALLY semantics
//! - Built-in hooks

pub mod builtin;
mod dispatch;
mod error;
mod hook;
mod pattern;
mod registry;
mod resolver;

pub use dispatch::ResolvedHooks;
pub use error::HookError;
pub use hook::{FeatureHook, HookPhase, NodeContext, NodeOutcome};
pub use pattern::pattern_matches;
pub use registry::HookRegistry;
pub use resolver::{DEBUG_HOOK, DEBUG_QUEUE_SUFFIX, FeatureHookResolver, ResolutionContext, ResolvedNames};
