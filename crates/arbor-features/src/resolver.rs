use std::sync::Arc;

use arbor_config::{NodeDef, PipelineScope};
use tracing::warn;

use crate::dispatch::ResolvedHooks;
use crate::registry::HookRegistry;

/// Queue-name suffix that turns on the `debug` hook.
pub const DEBUG_QUEUE_SUFFIX: &str = "-debug";
pub const DEBUG_HOOK: &str = "debug";

/// Pipeline scope and queue a node runs under.
#[derive(Debug, Clone, Copy)]
pub struct ResolutionContext<'a> {
  pub scope: &'a PipelineScope,
  pub queue: &'a str,
}

/// Hook names that run before and after a node, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedNames {
  pub pre: Vec<String>,
  pub post: Vec<String>,
}

/// Computes the PRE and POST hook lists for a node.
#[derive(Clone)]
pub struct FeatureHookResolver {
  registry: Arc<HookRegistry>,
}

impl FeatureHookResolver {
  pub fn new(registry: Arc<HookRegistry>) -> Self {
    Self { registry }
  }

  pub fn registry(&self) -> &Arc<HookRegistry> {
    &self.registry
  }

  /// Requested hook names before registry lookup.
  ///
  /// Order: explicit `preExecution`, `postExecution` and `features`, then the
  /// scope's features, then `debug` on a debug queue. `featureNotRequired`
  /// removes names; `featureRequired` adds them back last.
  pub fn requested_names(&self, def: &NodeDef, ctx: ResolutionContext<'_>) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    let mut push = |name: &str| {
      if !names.iter().any(|n| n == name) {
        names.push(name.to_string());
      }
    };

    for name in def
      .pre_execution
      .iter()
      .chain(&def.post_execution)
      .chain(&def.features)
      .chain(&ctx.scope.features)
    {
      push(name);
    }
    if ctx.queue.ends_with(DEBUG_QUEUE_SUFFIX) {
      push(DEBUG_HOOK);
    }

    names.retain(|n| !def.feature_not_required.contains(n));
    for name in &def.feature_required {
      if !names.contains(name) {
        names.push(name.clone());
      }
    }
    names
  }

  /// Resolve the hooks for `def`.
  ///
  /// Unknown names are logged and dropped; hooks that do not apply to the
  /// node's type are skipped silently.
  pub fn resolve(&self, def: &NodeDef, ctx: ResolutionContext<'_>) -> ResolvedHooks {
    let mut resolved = ResolvedHooks::default();
    for name in self.requested_names(def, ctx) {
      let Some(hook) = self.registry.get(&name) else {
        warn!(node_id = %def.id, hook = %name, "unknown_feature_hook");
        continue;
      };
      if !hook.applies_to(def.node_type, def.plugin_ref.as_deref()) {
        continue;
      }
      if hook.phase().runs_before() {
        resolved.pre.push(hook.clone());
      }
      if hook.phase().runs_after() {
        resolved.post.push(hook);
      }
    }
    resolved
  }

  pub fn resolve_names(&self, def: &NodeDef, ctx: ResolutionContext<'_>) -> ResolvedNames {
    self.resolve(def, ctx).names()
  }

  /// Write the resolved hook lists into a freshly created node's explicit lists.
  pub fn enrich(&self, mut def: NodeDef, ctx: ResolutionContext<'_>) -> NodeDef {
    let names = self.resolve_names(&def, ctx);
    def.pre_execution = names.pre;
    def.post_execution = names.post;
    def
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::HookError;
  use crate::hook::{FeatureHook, HookPhase};
  use arbor_config::StructuralType;
  use async_trait::async_trait;

  struct TestHook {
    name: &'static str,
    phase: HookPhase,
    patterns: &'static [&'static str],
  }

  #[async_trait]
  impl FeatureHook for TestHook {
    fn name(&self) -> &str {
      self.name
    }

    fn phase(&self) -> HookPhase {
      self.phase
    }

    fn patterns(&self) -> &[&str] {
      self.patterns
    }

    async fn before(&self, _ctx: &crate::hook::NodeContext) -> Result<(), HookError> {
      Ok(())
    }
  }

  fn resolver() -> FeatureHookResolver {
    let registry = HookRegistry::new();
    for (name, phase, patterns) in [
      ("audit", HookPhase::Pre, &["*"][..]),
      ("metrics", HookPhase::PreFinally, &["PLUGIN.*"][..]),
      ("trace", HookPhase::PrePost, &["*"][..]),
      ("notify", HookPhase::Post, &["*"][..]),
      ("debug", HookPhase::PrePost, &["*"][..]),
    ] {
      registry.register(Arc::new(TestHook {
        name,
        phase,
        patterns,
      }));
    }
    FeatureHookResolver::new(Arc::new(registry))
  }

  fn scope(features: &[&str]) -> PipelineScope {
    PipelineScope {
      capabilities: Vec::new(),
      features: features.iter().map(|f| f.to_string()).collect(),
    }
  }

  #[test]
  fn test_resolution_order_and_phases() {
    let mut def = NodeDef::plugin("ask", "llm/chat");
    def.pre_execution = vec!["audit".to_string()];
    def.post_execution = vec!["notify".to_string()];
    let scope = scope(&["trace", "metrics"]);

    let names = resolver().resolve_names(&def, ResolutionContext { scope: &scope, queue: "qa" });
    assert_eq!(names.pre, vec!["audit", "trace", "metrics"]);
    assert_eq!(names.post, vec!["notify", "trace", "metrics"]);
  }

  #[test]
  fn test_debug_queue_adds_debug_hook_once() {
    let def = NodeDef::plugin("ask", "echo").with_features(&["debug"]);
    let scope = scope(&[]);
    let names = resolver().requested_names(&def, ResolutionContext { scope: &scope, queue: "qa-debug" });
    assert_eq!(names, vec!["debug"]);

    let plain = NodeDef::plugin("ask", "echo");
    let names = resolver().requested_names(&plain, ResolutionContext { scope: &scope, queue: "qa-debug" });
    assert_eq!(names, vec!["debug"]);
    let names = resolver().requested_names(&plain, ResolutionContext { scope: &scope, queue: "qa" });
    assert!(names.is_empty());
  }

  #[test]
  fn test_not_required_removes_and_required_adds() {
    let mut def = NodeDef::plugin("ask", "echo");
    def.feature_not_required = vec!["trace".to_string(), "debug".to_string()];
    def.feature_required = vec!["notify".to_string(), "trace".to_string()];
    let scope = scope(&["trace", "audit"]);

    let names = resolver().requested_names(&def, ResolutionContext { scope: &scope, queue: "qa-debug" });
    assert_eq!(names, vec!["audit", "notify", "trace"]);
  }

  #[test]
  fn test_unknown_and_inapplicable_hooks_are_dropped() {
    let def = NodeDef::new("root", StructuralType::Sequence).with_features(&["ghost", "metrics", "audit"]);
    let scope = scope(&[]);
    let names = resolver().resolve_names(&def, ResolutionContext { scope: &scope, queue: "qa" });
    assert_eq!(names.pre, vec!["audit"]);
    assert!(names.post.is_empty());
  }

  #[test]
  fn test_enrich_writes_explicit_lists() {
    let scope = scope(&["trace"]);
    let ctx = ResolutionContext { scope: &scope, queue: "qa" };
    let resolver = resolver();

    let enriched = resolver.enrich(NodeDef::plugin("dyn-1", "echo"), ctx);
    assert_eq!(enriched.pre_execution, vec!["trace"]);
    assert_eq!(enriched.post_execution, vec!["trace"]);

    let again = resolver.resolve_names(&enriched, ctx);
    assert_eq!(again.pre, vec!["trace"]);
    assert_eq!(again.post, vec!["trace"]);
  }
}
