//! Dynamic node expansion.
//!
//! A PLANNER node runs its capability and hands the `content` output to an
//! [`ExpansionParser`]. The parsed [`ExpansionRequest`] is validated against
//! the runtime tree, turned into fresh node definitions with unique ids, and
//! attached under the requested node.

use std::collections::HashMap;
use std::sync::Arc;

use arbor_config::{NodeDef, ParameterMapping, StructuralType};
use arbor_features::{FeatureHookResolver, ResolutionContext};
use arbor_workflow::RuntimeExecutionTree;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Name of the parser used when a PLANNER does not set one.
pub const DEFAULT_PARSER: &str = "json";

/// Structural kind of a planned child.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChildKind {
  #[default]
  Plugin,
  Planner,
  Evaluation,
  Reflection,
}

impl ChildKind {
  pub fn structural_type(self) -> StructuralType {
    match self {
      ChildKind::Plugin => StructuralType::Plugin,
      ChildKind::Planner => StructuralType::Planner,
      ChildKind::Evaluation => StructuralType::Evaluation,
      ChildKind::Reflection => StructuralType::Reflection,
    }
  }
}

/// One child a planner asks for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildSpec {
  #[serde(default)]
  pub display_name: String,
  #[serde(default)]
  pub capability_ref: Option<String>,
  #[serde(default)]
  pub input_mappings: Vec<ParameterMapping>,
  #[serde(default)]
  pub output_mappings: Vec<ParameterMapping>,
  #[serde(default)]
  pub kind: ChildKind,
}

/// Children to attach under `attach_to`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpansionRequest {
  #[serde(default)]
  pub attach_to: String,
  #[serde(default)]
  pub children: Vec<ChildSpec>,
}

/// What an expansion attached. Becomes the planner node's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpansionResult {
  pub attached_to: String,
  pub node_ids: Vec<String>,
}

/// Turns a planner's `content` output into an expansion request.
pub trait ExpansionParser: Send + Sync {
  fn parse(&self, planner_id: &str, content: &Value) -> Result<ExpansionRequest, String>;
}

/// Accepts a JSON object or array, given directly or as text. Text may wrap
/// the JSON in a fenced ```json block, as model replies usually do.
///
/// A bare array is a child list attached to the planner itself.
pub struct JsonExpansionParser;

impl JsonExpansionParser {
  fn extract(text: &str) -> Result<Value, String> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
      return Ok(value);
    }

    let start = trimmed
      .find("```json")
      .ok_or_else(|| "content is neither JSON nor a fenced json block".to_string())?;
    let body = &trimmed[start + "```json".len()..];
    let end = body
      .find("```")
      .ok_or_else(|| "unterminated fenced json block".to_string())?;
    serde_json::from_str(body[..end].trim()).map_err(|e| format!("invalid JSON in fenced block: {}", e))
  }
}

impl ExpansionParser for JsonExpansionParser {
  fn parse(&self, planner_id: &str, content: &Value) -> Result<ExpansionRequest, String> {
    let value = match content {
      Value::String(text) => Self::extract(text)?,
      other => other.clone(),
    };

    match value {
      Value::Array(_) => Ok(ExpansionRequest {
        attach_to: planner_id.to_string(),
        children: serde_json::from_value(value).map_err(|e| format!("invalid child list: {}", e))?,
      }),
      Value::Object(_) => {
        serde_json::from_value(value).map_err(|e| format!("invalid expansion request: {}", e))
      }
      other => Err(format!("expected a JSON object or array, got {}", other)),
    }
  }
}

/// Parsers by name.
#[derive(Clone)]
pub struct ExpansionParsers {
  parsers: HashMap<String, Arc<dyn ExpansionParser>>,
}

impl ExpansionParsers {
  /// A registry holding the `json` parser.
  pub fn new() -> Self {
    let mut parsers = Self {
      parsers: HashMap::new(),
    };
    parsers.register(DEFAULT_PARSER, Arc::new(JsonExpansionParser));
    parsers
  }

  pub fn register(&mut self, name: impl Into<String>, parser: Arc<dyn ExpansionParser>) {
    self.parsers.insert(name.into(), parser);
  }

  pub fn get(&self, name: &str) -> Option<Arc<dyn ExpansionParser>> {
    self.parsers.get(name).cloned()
  }
}

impl Default for ExpansionParsers {
  fn default() -> Self {
    Self::new()
  }
}

/// Check a request against the tree before anything is attached.
pub fn validate(tree: &RuntimeExecutionTree, request: &ExpansionRequest) -> Result<(), String> {
  if request.attach_to.trim().is_empty() {
    return Err("attachTo is blank".to_string());
  }
  if !tree.contains(&request.attach_to) {
    return Err(format!("attachTo '{}' does not exist", request.attach_to));
  }
  if tree.has_planner_expanded(&request.attach_to) {
    return Err(format!("node '{}' was already expanded", request.attach_to));
  }
  if let Some(position) = request
    .children
    .iter()
    .position(|c| c.capability_ref.as_deref().is_none_or(|r| r.trim().is_empty()))
  {
    return Err(format!("child {} has no capabilityRef", position));
  }
  Ok(())
}

/// Build enriched definitions for the requested children.
///
/// Ids are `{planner}-dyn-{n}`, counting up past ids already taken in the tree.
pub fn build_children(
  tree: &RuntimeExecutionTree,
  planner_id: &str,
  request: &ExpansionRequest,
  resolver: &FeatureHookResolver,
  ctx: ResolutionContext<'_>,
) -> Vec<NodeDef> {
  let mut next = 1;
  let mut definitions = Vec::with_capacity(request.children.len());

  for spec in &request.children {
    let id = loop {
      let candidate = format!("{}-dyn-{}", planner_id, next);
      next += 1;
      if tree.is_free_id(&candidate) {
        break candidate;
      }
    };

    let mut definition = NodeDef::new(id, spec.kind.structural_type());
    if !spec.display_name.is_empty() {
      definition.display_name = spec.display_name.clone();
    }
    definition.plugin_ref = spec.capability_ref.clone();
    definition.input_mappings = spec.input_mappings.clone();
    definition.output_mappings = spec.output_mappings.clone();
    definitions.push(resolver.enrich(definition, ctx));
  }
  definitions
}
