use serde::{Deserialize, Serialize};

use crate::pipeline::RetryPolicy;

/// Structural type of a node in the execution tree.
///
/// Unrecognized type strings deserialize to [`StructuralType::Unknown`] so a
/// newer configuration fails fast at execution instead of at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StructuralType {
  Sequence,
  If,
  Switch,
  Case,
  Iterator,
  Fork,
  Join,
  Plugin,
  TryCatch,
  Retry,
  SubPipeline,
  EventWait,
  LlmDecision,
  ToolRouter,
  Evaluation,
  Reflection,
  Planner,
  #[serde(other)]
  Unknown,
}

impl StructuralType {
  /// Canonical configuration name, e.g. `TRY_CATCH`.
  pub fn as_str(&self) -> &'static str {
    match self {
      StructuralType::Sequence => "SEQUENCE",
      StructuralType::If => "IF",
      StructuralType::Switch => "SWITCH",
      StructuralType::Case => "CASE",
      StructuralType::Iterator => "ITERATOR",
      StructuralType::Fork => "FORK",
      StructuralType::Join => "JOIN",
      StructuralType::Plugin => "PLUGIN",
      StructuralType::TryCatch => "TRY_CATCH",
      StructuralType::Retry => "RETRY",
      StructuralType::SubPipeline => "SUB_PIPELINE",
      StructuralType::EventWait => "EVENT_WAIT",
      StructuralType::LlmDecision => "LLM_DECISION",
      StructuralType::ToolRouter => "TOOL_ROUTER",
      StructuralType::Evaluation => "EVALUATION",
      StructuralType::Reflection => "REFLECTION",
      StructuralType::Planner => "PLANNER",
      StructuralType::Unknown => "UNKNOWN",
    }
  }

  /// Whether executing this node calls a capability through the plugin contract.
  pub fn invokes_capability(&self) -> bool {
    matches!(
      self,
      StructuralType::Plugin
        | StructuralType::LlmDecision
        | StructuralType::ToolRouter
        | StructuralType::Evaluation
        | StructuralType::Reflection
        | StructuralType::Planner
    )
  }

  /// Whether the node owns a body that is walked as a unit (loops, re-runs,
  /// dynamic expansion, nested pipelines).
  pub fn is_composite(&self) -> bool {
    matches!(
      self,
      StructuralType::Iterator
        | StructuralType::Retry
        | StructuralType::Planner
        | StructuralType::SubPipeline
    )
  }
}

impl std::fmt::Display for StructuralType {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Maps a node parameter to a pipeline variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterMapping {
  pub parameter_name: String,
  pub variable_name: String,
}

impl ParameterMapping {
  pub fn new(parameter_name: impl Into<String>, variable_name: impl Into<String>) -> Self {
    Self {
      parameter_name: parameter_name.into(),
      variable_name: variable_name.into(),
    }
  }
}

/// Loop settings for ITERATOR nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IteratorSpec {
  /// Variable holding the array to iterate.
  pub items: String,
  /// Variable bound to the current element.
  pub item: String,
  /// Variable bound to the current zero-based index.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub index: Option<String>,
  /// Variable read at the end of every iteration...
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub collect_from: Option<String>,
  /// ...and appended to this array variable.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub collect_into: Option<String>,
}

/// Reference to a nested pipeline of the same tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubPipelineRef {
  pub queue: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub version: Option<String>,
}

/// Immutable description of one execution tree node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDef {
  pub id: String,
  #[serde(default)]
  pub display_name: String,
  #[serde(rename = "type")]
  pub node_type: StructuralType,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub children: Vec<NodeDef>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub plugin_ref: Option<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub input_mappings: Vec<ParameterMapping>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub output_mappings: Vec<ParameterMapping>,

  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub features: Vec<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub pre_execution: Vec<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub post_execution: Vec<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub feature_required: Vec<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub feature_not_required: Vec<String>,

  /// IF: minijinja expression over the variable table.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub condition: Option<String>,
  /// SWITCH: variable whose value selects a CASE child.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub switch_on: Option<String>,
  /// CASE: value matched against the SWITCH variable. `None` is the default case.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub case_value: Option<serde_json::Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub iterate: Option<IteratorSpec>,
  /// TRY_CATCH: variable receiving the caught error message.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error_variable: Option<String>,
  /// JOIN: the FORK this join closes. Defaults to the nearest preceding FORK sibling.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub join_of: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub retry: Option<RetryPolicy>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub timeout_ms: Option<u64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub sub_pipeline: Option<SubPipelineRef>,
  /// EVENT_WAIT: name of the awaited signal.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub event: Option<String>,
  /// PLANNER: expansion parser name.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub parser: Option<String>,
  /// LLM_DECISION / TOOL_ROUTER: output key naming the chosen child.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub route_key: Option<String>,
}

impl NodeDef {
  /// Create a bare node of the given type.
  pub fn new(id: impl Into<String>, node_type: StructuralType) -> Self {
    let id = id.into();
    Self {
      display_name: id.clone(),
      id,
      node_type,
      children: Vec::new(),
      plugin_ref: None,
      input_mappings: Vec::new(),
      output_mappings: Vec::new(),
      features: Vec::new(),
      pre_execution: Vec::new(),
      post_execution: Vec::new(),
      feature_required: Vec::new(),
      feature_not_required: Vec::new(),
      condition: None,
      switch_on: None,
      case_value: None,
      iterate: None,
      error_variable: None,
      join_of: None,
      retry: None,
      timeout_ms: None,
      sub_pipeline: None,
      event: None,
      parser: None,
      route_key: None,
    }
  }

  /// Create a PLUGIN node calling `plugin_ref`.
  pub fn plugin(id: impl Into<String>, plugin_ref: impl Into<String>) -> Self {
    let mut node = Self::new(id, StructuralType::Plugin);
    node.plugin_ref = Some(plugin_ref.into());
    node
  }

  pub fn with_children(mut self, children: Vec<NodeDef>) -> Self {
    self.children = children;
    self
  }

  pub fn with_input(mut self, parameter: &str, variable: &str) -> Self {
    self
      .input_mappings
      .push(ParameterMapping::new(parameter, variable));
    self
  }

  pub fn with_output(mut self, parameter: &str, variable: &str) -> Self {
    self
      .output_mappings
      .push(ParameterMapping::new(parameter, variable));
    self
  }

  pub fn with_features(mut self, features: &[&str]) -> Self {
    self
      .features
      .extend(features.iter().map(|f| f.to_string()));
    self
  }

  /// Depth-first pre-order visit of this node and its static descendants.
  pub fn walk(&self, visit: &mut impl FnMut(&NodeDef)) {
    visit(self);
    for child in &self.children {
      child.walk(visit);
    }
  }

  /// Number of nodes in this subtree.
  pub fn count(&self) -> usize {
    let mut count = 0;
    self.walk(&mut |_| count += 1);
    count
  }
}
