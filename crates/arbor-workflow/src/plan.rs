use arbor_config::{NodeDef, StructuralType};
use serde::{Deserialize, Serialize};

/// Overall shape of a compiled plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanShape {
  /// One activity per step in depth-first order.
  Linear,
  /// FORK branches are grouped into concurrent steps.
  Parallel,
}

/// What kind of work an activity performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
  Capability,
  Planner,
  Control,
  Join,
  SubPipeline,
  EventWait,
  Unknown,
}

impl From<StructuralType> for ActivityType {
  fn from(node_type: StructuralType) -> Self {
    match node_type {
      StructuralType::Plugin
      | StructuralType::LlmDecision
      | StructuralType::ToolRouter
      | StructuralType::Evaluation
      | StructuralType::Reflection => ActivityType::Capability,
      StructuralType::Planner => ActivityType::Planner,
      StructuralType::Join => ActivityType::Join,
      StructuralType::SubPipeline => ActivityType::SubPipeline,
      StructuralType::EventWait => ActivityType::EventWait,
      StructuralType::Unknown => ActivityType::Unknown,
      StructuralType::Sequence
      | StructuralType::If
      | StructuralType::Switch
      | StructuralType::Case
      | StructuralType::Iterator
      | StructuralType::Fork
      | StructuralType::TryCatch
      | StructuralType::Retry => ActivityType::Control,
    }
  }
}

/// Whether an activity runs only its node or walks the whole subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityScope {
  Node,
  Subtree,
}

/// One schedulable unit of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
  pub node_id: String,
  pub activity_type: ActivityType,
  pub scope: ActivityScope,
  /// Nearest composite ancestor whose subtree walk executes this activity.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub owner: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub capability_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStep {
  pub activities: Vec<Activity>,
  /// Activities of a concurrent step run at the same time.
  pub concurrent: bool,
}

/// Where stepping continues when a TRY_CATCH absorbs a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatchPoint {
  pub try_catch_id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error_variable: Option<String>,
  pub try_step: usize,
  /// First step of the catch branch, if the TRY_CATCH has one.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub catch_step: Option<usize>,
  /// First step after the whole TRY_CATCH subtree.
  pub resume_step: usize,
}

/// Static compilation of an execution tree into ordered steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
  pub shape: PlanShape,
  pub steps: Vec<PlanStep>,
  pub catch_points: Vec<CatchPoint>,
}

impl ExecutionPlan {
  /// Compile the static tree rooted at `root`.
  ///
  /// A tree without FORK or JOIN nodes compiles to a linear plan; otherwise
  /// every top-level FORK becomes its own step followed by one concurrent step
  /// holding its branches.
  pub fn build(root: &NodeDef) -> Self {
    let mut parallel = false;
    root.walk(&mut |node| {
      if matches!(node.node_type, StructuralType::Fork | StructuralType::Join) {
        parallel = true;
      }
    });

    let mut builder = PlanBuilder {
      parallel,
      steps: Vec::new(),
      catch_points: Vec::new(),
    };
    builder.visit(root, None);

    Self {
      shape: if parallel {
        PlanShape::Parallel
      } else {
        PlanShape::Linear
      },
      steps: builder.steps,
      catch_points: builder.catch_points,
    }
  }

  pub fn len(&self) -> usize {
    self.steps.len()
  }

  pub fn is_empty(&self) -> bool {
    self.steps.is_empty()
  }

  /// All activities in step order.
  pub fn activities(&self) -> impl Iterator<Item = &Activity> {
    self.steps.iter().flat_map(|s| s.activities.iter())
  }

  /// Index of the step holding the activity for `node_id`.
  pub fn step_of(&self, node_id: &str) -> Option<usize> {
    self
      .steps
      .iter()
      .position(|s| s.activities.iter().any(|a| a.node_id == node_id))
  }

  pub fn catch_point_for(&self, try_catch_id: &str) -> Option<&CatchPoint> {
    self
      .catch_points
      .iter()
      .find(|c| c.try_catch_id == try_catch_id)
  }
}

struct PlanBuilder {
  parallel: bool,
  steps: Vec<PlanStep>,
  catch_points: Vec<CatchPoint>,
}

impl PlanBuilder {
  fn activity(node: &NodeDef, owner: Option<&str>, scope: ActivityScope) -> Activity {
    Activity {
      node_id: node.id.clone(),
      activity_type: node.node_type.into(),
      scope,
      owner: owner.map(str::to_string),
      capability_ref: node.plugin_ref.clone(),
    }
  }

  fn push(&mut self, activities: Vec<Activity>, concurrent: bool) {
    self.steps.push(PlanStep {
      activities,
      concurrent,
    });
  }

  fn visit(&mut self, node: &NodeDef, owner: Option<&str>) {
    let scope = if node.node_type.is_composite() {
      ActivityScope::Subtree
    } else {
      ActivityScope::Node
    };
    self.push(vec![Self::activity(node, owner, scope)], false);

    if self.parallel && owner.is_none() && node.node_type == StructuralType::Fork {
      let branches = node
        .children
        .iter()
        .map(|branch| Self::activity(branch, None, ActivityScope::Subtree))
        .collect::<Vec<_>>();
      if !branches.is_empty() {
        self.push(branches, true);
      }
      return;
    }

    let child_owner = if node.node_type.is_composite() {
      Some(node.id.as_str())
    } else {
      owner
    };

    if owner.is_none() && node.node_type == StructuralType::TryCatch {
      let try_step = self.steps.len();
      let mut catch_step = None;
      for (position, child) in node.children.iter().enumerate() {
        if position == 1 {
          catch_step = Some(self.steps.len());
        }
        self.visit(child, child_owner);
      }
      self.catch_points.push(CatchPoint {
        try_catch_id: node.id.clone(),
        error_variable: node.error_variable.clone(),
        try_step,
        catch_step,
        resume_step: self.steps.len(),
      });
      return;
    }

    for child in &node.children {
      self.visit(child, child_owner);
    }
  }
}
