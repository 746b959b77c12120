//! Run-scoped variable table.

use std::collections::BTreeMap;

use arbor_config::{ResultMapping, VariableDef, VariableScope};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VariableError {
  /// IN variables are seeded from the run input and never written afterwards.
  #[error("variable '{name}' is an input and cannot be written")]
  ReadOnly { name: String },

  #[error("required input variable '{name}' is missing")]
  MissingInput { name: String },
}

/// Name → value mapping for one run, governed by the pipeline's variable registry.
///
/// Names missing from the registry are treated as INTERNAL, except keys of the
/// run input, which are IN.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableTable {
  scopes: BTreeMap<String, VariableScope>,
  values: BTreeMap<String, Value>,
}

impl VariableTable {
  /// Seed a table from the registry and the run input.
  pub fn seed(definitions: &[VariableDef], input: &Value) -> Result<Self, VariableError> {
    let mut table = Self::default();
    let input = input.as_object();

    for definition in definitions {
      table
        .scopes
        .insert(definition.name.clone(), definition.scope);

      let supplied = match definition.scope {
        VariableScope::In => input.and_then(|i| i.get(&definition.name)).cloned(),
        VariableScope::Internal | VariableScope::Out => None,
      };
      match supplied.or_else(|| definition.default.clone()) {
        Some(value) => {
          table.values.insert(definition.name.clone(), value);
        }
        None if definition.required && definition.scope == VariableScope::In => {
          return Err(VariableError::MissingInput {
            name: definition.name.clone(),
          });
        }
        None => {}
      }
    }

    for (name, value) in input.into_iter().flatten() {
      if table.scopes.contains_key(name) {
        continue;
      }
      debug!(variable = %name, "undeclared_input_variable");
      table.scopes.insert(name.clone(), VariableScope::In);
      table.values.insert(name.clone(), value.clone());
    }

    Ok(table)
  }

  pub fn get(&self, name: &str) -> Option<&Value> {
    self.values.get(name)
  }

  pub fn scope_of(&self, name: &str) -> VariableScope {
    self
      .scopes
      .get(name)
      .copied()
      .unwrap_or(VariableScope::Internal)
  }

  /// Write a value. Writes to IN variables are rejected.
  pub fn set(&mut self, name: &str, value: Value) -> Result<(), VariableError> {
    if self.scope_of(name) == VariableScope::In {
      return Err(VariableError::ReadOnly {
        name: name.to_string(),
      });
    }
    self.values.insert(name.to_string(), value);
    Ok(())
  }

  /// Append `value` to the array variable `name`, creating it if needed.
  pub fn append(&mut self, name: &str, value: Value) -> Result<(), VariableError> {
    let mut items = match self.values.get(name) {
      Some(Value::Array(items)) => items.clone(),
      Some(Value::Null) | None => Vec::new(),
      Some(other) => vec![other.clone()],
    };
    items.push(value);
    self.set(name, Value::Array(items))
  }

  /// All values as one JSON object, for condition evaluation.
  pub fn to_object(&self) -> serde_json::Map<String, Value> {
    self
      .values
      .iter()
      .map(|(k, v)| (k.clone(), v.clone()))
      .collect()
  }

  /// Project the run output.
  ///
  /// With a result mapping, each mapped variable lands under its output
  /// parameter (unset variables are omitted). Without one, every OUT variable
  /// is exported under its own name.
  pub fn export(&self, mappings: &[ResultMapping]) -> Value {
    let mut output = serde_json::Map::new();
    if mappings.is_empty() {
      for (name, scope) in &self.scopes {
        if *scope == VariableScope::Out
          && let Some(value) = self.values.get(name)
        {
          output.insert(name.clone(), value.clone());
        }
      }
    } else {
      for mapping in mappings {
        if let Some(value) = self.values.get(&mapping.variable) {
          output.insert(mapping.output_parameter.clone(), value.clone());
        }
      }
    }
    Value::Object(output)
  }
}
