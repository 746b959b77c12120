use arbor_config::StructuralType;

/// Match a hook applicability pattern against a node.
///
/// The node is described as `TYPE` or, when it has a plugin reference,
/// `TYPE.pluginRef`. Supported patterns:
/// - `*` matches every node
/// - `PLUGIN` matches the exact structural type
/// - `PLUGIN.llm/chat` matches the exact type and plugin reference
/// - `PLUGIN.*` or `PLUGIN.llm/*` match by prefix
pub fn pattern_matches(pattern: &str, node_type: StructuralType, plugin_ref: Option<&str>) -> bool {
  if pattern == "*" {
    return true;
  }

  let type_name = node_type.as_str();
  let target = match plugin_ref {
    Some(plugin_ref) => format!("{}.{}", type_name, plugin_ref),
    None => type_name.to_string(),
  };

  match pattern.strip_suffix('*') {
    Some(prefix) => {
      target.starts_with(prefix) || prefix.strip_suffix('.') == Some(type_name)
    }
    None => pattern == type_name || pattern == target,
  }
}
