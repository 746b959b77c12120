//! Capability packages installed on disk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::capability::{
  Capability, CapabilityError, CapabilityOutput, CapabilityRequest, error_codes,
};
use crate::error::PluginError;
use crate::registry::PluginRegistry;

/// `manifest.json` of a capability package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifest {
  /// Capability reference the package provides, e.g. `acme/summarize`.
  pub name: String,
  pub version: String,
  #[serde(default)]
  pub description: String,
  /// Program to run. Relative paths are resolved against the package directory first.
  pub command: String,
  #[serde(default)]
  pub args: Vec<String>,
}

impl PackageManifest {
  /// Directory name for this package (`acme--summarize--1.0.0`).
  pub fn dir_name(&self) -> String {
    format!("{}--{}", self.name.replace('/', "--"), self.version)
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledPackage {
  pub manifest: PackageManifest,
  pub package_dir: PathBuf,
}

/// Filesystem-based package registry.
///
/// Packages are stored in a directory structure:
/// ```text
/// {root}/
/// └── acme--summarize--1.0.0/
///     ├── manifest.json
///     └── run.sh (optional, referenced by `command`)
/// ```
pub struct FsPackageRegistry {
  root: PathBuf,
}

impl FsPackageRegistry {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// Parse a directory name into (name, version).
  /// Example: "acme--summarize--1.0.0" -> ("acme/summarize", "1.0.0")
  fn parse_dir_name(dir_name: &str) -> Option<(String, String)> {
    let last_sep = dir_name.rfind("--")?;
    let name_part = &dir_name[..last_sep];
    let version = &dir_name[last_sep + 2..];
    if name_part.is_empty() || version.is_empty() {
      return None;
    }

    let name = match name_part.find("--") {
      Some(first_sep) => format!("{}/{}", &name_part[..first_sep], &name_part[first_sep + 2..]),
      None => name_part.to_string(),
    };

    Some((name, version.to_string()))
  }

  async fn read_manifest(&self, package_dir: &Path) -> Result<PackageManifest, PluginError> {
    let content = fs::read_to_string(package_dir.join("manifest.json")).await?;
    let manifest: PackageManifest = serde_json::from_str(&content)?;
    Ok(manifest)
  }

  async fn load_package(&self, package_dir: PathBuf) -> Result<InstalledPackage, PluginError> {
    let manifest = self.read_manifest(&package_dir).await?;

    if let Some(dir_name) = package_dir.file_name().and_then(|n| n.to_str())
      && let Some((name, version)) = Self::parse_dir_name(dir_name)
      && (name != manifest.name || version != manifest.version)
    {
      return Err(PluginError::InvalidPackage {
        path: package_dir,
        message: format!(
          "directory names {}@{} but manifest declares {}@{}",
          name, version, manifest.name, manifest.version
        ),
      });
    }

    Ok(InstalledPackage {
      manifest,
      package_dir,
    })
  }

  /// Every valid package under the root. Invalid packages are logged and skipped.
  pub async fn list(&self) -> Result<Vec<InstalledPackage>, PluginError> {
    let mut packages = Vec::new();
    if !self.root.exists() {
      return Ok(packages);
    }

    let mut entries = fs::read_dir(&self.root).await?;
    while let Some(entry) = entries.next_entry().await? {
      let path = entry.path();
      if !path.is_dir() {
        continue;
      }
      match self.load_package(path.clone()).await {
        Ok(package) => packages.push(package),
        Err(e) => warn!(path = %path.display(), error = %e, "package_skipped"),
      }
    }

    packages.sort_by(|a, b| {
      (a.manifest.name.as_str(), a.manifest.version.as_str())
        .cmp(&(b.manifest.name.as_str(), b.manifest.version.as_str()))
    });
    Ok(packages)
  }

  /// Look up a package; without a version the latest (string order) wins.
  pub async fn get(
    &self,
    name: &str,
    version: Option<&str>,
  ) -> Result<Option<InstalledPackage>, PluginError> {
    let matching = self
      .list()
      .await?
      .into_iter()
      .filter(|p| p.manifest.name == name)
      .filter(|p| version.is_none_or(|v| p.manifest.version == v));
    Ok(matching.last())
  }

  /// Register one process-backed capability per package name (latest version)
  /// and return the registered references.
  pub async fn register_all(&self, registry: &PluginRegistry) -> Result<Vec<String>, PluginError> {
    let mut latest: BTreeMap<String, InstalledPackage> = BTreeMap::new();
    for package in self.list().await? {
      latest.insert(package.manifest.name.clone(), package);
    }

    let mut registered = Vec::new();
    for (name, package) in latest {
      let capability = Arc::new(ProcessCapability::from_package(&package));
      let version = package.manifest.version.clone();
      registry.register(
        name.clone(),
        version,
        Arc::new(move || capability.clone() as Arc<dyn Capability>),
      );
      debug!(capability_ref = %name, "package_registered");
      registered.push(name);
    }
    Ok(registered)
  }
}

/// Capability backed by an external process.
///
/// The request is written to stdin as JSON
/// (`{"runId", "nodeId", "tenant", "parameters"}`) and the process must print a
/// JSON object to stdout. An object with `"success": false` is a failure whose
/// `code` and `message` keys are carried into the [`CapabilityError`].
pub struct ProcessCapability {
  program: PathBuf,
  args: Vec<String>,
  working_dir: PathBuf,
}

impl ProcessCapability {
  pub fn new(program: impl Into<PathBuf>, args: Vec<String>, working_dir: impl Into<PathBuf>) -> Self {
    Self {
      program: program.into(),
      args,
      working_dir: working_dir.into(),
    }
  }

  pub fn from_package(package: &InstalledPackage) -> Self {
    let local = package.package_dir.join(&package.manifest.command);
    let program = if local.is_file() {
      local
    } else {
      PathBuf::from(&package.manifest.command)
    };
    Self::new(program, package.manifest.args.clone(), &package.package_dir)
  }
}

#[async_trait]
impl Capability for ProcessCapability {
  async fn execute(&self, request: CapabilityRequest) -> Result<CapabilityOutput, CapabilityError> {
    let payload = serde_json::json!({
      "runId": request.run_id,
      "nodeId": request.node_id,
      "tenant": request.tenant,
      "parameters": request.parameters,
    });
    let payload = serde_json::to_vec(&payload)
      .map_err(|e| CapabilityError::new(error_codes::INVALID_INPUT, e.to_string()))?;

    let mut child = Command::new(&self.program)
      .args(&self.args)
      .current_dir(&self.working_dir)
      .stdin(Stdio::piped())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true)
      .spawn()
      .map_err(|e| {
        CapabilityError::new(
          error_codes::PROCESS_FAILED,
          format!("failed to spawn '{}': {}", self.program.display(), e),
        )
      })?;

    if let Some(mut stdin) = child.stdin.take() {
      stdin
        .write_all(&payload)
        .await
        .map_err(|e| CapabilityError::new(error_codes::PROCESS_FAILED, e.to_string()))?;
    }

    let output = child
      .wait_with_output()
      .await
      .map_err(|e| CapabilityError::new(error_codes::PROCESS_FAILED, e.to_string()))?;

    if !output.status.success() {
      let stderr = String::from_utf8_lossy(&output.stderr);
      return Err(CapabilityError::new(
        error_codes::PROCESS_FAILED,
        format!("process exited with {}: {}", output.status, stderr.trim()),
      ));
    }

    let value: serde_json::Value = serde_json::from_slice(&output.stdout).map_err(|e| {
      CapabilityError::new(error_codes::INVALID_OUTPUT, format!("invalid JSON: {}", e))
    })?;
    let mut values = match value {
      serde_json::Value::Object(values) => values,
      other => {
        return Err(CapabilityError::new(
          error_codes::INVALID_OUTPUT,
          format!("expected a JSON object, got {}", other),
        ));
      }
    };

    if values.get("success") == Some(&serde_json::Value::Bool(false)) {
      let code = values
        .remove("code")
        .and_then(|c| c.as_str().map(str::to_string))
        .unwrap_or_else(|| error_codes::CAPABILITY_FAILED.to_string());
      let message = values
        .remove("message")
        .and_then(|m| m.as_str().map(str::to_string))
        .unwrap_or_default();
      values.remove("success");
      return Err(CapabilityError::new(code, message).with_outputs(values));
    }

    Ok(CapabilityOutput::new(values))
  }
}
