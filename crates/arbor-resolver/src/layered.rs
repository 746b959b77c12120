use std::sync::Arc;

use arbor_config::PipelineDef;
use tracing::{debug, instrument, warn};

use crate::error::ConfigurationError;
use crate::source::{PipelineKey, PipelineSource};

/// Resolves pipelines through an ordered chain of sources.
pub struct LayeredResolver {
  layers: Vec<Arc<dyn PipelineSource>>,
}

impl LayeredResolver {
  /// Layers are tried in order, fastest first.
  pub fn new(layers: Vec<Arc<dyn PipelineSource>>) -> Self {
    Self { layers }
  }

  /// Load the pipeline for `key`.
  ///
  /// The first layer that has it wins and the definition is written back to
  /// every earlier layer. A failing layer is logged and skipped; its error is
  /// returned only if no later layer has the pipeline either.
  #[instrument(name = "resolve_pipeline", skip(self), fields(key = %key))]
  pub async fn resolve(&self, key: &PipelineKey) -> Result<PipelineDef, ConfigurationError> {
    let mut last_error = None;

    for (position, layer) in self.layers.iter().enumerate() {
      let pipeline = match layer.load(key).await {
        Ok(Some(pipeline)) => pipeline,
        Ok(None) => continue,
        Err(e) => {
          warn!(layer = %layer.name(), error = %e, "config_layer_failed");
          last_error = Some(e);
          continue;
        }
      };

      if let Some(requested) = &key.version
        && *requested != pipeline.version
      {
        return Err(ConfigurationError::VersionMismatch {
          tenant: key.tenant.clone(),
          queue: key.queue.clone(),
          requested: requested.clone(),
          loaded: pipeline.version,
        });
      }

      debug!(layer = %layer.name(), version = %pipeline.version, "config_resolved");
      for earlier in &self.layers[..position] {
        if let Err(e) = earlier.store(key, &pipeline).await {
          warn!(layer = %earlier.name(), error = %e, "config_write_back_failed");
        }
      }
      return Ok(pipeline);
    }

    Err(last_error.unwrap_or_else(|| ConfigurationError::PipelineNotFound {
      tenant: key.tenant.clone(),
      queue: key.queue.clone(),
    }))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::fs::FsPipelineSource;
  use crate::memory::MemoryPipelineSource;
  use arbor_config::{NodeDef, StructuralType};

  fn pipeline(version: &str) -> PipelineDef {
    PipelineDef::new("qa", version, NodeDef::new("root", StructuralType::Sequence))
  }

  fn layers() -> (Arc<MemoryPipelineSource>, Arc<MemoryPipelineSource>, Arc<MemoryPipelineSource>) {
    (
      Arc::new(MemoryPipelineSource::new("cache")),
      Arc::new(MemoryPipelineSource::new("store")),
      Arc::new(MemoryPipelineSource::new("file")),
    )
  }

  #[tokio::test]
  async fn test_hit_is_written_back_to_earlier_layers() {
    let (cache, store, file) = layers();
    file.insert("acme", "qa", pipeline("1"));
    let resolver = LayeredResolver::new(vec![cache.clone(), store.clone(), file.clone()]);
    let key = PipelineKey::new("acme", "qa");

    let resolved = resolver.resolve(&key).await.unwrap();
    assert_eq!(resolved.version, "1");
    assert!(cache.contains(&key));
    assert!(store.contains(&key));
    assert!(cache.contains(&key.clone().with_version("1")));
  }

  #[tokio::test]
  async fn test_earlier_layer_wins() {
    let (cache, store, file) = layers();
    store.insert("acme", "qa", pipeline("2"));
    file.insert("acme", "qa", pipeline("1"));
    let resolver = LayeredResolver::new(vec![cache.clone(), store, file]);

    let resolved = resolver.resolve(&PipelineKey::new("acme", "qa")).await.unwrap();
    assert_eq!(resolved.version, "2");
  }

  #[tokio::test]
  async fn test_version_mismatch_is_fatal() {
    let temp = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(temp.path().join("acme")).unwrap();
    std::fs::write(
      temp.path().join("acme/qa.json"),
      serde_json::to_string(&pipeline("1")).unwrap(),
    )
    .unwrap();

    let cache = Arc::new(MemoryPipelineSource::new("cache"));
    let file = Arc::new(FsPipelineSource::new("file", temp.path()));
    let resolver = LayeredResolver::new(vec![cache.clone(), file]);

    let err = resolver
      .resolve(&PipelineKey::new("acme", "qa").with_version("2"))
      .await
      .unwrap_err();
    assert!(matches!(
      err,
      ConfigurationError::VersionMismatch { ref requested, ref loaded, .. }
        if requested == "2" && loaded == "1"
    ));
    assert!(!cache.contains(&PipelineKey::new("acme", "qa")));
  }

  #[tokio::test]
  async fn test_missing_pipeline() {
    let (cache, store, file) = layers();
    let resolver = LayeredResolver::new(vec![cache, store, file]);
    let err = resolver.resolve(&PipelineKey::new("acme", "qa")).await.unwrap_err();
    assert!(matches!(err, ConfigurationError::PipelineNotFound { .. }));
  }
}
