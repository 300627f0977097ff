//! Process-wide, lazily initialised enhancers keyed by model name.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::{error, info};

use crate::backend::{build_session, InferenceBackend, SessionConfig};
use crate::config::AppConfig;
use crate::enhancer::{Enhancer, EnhancerOptions, OrtRunner};
use crate::model_registry::{ModelEntry, ModelRegistry};

/// Builds an enhancer for a catalog entry. Runs on the blocking pool.
pub type EnhancerLoader = Arc<dyn Fn(&ModelEntry) -> Result<Enhancer> + Send + Sync>;

type Slot = Arc<OnceCell<Arc<Enhancer>>>;

pub struct ModelPool {
    registry: Arc<ModelRegistry>,
    loader: EnhancerLoader,
    slots: DashMap<String, Slot>,
}

impl ModelPool {
    pub fn new(registry: Arc<ModelRegistry>, loader: EnhancerLoader) -> Self {
        Self {
            registry,
            loader,
            slots: DashMap::new(),
        }
    }

    /// Pool backed by ONNX Runtime sessions built from `config`.
    pub fn with_ort(registry: Arc<ModelRegistry>, config: &AppConfig) -> Self {
        let loader = ort_loader(Arc::clone(&registry), config);
        Self::new(registry, loader)
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Enhancer for `name` (catalog name or alias), loading it on first use.
    /// A failed load is not remembered; the next call tries again.
    pub async fn get(&self, name: &str) -> Result<Arc<Enhancer>> {
        let entry = self
            .registry
            .resolve(name)
            .with_context(|| format!("Unknown model: {name}"))?
            .clone();

        let slot = self.slots.entry(entry.name.clone()).or_default().clone();
        let enhancer = slot
            .get_or_try_init(|| {
                let loader = Arc::clone(&self.loader);
                let entry = entry.clone();
                async move {
                    let started = Instant::now();
                    let enhancer = tokio::task::spawn_blocking(move || loader(&entry))
                        .await
                        .context("model loader task panicked")??;
                    info!(
                        model = %name,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Model loaded"
                    );
                    Ok::<_, anyhow::Error>(Arc::new(enhancer))
                }
            })
            .await?;

        Ok(Arc::clone(enhancer))
    }

    /// Load `name` ahead of the first request. Failures are logged only.
    pub async fn preload(&self, name: &str) {
        if let Err(err) = self.get(name).await {
            error!(model = %name, error = %format!("{err:#}"), "Model preload failed");
        }
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        let Some(entry) = self.registry.resolve(name) else {
            return false;
        };
        self.slots
            .get(&entry.name)
            .map(|slot| slot.initialized())
            .unwrap_or(false)
    }
}

/// Download-if-needed, build the session and wrap it for tiled inference.
pub fn ort_loader(registry: Arc<ModelRegistry>, config: &AppConfig) -> EnhancerLoader {
    let backend: InferenceBackend = config.inference.backend();
    let trt_cache_dir: PathBuf = config.paths.trt_cache_dir.clone();
    let tile_size = config.inference.tile_size as usize;
    let tile_pad = config.inference.tile_pad as usize;
    let max_output_pixels = config.inference.max_output_pixels;

    Arc::new(move |entry: &ModelEntry| -> Result<Enhancer> {
        let model_path = registry.ensure_downloaded(&entry.name)?;
        info!(
            model = %entry.name,
            path = %model_path.display(),
            backend = %backend,
            "Building inference session"
        );
        let session = build_session(&SessionConfig {
            model_path: &model_path,
            backend,
            trt_cache_dir: &trt_cache_dir,
        })?;
        let runner = OrtRunner::new(session)
            .with_context(|| format!("Unsupported model graph: {}", entry.name))?;

        Ok(Enhancer::new(
            Box::new(runner),
            EnhancerOptions {
                value_max: entry.value_max(),
                tile_size,
                tile_pad,
                max_output_pixels,
            },
        ))
    })
}
