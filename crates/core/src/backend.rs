//! Execution provider selection for the upscaling session.
//!
//! [`build_session`] creates an `ort::Session` for a super-resolution model with
//! TensorRT, CUDA or plain CPU execution, falling back to the next provider when
//! the preferred one cannot be used on this machine.

use std::path::Path;
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
};
use tracing::{debug, error, info, warn};

const TRT_PROGRESS_TICK: Duration = Duration::from_secs(15);

/// Where inference runs.
///
/// Default is `Cuda`. `Tensorrt` needs the TensorRT runtime libraries; when they
/// are missing the session falls back to CUDA. `Cuda` falls back to CPU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InferenceBackend {
    #[default]
    Cuda,
    Tensorrt,
    Cpu,
}

impl InferenceBackend {
    /// Parse from string (case-insensitive). Returns `Cuda` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "tensorrt" | "trt" => Self::Tensorrt,
            "cpu" => Self::Cpu,
            _ => Self::Cuda,
        }
    }
}

impl std::fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub backend: InferenceBackend,
    pub trt_cache_dir: &'a Path,
}

fn cache_size_bytes(root: &Path) -> u64 {
    let mut total = 0;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if let Ok(meta) = entry.metadata() {
                total += meta.len();
            }
        }
    }
    total
}

/// Build an `ort::Session` for `config.model_path` on the requested backend.
pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
    let model_path = config.model_path;

    let session = match config.backend {
        InferenceBackend::Tensorrt => {
            let cache_dir = config.trt_cache_dir;
            if let Err(e) = std::fs::create_dir_all(cache_dir) {
                warn!(
                    dir = %cache_dir.display(),
                    error = %e,
                    "Failed to create TRT cache directory"
                );
            }

            let cache_before = cache_size_bytes(cache_dir);
            let started = Instant::now();
            info!(
                cache_dir = %cache_dir.display(),
                cache_bytes = cache_before,
                "Initializing TensorRT session (first run may take several minutes)"
            );

            // Engine builds can take minutes.
            let (stop_tx, stop_rx) = channel::<()>();
            let progress_thread = thread::spawn(move || {
                let mut elapsed = TRT_PROGRESS_TICK.as_secs();
                loop {
                    match stop_rx.recv_timeout(TRT_PROGRESS_TICK) {
                        Ok(_) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {
                            info!(elapsed_secs = elapsed, "TensorRT engine build in progress");
                            elapsed += TRT_PROGRESS_TICK.as_secs();
                        }
                    }
                }
            });

            let session_result = builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_engine_cache(true)
                        .with_engine_cache_path(cache_dir.to_string_lossy().to_string())
                        .with_fp16(true)
                        .with_device_id(0)
                        .build(),
                    CUDAExecutionProvider::default().build(),
                ])?
                .commit_from_file(model_path)
                .with_context(|| format!("Failed to load ONNX model: {}", model_path.display()));

            let _ = stop_tx.send(());
            let _ = progress_thread.join();

            let elapsed_secs = started.elapsed().as_secs_f64();
            match session_result {
                Ok(session) => {
                    info!(
                        elapsed_secs,
                        cache_updated = cache_size_bytes(cache_dir) != cache_before,
                        "TensorRT session ready"
                    );
                    session
                }
                Err(err) => {
                    error!(elapsed_secs, error = %err, "TensorRT session initialization failed");
                    return Err(err);
                }
            }
        }
        InferenceBackend::Cuda => {
            let cuda = CUDAExecutionProvider::default();
            if cuda.is_available().unwrap_or(false) {
                debug!(backend = "cuda", "Building session with CUDA EP");
                builder
                    .with_execution_providers([cuda.build().error_on_failure()])?
                    .commit_from_file(model_path)
                    .with_context(|| {
                        format!("Failed to load ONNX model: {}", model_path.display())
                    })?
            } else {
                warn!("CUDA EP is not available, inference will run on CPU");
                builder.commit_from_file(model_path).with_context(|| {
                    format!("Failed to load ONNX model: {}", model_path.display())
                })?
            }
        }
        InferenceBackend::Cpu => {
            debug!(backend = "cpu", "Building session on CPU");
            builder
                .commit_from_file(model_path)
                .with_context(|| format!("Failed to load ONNX model: {}", model_path.display()))?
        }
    };

    Ok(session)
}
