//! Inference backend selection and `ort::Session` construction.
//!
//! Backends are tried in a configured order exactly once, at engine
//! construction. The first one whose execution provider reports itself as
//! available becomes the session's backend for its whole lifetime.

use std::path::Path;
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use ort::{
    execution_providers::{
        CPUExecutionProvider, CUDAExecutionProvider, ExecutionProvider,
        TensorRTExecutionProvider,
    },
    session::{builder::GraphOptimizationLevel, Session},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    Tensorrt,
    #[default]
    Cuda,
    Cpu,
}

/// Accelerators first, CPU last.
pub const DEFAULT_BACKEND_ORDER: [InferenceBackend; 3] = [
    InferenceBackend::Tensorrt,
    InferenceBackend::Cuda,
    InferenceBackend::Cpu,
];

impl InferenceBackend {
    /// Parse from string (case-insensitive). Returns `Cuda` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "tensorrt" | "trt" => Self::Tensorrt,
            "cpu" => Self::Cpu,
            _ => Self::Cuda,
        }
    }

    /// Whether the matching execution provider can be registered in this process.
    pub fn is_available(self) -> bool {
        match self {
            Self::Tensorrt => TensorRTExecutionProvider::default()
                .is_available()
                .unwrap_or(false),
            Self::Cuda => CUDAExecutionProvider::default()
                .is_available()
                .unwrap_or(false),
            Self::Cpu => true,
        }
    }
}

impl std::fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tensorrt => write!(f, "tensorrt"),
            Self::Cuda => write!(f, "cuda"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

/// Pick the first available backend from `order`, falling back to CPU.
pub fn select_backend(order: &[InferenceBackend]) -> InferenceBackend {
    select_backend_with(order, InferenceBackend::is_available)
}

fn select_backend_with(
    order: &[InferenceBackend],
    is_available: impl Fn(InferenceBackend) -> bool,
) -> InferenceBackend {
    for &backend in order {
        if is_available(backend) {
            debug!(%backend, "Backend capability probe succeeded");
            return backend;
        }
        debug!(%backend, "Backend capability probe failed; trying next");
    }

    warn!(
        tried = ?order,
        "No configured backend is available; falling back to CPU"
    );
    InferenceBackend::Cpu
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub backend: InferenceBackend,
    pub trt_cache_dir: Option<&'a Path>,
}

/// Build an `ort::Session` for the selected backend.
///
/// `Tensorrt` registers the TRT EP with engine caching and CUDA EP behind it;
/// `Cuda` registers only CUDA EP and fails if it cannot be registered;
/// `Cpu` registers the CPU EP.
pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
    let model_path = config.model_path;

    let session = match config.backend {
        InferenceBackend::Tensorrt => {
            let cache_dir = config
                .trt_cache_dir
                .unwrap_or_else(|| Path::new("trt_cache"));

            if let Err(e) = std::fs::create_dir_all(cache_dir) {
                warn!(
                    dir = %cache_dir.display(),
                    error = %e,
                    "Failed to create TRT cache directory"
                );
            }

            info!(
                cache_dir = %cache_dir.display(),
                "Initializing TensorRT session (first run may take several minutes)"
            );

            let started = Instant::now();
            let (stop_tx, stop_rx) = channel::<()>();
            let heartbeat = thread::spawn(move || {
                let tick = Duration::from_secs(15);
                loop {
                    match stop_rx.recv_timeout(tick) {
                        Ok(_) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {
                            info!(
                                elapsed_secs = started.elapsed().as_secs(),
                                "TensorRT engine build still in progress"
                            );
                        }
                    }
                }
            });

            let cache_path = cache_dir.to_string_lossy().to_string();
            let session_result = builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_engine_cache(true)
                        .with_engine_cache_path(&cache_path)
                        .with_fp16(true)
                        .with_device_id(0)
                        .build(),
                    CUDAExecutionProvider::default().build(),
                ])?
                .commit_from_file(model_path)
                .with_context(|| format!("Failed to load ONNX model: {}", model_path.display()));

            let _ = stop_tx.send(());
            let _ = heartbeat.join();

            match session_result {
                Ok(session) => {
                    info!(
                        elapsed_secs = started.elapsed().as_secs_f64(),
                        "TensorRT session ready"
                    );
                    session
                }
                Err(error_value) => {
                    error!(
                        elapsed_secs = started.elapsed().as_secs_f64(),
                        error = %format!("{error_value:#}"),
                        "TensorRT session initialization failed"
                    );
                    return Err(error_value);
                }
            }
        }
        InferenceBackend::Cuda => {
            debug!(backend = "cuda", "Building session with CUDA EP");
            builder
                .with_execution_providers([CUDAExecutionProvider::default()
                    .build()
                    .error_on_failure()])?
                .commit_from_file(model_path)
                .with_context(|| format!("Failed to load ONNX model: {}", model_path.display()))?
        }
        InferenceBackend::Cpu => {
            debug!(backend = "cpu", "Building session with CPU EP");
            builder
                .with_execution_providers([CPUExecutionProvider::default().build()])?
                .commit_from_file(model_path)
                .with_context(|| format!("Failed to load ONNX model: {}", model_path.display()))?
        }
    };

    Ok(session)
}
