//! Inference engine seam and the ONNX Runtime implementation behind it.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use half::f16;
use ndarray::{Array4, Ix4};
use ort::{session::Session, value::Tensor};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backend::{build_session, select_backend, InferenceBackend, SessionConfig};

/// Numeric precision of the engine's input and output tensors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    F16,
    #[default]
    F32,
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::F16 => "f16",
            Self::F32 => "f32",
        })
    }
}

/// `(1, 3, H, W)` tensor in one of the supported precisions.
#[derive(Clone, Debug, PartialEq)]
pub enum PatchTensor {
    F32(Array4<f32>),
    F16(Array4<f16>),
}

impl PatchTensor {
    pub fn precision(&self) -> Precision {
        match self {
            Self::F32(_) => Precision::F32,
            Self::F16(_) => Precision::F16,
        }
    }

    /// `(N, C, H, W)`.
    pub fn dim(&self) -> (usize, usize, usize, usize) {
        match self {
            Self::F32(a) => a.dim(),
            Self::F16(a) => a.dim(),
        }
    }
}

/// Opaque fixed-scale super-resolution model.
///
/// Called only from the thread that owns it; implementations need `Send` so
/// the owner can move into the transform stage of a pipeline.
pub trait InferenceEngine: Send {
    /// Integer upscale factor applied to both spatial axes.
    fn scale(&self) -> usize;

    /// Precision the engine expects its input in.
    fn precision(&self) -> Precision;

    fn backend(&self) -> InferenceBackend;

    /// Run one `(1, 3, H, W)` patch, returning `(1, 3, H*scale, W*scale)`.
    fn infer(&mut self, input: PatchTensor) -> Result<PatchTensor>;
}

impl<E: InferenceEngine + ?Sized> InferenceEngine for Box<E> {
    fn scale(&self) -> usize {
        (**self).scale()
    }

    fn precision(&self) -> Precision {
        (**self).precision()
    }

    fn backend(&self) -> InferenceBackend {
        (**self).backend()
    }

    fn infer(&mut self, input: PatchTensor) -> Result<PatchTensor> {
        (**self).infer(input)
    }
}

#[derive(Clone, Debug)]
pub struct OrtEngineConfig {
    pub model_path: PathBuf,
    pub scale: usize,
    /// Tried in order; the first available backend wins.
    pub backends: Vec<InferenceBackend>,
    pub trt_cache_dir: Option<PathBuf>,
}

pub struct OrtEngine {
    session: Session,
    input_name: String,
    output_name: String,
    precision: Precision,
    scale: usize,
    backend: InferenceBackend,
}

impl OrtEngine {
    pub fn load(config: &OrtEngineConfig) -> Result<Self> {
        if config.scale == 0 {
            bail!("model scale must be at least 1");
        }
        if !config.model_path.is_file() {
            bail!("model file not found: {}", config.model_path.display());
        }

        let backend = select_backend(&config.backends);
        debug!(
            model = %config.model_path.display(),
            scale = config.scale,
            %backend,
            "Loading ONNX super-resolution model"
        );

        let session = build_session(&SessionConfig {
            model_path: &config.model_path,
            backend,
            trt_cache_dir: config.trt_cache_dir.as_deref(),
        })?;

        let input_name = session
            .inputs()
            .first()
            .context("model declares no inputs")?
            .name()
            .to_string();
        let output_name = session
            .outputs()
            .first()
            .context("model declares no outputs")?
            .name()
            .to_string();
        let is_fp16 = match session.inputs()[0].dtype() {
            ort::value::ValueType::Tensor { ty, .. } => {
                *ty == ort::tensor::TensorElementType::Float16
            }
            _ => false,
        };
        let precision = if is_fp16 { Precision::F16 } else { Precision::F32 };

        info!(
            model = %model_file_name(&config.model_path),
            %input_name,
            %output_name,
            %precision,
            %backend,
            scale = config.scale,
            "Inference engine ready"
        );

        Ok(Self {
            session,
            input_name,
            output_name,
            precision,
            scale: config.scale,
            backend,
        })
    }
}

impl InferenceEngine for OrtEngine {
    fn scale(&self) -> usize {
        self.scale
    }

    fn precision(&self) -> Precision {
        self.precision
    }

    fn backend(&self) -> InferenceBackend {
        self.backend
    }

    fn infer(&mut self, input: PatchTensor) -> Result<PatchTensor> {
        let input_name = self.input_name.as_str();
        let output_name = self.output_name.as_str();
        match input {
            PatchTensor::F32(array) => {
                let input_tensor = Tensor::from_array(array)?;
                let outputs = self
                    .session
                    .run(ort::inputs![input_name => &input_tensor])?;
                let output_view = outputs[output_name].try_extract_array::<f32>()?;
                Ok(PatchTensor::F32(
                    output_view.to_owned().into_dimensionality::<Ix4>()?,
                ))
            }
            PatchTensor::F16(array) => {
                let input_tensor = Tensor::from_array(array)?;
                let outputs = self
                    .session
                    .run(ort::inputs![input_name => &input_tensor])?;
                let output_view = outputs[output_name].try_extract_array::<f16>()?;
                Ok(PatchTensor::F16(
                    output_view.to_owned().into_dimensionality::<Ix4>()?,
                ))
            }
        }
    }
}

fn model_file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
