use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::backend::{InferenceBackend, DEFAULT_BACKEND_ORDER};
use crate::budget::BudgetConfig;
use crate::encoder::EncoderConfig;
use crate::pipeline::PipelineConfig;
use crate::tiling::DEFAULT_TILE_PAD;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "UPSCALER_DATA_DIR";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub engine: EngineSettings,
    pub budget: BudgetConfig,
    pub pipeline: PipelineConfig,
    pub encoder: EncoderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            trt_cache_dir: PathBuf::from("trt_cache"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineSettings {
    /// Tried in order; the first available backend wins.
    pub backends: Vec<InferenceBackend>,
    pub preset: ModelPreset,
    /// Fixed tile side. `0` sizes tiles from available memory.
    pub tile_size: u32,
    /// Context border around each tile, in input pixels.
    pub tile_pad: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            backends: DEFAULT_BACKEND_ORDER.to_vec(),
            preset: ModelPreset::default(),
            tile_size: 0,
            tile_pad: DEFAULT_TILE_PAD,
        }
    }
}

impl EngineSettings {
    pub fn tile_size_override(&self) -> Option<u32> {
        (self.tile_size > 0).then_some(self.tile_size)
    }
}

/// Bundled Real-ESRGAN models.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelPreset {
    X2,
    #[default]
    X4,
}

impl ModelPreset {
    pub fn file_name(self) -> &'static str {
        match self {
            Self::X2 => "RealESRGAN_x2plus_fp16.onnx",
            Self::X4 => "RealESRGAN_x4plus_fp16.onnx",
        }
    }

    pub fn scale(self) -> usize {
        match self {
            Self::X2 => 2,
            Self::X4 => 4,
        }
    }
}

impl fmt::Display for ModelPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::X2 => write!(f, "x2"),
            Self::X4 => write!(f, "x4"),
        }
    }
}

impl FromStr for ModelPreset {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "x2" | "2" => Ok(Self::X2),
            "x4" | "4" => Ok(Self::X4),
            other => bail!("unknown model preset '{other}' (expected x2 or x4)"),
        }
    }
}

/// A model file and the scale it was trained for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelChoice {
    pub path: PathBuf,
    pub scale: usize,
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Model to load: an explicit path with its scale, else the preset's file
    /// under `models_dir` (relative to `data_dir`).
    pub fn resolve_model(
        &self,
        data_dir: &Path,
        explicit: Option<(&Path, usize)>,
        preset: Option<ModelPreset>,
    ) -> Result<ModelChoice> {
        if let Some((path, scale)) = explicit {
            if scale == 0 {
                bail!("model scale must be at least 1");
            }
            return Ok(ModelChoice {
                path: path.to_path_buf(),
                scale,
            });
        }

        let preset = preset.unwrap_or(self.engine.preset);
        let models_dir = resolve_relative_to(data_dir, &self.paths.models_dir);
        Ok(ModelChoice {
            path: models_dir.join(preset.file_name()),
            scale: preset.scale(),
        })
    }

    pub fn trt_cache_dir(&self, data_dir: &Path) -> PathBuf {
        resolve_relative_to(data_dir, &self.paths.trt_cache_dir)
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. UPSCALER_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create `data_dir` and write a default `config.toml` if none exists.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
