//! Tile budget estimation: how many input pixels one inference call may cover.
//!
//! The budget is `available_bytes / coefficient`, where the coefficient is an
//! empirical bytes-per-input-pixel cost for a given (backend, precision) pair.
//! The tile side follows from the budget and is aligned so that every grid tile
//! is a valid model input.

use std::process::Stdio;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::{debug, info, warn};

use crate::backend::InferenceBackend;
use crate::engine::Precision;

/// Used when the resource probe fails.
pub const FALLBACK_AVAILABLE_BYTES: u64 = 2 * 1024 * 1024 * 1024;

pub const TILE_SIDE_ALIGN: u32 = 32;

pub const MIN_TILE_SIDE: u32 = 256;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemoryCoefficient {
    pub backend: InferenceBackend,
    pub precision: Precision,
    pub bytes_per_pixel: u64,
}

impl MemoryCoefficient {
    const fn new(backend: InferenceBackend, precision: Precision, bytes_per_pixel: u64) -> Self {
        Self {
            backend,
            precision,
            bytes_per_pixel,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BudgetConfig {
    pub fallback_available_bytes: u64,
    pub coefficients: Vec<MemoryCoefficient>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        use InferenceBackend::{Cpu, Cuda, Tensorrt};
        use Precision::{F16, F32};

        Self {
            fallback_available_bytes: FALLBACK_AVAILABLE_BYTES,
            coefficients: vec![
                MemoryCoefficient::new(Tensorrt, F16, 12_000),
                MemoryCoefficient::new(Tensorrt, F32, 24_000),
                MemoryCoefficient::new(Cuda, F16, 16_000),
                MemoryCoefficient::new(Cuda, F32, 32_000),
                MemoryCoefficient::new(Cpu, F16, 40_000),
                MemoryCoefficient::new(Cpu, F32, 40_000),
            ],
        }
    }
}

impl BudgetConfig {
    /// Bytes per input pixel for `(backend, precision)`.
    ///
    /// Unknown pairs get the largest configured coefficient.
    pub fn coefficient(&self, backend: InferenceBackend, precision: Precision) -> u64 {
        self.coefficients
            .iter()
            .find(|c| c.backend == backend && c.precision == precision)
            .or_else(|| self.coefficients.iter().max_by_key(|c| c.bytes_per_pixel))
            .map(|c| c.bytes_per_pixel)
            .unwrap_or(40_000)
            .max(1)
    }
}

/// Pixel-area ceiling for one inference call. Fixed for the engine's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileBudget {
    pixels: u64,
}

impl TileBudget {
    pub fn from_pixels(pixels: u64) -> Self {
        Self {
            pixels: pixels.max(1),
        }
    }

    /// Budget whose tile side is `side` (after alignment and clamping).
    pub fn from_tile_side(side: u32) -> Self {
        let side = align_tile_side(side as u64) as u64;
        Self::from_pixels(side * side)
    }

    pub fn pixels(&self) -> u64 {
        self.pixels
    }

    /// `floor(sqrt(pixels))`, rounded down to a multiple of 32, at least 256.
    pub fn tile_side(&self) -> u32 {
        align_tile_side(integer_sqrt(self.pixels))
    }
}

fn align_tile_side(side: u64) -> u32 {
    let aligned = side / TILE_SIDE_ALIGN as u64 * TILE_SIDE_ALIGN as u64;
    aligned.clamp(MIN_TILE_SIDE as u64, u32::MAX as u64) as u32
}

fn integer_sqrt(value: u64) -> u64 {
    let mut root = (value as f64).sqrt() as u64;
    while root.checked_mul(root).map_or(true, |square| square > value) {
        root -= 1;
    }
    while (root + 1)
        .checked_mul(root + 1)
        .is_some_and(|square| square <= value)
    {
        root += 1;
    }
    root
}

pub fn compute_budget(
    backend: InferenceBackend,
    precision: Precision,
    available_bytes: u64,
    config: &BudgetConfig,
) -> TileBudget {
    let coefficient = config.coefficient(backend, precision);
    TileBudget::from_pixels(available_bytes / coefficient)
}

/// Source of the "available memory" figure used to size tiles.
pub trait ResourceProbe {
    fn name(&self) -> &str;
    fn available_bytes(&self) -> Result<u64>;
}

/// Probe once. A failed or zero reading yields
/// [`BudgetConfig::fallback_available_bytes`].
pub fn probe_available_bytes(probe: &dyn ResourceProbe, config: &BudgetConfig) -> u64 {
    match probe.available_bytes() {
        Ok(bytes) if bytes > 0 => bytes,
        Ok(_) => {
            warn!(
                probe = probe.name(),
                fallback_bytes = config.fallback_available_bytes,
                "Resource probe reported zero available memory; using fallback budget"
            );
            config.fallback_available_bytes
        }
        Err(error) => {
            warn!(
                probe = probe.name(),
                fallback_bytes = config.fallback_available_bytes,
                error = %format!("{error:#}"),
                "Resource probe failed; using fallback budget"
            );
            config.fallback_available_bytes
        }
    }
}

pub fn estimate_budget(
    probe: &dyn ResourceProbe,
    backend: InferenceBackend,
    precision: Precision,
    config: &BudgetConfig,
) -> TileBudget {
    let available_bytes = probe_available_bytes(probe, config);
    let budget = compute_budget(backend, precision, available_bytes, config);
    info!(
        probe = probe.name(),
        %backend,
        %precision,
        available_bytes,
        pixel_budget = budget.pixels(),
        tile_side = budget.tile_side(),
        "Tile budget computed"
    );
    budget
}

/// Host RAM, for the CPU backend.
pub struct SystemMemoryProbe;

impl ResourceProbe for SystemMemoryProbe {
    fn name(&self) -> &str {
        "system_memory"
    }

    fn available_bytes(&self) -> Result<u64> {
        let mut system = System::new();
        system.refresh_memory();
        let available = system.available_memory();
        if available == 0 {
            bail!("sysinfo reported no available memory");
        }
        Ok(available)
    }
}

/// Free memory of one NVIDIA device, queried through `nvidia-smi`.
pub struct NvidiaSmiProbe {
    pub device_id: u32,
}

impl ResourceProbe for NvidiaSmiProbe {
    fn name(&self) -> &str {
        "nvidia_smi"
    }

    fn available_bytes(&self) -> Result<u64> {
        let output = crate::runtime::command_for("nvidia-smi")
            .args([
                "--query-gpu=memory.free",
                "--format=csv,noheader,nounits",
            ])
            .arg(format!("--id={}", self.device_id))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .context("failed to execute nvidia-smi")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "nvidia-smi exited with status {}: {}",
                output.status,
                stderr.trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        debug!(device_id = self.device_id, raw = %stdout.trim(), "nvidia-smi memory query");
        parse_nvidia_smi_free_mib(&stdout)
    }
}

fn parse_nvidia_smi_free_mib(stdout: &str) -> Result<u64> {
    let line = stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .context("nvidia-smi returned no output")?;
    let mib: u64 = line
        .parse()
        .with_context(|| format!("unexpected nvidia-smi memory value: {line:?}"))?;
    Ok(mib * 1024 * 1024)
}

/// Constant figure; for tests and for `--tile-size` style overrides.
pub struct FixedProbe(pub u64);

impl ResourceProbe for FixedProbe {
    fn name(&self) -> &str {
        "fixed"
    }

    fn available_bytes(&self) -> Result<u64> {
        Ok(self.0)
    }
}

/// GPU backends are sized by device memory, CPU by host RAM.
pub fn probe_for_backend(backend: InferenceBackend) -> Box<dyn ResourceProbe> {
    match backend {
        InferenceBackend::Cuda | InferenceBackend::Tensorrt => {
            Box::new(NvidiaSmiProbe { device_id: 0 })
        }
        InferenceBackend::Cpu => Box::new(SystemMemoryProbe),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingProbe;

    impl ResourceProbe for FailingProbe {
        fn name(&self) -> &str {
            "failing"
        }

        fn available_bytes(&self) -> Result<u64> {
            bail!("no device")
        }
    }

    #[test]
    fn test_budget_for_8_gib_is_aligned() {
        let config = BudgetConfig::default();
        for coefficient in &config.coefficients {
            let budget = compute_budget(
                coefficient.backend,
                coefficient.precision,
                8 * (1 << 30),
                &config,
            );
            let side = budget.tile_side();
            assert_eq!(side % TILE_SIDE_ALIGN, 0, "{coefficient:?} -> {side}");
            assert!(side >= MIN_TILE_SIDE, "{coefficient:?} -> {side}");
        }
    }

    #[test]
    fn test_budget_cuda_fp16_8_gib() {
        let config = BudgetConfig::default();
        let budget = compute_budget(InferenceBackend::Cuda, Precision::F16, 8 * (1 << 30), &config);
        // 8 GiB / 16000 = 536870 px, sqrt = 732, aligned down to 704.
        assert_eq!(budget.pixels(), 536_870);
        assert_eq!(budget.tile_side(), 704);
    }

    #[test]
    fn test_tile_side_clamps_to_minimum() {
        assert_eq!(TileBudget::from_pixels(1).tile_side(), MIN_TILE_SIDE);
        assert_eq!(TileBudget::from_pixels(0).tile_side(), MIN_TILE_SIDE);
        assert_eq!(TileBudget::from_pixels(300 * 300).tile_side(), 288);
    }

    #[test]
    fn test_from_tile_side_aligns() {
        assert_eq!(TileBudget::from_tile_side(500).tile_side(), 480);
        assert_eq!(TileBudget::from_tile_side(100).tile_side(), MIN_TILE_SIDE);
        assert_eq!(TileBudget::from_tile_side(512).tile_side(), 512);
    }

    #[test]
    fn test_integer_sqrt_exact() {
        assert_eq!(integer_sqrt(0), 0);
        assert_eq!(integer_sqrt(15), 3);
        assert_eq!(integer_sqrt(16), 4);
        assert_eq!(integer_sqrt(u64::MAX), 4_294_967_295);
    }

    #[test]
    fn test_unknown_pair_uses_largest_coefficient() {
        let config = BudgetConfig {
            fallback_available_bytes: FALLBACK_AVAILABLE_BYTES,
            coefficients: vec![
                MemoryCoefficient::new(InferenceBackend::Cuda, Precision::F16, 10),
                MemoryCoefficient::new(InferenceBackend::Cuda, Precision::F32, 20),
            ],
        };
        assert_eq!(config.coefficient(InferenceBackend::Cpu, Precision::F32), 20);
        assert_eq!(config.coefficient(InferenceBackend::Cuda, Precision::F16), 10);
    }

    #[test]
    fn test_failed_probe_uses_fallback() {
        let config = BudgetConfig::default();
        let budget = estimate_budget(&FailingProbe, InferenceBackend::Cuda, Precision::F16, &config);
        let expected = compute_budget(
            InferenceBackend::Cuda,
            Precision::F16,
            FALLBACK_AVAILABLE_BYTES,
            &config,
        );
        assert_eq!(budget, expected);
    }

    #[test]
    fn test_zero_reading_uses_fallback() {
        let config = BudgetConfig {
            fallback_available_bytes: 3 << 30,
            ..BudgetConfig::default()
        };
        assert_eq!(probe_available_bytes(&FixedProbe(0), &config), 3 << 30);
        assert_eq!(probe_available_bytes(&FailingProbe, &config), 3 << 30);
        assert_eq!(probe_available_bytes(&FixedProbe(1 << 30), &config), 1 << 30);
    }

    #[test]
    fn test_fixed_probe_budget() {
        let config = BudgetConfig::default();
        let budget = estimate_budget(
            &FixedProbe(8 * (1 << 30)),
            InferenceBackend::Cuda,
            Precision::F16,
            &config,
        );
        assert_eq!(budget.tile_side(), 704);
    }

    #[test]
    fn test_parse_nvidia_smi_output() {
        assert_eq!(
            parse_nvidia_smi_free_mib("8123\n").unwrap(),
            8123 * 1024 * 1024
        );
        assert_eq!(parse_nvidia_smi_free_mib("\n  512 \n").unwrap(), 512 << 20);
        assert!(parse_nvidia_smi_free_mib("").is_err());
        assert!(parse_nvidia_smi_free_mib("[N/A]").is_err());
    }

    #[test]
    fn test_budget_config_toml_roundtrip() {
        let original = BudgetConfig::default();
        let encoded = toml::to_string_pretty(&original).expect("serialize budget config");
        let decoded: BudgetConfig = toml::from_str(&encoded).expect("deserialize budget config");
        assert_eq!(decoded, original);
    }
}
