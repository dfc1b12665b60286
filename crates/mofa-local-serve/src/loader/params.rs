//! Backend-specific load parameters.

use crate::allocation::AllocationPlan;
use crate::config::LoaderConfig;
use crate::device::{DeviceKind, PackedRule};
use crate::loader::format::ModelFormat;
use crate::probe::SystemSnapshot;
use serde::{Deserialize, Serialize};

/// Context window for packed models.
pub const DEFAULT_CONTEXT: u32 = 2048;
/// Input truncation for full-precision models, in tokens.
pub const FULL_PRECISION_MAX_INPUT_TOKENS: u32 = 1024;

/// How many transformer layers to offload to the GPU.
///
/// Serialized as a plain integer, `-1` meaning every layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum GpuLayers {
    All,
    Count(u32),
}

impl From<i32> for GpuLayers {
    fn from(v: i32) -> Self {
        if v < 0 {
            GpuLayers::All
        } else {
            GpuLayers::Count(v as u32)
        }
    }
}

impl From<GpuLayers> for i32 {
    fn from(v: GpuLayers) -> Self {
        match v {
            GpuLayers::All => -1,
            GpuLayers::Count(n) => n.min(i32::MAX as u32) as i32,
        }
    }
}

/// Parameters for the packed (quantized) runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackedParams {
    pub n_gpu_layers: GpuLayers,
    pub n_batch: u32,
    pub n_ctx: u32,
    /// `None` lets the runtime pick
    pub n_threads: Option<usize>,
    pub use_mmap: bool,
    pub use_mlock: bool,
}

impl PackedParams {
    /// Device defaults, then configured overrides.
    pub fn for_device(
        kind: DeviceKind,
        snapshot: &SystemSnapshot,
        overrides: &LoaderConfig,
    ) -> Self {
        let profile = kind.profile();
        let (gpu_layers, batch) = match profile.packed {
            PackedRule::Fixed { gpu_layers, batch } => (gpu_layers, batch),
            PackedRule::AvailableMemoryBands(bands) => {
                let available = snapshot.available_memory_gb();
                bands
                    .iter()
                    .find(|b| available > b.above_gb)
                    .map(|b| (b.gpu_layers, b.batch))
                    .unwrap_or((GpuLayers::Count(0), 256))
            }
        };
        let threads = profile
            .half_threads
            .then(|| (snapshot.cpu_cores / 2).max(1));

        Self {
            n_gpu_layers: overrides.n_gpu_layers.unwrap_or(gpu_layers),
            n_batch: overrides.n_batch.unwrap_or(batch),
            n_ctx: overrides.n_ctx.unwrap_or(DEFAULT_CONTEXT),
            n_threads: overrides.n_threads.or(threads),
            use_mmap: true,
            use_mlock: false,
        }
    }
}

/// Parameters for the full-precision runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullPrecisionParams {
    pub device: DeviceKind,
    pub memory_budget_gb: f64,
    pub half_precision: bool,
    pub max_input_tokens: u32,
}

impl FullPrecisionParams {
    pub fn for_plan(plan: &AllocationPlan) -> Self {
        Self {
            device: plan.device,
            memory_budget_gb: plan.effective_memory_gb(),
            half_precision: plan.device.is_gpu(),
            max_input_tokens: FULL_PRECISION_MAX_INPUT_TOKENS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum LoadParameters {
    Packed(PackedParams),
    FullPrecision(FullPrecisionParams),
}

impl LoadParameters {
    pub fn build(
        format: ModelFormat,
        plan: &AllocationPlan,
        snapshot: &SystemSnapshot,
        overrides: &LoaderConfig,
    ) -> Self {
        match format {
            ModelFormat::Packed => {
                LoadParameters::Packed(PackedParams::for_device(plan.device, snapshot, overrides))
            }
            ModelFormat::FullPrecision => {
                LoadParameters::FullPrecision(FullPrecisionParams::for_plan(plan))
            }
        }
    }
}
