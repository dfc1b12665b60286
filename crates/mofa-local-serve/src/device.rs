//! Device kinds and the kind-indexed strategy table.
//!
//! Every place that needs to branch on the compute backend (catalog,
//! allocation policy, loader parameters, monitor thresholds) reads the
//! [`DeviceProfile`] for the kind instead of keeping its own ladder.
//!
//! Selection priority: **integrated GPU** → **discrete GPU** →
//! **secondary GPU family** → **CPU**.

use crate::loader::params::GpuLayers;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Compute backends a model can run on. Mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Unified-memory GPU sharing system RAM (Apple Silicon / Metal)
    IntegratedGpu,
    /// Discrete GPU with dedicated VRAM (NVIDIA CUDA)
    DiscreteGpu,
    /// Secondary GPU family (AMD ROCm)
    SecondaryGpu,
    /// CPU only. Always available, lowest throughput
    Cpu,
}

impl DeviceKind {
    /// Selection priority, first eligible wins.
    pub const PRIORITY: [DeviceKind; 4] = [
        DeviceKind::IntegratedGpu,
        DeviceKind::DiscreteGpu,
        DeviceKind::SecondaryGpu,
        DeviceKind::Cpu,
    ];

    /// Strategy table entry for this kind.
    pub fn profile(self) -> &'static DeviceProfile {
        match self {
            DeviceKind::IntegratedGpu => &PROFILES[0],
            DeviceKind::DiscreteGpu => &PROFILES[1],
            DeviceKind::SecondaryGpu => &PROFILES[2],
            DeviceKind::Cpu => &PROFILES[3],
        }
    }

    pub fn is_gpu(self) -> bool {
        !matches!(self, DeviceKind::Cpu)
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.profile().label)
    }
}

/// Coarse capability class of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceTier {
    Legacy,
    Standard,
    Pro,
    Ultra,
    /// Backend not present on this host
    Unsupported,
    /// Probing the backend failed
    Error,
}

impl std::fmt::Display for PerformanceTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PerformanceTier::Legacy => "Legacy",
            PerformanceTier::Standard => "Standard",
            PerformanceTier::Pro => "Pro",
            PerformanceTier::Ultra => "Ultra",
            PerformanceTier::Unsupported => "Unsupported",
            PerformanceTier::Error => "Error",
        };
        f.write_str(s)
    }
}

/// What one backend looks like on this host right now.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub device_type: DeviceKind,
    pub device_name: String,
    /// Estimated usable memory in GB
    pub memory_gb: f64,
    pub performance_tier: PerformanceTier,
    pub supported: bool,
    pub error_message: Option<String>,
}

impl DeviceDescriptor {
    pub fn supported(
        kind: DeviceKind,
        name: impl Into<String>,
        memory_gb: f64,
        tier: PerformanceTier,
    ) -> Self {
        Self {
            device_type: kind,
            device_name: name.into(),
            memory_gb,
            performance_tier: tier,
            supported: true,
            error_message: None,
        }
    }

    /// Backend absent on this host (expected, non-fatal).
    pub fn unsupported(kind: DeviceKind, reason: impl Into<String>) -> Self {
        Self {
            device_type: kind,
            device_name: kind.profile().default_name.to_string(),
            memory_gb: 0.0,
            performance_tier: PerformanceTier::Unsupported,
            supported: false,
            error_message: Some(reason.into()),
        }
    }

    /// Backend probe itself failed.
    pub fn failed(kind: DeviceKind, error: impl Into<String>) -> Self {
        Self {
            device_type: kind,
            device_name: kind.profile().default_name.to_string(),
            memory_gb: 0.0,
            performance_tier: PerformanceTier::Error,
            supported: false,
            error_message: Some(error.into()),
        }
    }
}

/// Descriptors for every device kind, recomputed wholesale on each enumeration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceCatalog {
    devices: BTreeMap<DeviceKind, DeviceDescriptor>,
}

impl DeviceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_descriptors(descriptors: impl IntoIterator<Item = DeviceDescriptor>) -> Self {
        let mut catalog = Self::new();
        for d in descriptors {
            catalog.insert(d);
        }
        catalog
    }

    pub fn insert(&mut self, descriptor: DeviceDescriptor) {
        self.devices.insert(descriptor.device_type, descriptor);
    }

    pub fn get(&self, kind: DeviceKind) -> Option<&DeviceDescriptor> {
        self.devices.get(&kind)
    }

    pub fn is_supported(&self, kind: DeviceKind) -> bool {
        self.get(kind).map(|d| d.supported).unwrap_or(false)
    }

    /// Descriptor for `kind`, or an "unsupported" placeholder if missing.
    pub fn descriptor_or_unsupported(&self, kind: DeviceKind) -> DeviceDescriptor {
        self.get(kind)
            .cloned()
            .unwrap_or_else(|| DeviceDescriptor::unsupported(kind, "not enumerated"))
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceDescriptor> {
        self.devices.values()
    }

    pub fn supported_kinds(&self) -> Vec<DeviceKind> {
        self.devices
            .values()
            .filter(|d| d.supported)
            .map(|d| d.device_type)
            .collect()
    }
}

// ============================================================================
// Strategy table
// ============================================================================

/// When a device may be selected.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Eligibility {
    /// Unified memory: requires at least this fraction of total memory free
    MinAvailableFraction(f64),
    /// Dedicated device: requires at least this much free system memory (GB)
    MinAvailableGb(f64),
    /// Terminal fallback
    Always,
}

/// One sizing band: applies while available/total is below `below_fraction`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizingBand {
    pub below_fraction: f64,
    pub cap_gb: f64,
    pub ratio: f64,
}

/// Base memory allocation before the safety reduction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SizingRule {
    /// `min(cap_gb, ratio × available)`
    Linear { cap_gb: f64, ratio: f64 },
    /// First band whose `below_fraction` exceeds available/total wins
    AvailableFractionBands(&'static [SizingBand]),
}

impl SizingRule {
    pub fn base_allocation_gb(&self, available_gb: f64, total_gb: f64) -> f64 {
        match self {
            SizingRule::Linear { cap_gb, ratio } => cap_gb.min(available_gb * ratio),
            SizingRule::AvailableFractionBands(bands) => {
                let fraction = if total_gb > 0.0 { available_gb / total_gb } else { 0.0 };
                let band = bands
                    .iter()
                    .find(|b| fraction < b.below_fraction)
                    .or_else(|| bands.last());
                match band {
                    Some(b) => b.cap_gb.min(available_gb * b.ratio),
                    None => 0.0,
                }
            }
        }
    }
}

/// One packed-format band: applies while available memory exceeds `above_gb`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PackedBand {
    pub above_gb: f64,
    pub gpu_layers: GpuLayers,
    pub batch: u32,
}

/// Packed-runtime offload/batch defaults.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PackedRule {
    /// First band whose `above_gb` is exceeded by available memory wins
    AvailableMemoryBands(&'static [PackedBand]),
    Fixed { gpu_layers: GpuLayers, batch: u32 },
}

/// Everything kind-specific, in one place.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceProfile {
    pub kind: DeviceKind,
    pub label: &'static str,
    pub default_name: &'static str,
    pub eligibility: Eligibility,
    pub sizing: SizingRule,
    /// Budget cap used when the loader falls back onto this device
    pub fallback_sizing: SizingRule,
    pub memory_warning_gb: f64,
    pub memory_critical_gb: f64,
    pub packed: PackedRule,
    /// Use only half the logical cores for packed inference threads
    pub half_threads: bool,
}

const INTEGRATED_SIZING: [SizingBand; 3] = [
    SizingBand { below_fraction: 0.3, cap_gb: 2.0, ratio: 0.3 },
    SizingBand { below_fraction: 0.5, cap_gb: 4.0, ratio: 0.4 },
    SizingBand { below_fraction: f64::INFINITY, cap_gb: 6.0, ratio: 0.5 },
];

const INTEGRATED_PACKED: [PackedBand; 3] = [
    PackedBand { above_gb: 8.0, gpu_layers: GpuLayers::Count(1), batch: 1024 },
    PackedBand { above_gb: 4.0, gpu_layers: GpuLayers::Count(1), batch: 512 },
    PackedBand { above_gb: f64::NEG_INFINITY, gpu_layers: GpuLayers::Count(0), batch: 256 },
];

static PROFILES: [DeviceProfile; 4] = [
    DeviceProfile {
        kind: DeviceKind::IntegratedGpu,
        label: "integrated-gpu",
        default_name: "Apple Silicon GPU",
        eligibility: Eligibility::MinAvailableFraction(0.25),
        sizing: SizingRule::AvailableFractionBands(&INTEGRATED_SIZING),
        fallback_sizing: SizingRule::Linear { cap_gb: 6.0, ratio: 0.5 },
        memory_warning_gb: 4.0,
        memory_critical_gb: 2.0,
        packed: PackedRule::AvailableMemoryBands(&INTEGRATED_PACKED),
        half_threads: false,
    },
    DeviceProfile {
        kind: DeviceKind::DiscreteGpu,
        label: "discrete-gpu",
        default_name: "NVIDIA CUDA",
        eligibility: Eligibility::MinAvailableGb(6.0),
        sizing: SizingRule::Linear { cap_gb: 12.0, ratio: 0.6 },
        fallback_sizing: SizingRule::Linear { cap_gb: 12.0, ratio: 0.6 },
        memory_warning_gb: 6.0,
        memory_critical_gb: 3.0,
        packed: PackedRule::Fixed { gpu_layers: GpuLayers::All, batch: 2048 },
        half_threads: false,
    },
    DeviceProfile {
        kind: DeviceKind::SecondaryGpu,
        label: "secondary-gpu",
        default_name: "AMD ROCm",
        eligibility: Eligibility::MinAvailableGb(6.0),
        sizing: SizingRule::Linear { cap_gb: 12.0, ratio: 0.6 },
        fallback_sizing: SizingRule::Linear { cap_gb: 12.0, ratio: 0.6 },
        memory_warning_gb: 6.0,
        memory_critical_gb: 3.0,
        packed: PackedRule::Fixed { gpu_layers: GpuLayers::All, batch: 1024 },
        half_threads: false,
    },
    DeviceProfile {
        kind: DeviceKind::Cpu,
        label: "cpu",
        default_name: "CPU",
        eligibility: Eligibility::Always,
        sizing: SizingRule::Linear { cap_gb: 8.0, ratio: 0.7 },
        fallback_sizing: SizingRule::Linear { cap_gb: 8.0, ratio: 0.6 },
        memory_warning_gb: 8.0,
        memory_critical_gb: 4.0,
        packed: PackedRule::Fixed { gpu_layers: GpuLayers::Count(0), batch: 256 },
        half_threads: true,
    },
];

// ============================================================================
// Tests
// ============================================================================
