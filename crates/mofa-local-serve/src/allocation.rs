//! Allocation policy: device selection and memory/parameter planning.
//!
//! Everything here is a pure function of (snapshot, catalog, processes).
//! The policy never fails: when nothing else fits it degrades to the floor
//! plan on the CPU (2 GB, conservative).

use crate::device::{DeviceCatalog, DeviceKind, Eligibility, SizingRule};
use crate::probe::{ProcessSample, SystemSnapshot, count_resource_intensive, total_process_memory_gb};
use serde::{Deserialize, Serialize};

/// Lower bound on the recommended budget.
pub const MIN_ALLOCATION_GB: f64 = 2.0;
/// Upper bound on the recommended budget.
pub const MAX_ALLOCATION_GB: f64 = 16.0;
/// Upper bound on the memory fraction handed to runtimes.
pub const MAX_MEMORY_FRACTION: f64 = 0.8;
/// Share of total memory kept free for the rest of the system.
pub const SAFETY_MARGIN_RATIO: f64 = 0.2;

const SAFE_AVAILABLE_RATIO: f64 = 0.7;
const CONSERVATIVE_MEMORY_CAP_GB: f64 = 6.0;
/// Integrated GPU selections in [0.25, 0.4) available are flagged low-headroom.
const LOW_HEADROOM_FRACTION: f64 = 0.4;

/// The single current resource decision. Replaced wholesale, never patched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationPlan {
    pub device: DeviceKind,
    pub recommended_memory_gb: f64,
    pub conservative_memory_gb: f64,
    /// Fraction of total memory the runtime may claim, in [0, 0.8]
    pub memory_fraction: f64,
    pub batch_size: u32,
    pub attention_heads: u32,
    pub hidden_size: u32,
    pub use_conservative: bool,
    pub safety_margin_gb: f64,
    #[serde(default)]
    pub low_headroom: bool,
}

impl AllocationPlan {
    /// Budget the loader should actually use.
    pub fn effective_memory_gb(&self) -> f64 {
        if self.use_conservative {
            self.conservative_memory_gb
        } else {
            self.recommended_memory_gb
        }
    }
}

/// Knobs that bend the default policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyOptions {
    /// Preferred device; honoured only when the catalog reports it supported
    pub device_override: Option<DeviceKind>,
}

// ============================================================================
// Selection
// ============================================================================

fn is_eligible(kind: DeviceKind, snapshot: &SystemSnapshot, catalog: &DeviceCatalog) -> bool {
    let profile = kind.profile();
    if profile.eligibility == Eligibility::Always {
        return true;
    }
    if !catalog.is_supported(kind) {
        return false;
    }
    match profile.eligibility {
        Eligibility::MinAvailableFraction(min) => {
            let fraction = snapshot.available_fraction();
            if fraction < min {
                tracing::info!(
                    device = %kind,
                    available_fraction = fraction,
                    "Low memory headroom, skipping device"
                );
                false
            } else {
                true
            }
        }
        Eligibility::MinAvailableGb(min) => {
            let available = snapshot.available_memory_gb();
            if available < min {
                tracing::info!(
                    device = %kind,
                    available_gb = available,
                    required_gb = min,
                    "Insufficient memory, skipping device"
                );
                false
            } else {
                true
            }
        }
        Eligibility::Always => true,
    }
}

/// First eligible device in priority order, honouring a supported override.
pub fn select_device(
    snapshot: &SystemSnapshot,
    catalog: &DeviceCatalog,
    options: &PolicyOptions,
) -> DeviceKind {
    if let Some(kind) = options.device_override {
        if catalog.is_supported(kind) {
            tracing::info!(device = %kind, "Using configured device override");
            return kind;
        }
        tracing::warn!(
            device = %kind,
            "Configured device is not supported, using automatic selection"
        );
    }

    DeviceKind::PRIORITY
        .into_iter()
        .find(|kind| is_eligible(*kind, snapshot, catalog))
        .unwrap_or(DeviceKind::Cpu)
}

// ============================================================================
// Sizing
// ============================================================================

fn build_plan(
    device: DeviceKind,
    sizing: SizingRule,
    snapshot: &SystemSnapshot,
    processes: &[ProcessSample],
    force_conservative: bool,
) -> AllocationPlan {
    let total = snapshot.total_memory_gb();
    let available = snapshot.available_memory_gb();
    let other = total_process_memory_gb(processes);
    let safety_margin = total * SAFETY_MARGIN_RATIO;

    let base = sizing.base_allocation_gb(available, total);
    let safe = base
        .min(available * SAFE_AVAILABLE_RATIO)
        .min(total - other - safety_margin);
    let recommended = safe.clamp(MIN_ALLOCATION_GB, MAX_ALLOCATION_GB);
    let memory_fraction = if total > 0.0 {
        (recommended / total).min(MAX_MEMORY_FRACTION)
    } else {
        0.0
    };

    let use_conservative = force_conservative
        || available < 2.0
        || count_resource_intensive(processes) > 8
        || snapshot.cpu_percent > 95.0
        || safe < MIN_ALLOCATION_GB
        || (device == DeviceKind::IntegratedGpu && available < 3.0);

    let (batch_size, attention_heads, hidden_size, conservative_memory_gb) = if use_conservative {
        (2, 24, 3072, recommended.min(CONSERVATIVE_MEMORY_CAP_GB))
    } else {
        (4, 32, 4096, recommended)
    };

    let low_headroom = device == DeviceKind::IntegratedGpu
        && snapshot.available_fraction() < LOW_HEADROOM_FRACTION;

    tracing::info!(
        device = %device,
        total_gb = total,
        available_gb = available,
        other_processes_gb = other,
        recommended_gb = recommended,
        conservative = use_conservative,
        batch_size,
        "Computed allocation plan"
    );

    AllocationPlan {
        device,
        recommended_memory_gb: recommended,
        conservative_memory_gb,
        memory_fraction,
        batch_size,
        attention_heads,
        hidden_size,
        use_conservative,
        safety_margin_gb: safety_margin,
        low_headroom,
    }
}

/// Select a device and size the plan with default options.
pub fn compute_allocation(
    snapshot: &SystemSnapshot,
    catalog: &DeviceCatalog,
    processes: &[ProcessSample],
) -> AllocationPlan {
    compute_allocation_with(&PolicyOptions::default(), snapshot, catalog, processes)
}

pub fn compute_allocation_with(
    options: &PolicyOptions,
    snapshot: &SystemSnapshot,
    catalog: &DeviceCatalog,
    processes: &[ProcessSample],
) -> AllocationPlan {
    let device = select_device(snapshot, catalog, options);
    build_plan(device, device.profile().sizing, snapshot, processes, false)
}

/// CPU plan used after an integrated-GPU load failure: reduced base budget,
/// conservative forced.
pub fn compute_cpu_fallback(snapshot: &SystemSnapshot, processes: &[ProcessSample]) -> AllocationPlan {
    let kind = DeviceKind::Cpu;
    build_plan(kind, kind.profile().fallback_sizing, snapshot, processes, true)
}

// ============================================================================
// Advice
// ============================================================================

/// Human-readable advice for the operator.
pub fn recommendations(
    snapshot: &SystemSnapshot,
    processes: &[ProcessSample],
    plan: &AllocationPlan,
) -> Vec<String> {
    let mut out = Vec::new();
    if plan.use_conservative {
        out.push("Use conservative memory settings due to system load".to_string());
    }
    if snapshot.available_memory_gb() < 8.0 {
        out.push("Close other applications to free up memory".to_string());
    }
    if snapshot.cpu_percent > 70.0 {
        out.push("System is under high load, consider reducing batch size".to_string());
    }
    if count_resource_intensive(processes) > 3 {
        out.push("Many GPU-intensive applications running, consider closing some".to_string());
    }
    if plan.device == DeviceKind::Cpu {
        out.push("No GPU acceleration available, performance will be limited".to_string());
    }
    if out.is_empty() {
        out.push("System is well-optimized for model loading".to_string());
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckStatus {
    Passed,
    Warning,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationCheck {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
}

/// Pre-flight readiness checks. Warnings do not fail the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub success: bool,
    pub checks: Vec<ValidationCheck>,
}

pub fn validate(
    snapshot: &SystemSnapshot,
    catalog: &DeviceCatalog,
    plan: &AllocationPlan,
) -> ValidationReport {
    let mut checks = Vec::with_capacity(4);
    let available = snapshot.available_memory_gb();

    checks.push(if available < 4.0 {
        ValidationCheck {
            name: "Minimum Memory".into(),
            status: CheckStatus::Failed,
            message: format!("Only {available:.1}GB available, need at least 4GB"),
        }
    } else {
        ValidationCheck {
            name: "Minimum Memory".into(),
            status: CheckStatus::Passed,
            message: format!("Sufficient memory: {available:.1}GB available"),
        }
    });

    let device = catalog.descriptor_or_unsupported(plan.device);
    checks.push(if device.supported {
        ValidationCheck {
            name: "Device Compatibility".into(),
            status: CheckStatus::Passed,
            message: format!("Device {} ({}) supported", plan.device, device.device_name),
        }
    } else {
        ValidationCheck {
            name: "Device Compatibility".into(),
            status: CheckStatus::Failed,
            message: format!(
                "Device {} not supported: {}",
                plan.device,
                device.error_message.unwrap_or_default()
            ),
        }
    });

    checks.push(if plan.recommended_memory_gb < 4.0 {
        ValidationCheck {
            name: "Memory Allocation".into(),
            status: CheckStatus::Warning,
            message: format!(
                "Low allocation: {:.1}GB (conservative mode recommended)",
                plan.recommended_memory_gb
            ),
        }
    } else {
        ValidationCheck {
            name: "Memory Allocation".into(),
            status: CheckStatus::Passed,
            message: format!("Allocation: {:.1}GB", plan.recommended_memory_gb),
        }
    });

    checks.push(if snapshot.cpu_percent > 80.0 {
        ValidationCheck {
            name: "System Load".into(),
            status: CheckStatus::Warning,
            message: format!("High CPU usage: {:.1}%", snapshot.cpu_percent),
        }
    } else {
        ValidationCheck {
            name: "System Load".into(),
            status: CheckStatus::Passed,
            message: format!("CPU usage: {:.1}%", snapshot.cpu_percent),
        }
    });

    let success = checks.iter().all(|c| c.status != CheckStatus::Failed);
    ValidationReport { success, checks }
}

// ============================================================================
// Tests
// ============================================================================
