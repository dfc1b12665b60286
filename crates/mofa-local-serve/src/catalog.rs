//! Device enumeration.
//!
//! Each backend is probed independently through filesystem checks and vendor
//! command-line tools rather than linking GPU libraries at compile time. A
//! failing probe marks only its own descriptor unsupported; enumeration of the
//! remaining kinds continues.

use crate::device::{DeviceCatalog, DeviceDescriptor, DeviceKind, PerformanceTier};
use crate::probe::SystemSnapshot;
use regex::Regex;
use std::path::Path;
use std::process::Command;
use std::sync::LazyLock;

static CHIPSET_MODEL: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"Chipset Model:\s*(.+)").ok());

/// Probe every device kind on the local host.
pub fn enumerate_devices(snapshot: &SystemSnapshot) -> DeviceCatalog {
    let catalog = DeviceCatalog::from_descriptors([
        detect_integrated(snapshot),
        detect_discrete(),
        detect_secondary(),
        cpu_descriptor(snapshot.cpu_cores, snapshot.total_memory_gb()),
    ]);

    for d in catalog.iter() {
        if d.supported {
            tracing::info!(
                device = %d.device_type,
                name = %d.device_name,
                memory_gb = d.memory_gb,
                tier = %d.performance_tier,
                "Device available"
            );
        } else {
            tracing::debug!(
                device = %d.device_type,
                reason = d.error_message.as_deref().unwrap_or(""),
                "Device not available"
            );
        }
    }
    catalog
}

// ============================================================================
// Integrated GPU (unified memory)
// ============================================================================

fn detect_integrated(snapshot: &SystemSnapshot) -> DeviceDescriptor {
    if !snapshot.is_unified_memory_platform() {
        return DeviceDescriptor::unsupported(
            DeviceKind::IntegratedGpu,
            "Metal not available on this platform",
        );
    }

    let chipset = match Command::new("system_profiler")
        .arg("SPDisplaysDataType")
        .output()
    {
        Ok(out) if out.status.success() => {
            parse_chipset_model(&String::from_utf8_lossy(&out.stdout))
        }
        Ok(out) => {
            tracing::warn!(status = %out.status, "system_profiler failed");
            None
        }
        Err(e) => {
            tracing::warn!(error = %e, "Could not run system_profiler");
            None
        }
    };

    classify_integrated(chipset.as_deref(), snapshot.total_memory_gb())
}

/// First `Chipset Model:` value in `system_profiler` output.
pub fn parse_chipset_model(output: &str) -> Option<String> {
    CHIPSET_MODEL
        .as_ref()?
        .captures(output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Tier and usable-memory estimate from the chipset name.
///
/// Unknown chipset: Standard with 80% of system memory.
pub fn classify_integrated(chipset: Option<&str>, total_gb: f64) -> DeviceDescriptor {
    let kind = DeviceKind::IntegratedGpu;
    let Some(name) = chipset else {
        return DeviceDescriptor::supported(
            kind,
            "Apple Silicon",
            total_gb * 0.8,
            PerformanceTier::Standard,
        );
    };

    let lower = name.to_lowercase();
    let (tier, memory_gb) = if lower.contains("ultra") {
        (PerformanceTier::Ultra, (total_gb * 0.85).min(32.0))
    } else if lower.contains("max") {
        (PerformanceTier::Pro, (total_gb * 0.8).min(20.0))
    } else if lower.contains("pro") {
        (PerformanceTier::Pro, (total_gb * 0.75).min(16.0))
    } else {
        (PerformanceTier::Standard, (total_gb * 0.7).min(12.0))
    };
    DeviceDescriptor::supported(kind, name, memory_gb, tier)
}

// ============================================================================
// Discrete GPU (CUDA)
// ============================================================================

/// One row of `nvidia-smi --query-gpu=name,memory.total,memory.free`.
#[derive(Debug, Clone, PartialEq)]
pub struct NvidiaGpu {
    pub name: String,
    pub memory_total_mib: u64,
    pub memory_free_mib: u64,
}

fn query_nvidia() -> Result<Option<NvidiaGpu>, String> {
    let output = match Command::new("nvidia-smi")
        .args([
            "--query-gpu=name,memory.total,memory.free",
            "--format=csv,noheader,nounits",
        ])
        .output()
    {
        Ok(o) => o,
        // Tool not installed: backend absent rather than broken
        Err(_) => return Ok(None),
    };
    if !output.status.success() {
        return Ok(None);
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_nvidia_smi(&stdout)
        .map(Some)
        .ok_or_else(|| format!("unparseable nvidia-smi output: {}", stdout.trim()))
}

/// Parse the first GPU row of `nvidia-smi` CSV output (MiB units).
pub fn parse_nvidia_smi(stdout: &str) -> Option<NvidiaGpu> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    if parts.len() < 3 {
        return None;
    }
    Some(NvidiaGpu {
        name: parts[0].to_string(),
        memory_total_mib: parts[1].parse().ok()?,
        memory_free_mib: parts[2].parse().ok()?,
    })
}

fn detect_discrete() -> DeviceDescriptor {
    let kind = DeviceKind::DiscreteGpu;
    match query_nvidia() {
        Ok(Some(gpu)) => DeviceDescriptor::supported(
            kind,
            gpu.name.clone(),
            gpu.memory_total_mib as f64 / 1024.0,
            classify_discrete_tier(&gpu.name),
        ),
        Ok(None) => DeviceDescriptor::unsupported(kind, "CUDA not available"),
        Err(e) => {
            tracing::warn!(error = %e, "CUDA probe failed");
            DeviceDescriptor::failed(kind, e)
        }
    }
}

/// Free discrete GPU memory in GB, when a CUDA device reports it.
pub fn discrete_free_memory_gb() -> Option<f64> {
    match query_nvidia() {
        Ok(Some(gpu)) => Some(gpu.memory_free_mib as f64 / 1024.0),
        _ => None,
    }
}

pub fn classify_discrete_tier(name: &str) -> PerformanceTier {
    let lower = name.to_lowercase();
    let has = |s: &str| lower.contains(s);
    if has("rtx 4090") || has("rtx 4080") {
        PerformanceTier::Ultra
    } else if has("rtx 3090") || has("rtx 3080") || has("rtx 4070") || has("rtx 4060") {
        PerformanceTier::Pro
    } else if has("gtx") || has("rtx") {
        PerformanceTier::Standard
    } else {
        PerformanceTier::Legacy
    }
}

// ============================================================================
// Secondary GPU family (ROCm)
// ============================================================================

/// Fixed usable-memory estimate; rocm-smi output is not trusted for sizing.
const SECONDARY_MEMORY_GB: f64 = 12.0;

fn detect_secondary() -> DeviceDescriptor {
    let kind = DeviceKind::SecondaryGpu;
    // AMD Kernel Fusion Driver, required for ROCm
    if !Path::new("/dev/kfd").exists() {
        return DeviceDescriptor::unsupported(kind, "ROCm not available");
    }
    match Command::new("rocm-smi").arg("--showproductname").output() {
        Ok(out) if out.status.success() => DeviceDescriptor::supported(
            kind,
            "AMD GPU (ROCm)",
            SECONDARY_MEMORY_GB,
            PerformanceTier::Standard,
        ),
        Ok(out) => DeviceDescriptor::failed(kind, format!("rocm-smi exited with {}", out.status)),
        Err(e) => DeviceDescriptor::unsupported(kind, format!("rocm-smi unavailable: {e}")),
    }
}

// ============================================================================
// CPU
// ============================================================================

pub fn cpu_descriptor(cores: usize, total_gb: f64) -> DeviceDescriptor {
    let (tier, memory_gb) = if cores >= 16 {
        (PerformanceTier::Pro, (total_gb * 0.6).min(12.0))
    } else if cores >= 8 {
        (PerformanceTier::Standard, (total_gb * 0.5).min(8.0))
    } else {
        (PerformanceTier::Legacy, (total_gb * 0.4).min(4.0))
    };
    DeviceDescriptor::supported(DeviceKind::Cpu, format!("CPU ({cores} cores)"), memory_gb, tier)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chipset_model() {
        let out = "Graphics/Displays:\n\n    Apple M2 Max:\n\n      Chipset Model: Apple M2 Max\n      Type: GPU\n";
        assert_eq!(parse_chipset_model(out).as_deref(), Some("Apple M2 Max"));
        assert_eq!(parse_chipset_model("nothing here"), None);
    }

    #[test]
    fn test_integrated_tiers() {
        let ultra = classify_integrated(Some("Apple M2 Ultra"), 64.0);
        assert_eq!(ultra.performance_tier, PerformanceTier::Ultra);
        assert_eq!(ultra.memory_gb, 32.0);

        let max = classify_integrated(Some("Apple M3 Max"), 16.0);
        assert_eq!(max.performance_tier, PerformanceTier::Pro);
        assert!((max.memory_gb - 12.8).abs() < 1e-9);

        let pro = classify_integrated(Some("Apple M1 Pro"), 32.0);
        assert_eq!(pro.performance_tier, PerformanceTier::Pro);
        assert_eq!(pro.memory_gb, 16.0);

        let base = classify_integrated(Some("Apple M1"), 8.0);
        assert_eq!(base.performance_tier, PerformanceTier::Standard);
        assert!((base.memory_gb - 5.6).abs() < 1e-9);
    }

    #[test]
    fn test_integrated_unknown_chipset() {
        let d = classify_integrated(None, 16.0);
        assert!(d.supported);
        assert_eq!(d.performance_tier, PerformanceTier::Standard);
        assert!((d.memory_gb - 12.8).abs() < 1e-9);
    }

    #[test]
    fn test_parse_nvidia_smi() {
        let gpu = parse_nvidia_smi("NVIDIA GeForce RTX 4090, 24564, 23000\n").unwrap();
        assert_eq!(gpu.name, "NVIDIA GeForce RTX 4090");
        assert_eq!(gpu.memory_total_mib, 24564);
        assert_eq!(gpu.memory_free_mib, 23000);

        assert!(parse_nvidia_smi("garbage").is_none());
        assert!(parse_nvidia_smi("").is_none());
    }

    #[test]
    fn test_discrete_tiers() {
        assert_eq!(classify_discrete_tier("NVIDIA GeForce RTX 4080"), PerformanceTier::Ultra);
        assert_eq!(classify_discrete_tier("NVIDIA GeForce RTX 3090"), PerformanceTier::Pro);
        assert_eq!(classify_discrete_tier("NVIDIA GeForce RTX 4060"), PerformanceTier::Pro);
        assert_eq!(classify_discrete_tier("NVIDIA GeForce GTX 1080"), PerformanceTier::Standard);
        assert_eq!(classify_discrete_tier("Tesla T4"), PerformanceTier::Legacy);
    }

    #[test]
    fn test_cpu_tiers() {
        let pro = cpu_descriptor(16, 64.0);
        assert_eq!(pro.performance_tier, PerformanceTier::Pro);
        assert_eq!(pro.memory_gb, 12.0);
        assert_eq!(pro.device_name, "CPU (16 cores)");

        let std = cpu_descriptor(8, 8.0);
        assert_eq!(std.performance_tier, PerformanceTier::Standard);
        assert_eq!(std.memory_gb, 4.0);

        let legacy = cpu_descriptor(4, 32.0);
        assert_eq!(legacy.performance_tier, PerformanceTier::Legacy);
        assert_eq!(legacy.memory_gb, 4.0);
    }

    #[test]
    fn test_enumerate_always_has_cpu() {
        let snapshot = crate::probe::SystemSnapshot::with_memory_gb(16.0, 8.0);
        let catalog = enumerate_devices(&snapshot);
        assert!(catalog.is_supported(DeviceKind::Cpu));
        for kind in DeviceKind::PRIORITY {
            assert!(catalog.get(kind).is_some());
        }
    }
}
