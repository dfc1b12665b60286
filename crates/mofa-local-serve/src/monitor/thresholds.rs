//! Alert thresholds, a pure function of (device kind, conservative flag).

use crate::device::DeviceKind;
use serde::{Deserialize, Serialize};

/// Memory thresholds are multiplied by this when the plan is conservative.
pub const CONSERVATIVE_FACTOR: f64 = 1.2;

/// Warning/critical levels for each monitored resource.
///
/// Memory levels are GB *available* (alert when at or below); CPU levels are
/// percent *used* (alert when at or above). Disk and GPU memory reuse the
/// memory levels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSet {
    pub memory_warning_gb: f64,
    pub memory_critical_gb: f64,
    pub cpu_warning_percent: f64,
    pub cpu_critical_percent: f64,
}

impl Default for ThresholdSet {
    fn default() -> Self {
        Self {
            memory_warning_gb: 6.0,
            memory_critical_gb: 3.0,
            cpu_warning_percent: 80.0,
            cpu_critical_percent: 90.0,
        }
    }
}

impl ThresholdSet {
    pub fn for_device(kind: DeviceKind, conservative: bool) -> Self {
        let profile = kind.profile();
        let factor = if conservative { CONSERVATIVE_FACTOR } else { 1.0 };
        Self {
            memory_warning_gb: profile.memory_warning_gb * factor,
            memory_critical_gb: profile.memory_critical_gb * factor,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_levels() {
        let t = ThresholdSet::for_device(DeviceKind::IntegratedGpu, false);
        assert_eq!((t.memory_warning_gb, t.memory_critical_gb), (4.0, 2.0));
        let t = ThresholdSet::for_device(DeviceKind::Cpu, false);
        assert_eq!((t.memory_warning_gb, t.memory_critical_gb), (8.0, 4.0));
        for kind in [DeviceKind::DiscreteGpu, DeviceKind::SecondaryGpu] {
            let t = ThresholdSet::for_device(kind, false);
            assert_eq!((t.memory_warning_gb, t.memory_critical_gb), (6.0, 3.0));
        }
    }

    #[test]
    fn test_conservative_scales_memory_only() {
        let t = ThresholdSet::for_device(DeviceKind::Cpu, true);
        assert!((t.memory_warning_gb - 9.6).abs() < 1e-9);
        assert!((t.memory_critical_gb - 4.8).abs() < 1e-9);
        assert_eq!(t.cpu_warning_percent, 80.0);
        assert_eq!(t.cpu_critical_percent, 90.0);
    }

    #[test]
    fn test_adjustment_is_idempotent() {
        let once = ThresholdSet::for_device(DeviceKind::IntegratedGpu, true);
        let twice = ThresholdSet::for_device(DeviceKind::IntegratedGpu, true);
        assert_eq!(once, twice);
    }
}
