//! Resource alerts and de-duplication.

use super::thresholds::ThresholdSet;
use crate::clock::Clock;
use crate::probe::ResourceMetrics;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Severity of a threshold violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Warning,
    Critical,
}

impl AlertLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertLevel::Warning => "warning",
            AlertLevel::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Memory,
    Cpu,
    Gpu,
    Disk,
}

impl ResourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceType::Memory => "memory",
            ResourceType::Cpu => "cpu",
            ResourceType::Gpu => "gpu",
            ResourceType::Disk => "disk",
        }
    }
}

/// A single threshold violation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub level: AlertLevel,
    pub resource_type: ResourceType,
    pub message: String,
    pub current_value: f64,
    pub threshold: f64,
    /// `GB` or `%`
    pub unit: String,
    pub recommendation: String,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    /// De-duplication key, `{resource}_{level}`.
    pub fn key(&self) -> String {
        format!("{}_{}", self.resource_type.as_str(), self.level.as_str())
    }
}

struct Wording {
    critical: fn(f64) -> String,
    critical_advice: &'static str,
    warning: fn(f64) -> String,
    warning_advice: &'static str,
}

const MEMORY_WORDING: Wording = Wording {
    critical: |v| format!("CRITICAL: Only {v:.1}GB memory available!"),
    critical_advice: "Close applications immediately or restart system",
    warning: |v| format!("WARNING: Low memory ({v:.1}GB available)"),
    warning_advice: "Close some applications for better performance",
};

const DISK_WORDING: Wording = Wording {
    critical: |v| format!("CRITICAL: Disk space critically low ({v:.1}GB free)"),
    critical_advice: "Free up disk space immediately to prevent crashes",
    warning: |v| format!("WARNING: Disk space getting low ({v:.1}GB free)"),
    warning_advice: "Consider freeing up disk space",
};

const GPU_WORDING: Wording = Wording {
    critical: |v| format!("CRITICAL: GPU memory critically low ({v:.1}GB available)"),
    critical_advice: "Close GPU-intensive applications or reduce model size",
    warning: |v| format!("WARNING: GPU memory getting low ({v:.1}GB available)"),
    warning_advice: "Consider closing GPU-intensive applications",
};

const CPU_WORDING: Wording = Wording {
    critical: |v| format!("CRITICAL: CPU usage at {v:.1}%!"),
    critical_advice: "Close CPU-intensive applications immediately",
    warning: |v| format!("WARNING: High CPU usage ({v:.1}%)"),
    warning_advice: "Consider closing some applications",
};

fn build(
    level: AlertLevel,
    resource_type: ResourceType,
    wording: &Wording,
    value: f64,
    threshold: f64,
    unit: &str,
    timestamp: DateTime<Utc>,
) -> Alert {
    let (message, recommendation) = match level {
        AlertLevel::Critical => ((wording.critical)(value), wording.critical_advice),
        AlertLevel::Warning => ((wording.warning)(value), wording.warning_advice),
    };
    Alert {
        id: Uuid::new_v4(),
        level,
        resource_type,
        message,
        current_value: value,
        threshold,
        unit: unit.to_string(),
        recommendation: recommendation.to_string(),
        timestamp,
    }
}

/// Compare every exposed metric against critical, then warning.
///
/// GB-available resources alert at or below the level; CPU at or above.
pub fn evaluate(metrics: &ResourceMetrics, t: &ThresholdSet, now_millis: u64) -> Vec<Alert> {
    let at = DateTime::<Utc>::from_timestamp_millis(now_millis as i64).unwrap_or_else(Utc::now);
    let mut alerts = Vec::new();

    let floors = [
        (ResourceType::Memory, Some(metrics.memory_available_gb), &MEMORY_WORDING),
        (ResourceType::Disk, metrics.disk_free_gb, &DISK_WORDING),
        (ResourceType::Gpu, metrics.gpu_memory_available_gb, &GPU_WORDING),
    ];
    for (resource, value, wording) in floors {
        let Some(v) = value else { continue };
        if v <= t.memory_critical_gb {
            alerts.push(build(AlertLevel::Critical, resource, wording, v, t.memory_critical_gb, "GB", at));
        } else if v <= t.memory_warning_gb {
            alerts.push(build(AlertLevel::Warning, resource, wording, v, t.memory_warning_gb, "GB", at));
        }
    }

    let cpu = metrics.cpu_percent;
    if cpu >= t.cpu_critical_percent {
        alerts.push(build(AlertLevel::Critical, ResourceType::Cpu, &CPU_WORDING, cpu, t.cpu_critical_percent, "%", at));
    } else if cpu >= t.cpu_warning_percent {
        alerts.push(build(AlertLevel::Warning, ResourceType::Cpu, &CPU_WORDING, cpu, t.cpu_warning_percent, "%", at));
    }

    alerts
}

// ============================================================================
// Aggregation
// ============================================================================

#[derive(Default)]
struct AggregatorState {
    last_emitted: HashMap<String, u64>,
    suppressed: BTreeMap<String, u64>,
    last_summary: Option<u64>,
}

/// Per-key cooldown plus periodic summary of what was suppressed.
pub struct AlertAggregator {
    clock: Arc<dyn Clock>,
    cooldown_ms: u64,
    summary_interval_ms: u64,
    state: Mutex<AggregatorState>,
}

impl std::fmt::Debug for AlertAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertAggregator")
            .field("cooldown_ms", &self.cooldown_ms)
            .field("summary_interval_ms", &self.summary_interval_ms)
            .finish()
    }
}

impl AlertAggregator {
    pub fn new(clock: Arc<dyn Clock>, cooldown: Duration, summary_interval: Duration) -> Self {
        Self {
            clock,
            cooldown_ms: cooldown.as_millis() as u64,
            summary_interval_ms: summary_interval.as_millis() as u64,
            state: Mutex::new(AggregatorState::default()),
        }
    }

    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    /// True if `key` may be emitted now; otherwise counts it as suppressed.
    pub fn admit(&self, key: &str) -> bool {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();
        let due = match state.last_emitted.get(key) {
            Some(last) => now.saturating_sub(*last) >= self.cooldown_ms,
            None => true,
        };
        if due {
            state.last_emitted.insert(key.to_string(), now);
        } else {
            *state.suppressed.entry(key.to_string()).or_insert(0) += 1;
        }
        due
    }

    /// One-line summary of suppressed alerts, once per summary interval.
    ///
    /// Returns `None` before the interval elapses or when nothing was suppressed.
    pub fn take_summary(&self) -> Option<String> {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();
        let last = *state.last_summary.get_or_insert(now);
        if now.saturating_sub(last) < self.summary_interval_ms {
            return None;
        }
        state.last_summary = Some(now);
        if state.suppressed.is_empty() {
            return None;
        }
        let parts: Vec<String> = state
            .suppressed
            .iter()
            .map(|(k, n)| format!("{k} x{n}"))
            .collect();
        state.suppressed.clear();
        Some(format!("Suppressed resource alerts: {}", parts.join(", ")))
    }
}
