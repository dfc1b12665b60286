//! Host sampling: memory, CPU, disk and competing processes.
//!
//! Probing never fails. A metric that cannot be read is reported as `0`
//! and logged at `warn`; callers treat zeros as "unknown" and degrade.
//!
//! Sampling is synchronous (the CPU sample blocks for the sysinfo minimum
//! update interval). Call from a blocking context or `spawn_blocking`.

use crate::device::DeviceCatalog;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use sysinfo::{Disks, MemoryRefreshKind, RefreshKind, System};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Point-in-time view of host resources. Recaptured per probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    /// Operating system id (`macos`, `linux`, ...)
    pub platform: String,
    /// CPU architecture (`aarch64`, `x86_64`, ...)
    pub arch: String,
    /// Logical CPU cores
    pub cpu_cores: usize,
    pub total_memory_bytes: u64,
    pub available_memory_bytes: u64,
    /// Host-wide CPU utilization, 0-100
    pub cpu_percent: f64,
    pub disk_free_bytes: u64,
}

impl SystemSnapshot {
    /// Snapshot with the given memory figures (in GB) on the current platform.
    pub fn with_memory_gb(total_gb: f64, available_gb: f64) -> Self {
        Self {
            platform: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            cpu_cores: num_cpus(),
            total_memory_bytes: gb_to_bytes(total_gb),
            available_memory_bytes: gb_to_bytes(available_gb),
            cpu_percent: 0.0,
            disk_free_bytes: 0,
        }
    }

    pub fn total_memory_gb(&self) -> f64 {
        self.total_memory_bytes as f64 / BYTES_PER_GB
    }

    pub fn available_memory_gb(&self) -> f64 {
        self.available_memory_bytes as f64 / BYTES_PER_GB
    }

    pub fn used_memory_gb(&self) -> f64 {
        (self.total_memory_gb() - self.available_memory_gb()).max(0.0)
    }

    /// Percent of memory in use, 0 when total is unknown
    pub fn memory_used_percent(&self) -> f64 {
        let total = self.total_memory_gb();
        if total > 0.0 {
            self.used_memory_gb() / total * 100.0
        } else {
            0.0
        }
    }

    /// available / total, 0 when total is unknown
    pub fn available_fraction(&self) -> f64 {
        let total = self.total_memory_gb();
        if total > 0.0 {
            self.available_memory_gb() / total
        } else {
            0.0
        }
    }

    pub fn disk_free_gb(&self) -> f64 {
        self.disk_free_bytes as f64 / BYTES_PER_GB
    }

    /// True on the platform that carries unified-memory GPU compute.
    pub fn is_unified_memory_platform(&self) -> bool {
        self.platform == "macos" && self.arch == "aarch64"
    }
}

/// A competing process worth knowing about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSample {
    pub name: String,
    /// Resident memory in MB
    pub memory_mb: f64,
    pub cpu_percent: f64,
    /// Name matched one of [`INTENSIVE_PROCESS_KEYWORDS`]
    pub resource_intensive: bool,
}

/// Sum of resident memory across `processes`, in GB.
pub fn total_process_memory_gb(processes: &[ProcessSample]) -> f64 {
    processes.iter().map(|p| p.memory_mb).sum::<f64>() / 1024.0
}

pub fn count_resource_intensive(processes: &[ProcessSample]) -> usize {
    processes.iter().filter(|p| p.resource_intensive).count()
}

/// Lower-case substrings marking GPU/memory-hungry desktop applications.
pub const INTENSIVE_PROCESS_KEYWORDS: &[&str] = &[
    "chrome",
    "safari",
    "firefox",
    "brave",
    "photoshop",
    "illustrator",
    "indesign",
    "final cut",
    "premiere",
    "after effects",
    "blender",
    "maya",
    "cinema 4d",
    "unity",
    "unreal",
    "docker",
    "vmware",
    "parallels",
    "xcode",
    "android studio",
    "zoom",
    "teams",
    "slack",
    "spotify",
    "itunes",
    "steam",
    "epic",
    "origin",
];

/// Most processes kept by [`list_other_processes`].
pub const MAX_OTHER_PROCESSES: usize = 10;
const INTENSIVE_MIN_MB: f64 = 100.0;
const LARGE_MIN_MB: f64 = 500.0;

pub fn is_resource_intensive(name: &str) -> bool {
    let lower = name.to_lowercase();
    INTENSIVE_PROCESS_KEYWORDS.iter().any(|k| lower.contains(k))
}

/// Filter, sort (memory descending) and truncate raw `(name, bytes, cpu%)` rows.
pub fn select_other_processes(
    rows: impl IntoIterator<Item = (String, u64, f64)>,
) -> Vec<ProcessSample> {
    let mut samples: Vec<ProcessSample> = rows
        .into_iter()
        .filter_map(|(name, bytes, cpu)| {
            let memory_mb = bytes as f64 / BYTES_PER_MB;
            let intensive = is_resource_intensive(&name);
            let keep = (intensive && memory_mb > INTENSIVE_MIN_MB) || memory_mb > LARGE_MIN_MB;
            keep.then_some(ProcessSample {
                name,
                memory_mb,
                cpu_percent: cpu,
                resource_intensive: intensive,
            })
        })
        .collect();
    samples.sort_by(|a, b| b.memory_mb.total_cmp(&a.memory_mb));
    samples.truncate(MAX_OTHER_PROCESSES);
    samples
}

/// Resource sample consumed by the monitor loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceMetrics {
    pub memory_available_gb: f64,
    pub memory_total_gb: f64,
    pub memory_used_percent: f64,
    pub cpu_percent: f64,
    pub disk_free_gb: Option<f64>,
    /// Only populated when the backend exposes it
    pub gpu_memory_available_gb: Option<f64>,
}

impl From<&SystemSnapshot> for ResourceMetrics {
    fn from(s: &SystemSnapshot) -> Self {
        Self {
            memory_available_gb: s.available_memory_gb(),
            memory_total_gb: s.total_memory_gb(),
            memory_used_percent: s.memory_used_percent(),
            cpu_percent: s.cpu_percent,
            disk_free_gb: (s.disk_free_bytes > 0).then(|| s.disk_free_gb()),
            gpu_memory_available_gb: None,
        }
    }
}

/// Memory-only reading, cheap enough to take around every load or generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStatus {
    pub total_gb: f64,
    pub available_gb: f64,
}

impl MemoryStatus {
    pub fn used_gb(&self) -> f64 {
        (self.total_gb - self.available_gb).max(0.0)
    }

    pub fn percent_used(&self) -> f64 {
        if self.total_gb > 0.0 {
            self.used_gb() / self.total_gb * 100.0
        } else {
            0.0
        }
    }
}

// ============================================================================
// Probe trait
// ============================================================================

/// Source of host state. Implementations must not panic or return errors;
/// unreadable values are substituted with zero.
pub trait HostProbe: Send + Sync {
    fn capture(&self) -> SystemSnapshot;

    fn enumerate_devices(&self, snapshot: &SystemSnapshot) -> DeviceCatalog;

    fn list_other_processes(&self) -> Vec<ProcessSample>;

    /// Sample for the monitor loop. Defaults to a fresh snapshot.
    fn sample_metrics(&self) -> ResourceMetrics {
        ResourceMetrics::from(&self.capture())
    }

    fn memory_status(&self) -> MemoryStatus {
        let s = self.capture();
        MemoryStatus {
            total_gb: s.total_memory_gb(),
            available_gb: s.available_memory_gb(),
        }
    }
}

/// The real host, read through `sysinfo` and vendor tools.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalHost;

impl HostProbe for LocalHost {
    fn capture(&self) -> SystemSnapshot {
        let mut sys = System::new_all();
        // CPU usage needs two refreshes separated by the minimum interval
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        sys.refresh_all();

        let cpus = sys.cpus();
        let cpu_percent = if cpus.is_empty() {
            tracing::warn!("CPU usage unavailable, reporting 0");
            0.0
        } else {
            cpus.iter().map(|c| c.cpu_usage() as f64).sum::<f64>() / cpus.len() as f64
        };

        let total = sys.total_memory();
        if total == 0 {
            tracing::warn!("Total memory unavailable, reporting 0");
        }

        SystemSnapshot {
            platform: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            cpu_cores: num_cpus(),
            total_memory_bytes: total,
            available_memory_bytes: sys.available_memory(),
            cpu_percent,
            disk_free_bytes: root_disk_free_bytes(),
        }
    }

    fn enumerate_devices(&self, snapshot: &SystemSnapshot) -> DeviceCatalog {
        crate::catalog::enumerate_devices(snapshot)
    }

    fn list_other_processes(&self) -> Vec<ProcessSample> {
        let mut sys = System::new_all();
        sys.refresh_all();
        let own = sysinfo::Pid::from_u32(std::process::id());
        select_other_processes(sys.processes().iter().filter(|(pid, _)| **pid != own).map(
            |(_, p)| {
                (
                    p.name().to_string_lossy().into_owned(),
                    p.memory(),
                    p.cpu_usage() as f64,
                )
            },
        ))
    }

    fn sample_metrics(&self) -> ResourceMetrics {
        let mut metrics = ResourceMetrics::from(&self.capture());
        metrics.gpu_memory_available_gb = crate::catalog::discrete_free_memory_gb();
        metrics
    }

    fn memory_status(&self) -> MemoryStatus {
        let mut sys = System::new_with_specifics(
            RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
        );
        sys.refresh_memory();
        MemoryStatus {
            total_gb: sys.total_memory() as f64 / BYTES_PER_GB,
            available_gb: sys.available_memory() as f64 / BYTES_PER_GB,
        }
    }
}

/// Free bytes on the filesystem holding `/` (or the first disk), 0 if unknown.
fn root_disk_free_bytes() -> u64 {
    let disks = Disks::new_with_refreshed_list();
    let root = disks
        .list()
        .iter()
        .find(|d| d.mount_point() == Path::new("/"))
        .or_else(|| disks.list().first());
    match root {
        Some(d) => d.available_space(),
        None => {
            tracing::warn!("No disks reported, disk free set to 0");
            0
        }
    }
}

/// Capture the local host.
pub fn probe_system() -> SystemSnapshot {
    LocalHost.capture()
}

/// Competing processes on the local host, top 10 by memory.
pub fn list_other_processes() -> Vec<ProcessSample> {
    LocalHost.list_other_processes()
}

pub(crate) fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

pub(crate) fn gb_to_bytes(gb: f64) -> u64 {
    (gb.max(0.0) * BYTES_PER_GB).round() as u64
}

// ============================================================================
// Static host
// ============================================================================

/// Deterministic host with caller-controlled state.
///
/// Used for offline planning (`--simulate` style tooling) and tests. State can be
/// swapped at any time; the next capture observes it.
#[derive(Debug)]
pub struct StaticHost {
    snapshot: RwLock<SystemSnapshot>,
    catalog: RwLock<DeviceCatalog>,
    processes: RwLock<Vec<ProcessSample>>,
    gpu_memory_available_gb: RwLock<Option<f64>>,
}

impl StaticHost {
    pub fn new(
        snapshot: SystemSnapshot,
        catalog: DeviceCatalog,
        processes: Vec<ProcessSample>,
    ) -> Self {
        Self {
            snapshot: RwLock::new(snapshot),
            catalog: RwLock::new(catalog),
            processes: RwLock::new(processes),
            gpu_memory_available_gb: RwLock::new(None),
        }
    }

    pub fn set_snapshot(&self, snapshot: SystemSnapshot) {
        *self.snapshot.write() = snapshot;
    }

    pub fn set_catalog(&self, catalog: DeviceCatalog) {
        *self.catalog.write() = catalog;
    }

    pub fn set_processes(&self, processes: Vec<ProcessSample>) {
        *self.processes.write() = processes;
    }

    pub fn set_gpu_memory_available_gb(&self, gb: Option<f64>) {
        *self.gpu_memory_available_gb.write() = gb;
    }
}

impl HostProbe for StaticHost {
    fn capture(&self) -> SystemSnapshot {
        self.snapshot.read().clone()
    }

    fn enumerate_devices(&self, _snapshot: &SystemSnapshot) -> DeviceCatalog {
        self.catalog.read().clone()
    }

    fn list_other_processes(&self) -> Vec<ProcessSample> {
        self.processes.read().clone()
    }

    fn sample_metrics(&self) -> ResourceMetrics {
        let mut metrics = ResourceMetrics::from(&*self.snapshot.read());
        metrics.gpu_memory_available_gb = *self.gpu_memory_available_gb.read();
        metrics
    }
}

// ============================================================================
// Tests
// ============================================================================
