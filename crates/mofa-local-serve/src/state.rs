//! Shared allocation state: the one "current" plan and the inputs it came from.
//!
//! A [`Selection`] is immutable; every recomputation builds a new one and swaps
//! the `Arc` under a write lock, so readers always observe a complete plan.
//!
//! Once the loader has fallen back to the CPU the state stays pinned there:
//! later refreshes resize the conservative CPU plan instead of re-running
//! device selection, so the plan always describes the device the model is on.

use crate::allocation::{self, AllocationPlan, PolicyOptions};
use crate::device::{DeviceCatalog, DeviceDescriptor};
use crate::diagnostics::DiagnosticSnapshot;
use crate::probe::{HostProbe, ProcessSample, SystemSnapshot};
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Everything the policy saw plus what it decided.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub snapshot: SystemSnapshot,
    pub catalog: DeviceCatalog,
    pub processes: Vec<ProcessSample>,
    pub plan: AllocationPlan,
}

impl Selection {
    /// Descriptor of the selected device.
    pub fn device_info(&self) -> DeviceDescriptor {
        self.catalog.descriptor_or_unsupported(self.plan.device)
    }

    pub fn recommendations(&self) -> Vec<String> {
        allocation::recommendations(&self.snapshot, &self.processes, &self.plan)
    }
}

/// Owner of the current plan.
///
/// Probing is blocking; async callers should go through `spawn_blocking`.
pub struct AllocationState {
    probe: Arc<dyn HostProbe>,
    options: PolicyOptions,
    current: RwLock<Arc<Selection>>,
    cpu_pinned: AtomicBool,
}

impl std::fmt::Debug for AllocationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationState")
            .field("options", &self.options)
            .field("current", &self.current.read().plan)
            .field("cpu_pinned", &self.is_cpu_pinned())
            .finish()
    }
}

impl AllocationState {
    /// Probe the host and compute the first plan.
    pub fn initialize(probe: Arc<dyn HostProbe>, options: PolicyOptions) -> Self {
        let selection = Self::compute(probe.as_ref(), &options, false);
        Self {
            probe,
            options,
            current: RwLock::new(Arc::new(selection)),
            cpu_pinned: AtomicBool::new(false),
        }
    }

    fn compute(probe: &dyn HostProbe, options: &PolicyOptions, cpu_pinned: bool) -> Selection {
        let snapshot = probe.capture();
        let catalog = probe.enumerate_devices(&snapshot);
        let processes = probe.list_other_processes();
        let plan = if cpu_pinned {
            allocation::compute_cpu_fallback(&snapshot, &processes)
        } else {
            allocation::compute_allocation_with(options, &snapshot, &catalog, &processes)
        };
        Selection {
            snapshot,
            catalog,
            processes,
            plan,
        }
    }

    pub fn probe(&self) -> &Arc<dyn HostProbe> {
        &self.probe
    }

    pub fn current(&self) -> Arc<Selection> {
        self.current.read().clone()
    }

    pub fn plan(&self) -> AllocationPlan {
        self.current.read().plan.clone()
    }

    /// True after [`fall_back_to_cpu`](Self::fall_back_to_cpu).
    pub fn is_cpu_pinned(&self) -> bool {
        self.cpu_pinned.load(Ordering::SeqCst)
    }

    /// Re-probe and replace the current selection.
    ///
    /// While pinned to the CPU only the plan size follows the host.
    pub fn refresh(&self) -> Arc<Selection> {
        let previous = self.current.read().plan.device;
        let next = Arc::new(Self::compute(
            self.probe.as_ref(),
            &self.options,
            self.is_cpu_pinned(),
        ));
        if next.plan.device != previous {
            tracing::warn!(
                from = %previous,
                to = %next.plan.device,
                "Device selection changed on recompute"
            );
        }
        *self.current.write() = next.clone();
        next
    }

    /// Replace the plan with the conservative CPU fallback plan and pin it.
    pub fn fall_back_to_cpu(&self) -> Arc<Selection> {
        self.cpu_pinned.store(true, Ordering::SeqCst);
        let snapshot = self.probe.capture();
        let processes = self.probe.list_other_processes();
        let catalog = self.current.read().catalog.clone();
        let plan = allocation::compute_cpu_fallback(&snapshot, &processes);
        let next = Arc::new(Selection {
            snapshot,
            catalog,
            processes,
            plan,
        });
        *self.current.write() = next.clone();
        next
    }

    pub fn diagnostic_snapshot(&self) -> DiagnosticSnapshot {
        DiagnosticSnapshot::from_selection(&self.current())
    }
}
