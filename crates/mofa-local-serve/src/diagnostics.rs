//! Persisted diagnostics document.
//!
//! Written by `mofa-serve-probe` for operators to inspect. `read_from` loads
//! a previously written document; nothing in the serving path consumes it.

use crate::allocation::AllocationPlan;
use crate::device::{DeviceDescriptor, DeviceKind};
use crate::error::ServeResult;
use crate::probe::{ProcessSample, SystemSnapshot};
use crate::state::Selection;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Competing processes included in the document.
pub const DIAGNOSTIC_PROCESS_LIMIT: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticSnapshot {
    pub device: DeviceKind,
    pub device_info: DeviceDescriptor,
    pub resource_allocation: AllocationPlan,
    pub system_info: SystemSnapshot,
    pub other_processes: Vec<ProcessSample>,
    pub recommendations: Vec<String>,
}

impl DiagnosticSnapshot {
    pub fn from_selection(selection: &Selection) -> Self {
        Self {
            device: selection.plan.device,
            device_info: selection.device_info(),
            resource_allocation: selection.plan.clone(),
            system_info: selection.snapshot.clone(),
            other_processes: selection
                .processes
                .iter()
                .take(DIAGNOSTIC_PROCESS_LIMIT)
                .cloned()
                .collect(),
            recommendations: selection.recommendations(),
        }
    }

    pub fn to_json(&self) -> ServeResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write_to(&self, path: impl AsRef<Path>) -> ServeResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, self.to_json()?)?;
        tracing::info!(path = %path.display(), device = %self.device, "Wrote diagnostics");
        Ok(())
    }

    pub fn read_from(path: impl AsRef<Path>) -> ServeResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}
