//! # mofa-local-serve
//!
//! Local inference control plane for MoFA.
//!
//! Decides *where* and *how much* a local model may use, keeps that decision
//! current while the host changes underneath it, and keeps generation
//! answering when the model misbehaves:
//!
//! | Component              | Role                                                  |
//! |------------------------|-------------------------------------------------------|
//! | [`probe`]              | host snapshot, competing processes                    |
//! | [`catalog`]            | per-device capability descriptors                     |
//! | [`allocation`]         | device choice and memory budget                       |
//! | [`monitor`]            | periodic sampling, alerts, threshold adaptation       |
//! | [`loader`]             | format detection, device parameters, load fallbacks   |
//! | [`generation`]         | retries, validation, templated fallback reply         |
//!
//! Devices are tried in priority order:
//! **integrated GPU** → **discrete GPU** → **secondary GPU** → **CPU**
//!
//! The crate ships no numerics; inference engines plug in as
//! [`ModelRuntime`] implementations.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mofa_local_serve::{
//!     AdaptiveLoader, AllocationState, GenerationSupervisor, LocalHost, PolicyOptions,
//!     ResourceMonitor, RuntimeSet, ServeConfig,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ServeConfig::load(Some("serve.toml"))?;
//!     let state = Arc::new(AllocationState::initialize(
//!         Arc::new(LocalHost),
//!         PolicyOptions { device_override: config.device_override },
//!     ));
//!
//!     let monitor = Arc::new(ResourceMonitor::new(state.probe().clone(), config.monitor.clone()));
//!     monitor.attach(state.clone());
//!     monitor.start_default();
//!
//!     // register real runtimes with `RuntimeSet::with`
//!     let loader = Arc::new(AdaptiveLoader::new(config.clone(), state, RuntimeSet::new()));
//!     let supervisor = GenerationSupervisor::new(loader, config.generation.clone());
//!     let out = supervisor.generate_default("User: hello\nAssistant: ").await?;
//!     println!("{}", out.text);
//!
//!     monitor.stop().await;
//!     Ok(())
//! }
//! ```

pub mod allocation;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod device;
pub mod diagnostics;
pub mod error;
pub mod generation;
pub mod loader;
pub mod monitor;
pub mod probe;
pub mod state;

pub use allocation::{AllocationPlan, PolicyOptions, compute_allocation};
pub use catalog::enumerate_devices;
pub use clock::{Clock, ManualClock, SystemClock};
pub use self::config::ServeConfig;
pub use device::{DeviceCatalog, DeviceDescriptor, DeviceKind, PerformanceTier};
pub use diagnostics::DiagnosticSnapshot;
pub use error::{ServeError, ServeResult};
pub use generation::{GenerationOutcome, GenerationSupervisor};
pub use loader::runtime::{Completion, ModelRuntime, ModelSession, RuntimeSet};
pub use loader::{AdaptiveLoader, InferenceProvider, MemoryInfo};
pub use monitor::{Alert, ResourceMonitor, ThresholdSet};
pub use probe::{HostProbe, LocalHost, StaticHost, SystemSnapshot, list_other_processes, probe_system};
pub use state::AllocationState;
