//! End-to-end behaviour of the control plane against a deterministic host.

use async_trait::async_trait;
use mofa_local_serve::allocation::{MAX_ALLOCATION_GB, MAX_MEMORY_FRACTION, MIN_ALLOCATION_GB};
use mofa_local_serve::generation::params::SamplingParams;
use mofa_local_serve::error::ServeError;
use mofa_local_serve::generation::validate::ResponseValidator;
use mofa_local_serve::loader::format::ModelFormat;
use mofa_local_serve::loader::runtime::LoadRequest;
use mofa_local_serve::probe::{ProcessSample, ResourceMetrics};
use mofa_local_serve::{
    AdaptiveLoader, AllocationState, Completion, DeviceCatalog, DeviceDescriptor, DeviceKind,
    DiagnosticSnapshot, GenerationSupervisor, ManualClock, ModelRuntime, ModelSession,
    PerformanceTier, PolicyOptions, ResourceMonitor, RuntimeSet, ServeConfig, ServeResult,
    StaticHost, SystemSnapshot, ThresholdSet, compute_allocation,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn integrated_and_discrete() -> DeviceCatalog {
    DeviceCatalog::from_descriptors([
        DeviceDescriptor::supported(DeviceKind::IntegratedGpu, "Apple M2", 16.0, PerformanceTier::Standard),
        DeviceDescriptor::supported(DeviceKind::DiscreteGpu, "RTX 4060", 8.0, PerformanceTier::Standard),
        DeviceDescriptor::supported(DeviceKind::Cpu, "CPU (8 cores)", 16.0, PerformanceTier::Standard),
    ])
}

fn heavy_processes(total_gb: f64) -> Vec<ProcessSample> {
    let each_mb = total_gb * 1024.0 / 4.0;
    (0..4)
        .map(|i| ProcessSample {
            name: format!("render-{i}"),
            memory_mb: each_mb,
            cpu_percent: 12.0,
            resource_intensive: true,
        })
        .collect()
}

// ============================================================================
// Allocation
// ============================================================================

#[test]
fn plan_stays_within_bounds() {
    let catalog = integrated_and_discrete();
    for total in [0.0, 2.0, 8.0, 16.0, 64.0, 256.0] {
        for ratio in [0.0, 0.05, 0.2, 0.5, 0.9, 1.0] {
            for other in [0.0, 4.0, 40.0] {
                let snapshot = SystemSnapshot::with_memory_gb(total, total * ratio);
                let plan = compute_allocation(&snapshot, &catalog, &heavy_processes(other));
                assert!(
                    (MIN_ALLOCATION_GB..=MAX_ALLOCATION_GB).contains(&plan.recommended_memory_gb),
                    "total={total} ratio={ratio} other={other}: {plan:?}"
                );
                assert!((0.0..=MAX_MEMORY_FRACTION).contains(&plan.memory_fraction));
            }
        }
    }
}

#[test]
fn integrated_preferred_with_headroom() {
    let snapshot = SystemSnapshot::with_memory_gb(16.0, 8.0);
    let plan = compute_allocation(&snapshot, &integrated_and_discrete(), &[]);
    assert_eq!(plan.device, DeviceKind::IntegratedGpu);
}

#[test]
fn discrete_chosen_when_integrated_starved() {
    let snapshot = SystemSnapshot::with_memory_gb(100.0, 10.0);
    let plan = compute_allocation(&snapshot, &integrated_and_discrete(), &[]);
    assert_eq!(plan.device, DeviceKind::DiscreteGpu);
}

#[test]
fn very_low_memory_is_conservative() {
    let snapshot = SystemSnapshot::with_memory_gb(16.0, 1.5);
    let plan = compute_allocation(&snapshot, &integrated_and_discrete(), &[]);
    assert!(plan.use_conservative);
    assert_eq!(plan.batch_size, 2);
}

#[test]
fn crowded_sixteen_gig_host_falls_to_cpu_floor() {
    let catalog = DeviceCatalog::from_descriptors([
        DeviceDescriptor::supported(DeviceKind::IntegratedGpu, "Apple M1", 16.0, PerformanceTier::Legacy),
        DeviceDescriptor::unsupported(DeviceKind::DiscreteGpu, "nvidia-smi not found"),
        DeviceDescriptor::supported(DeviceKind::Cpu, "CPU (8 cores)", 16.0, PerformanceTier::Standard),
    ]);
    let snapshot = SystemSnapshot::with_memory_gb(16.0, 3.0);
    let plan = compute_allocation(&snapshot, &catalog, &heavy_processes(11.5));

    assert_eq!(plan.device, DeviceKind::Cpu);
    assert_eq!(plan.recommended_memory_gb, 2.0);
    assert!(plan.use_conservative);
    assert_eq!(plan.batch_size, 2);
}

#[test]
fn saturated_cpu_forces_conservative_plan() {
    let mut snapshot = SystemSnapshot::with_memory_gb(64.0, 40.0);
    snapshot.cpu_percent = 96.0;
    let plan = compute_allocation(&snapshot, &integrated_and_discrete(), &[]);
    assert!(plan.use_conservative);
    assert_eq!(plan.batch_size, 2);

    snapshot.cpu_percent = 95.0;
    let plan = compute_allocation(&snapshot, &integrated_and_discrete(), &[]);
    assert!(!plan.use_conservative);
}

#[test]
fn low_headroom_flagged_below_forty_percent() {
    let tight = compute_allocation(
        &SystemSnapshot::with_memory_gb(10.0, 3.9),
        &integrated_and_discrete(),
        &[],
    );
    assert_eq!(tight.device, DeviceKind::IntegratedGpu);
    assert!(tight.low_headroom);

    let roomy = compute_allocation(
        &SystemSnapshot::with_memory_gb(10.0, 4.0),
        &integrated_and_discrete(),
        &[],
    );
    assert_eq!(roomy.device, DeviceKind::IntegratedGpu);
    assert!(!roomy.low_headroom);
}

#[test]
fn diagnostics_round_trip_through_disk() {
    let host = Arc::new(StaticHost::new(
        SystemSnapshot::with_memory_gb(32.0, 14.0),
        integrated_and_discrete(),
        heavy_processes(3.0),
    ));
    let state = AllocationState::initialize(host, PolicyOptions::default());
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("diagnostics.json");

    let written = state.diagnostic_snapshot();
    written.write_to(&path).unwrap();
    let read = DiagnosticSnapshot::read_from(&path).unwrap();
    assert_eq!(read, written);
    assert_eq!(read.resource_allocation, state.plan());
}

// ============================================================================
// Monitoring
// ============================================================================

#[test]
fn threshold_adjustment_is_idempotent() {
    let host = Arc::new(StaticHost::new(
        SystemSnapshot::with_memory_gb(16.0, 12.0),
        integrated_and_discrete(),
        Vec::new(),
    ));
    let monitor = ResourceMonitor::new(host, Default::default());
    monitor.adjust_thresholds(DeviceKind::IntegratedGpu, true);
    let once = monitor.get_current_thresholds();
    monitor.adjust_thresholds(DeviceKind::IntegratedGpu, true);
    assert_eq!(monitor.get_current_thresholds(), once);
    assert_eq!(once, ThresholdSet::for_device(DeviceKind::IntegratedGpu, true));
}

#[test]
fn memory_critical_deduplicated_by_cooldown() {
    let host = Arc::new(StaticHost::new(
        SystemSnapshot::with_memory_gb(16.0, 12.0),
        integrated_and_discrete(),
        Vec::new(),
    ));
    let clock = Arc::new(ManualClock::new(5_000_000));
    let monitor = ResourceMonitor::with_clock(host, Default::default(), clock.clone());
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    monitor.add_alert_callback(move |alert| {
        if alert.key() == "memory_critical" {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    });

    let metrics = ResourceMetrics {
        memory_available_gb: 1.0,
        memory_total_gb: 16.0,
        memory_used_percent: 93.75,
        cpu_percent: 5.0,
        disk_free_gb: None,
        gpu_memory_available_gb: None,
    };
    monitor.process(metrics.clone());
    clock.advance_secs(10);
    monitor.process(metrics.clone());
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    clock.advance_secs(21);
    monitor.process(metrics);
    assert_eq!(seen.load(Ordering::SeqCst), 2);
}

// ============================================================================
// Loading and generation
// ============================================================================

struct CannedSession {
    reply: String,
}

#[async_trait]
impl ModelSession for CannedSession {
    async fn complete(&self, _prompt: &str, _params: &SamplingParams) -> ServeResult<Completion> {
        Ok(Completion::new(self.reply.clone()))
    }
}

struct SlowRuntime {
    loads: AtomicUsize,
    reply: String,
}

#[async_trait]
impl ModelRuntime for SlowRuntime {
    fn name(&self) -> &str {
        "slow"
    }

    fn format(&self) -> ModelFormat {
        ModelFormat::Packed
    }

    async fn load(&self, _request: &LoadRequest) -> ServeResult<Arc<dyn ModelSession>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(Arc::new(CannedSession {
            reply: self.reply.clone(),
        }))
    }
}

fn serving_stack(
    reply: &str,
) -> (tempfile::TempDir, Arc<SlowRuntime>, Arc<AdaptiveLoader>, ServeConfig) {
    let dir = tempfile::tempdir().unwrap();
    let model = dir.path().join("tiny-q4.gguf");
    std::fs::write(&model, b"GGUF").unwrap();

    let host = Arc::new(StaticHost::new(
        SystemSnapshot::with_memory_gb(32.0, 20.0),
        integrated_and_discrete(),
        Vec::new(),
    ));
    let state = Arc::new(AllocationState::initialize(host, PolicyOptions::default()));
    let runtime = Arc::new(SlowRuntime {
        loads: AtomicUsize::new(0),
        reply: reply.to_string(),
    });
    let config = ServeConfig::new(&model).with_retry_pause_ms(0);
    let loader = Arc::new(AdaptiveLoader::new(
        config.clone(),
        state,
        RuntimeSet::new().with(runtime.clone()),
    ));
    (dir, runtime, loader, config)
}

/// Refuses integrated GPU plans so the loader has to fall back to the CPU.
struct NoIntegratedRuntime;

#[async_trait]
impl ModelRuntime for NoIntegratedRuntime {
    fn name(&self) -> &str {
        "no-integrated"
    }

    fn format(&self) -> ModelFormat {
        ModelFormat::Packed
    }

    async fn load(&self, request: &LoadRequest) -> ServeResult<Arc<dyn ModelSession>> {
        if request.plan.device == DeviceKind::IntegratedGpu {
            return Err(ServeError::ModelLoadFailed("integrated backend unavailable".into()));
        }
        Ok(Arc::new(CannedSession {
            reply: "ok".into(),
        }))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cpu_fallback_survives_critical_memory_recompute() {
    let dir = tempfile::tempdir().unwrap();
    let model = dir.path().join("tiny-q4.gguf");
    std::fs::write(&model, b"GGUF").unwrap();

    let host = Arc::new(StaticHost::new(
        SystemSnapshot::with_memory_gb(32.0, 20.0),
        integrated_and_discrete(),
        Vec::new(),
    ));
    let state = Arc::new(AllocationState::initialize(host.clone(), PolicyOptions::default()));
    assert_eq!(state.plan().device, DeviceKind::IntegratedGpu);

    let monitor = ResourceMonitor::new(host, Default::default());
    monitor.attach(state.clone());
    let loader = AdaptiveLoader::new(
        ServeConfig::new(&model),
        state.clone(),
        RuntimeSet::new().with(Arc::new(NoIntegratedRuntime)),
    );

    let loaded = loader.load().await.unwrap();
    assert_eq!(loaded.device, DeviceKind::Cpu);
    assert_eq!(
        monitor.get_current_thresholds(),
        ThresholdSet::for_device(DeviceKind::Cpu, true)
    );

    let alerts = monitor.process(ResourceMetrics {
        memory_available_gb: 1.0,
        memory_total_gb: 32.0,
        memory_used_percent: 96.9,
        cpu_percent: 5.0,
        disk_free_gb: None,
        gpu_memory_available_gb: None,
    });
    assert!(alerts.iter().any(|a| a.key() == "memory_critical"));

    let plan = state.plan();
    assert_eq!(plan.device, loaded.device);
    assert!(plan.use_conservative);
    let info = loader.get_memory_info();
    assert_eq!(info.device, DeviceKind::Cpu);
    assert!(info.conservative_mode);
    assert_eq!(state.diagnostic_snapshot().device, DeviceKind::Cpu);
    assert_eq!(
        monitor.get_current_thresholds(),
        ThresholdSet::for_device(DeviceKind::Cpu, true)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_loads_load_once() {
    let (_dir, runtime, loader, _) = serving_stack("ok");

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let loader = loader.clone();
            tokio::spawn(async move { loader.load().await.map(|m| m.device) })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), DeviceKind::IntegratedGpu);
    }
    assert_eq!(runtime.loads.load(Ordering::SeqCst), 1);
    assert!(loader.is_loaded());

    let info = loader.get_memory_info();
    assert_eq!(info.model_format, Some(ModelFormat::Packed));
    assert_eq!(info.device, DeviceKind::IntegratedGpu);
}

struct RejectEverything;

impl ResponseValidator for RejectEverything {
    fn is_valid(&self, _response: &str) -> bool {
        false
    }
}

#[tokio::test]
async fn rejected_generation_returns_fallback_after_three_attempts() {
    let (_dir, runtime, loader, config) = serving_stack("a perfectly good answer");
    let supervisor = GenerationSupervisor::new(loader, config.generation.clone())
        .with_validator(Arc::new(RejectEverything));

    let out = supervisor
        .generate("User: why is the sky blue?\nAssistant: ", &SamplingParams::default())
        .await
        .unwrap();
    assert!(out.fallback);
    assert_eq!(out.attempts, 3);
    assert!(out.text.starts_with("I understand your question."));
    assert_eq!(runtime.loads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn accepted_generation_reports_metrics() {
    let (_dir, _runtime, loader, config) = serving_stack("Rayleigh scattering.");
    let supervisor = GenerationSupervisor::new(loader, config.generation.clone());
    let out = supervisor
        .generate_default("User: why is the sky blue?\nAssistant: ")
        .await
        .unwrap();
    assert!(!out.fallback);
    assert_eq!(out.attempts, 1);
    assert_eq!(out.text, "Rayleigh scattering.");
    assert_eq!(out.metrics.usage.completion_tokens, 2);
}
