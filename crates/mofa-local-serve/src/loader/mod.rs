//! Adaptive model loading.
//!
//! `unloaded → loading (locked) → loaded | failed`. Loading is serialized by a
//! single async mutex and happens at most once per loader; the only reload is
//! the integrated-GPU → CPU fallback, which replaces the handle wholesale.
//!
//! Fallbacks:
//! - packed artifact but no packed runtime → full-precision fallback model on
//!   the same device
//! - integrated GPU load failure → one retry on the CPU with the reduced,
//!   conservative plan; a second failure is surfaced

pub mod format;
pub mod params;
pub mod runtime;

use crate::config::ServeConfig;
use crate::device::DeviceKind;
use crate::error::{ServeError, ServeResult};
use crate::generation::params::SamplingParams;
use crate::probe::total_process_memory_gb;
use crate::state::{AllocationState, Selection};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use format::{ModelArtifact, ModelFormat, detect_format};
use futures::stream::{self, BoxStream, StreamExt};
use params::LoadParameters;
use parking_lot::RwLock;
use runtime::{Completion, LoadRequest, ModelRuntime, ModelSession, RuntimeSet};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// Capability interface the generation supervisor drives.
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    /// Load the model if not loaded yet. Idempotent.
    async fn load(&self) -> ServeResult<()>;

    fn is_loaded(&self) -> bool;

    /// Format of the loaded model, `None` before loading.
    fn loaded_format(&self) -> Option<ModelFormat>;

    async fn generate(&self, prompt: &str, params: &SamplingParams) -> ServeResult<Completion>;

    /// Chunked output: native chunks when the runtime streams, word-level
    /// chunks of a full completion otherwise.
    async fn generate_stream(
        &self,
        prompt: &str,
        params: &SamplingParams,
    ) -> ServeResult<BoxStream<'static, ServeResult<String>>>;

    /// Release runtime caches. No-op by default.
    fn optimize_memory(&self) {}
}

/// A model bound to a device.
pub struct LoadedModel {
    pub artifact: ModelArtifact,
    pub device: DeviceKind,
    pub params: LoadParameters,
    pub session: Arc<dyn ModelSession>,
    pub loaded_at: DateTime<Utc>,
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("artifact", &self.artifact)
            .field("device", &self.device)
            .field("params", &self.params)
            .field("loaded_at", &self.loaded_at)
            .finish()
    }
}

impl LoadedModel {
    pub fn format(&self) -> ModelFormat {
        self.artifact.format
    }
}

/// Memory picture reported to operators and API responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub total_gb: f64,
    pub available_gb: f64,
    pub used_gb: f64,
    pub percent_used: f64,
    pub device: DeviceKind,
    pub allocated_gb: f64,
    pub conservative_mode: bool,
    pub other_apps_gb: f64,
    pub cpu_percent: f64,
    pub model_format: Option<ModelFormat>,
    pub model_size_gb: Option<f64>,
    pub model_path: Option<PathBuf>,
}

/// Loads the configured model onto the device chosen by the current plan.
pub struct AdaptiveLoader {
    config: ServeConfig,
    state: Arc<AllocationState>,
    runtimes: RuntimeSet,
    load_lock: tokio::sync::Mutex<()>,
    current: RwLock<Option<Arc<LoadedModel>>>,
}

impl std::fmt::Debug for AdaptiveLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveLoader")
            .field("model", &self.config.model)
            .field("runtimes", &self.runtimes)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

impl AdaptiveLoader {
    pub fn new(config: ServeConfig, state: Arc<AllocationState>, runtimes: RuntimeSet) -> Self {
        Self {
            config,
            state,
            runtimes,
            load_lock: tokio::sync::Mutex::new(()),
            current: RwLock::new(None),
        }
    }

    pub fn state(&self) -> &Arc<AllocationState> {
        &self.state
    }

    pub fn is_loaded(&self) -> bool {
        self.current.read().is_some()
    }

    pub fn loaded(&self) -> Option<Arc<LoadedModel>> {
        self.current.read().clone()
    }

    /// Load once. Concurrent callers wait on the load lock and share the result.
    pub async fn load(&self) -> ServeResult<Arc<LoadedModel>> {
        if let Some(model) = self.loaded() {
            return Ok(model);
        }
        let _guard = self.load_lock.lock().await;
        if let Some(model) = self.loaded() {
            return Ok(model);
        }

        self.optimize_memory();
        let model = self.load_locked().await?;
        *self.current.write() = Some(model.clone());
        self.optimize_memory();

        tracing::info!(
            device = %model.device,
            format = %model.format(),
            path = %model.artifact.path.display(),
            "Model loaded"
        );
        Ok(model)
    }

    async fn load_locked(&self) -> ServeResult<Arc<LoadedModel>> {
        let selection = self.state.current();
        let (artifact, runtime) = self.resolve_runtime(detect_format(&self.config.model.path)?)?;

        match self.try_load(&artifact, runtime.as_ref(), &selection).await {
            Ok(model) => Ok(model),
            Err(err) if selection.plan.device == DeviceKind::IntegratedGpu => {
                tracing::warn!(error = %err, "Integrated GPU load failed, falling back to CPU");
                let state = self.state.clone();
                let fallback = tokio::task::spawn_blocking(move || state.fall_back_to_cpu())
                    .await
                    .map_err(|e| ServeError::ModelLoadFailed(format!("CPU fallback aborted: {e}")))?;
                self.try_load(&artifact, runtime.as_ref(), &fallback)
                    .await
                    .map_err(|cpu_err| {
                        ServeError::ModelLoadFailed(format!(
                            "integrated GPU: {err}; CPU fallback: {cpu_err}"
                        ))
                    })
            }
            Err(err) => Err(err),
        }
    }

    /// Pick the runtime for `artifact`, switching to the full-precision
    /// fallback model when no packed runtime is registered.
    fn resolve_runtime(
        &self,
        artifact: ModelArtifact,
    ) -> ServeResult<(ModelArtifact, Arc<dyn ModelRuntime>)> {
        if let Some(runtime) = self.runtimes.get(artifact.format) {
            return Ok((artifact, runtime));
        }

        if artifact.format == ModelFormat::Packed {
            if let (Some(runtime), Some(path)) = (
                self.runtimes.get(ModelFormat::FullPrecision),
                self.config.model.fallback_path.as_ref(),
            ) {
                tracing::warn!(
                    fallback = %path.display(),
                    "Packed runtime unavailable, using full-precision model"
                );
                let mut fallback = detect_format(path)?;
                fallback.format = ModelFormat::FullPrecision;
                return Ok((fallback, runtime));
            }
        }

        Err(ServeError::RuntimeUnavailable(format!(
            "no {} runtime registered for {}",
            artifact.format,
            artifact.path.display()
        )))
    }

    async fn try_load(
        &self,
        artifact: &ModelArtifact,
        runtime: &dyn ModelRuntime,
        selection: &Selection,
    ) -> ServeResult<Arc<LoadedModel>> {
        let plan = &selection.plan;
        let params =
            LoadParameters::build(artifact.format, plan, &selection.snapshot, &self.config.loader);
        tracing::info!(
            runtime = runtime.name(),
            device = %plan.device,
            format = %artifact.format,
            budget_gb = plan.effective_memory_gb(),
            conservative = plan.use_conservative,
            "Loading model"
        );

        let request = LoadRequest {
            artifact: artifact.clone(),
            params: params.clone(),
            plan: plan.clone(),
        };
        let session = runtime.load(&request).await?;
        Ok(Arc::new(LoadedModel {
            artifact: artifact.clone(),
            device: plan.device,
            params,
            session,
            loaded_at: Utc::now(),
        }))
    }

    /// Release runtime caches and log memory before/after.
    pub fn optimize_memory(&self) {
        let probe = self.state.probe();
        let before = probe.memory_status();
        if let Some(model) = self.loaded() {
            model.session.release_cache();
        }
        let after = probe.memory_status();
        tracing::debug!(
            used_before_gb = before.used_gb(),
            used_after_gb = after.used_gb(),
            available_gb = after.available_gb,
            "Memory optimization pass"
        );
    }

    pub fn get_memory_info(&self) -> MemoryInfo {
        let memory = self.state.probe().memory_status();
        let selection = self.state.current();
        let model = self.loaded();
        MemoryInfo {
            total_gb: memory.total_gb,
            available_gb: memory.available_gb,
            used_gb: memory.used_gb(),
            percent_used: memory.percent_used(),
            device: model.as_ref().map(|m| m.device).unwrap_or(selection.plan.device),
            allocated_gb: selection.plan.effective_memory_gb(),
            conservative_mode: selection.plan.use_conservative,
            other_apps_gb: total_process_memory_gb(&selection.processes),
            cpu_percent: selection.snapshot.cpu_percent,
            model_format: model.as_ref().map(|m| m.format()),
            model_size_gb: model.as_ref().map(|m| m.artifact.size_gb()),
            model_path: model.as_ref().map(|m| m.artifact.path.clone()),
        }
    }
}

/// Split text into word chunks that concatenate back to the original.
pub fn word_chunks(text: &str) -> Vec<String> {
    text.split_inclusive(char::is_whitespace)
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl InferenceProvider for AdaptiveLoader {
    async fn load(&self) -> ServeResult<()> {
        AdaptiveLoader::load(self).await.map(|_| ())
    }

    fn is_loaded(&self) -> bool {
        AdaptiveLoader::is_loaded(self)
    }

    fn loaded_format(&self) -> Option<ModelFormat> {
        self.loaded().map(|m| m.format())
    }

    async fn generate(&self, prompt: &str, params: &SamplingParams) -> ServeResult<Completion> {
        let model = AdaptiveLoader::load(self).await?;
        model.session.complete(prompt, params).await
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        params: &SamplingParams,
    ) -> ServeResult<BoxStream<'static, ServeResult<String>>> {
        let model = AdaptiveLoader::load(self).await?;
        if let Some(native) = model.session.stream(prompt, params) {
            return Ok(native);
        }
        let completion = model.session.complete(prompt, params).await?;
        Ok(stream::iter(word_chunks(&completion.text).into_iter().map(Ok)).boxed())
    }

    fn optimize_memory(&self) {
        AdaptiveLoader::optimize_memory(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::PolicyOptions;
    use crate::device::{DeviceCatalog, DeviceDescriptor, PerformanceTier};
    use crate::probe::{StaticHost, SystemSnapshot};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoSession;

    #[async_trait]
    impl ModelSession for EchoSession {
        async fn complete(&self, prompt: &str, _params: &SamplingParams) -> ServeResult<Completion> {
            Ok(Completion::new(format!("echo {prompt}")))
        }
    }

    /// Counts loads; fails every load on the listed devices.
    struct CountingRuntime {
        format: ModelFormat,
        loads: AtomicUsize,
        fail_on: Vec<DeviceKind>,
        seen: parking_lot::Mutex<Vec<LoadRequest>>,
    }

    impl CountingRuntime {
        fn new(format: ModelFormat, fail_on: Vec<DeviceKind>) -> Arc<Self> {
            Arc::new(Self {
                format,
                loads: AtomicUsize::new(0),
                fail_on,
                seen: parking_lot::Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ModelRuntime for CountingRuntime {
        fn name(&self) -> &str {
            "counting"
        }

        fn format(&self) -> ModelFormat {
            self.format
        }

        async fn load(&self, request: &LoadRequest) -> ServeResult<Arc<dyn ModelSession>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().push(request.clone());
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            if self.fail_on.contains(&request.plan.device) {
                return Err(ServeError::ModelLoadFailed(format!("{} refused", request.plan.device)));
            }
            Ok(Arc::new(EchoSession))
        }
    }

    fn state_with(kind: DeviceKind) -> Arc<AllocationState> {
        let mut catalog = DeviceCatalog::from_descriptors([DeviceDescriptor::supported(
            DeviceKind::Cpu,
            "CPU (8 cores)",
            8.0,
            PerformanceTier::Standard,
        )]);
        if kind != DeviceKind::Cpu {
            catalog.insert(DeviceDescriptor::supported(kind, "GPU", 12.0, PerformanceTier::Pro));
        }
        let host = Arc::new(StaticHost::new(
            SystemSnapshot::with_memory_gb(32.0, 20.0),
            catalog,
            Vec::new(),
        ));
        Arc::new(AllocationState::initialize(host, PolicyOptions::default()))
    }

    fn packed_model(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("model.gguf");
        std::fs::write(&path, b"GGUF").unwrap();
        path
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_loads_share_one_load() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = CountingRuntime::new(ModelFormat::Packed, vec![]);
        let loader = Arc::new(AdaptiveLoader::new(
            ServeConfig::new(packed_model(&dir)),
            state_with(DeviceKind::DiscreteGpu),
            RuntimeSet::new().with(runtime.clone()),
        ));

        let (a, b) = tokio::join!(
            {
                let l = loader.clone();
                async move { l.load().await }
            },
            {
                let l = loader.clone();
                async move { l.load().await }
            }
        );
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(runtime.loads.load(Ordering::SeqCst), 1);
        assert!(loader.is_loaded());

        let seen = runtime.seen.lock();
        match &seen[0].params {
            LoadParameters::Packed(p) => assert_eq!(p.n_batch, 2048),
            other => panic!("unexpected params {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_integrated_failure_falls_back_to_cpu() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = CountingRuntime::new(ModelFormat::Packed, vec![DeviceKind::IntegratedGpu]);
        let state = state_with(DeviceKind::IntegratedGpu);
        assert_eq!(state.plan().device, DeviceKind::IntegratedGpu);

        let loader = AdaptiveLoader::new(
            ServeConfig::new(packed_model(&dir)),
            state.clone(),
            RuntimeSet::new().with(runtime.clone()),
        );
        let model = loader.load().await.unwrap();
        assert_eq!(model.device, DeviceKind::Cpu);
        assert_eq!(runtime.loads.load(Ordering::SeqCst), 2);
        assert!(state.plan().use_conservative);
        assert!(loader.get_memory_info().conservative_mode);
    }

    #[tokio::test]
    async fn test_second_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = CountingRuntime::new(
            ModelFormat::Packed,
            vec![DeviceKind::IntegratedGpu, DeviceKind::Cpu],
        );
        let loader = AdaptiveLoader::new(
            ServeConfig::new(packed_model(&dir)),
            state_with(DeviceKind::IntegratedGpu),
            RuntimeSet::new().with(runtime.clone()),
        );
        let err = loader.load().await.unwrap_err();
        assert!(matches!(err, ServeError::ModelLoadFailed(_)));
        assert!(!loader.is_loaded());
        assert_eq!(runtime.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_discrete_failure_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = CountingRuntime::new(ModelFormat::Packed, vec![DeviceKind::DiscreteGpu]);
        let loader = AdaptiveLoader::new(
            ServeConfig::new(packed_model(&dir)),
            state_with(DeviceKind::DiscreteGpu),
            RuntimeSet::new().with(runtime.clone()),
        );
        assert!(loader.load().await.is_err());
        assert_eq!(runtime.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_packed_without_runtime_uses_full_precision_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let fp_dir = dir.path().join("full");
        std::fs::create_dir(&fp_dir).unwrap();
        std::fs::write(fp_dir.join("config.json"), b"{}").unwrap();

        let runtime = CountingRuntime::new(ModelFormat::FullPrecision, vec![]);
        let loader = AdaptiveLoader::new(
            ServeConfig::new(packed_model(&dir)).with_fallback_model(&fp_dir),
            state_with(DeviceKind::DiscreteGpu),
            RuntimeSet::new().with(runtime.clone()),
        );
        let model = loader.load().await.unwrap();
        assert_eq!(model.format(), ModelFormat::FullPrecision);
        assert_eq!(model.artifact.path, fp_dir);
        match &model.params {
            LoadParameters::FullPrecision(p) => {
                assert!(p.half_precision);
                assert_eq!(p.max_input_tokens, 1024);
            }
            other => panic!("unexpected params {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_no_runtime_at_all() {
        let dir = tempfile::tempdir().unwrap();
        let loader = AdaptiveLoader::new(
            ServeConfig::new(packed_model(&dir)),
            state_with(DeviceKind::Cpu),
            RuntimeSet::new(),
        );
        let err = loader.load().await.unwrap_err();
        assert!(matches!(err, ServeError::RuntimeUnavailable(_)));
    }

    #[tokio::test]
    async fn test_missing_model() {
        let dir = tempfile::tempdir().unwrap();
        let loader = AdaptiveLoader::new(
            ServeConfig::new(dir.path().join("absent.gguf")),
            state_with(DeviceKind::Cpu),
            RuntimeSet::new().with(CountingRuntime::new(ModelFormat::Packed, vec![])),
        );
        assert!(matches!(loader.load().await, Err(ServeError::ModelNotFound(_))));
    }

    #[tokio::test]
    async fn test_word_level_stream_without_native_stream() {
        let dir = tempfile::tempdir().unwrap();
        let loader = AdaptiveLoader::new(
            ServeConfig::new(packed_model(&dir)),
            state_with(DeviceKind::Cpu),
            RuntimeSet::new().with(CountingRuntime::new(ModelFormat::Packed, vec![])),
        );
        let chunks: Vec<String> = InferenceProvider::generate_stream(
            &loader,
            "hi there",
            &SamplingParams::default(),
        )
        .await
        .unwrap()
        .map(|c| c.unwrap())
        .collect()
        .await;
        assert_eq!(chunks, vec!["echo ", "hi ", "there"]);
    }

    #[test]
    fn test_word_chunks_roundtrip_text() {
        let text = "one  two\nthree";
        assert_eq!(word_chunks(text).concat(), text);
        assert!(word_chunks("").is_empty());
    }
}
