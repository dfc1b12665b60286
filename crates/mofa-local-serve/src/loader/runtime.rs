//! Runtime strategies.
//!
//! The crate ships no numerics. Concrete inference engines plug in by
//! implementing [`ModelRuntime`] (loading) and [`ModelSession`] (a loaded model).

use crate::allocation::AllocationPlan;
use crate::error::ServeResult;
use crate::generation::params::SamplingParams;
use crate::loader::format::{ModelArtifact, ModelFormat};
use crate::loader::params::LoadParameters;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Everything a runtime needs to load one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadRequest {
    pub artifact: ModelArtifact,
    pub params: LoadParameters,
    pub plan: AllocationPlan,
}

/// Output of one non-streaming generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    /// Exact count when the runtime knows it
    pub tokens_generated: Option<u32>,
}

impl Completion {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tokens_generated: None,
        }
    }
}

/// A loaded model.
#[async_trait]
pub trait ModelSession: Send + Sync {
    async fn complete(&self, prompt: &str, params: &SamplingParams) -> ServeResult<Completion>;

    /// Native chunk stream, if the runtime produces one.
    ///
    /// `None` makes callers fall back to word-level chunks of [`complete`](Self::complete).
    fn stream(
        &self,
        _prompt: &str,
        _params: &SamplingParams,
    ) -> Option<BoxStream<'static, ServeResult<String>>> {
        None
    }

    /// Drop transient caches (KV cache, allocator pools).
    fn release_cache(&self) {}
}

/// Loads artifacts of one format.
#[async_trait]
pub trait ModelRuntime: Send + Sync {
    fn name(&self) -> &str;

    fn format(&self) -> ModelFormat;

    async fn load(&self, request: &LoadRequest) -> ServeResult<Arc<dyn ModelSession>>;
}

/// Registered runtimes, at most one per format.
#[derive(Clone, Default)]
pub struct RuntimeSet {
    packed: Option<Arc<dyn ModelRuntime>>,
    full_precision: Option<Arc<dyn ModelRuntime>>,
}

impl std::fmt::Debug for RuntimeSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeSet")
            .field("packed", &self.packed.as_ref().map(|r| r.name().to_string()))
            .field(
                "full_precision",
                &self.full_precision.as_ref().map(|r| r.name().to_string()),
            )
            .finish()
    }
}

impl RuntimeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a runtime under the format it reports.
    pub fn with(mut self, runtime: Arc<dyn ModelRuntime>) -> Self {
        match runtime.format() {
            ModelFormat::Packed => self.packed = Some(runtime),
            ModelFormat::FullPrecision => self.full_precision = Some(runtime),
        }
        self
    }

    pub fn get(&self, format: ModelFormat) -> Option<Arc<dyn ModelRuntime>> {
        match format {
            ModelFormat::Packed => self.packed.clone(),
            ModelFormat::FullPrecision => self.full_precision.clone(),
        }
    }
}
