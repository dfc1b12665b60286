//! Supervised generation: bounded retries with widened sampling, response
//! validation and a templated fallback reply.
//!
//! Only a failure to load the model is returned as an error. Rejected or
//! failed attempts are retried; when every attempt is spent the caller gets
//! [`fallback::fallback_response`] with `fallback = true`.

pub mod fallback;
pub mod params;
pub mod prompt;
pub mod validate;

use crate::config::GenerationConfig;
use crate::error::ServeResult;
use crate::loader::InferenceProvider;
use crate::loader::format::ModelFormat;
use fallback::fallback_response;
use futures::StreamExt;
use futures::stream::BoxStream;
use params::SamplingParams;
use prompt::{Usage, estimate_usage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use validate::{DefaultValidator, ResponseValidator, strip_sentinels};

/// Chunks buffered between the producer task and the consumer.
const STREAM_BUFFER: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationMetrics {
    pub generation_time_secs: f64,
    pub tokens_generated: u32,
    pub tokens_per_second: f64,
    pub usage: Usage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutcome {
    pub text: String,
    /// Attempts made, including the accepted one
    pub attempts: u32,
    /// True when `text` is the templated fallback
    pub fallback: bool,
    pub metrics: GenerationMetrics,
}

pub struct GenerationSupervisor {
    provider: Arc<dyn InferenceProvider>,
    validator: Arc<dyn ResponseValidator>,
    config: GenerationConfig,
}

impl std::fmt::Debug for GenerationSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationSupervisor")
            .field("config", &self.config)
            .finish()
    }
}

impl GenerationSupervisor {
    pub fn new(provider: Arc<dyn InferenceProvider>, config: GenerationConfig) -> Self {
        Self {
            provider,
            validator: Arc::new(DefaultValidator),
            config,
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn ResponseValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    /// Generate with the configured sampling defaults.
    pub async fn generate_default(&self, prompt: &str) -> ServeResult<GenerationOutcome> {
        let params = self.config.sampling.clone();
        self.generate(prompt, &params).await
    }

    pub async fn generate(
        &self,
        prompt: &str,
        params: &SamplingParams,
    ) -> ServeResult<GenerationOutcome> {
        self.provider.load().await?;
        let format = self.provider.loaded_format();
        let started = Instant::now();
        let max_attempts = self.config.max_attempts.max(1);

        for attempt in 0..max_attempts {
            if attempt > 0 && !self.config.retry_pause().is_zero() {
                tokio::time::sleep(self.config.retry_pause()).await;
            }
            let attempt_params = params.widen(attempt);
            if self.config.optimize_memory {
                self.provider.optimize_memory();
            }

            match self.provider.generate(prompt, &attempt_params).await {
                Ok(completion) if self.validator.is_valid(strip_sentinels(&completion.text)) => {
                    let text = strip_sentinels(&completion.text).trim().to_string();
                    let metrics =
                        build_metrics(prompt, &text, completion.tokens_generated, format, started);
                    tracing::info!(
                        attempts = attempt + 1,
                        tokens = metrics.tokens_generated,
                        tokens_per_second = metrics.tokens_per_second,
                        "Generation accepted"
                    );
                    self.after_generation();
                    return Ok(GenerationOutcome {
                        text,
                        attempts: attempt + 1,
                        fallback: false,
                        metrics,
                    });
                }
                Ok(_) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        temperature = attempt_params.temperature,
                        max_tokens = attempt_params.max_tokens,
                        "Response rejected by validator"
                    );
                }
                Err(e) => {
                    tracing::warn!(attempt = attempt + 1, error = %e, "Generation attempt failed");
                }
            }
        }

        tracing::warn!(attempts = max_attempts, "All attempts rejected, using fallback reply");
        self.after_generation();
        let text = fallback_response(prompt).to_string();
        Ok(GenerationOutcome {
            metrics: build_metrics(prompt, &text, None, format, started),
            text,
            attempts: max_attempts,
            fallback: true,
        })
    }

    fn after_generation(&self) {
        if self.config.optimize_memory {
            self.provider.optimize_memory();
        }
    }

    /// Stream chunks from a background task.
    ///
    /// The model is loaded before returning so load failures surface here. A
    /// stream that ends without producing any chunk yields the fallback reply.
    pub async fn generate_stream(
        &self,
        prompt: &str,
        params: &SamplingParams,
    ) -> ServeResult<BoxStream<'static, ServeResult<String>>> {
        self.provider.load().await?;

        let (tx, rx) = tokio::sync::mpsc::channel(STREAM_BUFFER);
        let provider = Arc::clone(&self.provider);
        let prompt = prompt.to_string();
        let params = params.clone();
        let optimize = self.config.optimize_memory;

        tokio::spawn(async move {
            if optimize {
                provider.optimize_memory();
            }
            let mut produced = false;
            match provider.generate_stream(&prompt, &params).await {
                Ok(mut chunks) => {
                    while let Some(chunk) = chunks.next().await {
                        match chunk {
                            Ok(text) if text.is_empty() => continue,
                            Ok(text) => {
                                produced = true;
                                if tx.send(Ok(text)).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "Stream chunk failed");
                                break;
                            }
                        }
                        tokio::task::yield_now().await;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Streaming generation failed"),
            }
            if !produced {
                let _ = tx.send(Ok(fallback_response(&prompt).to_string())).await;
            }
            if optimize {
                provider.optimize_memory();
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}

fn build_metrics(
    prompt: &str,
    text: &str,
    exact_tokens: Option<u32>,
    format: Option<ModelFormat>,
    started: Instant,
) -> GenerationMetrics {
    let elapsed = started.elapsed().as_secs_f64();
    let usage = estimate_usage(prompt, text, format);
    let tokens_generated = exact_tokens.unwrap_or(usage.completion_tokens);
    let tokens_per_second = if elapsed > 0.0 {
        tokens_generated as f64 / elapsed
    } else {
        0.0
    };
    GenerationMetrics {
        generation_time_secs: elapsed,
        tokens_generated,
        tokens_per_second,
        usage,
    }
}
