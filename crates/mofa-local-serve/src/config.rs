//! Configuration for the local serving control plane
//!
//! Loaded from an optional file (format detected from the extension) with
//! `${VAR}` substitution, then overridden by `MOFA_SERVE__*` environment
//! variables using `__` for nesting, e.g. `MOFA_SERVE__MONITOR__INTERVAL_SECS=5`.

use crate::device::DeviceKind;
use crate::error::{ServeError, ServeResult};
use crate::generation::params::SamplingParams;
use crate::loader::params::GpuLayers;
use config::{Config as Cfg, Environment, File, FileFormat};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

/// Environment prefix for overrides
pub const ENV_PREFIX: &str = "MOFA_SERVE";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServeConfig {
    pub model: ModelConfig,

    /// Force a specific device instead of priority selection.
    /// Ignored (with a warning) when the device is not supported.
    pub device_override: Option<DeviceKind>,

    pub monitor: MonitorConfig,
    pub loader: LoaderConfig,
    pub generation: GenerationConfig,

    /// Where `mofa-serve-probe` writes the diagnostics document
    pub diagnostics_path: Option<PathBuf>,
}

/// Model artifacts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Primary model: a `.gguf` file, a directory containing one, or a
    /// full-precision model directory
    pub path: PathBuf,

    /// Full-precision model used when the packed runtime is unavailable
    pub fallback_path: Option<PathBuf>,
}

/// Background monitor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval_secs: u64,
    /// Alerts kept in history
    pub history_limit: usize,
    /// Minimum gap between two emissions of the same alert key
    pub alert_cooldown_secs: u64,
    /// Period of the suppressed-alert summary
    pub summary_interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            history_limit: 100,
            alert_cooldown_secs: 30,
            summary_interval_secs: 60,
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn alert_cooldown(&self) -> Duration {
        Duration::from_secs(self.alert_cooldown_secs)
    }

    pub fn summary_interval(&self) -> Duration {
        Duration::from_secs(self.summary_interval_secs)
    }
}

/// Overrides applied on top of the device defaults for the packed runtime
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub n_ctx: Option<u32>,
    pub n_batch: Option<u32>,
    pub n_threads: Option<usize>,
    /// `-1` offloads every layer
    pub n_gpu_layers: Option<GpuLayers>,
}

/// Generation supervisor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub max_attempts: u32,
    /// Pause between attempts
    pub retry_pause_ms: u64,
    /// Release runtime caches around each generation
    pub optimize_memory: bool,
    pub sampling: SamplingParams,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_pause_ms: 500,
            optimize_memory: true,
            sampling: SamplingParams::default(),
        }
    }
}

impl GenerationConfig {
    pub fn retry_pause(&self) -> Duration {
        Duration::from_millis(self.retry_pause_ms)
    }
}

impl ServeConfig {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model: ModelConfig {
                path: model_path.into(),
                fallback_path: None,
            },
            ..Default::default()
        }
    }

    /// Force a specific device
    pub fn with_device(mut self, device: DeviceKind) -> Self {
        self.device_override = Some(device);
        self
    }

    pub fn with_fallback_model(mut self, path: impl Into<PathBuf>) -> Self {
        self.model.fallback_path = Some(path.into());
        self
    }

    /// Set the monitor sampling interval
    pub fn with_monitor_interval(mut self, secs: u64) -> Result<Self, &'static str> {
        if secs == 0 {
            return Err("monitor interval must be > 0");
        }
        self.monitor.interval_secs = secs;
        Ok(self)
    }

    /// Set the context window
    pub fn with_context(mut self, n_ctx: u32) -> Result<Self, &'static str> {
        if n_ctx == 0 {
            return Err("n_ctx must be > 0");
        }
        self.loader.n_ctx = Some(n_ctx);
        Ok(self)
    }

    /// Set the prompt batch size
    pub fn with_batch(mut self, n_batch: u32) -> Result<Self, &'static str> {
        if n_batch == 0 {
            return Err("n_batch must be > 0");
        }
        self.loader.n_batch = Some(n_batch);
        Ok(self)
    }

    /// Set number of inference threads
    pub fn with_threads(mut self, threads: usize) -> Result<Self, &'static str> {
        if threads == 0 {
            return Err("n_threads must be > 0");
        }
        self.loader.n_threads = Some(threads);
        Ok(self)
    }

    pub fn with_gpu_layers(mut self, layers: GpuLayers) -> Self {
        self.loader.n_gpu_layers = Some(layers);
        self
    }

    /// Set the number of generation attempts before falling back
    pub fn with_max_attempts(mut self, attempts: u32) -> Result<Self, &'static str> {
        if attempts == 0 {
            return Err("max_attempts must be > 0");
        }
        self.generation.max_attempts = attempts;
        Ok(self)
    }

    pub fn with_retry_pause_ms(mut self, ms: u64) -> Self {
        self.generation.retry_pause_ms = ms;
        self
    }

    /// Set default sampling temperature
    pub fn with_temperature(mut self, temp: f32) -> Result<Self, &'static str> {
        if !(0.0..=2.0).contains(&temp) {
            return Err("temperature must be between 0.0 and 2.0");
        }
        self.generation.sampling.temperature = temp;
        Ok(self)
    }

    /// Reject values the builders would have refused
    pub fn validate(&self) -> ServeResult<()> {
        let fail = |m: &str| Err(ServeError::ConfigError(m.to_string()));
        if self.monitor.interval_secs == 0 {
            return fail("monitor.interval_secs must be > 0");
        }
        if self.monitor.history_limit == 0 {
            return fail("monitor.history_limit must be > 0");
        }
        if self.generation.max_attempts == 0 {
            return fail("generation.max_attempts must be > 0");
        }
        if !(0.0..=2.0).contains(&self.generation.sampling.temperature) {
            return fail("generation.sampling.temperature must be between 0.0 and 2.0");
        }
        if matches!(self.loader.n_ctx, Some(0)) || matches!(self.loader.n_batch, Some(0)) {
            return fail("loader.n_ctx and loader.n_batch must be > 0");
        }
        Ok(())
    }

    /// Load from an optional file plus `MOFA_SERVE__*` environment overrides
    pub fn load(path: Option<&str>) -> ServeResult<Self> {
        Self::load_with_env(
            path,
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
    }

    fn load_with_env(path: Option<&str>, env: Environment) -> ServeResult<Self> {
        let mut builder = Cfg::builder();
        if let Some(path) = path {
            let format = detect_format(path)?;
            let content = std::fs::read_to_string(path)?;
            builder = builder.add_source(File::from_str(&substitute_env_vars(&content), format));
        }
        let cfg: ServeConfig = builder.add_source(env).build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Detect configuration format from file extension
pub fn detect_format(path: &str) -> ServeResult<FileFormat> {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| ServeError::ConfigError(format!("no file extension: {path}")))?;

    match ext.to_lowercase().as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "toml" => Ok(FileFormat::Toml),
        "json" => Ok(FileFormat::Json),
        _ => Err(ServeError::ConfigError(format!("unsupported format: {ext}"))),
    }
}

static ENV_VAR_REF: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").ok());

/// Replace `${VAR}` references with environment values; unknown variables
/// are left untouched
pub fn substitute_env_vars(content: &str) -> String {
    let Some(re) = ENV_VAR_REF.as_ref() else {
        return content.to_string();
    };
    re.replace_all(content, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
    })
    .into_owned()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn no_env() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
            .source(Some(HashMap::new()))
    }

    #[test]
    fn test_default_config() {
        let cfg = ServeConfig::default();
        assert_eq!(cfg.monitor.interval_secs, 10);
        assert_eq!(cfg.monitor.history_limit, 100);
        assert_eq!(cfg.generation.max_attempts, 3);
        assert_eq!(cfg.generation.retry_pause_ms, 500);
        assert!(cfg.device_override.is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_builders_reject_zero() {
        assert!(ServeConfig::new("/m").with_monitor_interval(0).is_err());
        assert!(ServeConfig::new("/m").with_context(0).is_err());
        assert!(ServeConfig::new("/m").with_batch(0).is_err());
        assert!(ServeConfig::new("/m").with_threads(0).is_err());
        assert!(ServeConfig::new("/m").with_max_attempts(0).is_err());
        assert!(ServeConfig::new("/m").with_temperature(2.5).is_err());
    }

    #[test]
    fn test_builder_chain() {
        let cfg = ServeConfig::new("/models/llama.gguf")
            .with_device(DeviceKind::Cpu)
            .with_gpu_layers(GpuLayers::All)
            .with_batch(128)
            .unwrap();
        assert_eq!(cfg.device_override, Some(DeviceKind::Cpu));
        assert_eq!(cfg.loader.n_gpu_layers, Some(GpuLayers::All));
        assert_eq!(cfg.loader.n_batch, Some(128));
    }

    #[test]
    fn test_load_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("serve.toml");
        std::fs::write(
            &path,
            r#"
device_override = "discrete_gpu"

[model]
path = "/models/llama-3.2-3b.gguf"

[monitor]
interval_secs = 5

[loader]
n_ctx = 4096
n_gpu_layers = -1
"#,
        )
        .unwrap();

        let cfg = ServeConfig::load_with_env(path.to_str(), no_env()).unwrap();
        assert_eq!(cfg.device_override, Some(DeviceKind::DiscreteGpu));
        assert_eq!(cfg.model.path, PathBuf::from("/models/llama-3.2-3b.gguf"));
        assert_eq!(cfg.monitor.interval_secs, 5);
        assert_eq!(cfg.monitor.history_limit, 100);
        assert_eq!(cfg.loader.n_ctx, Some(4096));
        assert_eq!(cfg.loader.n_gpu_layers, Some(GpuLayers::All));
    }

    #[test]
    fn test_env_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("serve.json");
        std::fs::write(&path, r#"{ "monitor": { "interval_secs": 5 } }"#).unwrap();

        let mut vars = HashMap::new();
        vars.insert("MOFA_SERVE__MONITOR__INTERVAL_SECS".to_string(), "20".to_string());
        vars.insert("MOFA_SERVE__GENERATION__MAX_ATTEMPTS".to_string(), "5".to_string());
        let env = Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
            .source(Some(vars));

        let cfg = ServeConfig::load_with_env(path.to_str(), env).unwrap();
        assert_eq!(cfg.monitor.interval_secs, 20);
        assert_eq!(cfg.generation.max_attempts, 5);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("serve.toml");
        std::fs::write(&path, "[monitor]\ninterval_secs = 0\n").unwrap();
        let err = ServeConfig::load_with_env(path.to_str(), no_env()).unwrap_err();
        assert!(matches!(err, ServeError::ConfigError(_)));
    }

    #[test]
    fn test_detect_format() {
        assert_eq!(detect_format("a.toml").unwrap(), FileFormat::Toml);
        assert_eq!(detect_format("a.yml").unwrap(), FileFormat::Yaml);
        assert_eq!(detect_format("a.json").unwrap(), FileFormat::Json);
        assert!(detect_format("a.txt").is_err());
        assert!(detect_format("noext").is_err());
    }

    #[test]
    fn test_substitute_leaves_unknown_vars() {
        let out = substitute_env_vars("path = \"${MOFA_SERVE_TEST_SURELY_UNSET_VAR}/m\"");
        assert_eq!(out, "path = \"${MOFA_SERVE_TEST_SURELY_UNSET_VAR}/m\"");
    }
}
