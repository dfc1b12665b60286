//! mofa-serve-probe: inspect this host the way the serving process would.
//!
//! Probes the host, prints the device catalog, the allocation plan and the
//! pre-flight checks, then writes the diagnostics document.
//!
//! # Usage
//!
//! ```text
//! mofa-serve-probe [CONFIG_FILE]
//! ```
//!
//! # Environment variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `MOFA_SERVE__*` | *(none)* | Overrides for any config key, `__` separated. |
//! | `MOFA_SERVE_PROBE_WATCH_SECS` | `0` | Run the resource monitor this long before exiting. |

use anyhow::Context;
use mofa_local_serve::allocation::{self, CheckStatus};
use mofa_local_serve::{
    AllocationState, LocalHost, PolicyOptions, ResourceMonitor, ServeConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_DIAGNOSTICS_PATH: &str = "mofa-serve-diagnostics.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("mofa_local_serve=info,mofa_serve_probe=info")),
        )
        .init();

    let config_path = std::env::args().nth(1);
    let config = ServeConfig::load(config_path.as_deref()).context("loading configuration")?;

    let options = PolicyOptions {
        device_override: config.device_override,
    };
    let state = tokio::task::spawn_blocking(move || {
        Arc::new(AllocationState::initialize(Arc::new(LocalHost), options))
    })
    .await
    .context("probing host")?;

    let selection = state.current();
    println!("Devices:");
    for d in selection.catalog.iter() {
        let status = if d.supported {
            "supported".to_string()
        } else {
            d.error_message.clone().unwrap_or_else(|| "unsupported".to_string())
        };
        println!(
            "  {:<15} {:<32} {:>6.1}GB  {:<12} {}",
            d.device_type.to_string(),
            d.device_name,
            d.memory_gb,
            d.performance_tier.to_string(),
            status
        );
    }

    println!("\nAllocation plan:");
    println!("{}", serde_json::to_string_pretty(&selection.plan)?);

    let report = allocation::validate(&selection.snapshot, &selection.catalog, &selection.plan);
    println!("\nPre-flight checks:");
    for check in &report.checks {
        let mark = match check.status {
            CheckStatus::Passed => "ok  ",
            CheckStatus::Warning => "warn",
            CheckStatus::Failed => "FAIL",
        };
        println!("  [{mark}] {}: {}", check.name, check.message);
    }

    for rec in selection.recommendations() {
        println!("  - {rec}");
    }

    let path = config
        .diagnostics_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DIAGNOSTICS_PATH));
    state
        .diagnostic_snapshot()
        .write_to(&path)
        .with_context(|| format!("writing diagnostics to {}", path.display()))?;

    let watch_secs: u64 = std::env::var("MOFA_SERVE_PROBE_WATCH_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if watch_secs > 0 {
        let monitor = Arc::new(ResourceMonitor::new(state.probe().clone(), config.monitor.clone()));
        monitor.attach(state.clone());
        monitor.add_alert_callback(|alert| {
            println!("  alert: {} ({})", alert.message, alert.recommendation);
            Ok(())
        });
        monitor.start_default();
        tokio::time::sleep(Duration::from_secs(watch_secs)).await;
        monitor.stop().await;

        let status = monitor.status_report();
        info!(
            tier = %status.performance.tier,
            alerts = status.recent_alerts.len(),
            "Monitoring finished"
        );
    }

    if !report.success {
        anyhow::bail!("pre-flight checks failed");
    }
    Ok(())
}
