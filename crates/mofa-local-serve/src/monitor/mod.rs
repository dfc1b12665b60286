//! Background resource monitoring.
//!
//! The monitor samples host metrics on an interval, turns threshold
//! violations into [`Alert`]s, de-duplicates them per `{resource}_{level}`
//! key and fans them out to registered callbacks. A critical memory alert
//! triggers a recomputation of the shared allocation plan.

pub mod alert;
pub mod thresholds;
pub mod tier;

pub use alert::{Alert, AlertAggregator, AlertLevel, ResourceType};
pub use thresholds::ThresholdSet;
pub use tier::PerformanceClass;

use crate::clock::{Clock, SystemClock};
use crate::config::MonitorConfig;
use crate::device::DeviceKind;
use crate::error::ServeResult;
use crate::probe::{HostProbe, ResourceMetrics};
use crate::state::AllocationState;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Alerts included in a status report.
pub const STATUS_RECENT_ALERTS: usize = 5;

/// Receives every emitted alert. An `Err` or a panic is logged and does not
/// affect the other callbacks.
pub type AlertCallback = Arc<dyn Fn(&Alert) -> ServeResult<()> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub tier: PerformanceClass,
    pub description: String,
    pub metrics: ResourceMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub timestamp: DateTime<Utc>,
    pub metrics: ResourceMetrics,
    pub performance: PerformanceReport,
    pub thresholds: ThresholdSet,
    pub recommendations: Vec<String>,
    pub recent_alerts: Vec<Alert>,
    /// Most recent summary of alerts suppressed by the cooldown
    pub suppressed_summary: Option<String>,
    pub monitoring_active: bool,
}

/// Advice derived from one metrics sample.
pub fn recommendations_for(metrics: &ResourceMetrics) -> Vec<String> {
    let mut out = Vec::new();
    if metrics.memory_available_gb < 8.0 {
        out.push("Close memory-intensive apps (browsers, IDEs)".to_string());
    }
    if metrics.memory_available_gb < 4.0 {
        out.push("Restart computer to free memory".to_string());
    }
    if metrics.cpu_percent > 80.0 {
        out.push("Close CPU-intensive apps (video editors, games)".to_string());
    }
    if metrics.cpu_percent > 90.0 {
        out.push("Avoid running multiple AI models".to_string());
    }
    if out.is_empty() {
        out.push("System resources are optimal".to_string());
    }
    out
}

pub struct ResourceMonitor {
    probe: Arc<dyn HostProbe>,
    config: MonitorConfig,
    thresholds: RwLock<ThresholdSet>,
    aggregator: AlertAggregator,
    callbacks: RwLock<Vec<AlertCallback>>,
    history: Mutex<VecDeque<Alert>>,
    latest: RwLock<Option<ResourceMetrics>>,
    last_summary: RwLock<Option<String>>,
    allocation: RwLock<Option<Arc<AllocationState>>>,
    running: AtomicBool,
    wake: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ResourceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceMonitor")
            .field("config", &self.config)
            .field("thresholds", &*self.thresholds.read())
            .field("callbacks", &self.callbacks.read().len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl ResourceMonitor {
    pub fn new(probe: Arc<dyn HostProbe>, config: MonitorConfig) -> Self {
        Self::with_clock(probe, config, Arc::new(SystemClock))
    }

    pub fn with_clock(probe: Arc<dyn HostProbe>, config: MonitorConfig, clock: Arc<dyn Clock>) -> Self {
        let aggregator =
            AlertAggregator::new(clock, config.alert_cooldown(), config.summary_interval());
        Self {
            probe,
            config,
            thresholds: RwLock::new(ThresholdSet::default()),
            aggregator,
            callbacks: RwLock::new(Vec::new()),
            history: Mutex::new(VecDeque::new()),
            latest: RwLock::new(None),
            last_summary: RwLock::new(None),
            allocation: RwLock::new(None),
            running: AtomicBool::new(false),
            wake: Notify::new(),
            task: Mutex::new(None),
        }
    }

    /// Follow `state`: thresholds track its plan, critical memory recomputes it.
    ///
    /// While attached, thresholds are re-derived from the current plan before
    /// every evaluation, so plan changes made elsewhere (a loader CPU fallback)
    /// are picked up without notifying the monitor.
    pub fn attach(&self, state: Arc<AllocationState>) {
        let plan = state.plan();
        *self.allocation.write() = Some(state);
        self.adjust_thresholds(plan.device, plan.use_conservative);
    }

    /// Re-derive thresholds from the attached plan if it moved.
    fn sync_thresholds(&self) {
        let Some(state) = self.allocation.read().clone() else {
            return;
        };
        let plan = state.plan();
        if *self.thresholds.read() != ThresholdSet::for_device(plan.device, plan.use_conservative) {
            self.adjust_thresholds(plan.device, plan.use_conservative);
        }
    }

    pub fn adjust_thresholds(&self, device: DeviceKind, conservative: bool) {
        let next = ThresholdSet::for_device(device, conservative);
        *self.thresholds.write() = next;
        info!(
            device = %device,
            conservative,
            memory_warning_gb = next.memory_warning_gb,
            memory_critical_gb = next.memory_critical_gb,
            "Alert thresholds adjusted"
        );
    }

    pub fn get_current_thresholds(&self) -> ThresholdSet {
        self.sync_thresholds();
        *self.thresholds.read()
    }

    pub fn add_alert_callback<F>(&self, callback: F)
    where
        F: Fn(&Alert) -> ServeResult<()> + Send + Sync + 'static,
    {
        self.callbacks.write().push(Arc::new(callback));
    }

    /// Evaluation against the current thresholds. No de-dup, no history, no dispatch.
    pub fn check_alerts(&self, metrics: &ResourceMetrics) -> Vec<Alert> {
        alert::evaluate(metrics, &self.get_current_thresholds(), self.aggregator.now_millis())
    }

    /// Evaluate, de-duplicate, record and dispatch. Returns the emitted alerts.
    ///
    /// Callbacks and history only see alerts. The periodic summary of
    /// suppressed alerts is logged and kept for [`suppressed_summary`](Self::suppressed_summary).
    pub fn process(&self, metrics: ResourceMetrics) -> Vec<Alert> {
        let candidates = self.check_alerts(&metrics);
        *self.latest.write() = Some(metrics);

        let emitted: Vec<Alert> = candidates
            .into_iter()
            .filter(|a| self.aggregator.admit(&a.key()))
            .collect();

        for alert in &emitted {
            self.record(alert.clone());
            match alert.level {
                AlertLevel::Critical => error!(
                    resource = alert.resource_type.as_str(),
                    value = alert.current_value,
                    threshold = alert.threshold,
                    "{}", alert.message
                ),
                AlertLevel::Warning => warn!(
                    resource = alert.resource_type.as_str(),
                    value = alert.current_value,
                    threshold = alert.threshold,
                    "{}", alert.message
                ),
            }
            self.dispatch(alert);
        }

        let memory_critical = emitted
            .iter()
            .any(|a| a.resource_type == ResourceType::Memory && a.level == AlertLevel::Critical);
        if memory_critical {
            self.recompute_allocation();
        }

        if let Some(summary) = self.aggregator.take_summary() {
            info!("{summary}");
            *self.last_summary.write() = Some(summary);
        }
        emitted
    }

    fn record(&self, alert: Alert) {
        let mut history = self.history.lock();
        history.push_back(alert);
        while history.len() > self.config.history_limit {
            history.pop_front();
        }
    }

    fn dispatch(&self, alert: &Alert) {
        let callbacks = self.callbacks.read().clone();
        for callback in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(alert))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, alert = %alert.key(), "Alert callback failed"),
                Err(_) => error!(alert = %alert.key(), "Alert callback panicked"),
            }
        }
    }

    fn recompute_allocation(&self) {
        let Some(state) = self.allocation.read().clone() else {
            return;
        };
        warn!("Critical memory pressure, recomputing allocation");
        let selection = state.refresh();
        self.adjust_thresholds(selection.plan.device, selection.plan.use_conservative);
    }

    /// One blocking sample-and-process cycle.
    pub fn evaluate_once(&self) -> Vec<Alert> {
        let metrics = self.probe.sample_metrics();
        debug!(
            memory_available_gb = metrics.memory_available_gb,
            cpu_percent = metrics.cpu_percent,
            "Resource sample"
        );
        self.process(metrics)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start the background loop. Returns false if already running.
    pub fn start(self: &Arc<Self>, interval: Duration) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!("Starting resource monitoring with interval {:?}", interval);

        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while monitor.running.load(Ordering::SeqCst) {
                let worker = Arc::clone(&monitor);
                if let Err(e) = tokio::task::spawn_blocking(move || worker.evaluate_once()).await {
                    error!(error = %e, "Resource sampling task failed");
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = monitor.wake.notified() => {}
                }
            }
            debug!("Resource monitoring loop exited");
        });
        *self.task.lock() = Some(handle);
        true
    }

    /// Start with the configured interval.
    pub fn start_default(self: &Arc<Self>) -> bool {
        self.start(self.config.interval())
    }

    /// Stop the loop and wait for it to exit.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.wake.notify_one();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Resource monitoring task ended abnormally");
            }
        }
        info!("Resource monitoring stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Reports
    // ========================================================================

    fn metrics_or_sample(&self) -> ResourceMetrics {
        let latest = self.latest.read().clone();
        latest.unwrap_or_else(|| self.probe.sample_metrics())
    }

    pub fn get_performance_tier(&self) -> PerformanceReport {
        let metrics = self.metrics_or_sample();
        let tier = PerformanceClass::classify(metrics.memory_available_gb, metrics.cpu_percent);
        PerformanceReport {
            tier,
            description: tier.description().to_string(),
            metrics,
        }
    }

    pub fn get_recommendations(&self) -> Vec<String> {
        recommendations_for(&self.metrics_or_sample())
    }

    pub fn suppressed_summary(&self) -> Option<String> {
        self.last_summary.read().clone()
    }

    pub fn alert_history(&self) -> Vec<Alert> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn status_report(&self) -> StatusReport {
        let performance = self.get_performance_tier();
        let recent_alerts = {
            let history = self.history.lock();
            let skip = history.len().saturating_sub(STATUS_RECENT_ALERTS);
            history.iter().skip(skip).cloned().collect()
        };
        StatusReport {
            timestamp: Utc::now(),
            metrics: performance.metrics.clone(),
            recommendations: recommendations_for(&performance.metrics),
            performance,
            thresholds: self.get_current_thresholds(),
            recent_alerts,
            suppressed_summary: self.suppressed_summary(),
            monitoring_active: self.is_running(),
        }
    }
}
