//! Engine Metrics
//!
//! Prometheus counters and gauges registered in the default registry and
//! served by the metrics endpoint of the binary.

use prometheus::{IntCounterVec, IntGaugeVec, Opts};
use std::sync::OnceLock;
use tracing::warn;

/// Engine metric families
pub struct Metrics {
    controller_runs: Option<IntCounterVec>,
    controller_errors: Option<IntCounterVec>,
    controller_panics: Option<IntCounterVec>,
    merge_conflicts: Option<IntCounterVec>,
    operator_panics: Option<IntCounterVec>,
    probe_results: Option<IntCounterVec>,
    readiness: Option<IntGaugeVec>,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Process-wide metrics
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::register)
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> Option<IntCounterVec> {
    let counter = IntCounterVec::new(Opts::new(name, help), labels)
        .map_err(|e| warn!(metric = name, error = %e, "invalid metric"))
        .ok()?;

    if let Err(e) = prometheus::register(Box::new(counter.clone())) {
        warn!(metric = name, error = %e, "failed to register metric");
    }

    Some(counter)
}

fn gauge_vec(name: &str, help: &str, labels: &[&str]) -> Option<IntGaugeVec> {
    let gauge = IntGaugeVec::new(Opts::new(name, help), labels)
        .map_err(|e| warn!(metric = name, error = %e, "invalid metric"))
        .ok()?;

    if let Err(e) = prometheus::register(Box::new(gauge.clone())) {
        warn!(metric = name, error = %e, "failed to register metric");
    }

    Some(gauge)
}

impl Metrics {
    fn register() -> Self {
        Self {
            controller_runs: counter_vec(
                "netd_controller_runs_total",
                "Completed controller reconciliation passes",
                &["controller"],
            ),
            controller_errors: counter_vec(
                "netd_controller_errors_total",
                "Controller runs that returned an error",
                &["controller"],
            ),
            controller_panics: counter_vec(
                "netd_controller_panics_total",
                "Controller runs that panicked",
                &["controller"],
            ),
            merge_conflicts: counter_vec(
                "netd_merge_conflicts_total",
                "Merge outputs held back by pending finalizers",
                &["controller"],
            ),
            operator_panics: counter_vec(
                "netd_operator_panics_total",
                "Operator tasks that panicked",
                &["operator", "link"],
            ),
            probe_results: counter_vec(
                "netd_probe_results_total",
                "Probe attempts by outcome",
                &["probe", "result"],
            ),
            readiness: gauge_vec(
                "netd_ready",
                "Readiness bits of the aggregate network status",
                &["condition"],
            ),
        }
    }

    pub fn controller_run(&self, controller: &str) {
        if let Some(c) = &self.controller_runs {
            c.with_label_values(&[controller]).inc();
        }
    }

    pub fn controller_error(&self, controller: &str) {
        if let Some(c) = &self.controller_errors {
            c.with_label_values(&[controller]).inc();
        }
    }

    pub fn controller_panic(&self, controller: &str) {
        if let Some(c) = &self.controller_panics {
            c.with_label_values(&[controller]).inc();
        }
    }

    pub fn merge_conflicts(&self, controller: &str, count: usize) {
        if let Some(c) = &self.merge_conflicts {
            c.with_label_values(&[controller]).inc_by(count as u64);
        }
    }

    pub fn operator_panic(&self, operator: &str, link: &str) {
        if let Some(c) = &self.operator_panics {
            c.with_label_values(&[operator, link]).inc();
        }
    }

    pub fn probe_result(&self, probe: &str, success: bool) {
        if let Some(c) = &self.probe_results {
            let result = if success { "success" } else { "failure" };
            c.with_label_values(&[probe, result]).inc();
        }
    }

    pub fn set_ready(&self, condition: &str, ready: bool) {
        if let Some(g) = &self.readiness {
            g.with_label_values(&[condition]).set(ready as i64);
        }
    }
}
