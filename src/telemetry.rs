//! Correlation IDs and validator metrics.
//!
//! Counters are plain atomics with relaxed ordering; they are read as a
//! point-in-time [`MetricsSnapshot`] and never gate a decision.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// Generate a new correlation ID for request tracing.
///
/// Used when the caller does not supply one, so every audit entry can be
/// joined with the caller's logs.
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Use `candidate` when it is non-blank, otherwise generate a new ID.
pub fn correlation_id_or_new(candidate: Option<&str>) -> String {
    match candidate.map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => generate_correlation_id(),
    }
}

/// Validator metrics counters.
#[derive(Debug, Default)]
pub struct ValidatorMetrics {
    /// Calls that returned a verdict (withheld verdicts are not counted)
    pub validations_total: AtomicU64,

    /// Verdicts returned as `allow`
    pub allowed: AtomicU64,

    /// Verdicts returned as `deny`, including fail-closed denies
    pub denied: AtomicU64,

    /// Calls whose audit entry could not be delivered
    pub audit_failures: AtomicU64,

    /// Blocking findings reported
    pub block_findings: AtomicU64,

    /// Warning findings reported
    pub warn_findings: AtomicU64,

    /// Inputs rejected for length before analysis
    pub oversized_inputs: AtomicU64,

    /// Cumulative validation time (microseconds)
    pub validation_time_us_total: AtomicU64,
}

impl ValidatorMetrics {
    /// Create new metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one returned verdict.
    pub fn record_validation(&self, allowed: bool, blocks: u64, warns: u64, duration: Duration) {
        self.validations_total.fetch_add(1, Ordering::Relaxed);
        if allowed {
            self.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.denied.fetch_add(1, Ordering::Relaxed);
        }
        self.block_findings.fetch_add(blocks, Ordering::Relaxed);
        self.warn_findings.fetch_add(warns, Ordering::Relaxed);
        self.validation_time_us_total
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record an audit delivery failure.
    pub fn record_audit_failure(&self) {
        self.audit_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an input rejected for its length.
    pub fn record_oversized(&self) {
        self.oversized_inputs.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            validations_total: self.validations_total.load(Ordering::Relaxed),
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            audit_failures: self.audit_failures.load(Ordering::Relaxed),
            block_findings: self.block_findings.load(Ordering::Relaxed),
            warn_findings: self.warn_findings.load(Ordering::Relaxed),
            oversized_inputs: self.oversized_inputs.load(Ordering::Relaxed),
            validation_time_us_total: self.validation_time_us_total.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub validations_total: u64,
    pub allowed: u64,
    pub denied: u64,
    pub audit_failures: u64,
    pub block_findings: u64,
    pub warn_findings: u64,
    pub oversized_inputs: u64,
    pub validation_time_us_total: u64,
}

impl MetricsSnapshot {
    /// Calculate average validation time in microseconds.
    pub fn avg_validation_time_us(&self) -> f64 {
        if self.validations_total == 0 {
            return 0.0;
        }
        self.validation_time_us_total as f64 / self.validations_total as f64
    }

    /// Calculate the deny rate as a percentage.
    pub fn deny_rate(&self) -> f64 {
        if self.validations_total == 0 {
            return 0.0;
        }
        (self.denied as f64 / self.validations_total as f64) * 100.0
    }
}
