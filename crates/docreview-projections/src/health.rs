//! Projection health classification.

use serde::Serialize;

use docreview_core::checkpoint::{FailureSummary, ProjectionCheckpoint};

use crate::config::HealthThresholds;

/// Health of a single projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Caught up and no open failures.
    Healthy,
    /// Lagging or retrying.
    Degraded,
    /// Far behind or stuck on a permanent failure.
    Critical,
}

/// Health report for one projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectionHealth {
    /// Projection name.
    pub name: String,
    /// Overall status.
    pub status: HealthStatus,
    /// Applied watermark.
    pub checkpoint: i64,
    /// First-pass position.
    pub dispatched_through: i64,
    /// Distance between the head of the log and the checkpoint.
    pub lag: i64,
    /// Open failure records.
    pub unresolved_failures: i64,
    /// Open failure records whose retries are exhausted.
    pub permanent_failures: i64,
}

impl ProjectionHealth {
    /// Classifies a projection from its checkpoint and open failures.
    #[must_use]
    pub fn assess(
        head: i64,
        checkpoint: &ProjectionCheckpoint,
        failures: FailureSummary,
        thresholds: HealthThresholds,
    ) -> Self {
        let lag = (head - checkpoint.last_applied_global_sequence).max(0);
        let status = if lag > thresholds.critical_lag || failures.permanent > 0 {
            HealthStatus::Critical
        } else if lag > thresholds.degraded_lag || failures.unresolved > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        Self {
            name: checkpoint.projection_name.clone(),
            status,
            checkpoint: checkpoint.last_applied_global_sequence,
            dispatched_through: checkpoint.dispatched_through,
            lag,
            unresolved_failures: failures.unresolved,
            permanent_failures: failures.permanent,
        }
    }
}
