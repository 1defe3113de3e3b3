//! Settings for the projection pipeline.

use std::time::Duration;

use crate::backoff::RetryPolicy;

/// Delivery settings shared by the dispatcher and the background lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    /// Events read from the log per catch-up or replay batch.
    pub batch_size: i64,
    /// Capacity of each background lane's channel.
    pub lane_capacity: usize,
    /// How often background lanes poll the log for missed events.
    pub catch_up_interval: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            batch_size: 500,
            lane_capacity: 256,
            catch_up_interval: Duration::from_secs(5),
        }
    }
}

/// Retry worker schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryWorkerSettings {
    /// Time between ticks.
    pub tick_interval: Duration,
    /// Maximum records claimed per tick.
    pub batch_size: i64,
    /// How long a claimed record stays invisible to other workers.
    pub claim_lease: Duration,
}

impl Default for RetryWorkerSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            batch_size: 100,
            claim_lease: Duration::from_secs(30),
        }
    }
}

/// Lag thresholds for projection health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthThresholds {
    /// Lag above which a projection is degraded.
    pub degraded_lag: i64,
    /// Lag above which a projection is critical.
    pub critical_lag: i64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            degraded_lag: 100,
            critical_lag: 1000,
        }
    }
}

/// All projection pipeline settings.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProjectionSettings {
    /// Delivery settings.
    pub dispatch: DispatchSettings,
    /// Retry backoff.
    pub retry: RetryPolicy,
    /// Retry worker schedule.
    pub worker: RetryWorkerSettings,
    /// Health thresholds.
    pub health: HealthThresholds,
}
