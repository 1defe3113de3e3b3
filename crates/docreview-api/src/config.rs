//! Server configuration, read once from the environment at startup.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use docreview_core::aggregate_repository::RepositorySettings;
use docreview_projections::ProjectionSettings;

use crate::error::AppError;

/// How committed events reach projections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Per-projection background lanes; writers never wait for projections.
    Background,
    /// Delivered on the writer's task before the command returns.
    Inline,
}

impl FromStr for DispatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "background" => Ok(Self::Background),
            "inline" => Ok(Self::Inline),
            other => Err(format!("expected `background` or `inline`, got `{other}`")),
        }
    }
}

/// Complete server configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// PostgreSQL connection string.
    pub database_url: String,
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Connection pool size.
    pub database_max_connections: u32,
    /// Aggregate repository tuning.
    pub repository: RepositorySettings,
    /// Projection pipeline tuning.
    pub projections: ProjectionSettings,
    /// Projection delivery mode.
    pub dispatch_mode: DispatchMode,
    /// OTLP collector endpoint; tracing export is off when unset.
    pub otlp_endpoint: Option<String>,
}

impl AppConfig {
    /// Reads the configuration from process environment variables.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `DATABASE_URL` is missing or any value
    /// fails to parse.
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`.
    ///
    /// # Errors
    ///
    /// See [`AppConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let database_url = env
            .raw("DATABASE_URL")
            .ok_or_else(|| AppError::Config("DATABASE_URL must be set".into()))?;

        let mut projections = ProjectionSettings::default();
        projections.dispatch.batch_size = env.parse("REPLAY_BATCH_SIZE", projections.dispatch.batch_size)?;
        projections.dispatch.lane_capacity =
            env.parse("DISPATCH_LANE_CAPACITY", projections.dispatch.lane_capacity)?;
        projections.dispatch.catch_up_interval =
            env.millis("DISPATCH_CATCH_UP_MS", projections.dispatch.catch_up_interval)?;
        projections.retry.base_delay = env.millis("RETRY_BASE_DELAY_MS", projections.retry.base_delay)?;
        projections.retry.max_delay = env.millis("RETRY_MAX_DELAY_MS", projections.retry.max_delay)?;
        projections.retry.max_retries = env.parse("RETRY_MAX_ATTEMPTS", projections.retry.max_retries)?;
        projections.retry.jitter_ratio =
            env.parse("RETRY_JITTER_RATIO", projections.retry.jitter_ratio)?;
        projections.worker.tick_interval = env.millis("RETRY_TICK_MS", projections.worker.tick_interval)?;
        projections.worker.batch_size = env.parse("RETRY_BATCH_SIZE", projections.worker.batch_size)?;
        projections.worker.claim_lease =
            env.millis("RETRY_CLAIM_LEASE_MS", projections.worker.claim_lease)?;
        projections.health.degraded_lag =
            env.parse("HEALTH_DEGRADED_LAG", projections.health.degraded_lag)?;
        projections.health.critical_lag =
            env.parse("HEALTH_CRITICAL_LAG", projections.health.critical_lag)?;

        let defaults = RepositorySettings::default();
        let repository = RepositorySettings {
            snapshot_every: env.parse("SNAPSHOT_EVERY", defaults.snapshot_every)?,
            max_save_attempts: env.parse("MAX_SAVE_ATTEMPTS", defaults.max_save_attempts)?,
        };

        let config = Self {
            database_url,
            host: env.raw("HOST").unwrap_or_else(|| "0.0.0.0".to_owned()),
            port: env.parse("PORT", 3000)?,
            database_max_connections: env.parse("DATABASE_MAX_CONNECTIONS", 10)?,
            repository,
            projections,
            dispatch_mode: env.parse("DISPATCH_MODE", DispatchMode::Background)?,
            otlp_endpoint: env.raw("OTEL_EXPORTER_OTLP_ENDPOINT"),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        let projections = &self.projections;
        for (key, value) in [
            ("DISPATCH_CATCH_UP_MS", projections.dispatch.catch_up_interval),
            ("RETRY_TICK_MS", projections.worker.tick_interval),
            ("RETRY_CLAIM_LEASE_MS", projections.worker.claim_lease),
        ] {
            if value.is_zero() {
                return Err(AppError::Config(format!("{key} must be greater than zero")));
            }
        }
        for (key, value) in [
            ("REPLAY_BATCH_SIZE", projections.dispatch.batch_size),
            ("RETRY_BATCH_SIZE", projections.worker.batch_size),
        ] {
            if value < 1 {
                return Err(AppError::Config(format!("{key} must be at least 1, got {value}")));
            }
        }
        if projections.dispatch.lane_capacity == 0 {
            return Err(AppError::Config("DISPATCH_LANE_CAPACITY must be at least 1".into()));
        }
        if self.database_max_connections == 0 {
            return Err(AppError::Config("DATABASE_MAX_CONNECTIONS must be at least 1".into()));
        }
        if self.repository.max_save_attempts == 0 {
            return Err(AppError::Config("MAX_SAVE_ATTEMPTS must be at least 1".into()));
        }
        if projections.retry.max_retries < 0 {
            return Err(AppError::Config("RETRY_MAX_ATTEMPTS must not be negative".into()));
        }
        if !(0.0..=1.0).contains(&projections.retry.jitter_ratio) {
            return Err(AppError::Config(
                "RETRY_JITTER_RATIO must be between 0 and 1".into(),
            ));
        }
        if projections.health.degraded_lag > projections.health.critical_lag {
            return Err(AppError::Config(
                "HEALTH_DEGRADED_LAG must not exceed HEALTH_CRITICAL_LAG".into(),
            ));
        }
        Ok(())
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|value| !value.trim().is_empty())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, AppError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.raw(key) {
            None => Ok(default),
            Some(value) => value
                .trim()
                .parse()
                .map_err(|e| AppError::Config(format!("{key} is invalid: {e}"))),
        }
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, AppError> {
        let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        self.parse(key, default_ms).map(Duration::from_millis)
    }
}
