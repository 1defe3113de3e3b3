//! Docreview Projections: the read side of the event log.
//!
//! Committed events flow from the aggregate repository into the
//! [`ProjectionDispatcher`], which feeds every registered projection in
//! global order. Handler failures are isolated per projection, recorded by
//! the [`FailureTracker`] and retried with exponential backoff by the
//! [`RetryWorker`]. [`ProjectionAdmin`] exposes health, replay, reset and
//! manual resolution to operators.

pub mod admin;
pub mod background;
pub mod backoff;
pub mod config;
pub mod dispatcher;
pub mod failure_tracker;
pub mod health;
pub mod retry_worker;

pub use admin::ProjectionAdmin;
pub use background::BackgroundDispatcher;
pub use backoff::RetryPolicy;
pub use config::ProjectionSettings;
pub use dispatcher::{ProjectionDispatcher, ReplayReport, ReplayStatus};
pub use failure_tracker::FailureTracker;
pub use health::{HealthStatus, ProjectionHealth};
pub use retry_worker::RetryWorker;
