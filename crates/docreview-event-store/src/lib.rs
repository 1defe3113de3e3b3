//! Docreview Event Store: PostgreSQL persistence.
//!
//! Holds the append-only event log, the snapshot cache and the projection
//! bookkeeping tables. The schema lives in the workspace `migrations/`
//! directory.

mod error;
pub mod pg_event_repository;
pub mod pg_projection_store;

pub use pg_event_repository::PgEventRepository;
pub use pg_projection_store::PgProjectionStore;

/// Embedded migrations for the event log and projection tables.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");
