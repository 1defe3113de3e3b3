//! Docreview API: the axum HTTP surface over the document review service.
//!
//! Exposed as a library so integration tests can build the same router the
//! binary serves.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod telemetry;
