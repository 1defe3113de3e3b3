//! Docreview Core: event-sourcing abstractions.
//!
//! This crate defines the traits and types shared by the event log, the
//! projection pipeline and the bounded contexts. It contains no
//! infrastructure code.

pub mod aggregate;
pub mod aggregate_repository;
pub mod checkpoint;
pub mod clock;
pub mod error;
pub mod event;
pub mod projection;
pub mod repository;
pub mod rng;
pub mod upcaster;
