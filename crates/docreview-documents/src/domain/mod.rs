//! Domain layer for the document review context.

pub mod aggregates;
pub mod commands;
pub mod events;
