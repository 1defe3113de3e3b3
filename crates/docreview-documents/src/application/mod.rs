//! Application layer for the document review context.

pub mod command_handlers;
pub mod projection;
pub mod query_handlers;
