//! Document review bounded context.
//!
//! Users upload documents, an assistant proposes edits, users accept or
//! reject them. Everything here runs on top of the event-sourced core.

pub mod application;
pub mod domain;
