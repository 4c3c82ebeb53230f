//! Shared domain types used across all SerialAgent crates: config schema,
//! tool-call/capability/stream primitives, the common [`error::Error`], and
//! structured trace events.

pub mod capability;
pub mod config;
pub mod error;
pub mod stream;
pub mod tool;
pub mod trace;
