//! Shared domain types for SerialAgent: conversation messages and content
//! blocks, the streaming/usage contract, the observable-event taxonomy,
//! configuration, and the crate-wide error type.

pub mod capability;
pub mod config;
pub mod control;
pub mod error;
pub mod events;
pub mod stream;
pub mod tool;
pub mod trace;

pub use error::{Error, Result};
