//! The hook dispatcher: a named-event pipeline with scoped registries, tool-
//! name matching, per-hook timeouts, and external shell-command hooks that
//! exchange JSON over stdin/stdout.
//!
//! `HookRegistry` owns the matchers (see `registry`); `Dispatcher::fire`
//! merges base and scoped registrations and runs callbacks then shell
//! commands in order, emitting `hook_started`/`hook_progress`/`hook_response`
//! events as it goes.

pub mod dispatcher;
pub mod matcher;
pub mod registry;
pub mod shell;
pub mod types;

pub use dispatcher::Dispatcher;
pub use matcher::{BoxFuture, Callback, Matcher};
pub use registry::{HookMap, HookRegistry};
pub use shell::{OutputMode, ShellHookError};
pub use types::{Decision, HookInput, HookResult, RawOutcome, RawSyncOutput};
