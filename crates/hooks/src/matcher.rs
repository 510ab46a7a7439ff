//! A matcher binds a tool-name pattern to an ordered list of in-process
//! callbacks and external shell commands.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::types::{HookInput, RawOutcome};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// An in-process hook callback: given the event input and a correlation id,
/// produces a raw outcome plus an optional error message.
pub type Callback =
    Arc<dyn Fn(HookInput, String) -> BoxFuture<'static, (RawOutcome, Option<String>)> + Send + Sync>;

/// One registration entry: which invocations it applies to, and what to run.
#[derive(Clone)]
pub struct Matcher {
    /// Tool-name pattern. Empty matches every invocation of the event.
    pub pattern: String,
    pub timeout: Option<Duration>,
    pub callbacks: Vec<Callback>,
    pub commands: Vec<String>,
}

impl Matcher {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            timeout: None,
            callbacks: Vec::new(),
            commands: Vec::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_callback(mut self, callback: Callback) -> Self {
        self.callbacks.push(callback);
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.commands.push(command.into());
        self
    }

    /// Empty pattern matches every invocation; otherwise exact match first
    /// (the common case, and cheaper than compiling a glob), falling back to
    /// glob semantics for patterns like `mcp__*`.
    pub fn matches(&self, tool_name: Option<&str>) -> bool {
        if self.pattern.is_empty() {
            return true;
        }
        let Some(name) = tool_name else {
            return false;
        };
        if self.pattern == name {
            return true;
        }
        glob::Pattern::new(&self.pattern)
            .map(|p| p.matches(name))
            .unwrap_or(false)
    }
}
