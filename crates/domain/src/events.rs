//! The message taxonomy — every event the agent loop and its collaborators
//! emit onto the single output channel.
//!
//! This is a tagged union rather than an open hierarchy so a decoder only
//! needs the `type` (and, for a couple of variants, `subtype`) discriminator
//! to know which concrete shape follows. Every variant carries a fresh `id`
//! and the owning session's `session_id`; ordering across the whole taxonomy
//! is established by the single writer inside the loop (see `runtime::turn`).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::stream::UsageLedger;
use crate::tool::Message;

/// Why the loop stopped producing turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    EndTurn,
    MaxTurns,
    MaxBudget,
    Cancelled,
    Interrupted,
    Error,
}

/// Result-event subtype; mirrors [`ExitReason`] but carries an error message
/// on the `error` arm, matching the "subtype" convention system messages use.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum ResultOutcome {
    Success,
    MaxTurns,
    MaxBudget,
    Cancelled,
    Interrupted,
    Error { message: String },
}

impl ResultOutcome {
    pub fn exit_reason(&self) -> ExitReason {
        match self {
            ResultOutcome::Success => ExitReason::EndTurn,
            ResultOutcome::MaxTurns => ExitReason::MaxTurns,
            ResultOutcome::MaxBudget => ExitReason::MaxBudget,
            ResultOutcome::Cancelled => ExitReason::Cancelled,
            ResultOutcome::Interrupted => ExitReason::Interrupted,
            ResultOutcome::Error { .. } => ExitReason::Error,
        }
    }
}

/// Which stream a hook's external process wrote progress output to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStream {
    Stdout,
    Stderr,
}

/// Outcome of a single hook callback/shell-command invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookOutcome {
    Success,
    Error,
}

/// What happened to a shared task, for `TaskNotification`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskNotificationKind {
    Claimed,
    Completed,
    Unblocked,
}

/// Every observable event the core may emit, in one tagged union.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// First event of every run: active model, cwd, permission mode,
    /// registered tool names, active skills.
    SystemInit {
        id: Uuid,
        session_id: String,
        model: String,
        cwd: String,
        permission_mode: String,
        tools: Vec<String>,
        active_skills: Vec<String>,
    },

    /// Informational status update that doesn't fit a more specific variant.
    SystemStatus {
        id: Uuid,
        session_id: String,
        message: String,
    },

    /// One streamed chunk of the assistant's in-progress response.
    AssistantDelta {
        id: Uuid,
        session_id: String,
        delta: String,
    },

    /// The accumulated assistant message for one turn, blocks in model order.
    Assistant {
        id: Uuid,
        session_id: String,
        message: Message,
    },

    /// The tool-result message appended to history as the next user turn.
    User {
        id: Uuid,
        session_id: String,
        message: Message,
    },

    /// History was replaced with a compacted form; carries the pre-compaction
    /// token count so observers can report the savings.
    CompactBoundary {
        id: Uuid,
        session_id: String,
        pre_compaction_tokens: u64,
    },

    /// A hook matcher began dispatching for one event+tool pair.
    HookStarted {
        id: Uuid,
        session_id: String,
        correlation_id: String,
        hook_event: String,
        tool_name: Option<String>,
    },

    /// Streamed stdout/stderr from a shell-command hook running in progress
    /// mode, emitted line-oriented as it arrives.
    HookProgress {
        id: Uuid,
        session_id: String,
        correlation_id: String,
        stream: ProgressStream,
        chunk: String,
    },

    /// The terminal outcome of one callback or shell-command invocation
    /// inside a hook matcher.
    HookResponse {
        id: Uuid,
        session_id: String,
        correlation_id: String,
        outcome: HookOutcome,
        decision: Option<String>,
        message: Option<String>,
    },

    /// Elapsed-time/completion tracking for one tool invocation.
    ToolProgress {
        id: Uuid,
        session_id: String,
        call_id: String,
        tool_name: String,
        elapsed_ms: u64,
        done: bool,
    },

    /// A provider/auth state transition (e.g. token refreshed, auth failed).
    AuthStatus {
        id: Uuid,
        session_id: String,
        provider: String,
        status: String,
    },

    /// A short human-readable summary of a finished tool call, for transcript
    /// rendering without replaying the full tool-result content.
    ToolUseSummary {
        id: Uuid,
        session_id: String,
        call_id: String,
        tool_name: String,
        summary: String,
    },

    /// A shared-task-list state change worth surfacing to observers.
    TaskNotification {
        id: Uuid,
        session_id: String,
        task_id: String,
        kind: TaskNotificationKind,
    },

    /// Paths that were written to disk and checkpointed (out-of-scope
    /// checkpointing subsystem notifies through this event).
    FilesPersisted {
        id: Uuid,
        session_id: String,
        paths: Vec<String>,
    },

    /// Terminal event for a run. Exactly one is emitted, always last.
    Result {
        id: Uuid,
        session_id: String,
        outcome: ResultOutcome,
        turn_count: u32,
        usage: UsageLedger,
        total_cost_usd: f64,
        wall_clock_ms: u64,
        api_duration_ms: u64,
    },
}

impl Event {
    pub fn session_id(&self) -> &str {
        match self {
            Event::SystemInit { session_id, .. }
            | Event::SystemStatus { session_id, .. }
            | Event::AssistantDelta { session_id, .. }
            | Event::Assistant { session_id, .. }
            | Event::User { session_id, .. }
            | Event::CompactBoundary { session_id, .. }
            | Event::HookStarted { session_id, .. }
            | Event::HookProgress { session_id, .. }
            | Event::HookResponse { session_id, .. }
            | Event::ToolProgress { session_id, .. }
            | Event::AuthStatus { session_id, .. }
            | Event::ToolUseSummary { session_id, .. }
            | Event::TaskNotification { session_id, .. }
            | Event::FilesPersisted { session_id, .. }
            | Event::Result { session_id, .. } => session_id,
        }
    }

    /// True for the one terminal variant every run must emit exactly once,
    /// last, per the §8 ordering invariant.
    pub fn is_result(&self) -> bool {
        matches!(self, Event::Result { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_outcome_maps_to_exit_reason() {
        assert_eq!(ResultOutcome::Success.exit_reason(), ExitReason::EndTurn);
        assert_eq!(
            ResultOutcome::Error {
                message: "boom".into()
            }
            .exit_reason(),
            ExitReason::Error
        );
    }

    #[test]
    fn event_tags_serialize_as_snake_case_type_field() {
        let ev = Event::SystemInit {
            id: Uuid::new_v4(),
            session_id: "s1".into(),
            model: "claude-opus".into(),
            cwd: "/tmp".into(),
            permission_mode: "default".into(),
            tools: vec!["Read".into()],
            active_skills: vec![],
        };
        let value = serde_json::to_value(&ev).unwrap();
        assert_eq!(value["type"], "system_init");
        assert_eq!(value["model"], "claude-opus");
    }

    #[test]
    fn result_is_the_only_terminal_variant() {
        let result = Event::Result {
            id: Uuid::new_v4(),
            session_id: "s1".into(),
            outcome: ResultOutcome::Success,
            turn_count: 3,
            usage: UsageLedger::new(),
            total_cost_usd: 0.0,
            wall_clock_ms: 10,
            api_duration_ms: 5,
        };
        let status = Event::SystemStatus {
            id: Uuid::new_v4(),
            session_id: "s1".into(),
            message: "hi".into(),
        };
        assert!(result.is_result());
        assert!(!status.is_result());
    }
}
