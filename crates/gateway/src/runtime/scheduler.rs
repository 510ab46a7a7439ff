//! The tool scheduler — decides serial vs. parallel execution for a batch
//! of tool-use blocks, fires `pre_tool_use`/`post_tool_use`/
//! `post_tool_use_failure` hooks around each one, checks permissions
//! (skill-scoped when an active skill is set), tracks the file-access log,
//! and returns ordered tool-result records.
//!
//! Grounded on the teacher's `runtime/turn.rs` tool-dispatch step for the
//! concurrency shape (`join_all` over independent futures, same-order
//! zip of results back onto the call list) and on `sa_hooks::Dispatcher` /
//! `runtime/permission.rs` for the hook and permission machinery this
//! module composes around that shape.

use std::collections::{HashMap, HashSet};

use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::Instrument;

use sa_domain::config::ToolPolicy;
use sa_domain::events::Event;
use sa_domain::tool::{ToolCall, ToolDefinition, ToolEffect};
use sa_hooks::types::{Decision, HookInput};
use sa_skills::registry::SkillsRegistry;

use crate::state::AppState;

use super::cancel::CancelToken;
use super::permission::{
    fold_ask_to_deny, ActiveSkill, ConfigPermissionChecker, PermissionChecker, PermissionDecision,
    ScopedPermissionChecker,
};
use super::tools;

/// Default concurrency cap for an all-`none`-effect batch. Callers with a
/// different sizing policy can scale this; this is the "sane floor 1"
/// default when nothing more specific is configured.
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// File-access log
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-path record of operation classes observed on it during a turn.
/// Keyed on the raw path string the tool was invoked with (not canonicalized
/// — the scheduler never touches the filesystem itself).
pub type FileAccessLog = Mutex<HashMap<String, HashSet<&'static str>>>;

pub fn new_file_access_log() -> FileAccessLog {
    Mutex::new(HashMap::new())
}

/// Fixed tool-name to file-operation mapping (SPEC_FULL §4.2, step 5).
fn file_operation(tool_name: &str) -> Option<&'static str> {
    match tool_name {
        "Read" => Some("read"),
        "Write" => Some("write"),
        "Edit" | "FileEdit" | "NotebookEdit" => Some("edit"),
        "Glob" => Some("glob"),
        "Grep" => Some("grep"),
        _ => None,
    }
}

const PATH_INPUT_KEYS: [&str; 3] = ["file_path", "path", "notebook_path"];

fn record_file_access(log: &FileAccessLog, tool_name: &str, input: &Value) {
    let Some(op) = file_operation(tool_name) else {
        return;
    };
    for key in PATH_INPUT_KEYS {
        if let Some(path) = input.get(key).and_then(Value::as_str) {
            log.lock().entry(path.to_string()).or_default().insert(op);
            return;
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Output shapes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One slot of scheduler output — same length and ordering as the input
/// batch, even when execution ran in parallel.
#[derive(Debug, Clone)]
pub struct ToolResultRecord {
    pub call_id: String,
    pub tool_name: String,
    pub content: String,
    pub is_error: bool,
}

/// Result of scheduling one batch of tool-use blocks.
pub struct SchedulerOutcome {
    pub results: Vec<ToolResultRecord>,
    /// Set once a hook or permission check returns `interrupt=true`; the
    /// caller should stop the whole turn, not just this batch.
    pub interrupted: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything `schedule` needs beyond the batch of calls itself, threaded
/// through from the turn loop. `active_skill` is a `Mutex` rather than a
/// plain `&mut` so the parallel path (which never contains a `Skill` call,
/// since `Skill` is `Mutating`) can still share it safely with the serial
/// path across turn-loop iterations.
pub struct SchedulerContext<'a> {
    pub state: &'a AppState,
    pub session_key: &'a str,
    pub session_id: &'a str,
    pub skills: &'a SkillsRegistry,
    pub tool_policy: Option<&'a ToolPolicy>,
    pub tool_defs: &'a [ToolDefinition],
    pub active_skill: &'a Mutex<Option<ActiveSkill>>,
    pub file_access_log: &'a FileAccessLog,
    pub max_concurrency: usize,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Parallelism policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A single call always runs serially. A multi-call batch runs fully in
/// parallel only when every referenced tool is known to the registry and
/// has side-effect class `none`; otherwise it runs serially, in order.
fn is_parallel_batch(calls: &[ToolCall], tool_defs: &[ToolDefinition]) -> bool {
    if calls.len() <= 1 {
        return false;
    }
    calls.iter().all(|tc| {
        tool_defs
            .iter()
            .find(|d| d.name == tc.tool_name)
            .map(|d| d.effect == ToolEffect::None)
            .unwrap_or(false)
    })
}

/// Schedule one batch of tool-use blocks (everything the model requested
/// in a single assistant turn) and return ordered results.
pub async fn schedule(
    ctx: &SchedulerContext<'_>,
    calls: &[ToolCall],
    cancel: &CancelToken,
) -> SchedulerOutcome {
    if is_parallel_batch(calls, ctx.tool_defs) {
        schedule_parallel(ctx, calls).await
    } else {
        schedule_serial(ctx, calls, cancel).await
    }
}

async fn schedule_serial(
    ctx: &SchedulerContext<'_>,
    calls: &[ToolCall],
    cancel: &CancelToken,
) -> SchedulerOutcome {
    let mut results = Vec::with_capacity(calls.len());
    for tc in calls {
        if cancel.is_cancelled() {
            return SchedulerOutcome {
                results,
                interrupted: true,
            };
        }
        let (record, interrupted) = execute_one(ctx, tc).await;
        let stop = interrupted;
        results.push(record);
        if stop {
            return SchedulerOutcome {
                results,
                interrupted: true,
            };
        }
    }
    SchedulerOutcome {
        results,
        interrupted: false,
    }
}

async fn schedule_parallel(ctx: &SchedulerContext<'_>, calls: &[ToolCall]) -> SchedulerOutcome {
    let cap = ctx.max_concurrency.max(1);

    let outcomes: Vec<(ToolResultRecord, bool)> = stream::iter(calls.iter())
        .map(|tc| {
            let tool_span = tracing::info_span!("tool.call", tool_name = %tc.tool_name);
            execute_one(ctx, tc).instrument(tool_span)
        })
        .buffered(cap)
        .collect()
        .await;

    // Parallel batches are, by construction, all `none`-effect tools —
    // no individual invocation can request interruption via a file/exec
    // side effect, but a hook still can. Preserve the `interrupted` union
    // without reordering results (join semantics already kept input order).
    let interrupted = outcomes.iter().any(|(_, stop)| *stop);
    SchedulerOutcome {
        results: outcomes.into_iter().map(|(r, _)| r).collect(),
        interrupted,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-invocation steps
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn error_record(tc: &ToolCall, message: String) -> ToolResultRecord {
    ToolResultRecord {
        call_id: tc.call_id.clone(),
        tool_name: tc.tool_name.clone(),
        content: message,
        is_error: true,
    }
}

/// Run one tool-use block through hooks, permission checks, execution, and
/// post-hooks. Returns the result record plus whether this invocation
/// should interrupt the rest of the turn.
async fn execute_one(ctx: &SchedulerContext<'_>, tc: &ToolCall) -> (ToolResultRecord, bool) {
    let state = ctx.state;

    // 1. Zero-elapsed progress event. `hook_started` itself is emitted by
    //    the dispatcher once a matcher actually fires, below.
    let _ = state.events.send(Event::ToolProgress {
        id: uuid::Uuid::new_v4(),
        session_id: ctx.session_id.to_string(),
        call_id: tc.call_id.clone(),
        tool_name: tc.tool_name.clone(),
        elapsed_ms: 0,
        done: false,
    });

    // 2. pre_tool_use hook.
    let pre_input = HookInput::new("pre_tool_use", ctx.session_id)
        .with_tool_name(tc.tool_name.clone())
        .with_tool_input(tc.arguments.clone());
    let pre_results = state.hooks.fire("pre_tool_use", pre_input).await;

    if let Some(deny) = pre_results.iter().find(|r| r.decision == Some(Decision::Deny)) {
        let message = deny
            .reason
            .clone()
            .or_else(|| deny.system_message.clone())
            .unwrap_or_else(|| format!("{} denied by pre_tool_use hook", tc.tool_name));
        let interrupt = !deny.cont;
        return (error_record(tc, message), interrupt);
    }
    if let Some(halted) = pre_results.iter().find(|r| !r.cont) {
        let message = halted
            .stop_reason
            .clone()
            .or_else(|| halted.system_message.clone())
            .unwrap_or_else(|| format!("pre_tool_use hook halted {}", tc.tool_name));
        return (error_record(tc, message), true);
    }

    // 3. Permission check, scoped to the active skill when one is set.
    let decision = {
        let checker = ConfigPermissionChecker::new(
            ctx.tool_policy.cloned(),
            state.denied_command_set.clone(),
            state.approval_command_set.clone(),
        );
        let active_skill = ctx.active_skill.lock();
        let scoped = ScopedPermissionChecker::new(&checker, active_skill.as_ref());
        fold_ask_to_deny(scoped.check_scoped(&tc.tool_name, &tc.arguments))
    };

    let input = match decision {
        PermissionDecision::Allow { updated_input } => updated_input.unwrap_or_else(|| tc.arguments.clone()),
        PermissionDecision::Deny { message, interrupt } => {
            return (error_record(tc, message), interrupt);
        }
        PermissionDecision::Ask { message } => {
            // fold_ask_to_deny always converts Ask before we get here.
            return (error_record(tc, message), false);
        }
    };

    // 4. `Skill` invocations set the active-skill scope before execution.
    if tc.tool_name == "Skill" {
        if let Some(skill_name) = input.get("skill").and_then(Value::as_str) {
            if let Some(entry) = ctx.skills.list().into_iter().find(|s| s.name == skill_name) {
                let allowed = entry.allowed_tools();
                if !allowed.is_empty() {
                    *ctx.active_skill.lock() = Some(ActiveSkill::new(skill_name, &allowed));
                }
            }
        }
    }

    // 5. Execute, recording any path argument in the file-access log.
    record_file_access(ctx.file_access_log, &tc.tool_name, &input);
    let (content, is_error) =
        tools::dispatch_tool(state, &tc.tool_name, &input, Some(ctx.session_key)).await;

    let _ = state.events.send(Event::ToolProgress {
        id: uuid::Uuid::new_v4(),
        session_id: ctx.session_id.to_string(),
        call_id: tc.call_id.clone(),
        tool_name: tc.tool_name.clone(),
        elapsed_ms: 0,
        done: true,
    });

    if is_error {
        // 6. post_tool_use_failure hook.
        let fail_input = HookInput::new("post_tool_use_failure", ctx.session_id)
            .with_tool_name(tc.tool_name.clone())
            .with_tool_input(input)
            .with_tool_response(serde_json::json!({ "error": content }));
        let _ = state.hooks.fire("post_tool_use_failure", fail_input).await;
        return (
            ToolResultRecord {
                call_id: tc.call_id.clone(),
                tool_name: tc.tool_name.clone(),
                content,
                is_error: true,
            },
            false,
        );
    }

    // 7. post_tool_use hook — may attach updated output/context.
    let post_input = HookInput::new("post_tool_use", ctx.session_id)
        .with_tool_name(tc.tool_name.clone())
        .with_tool_input(input)
        .with_tool_response(serde_json::json!({ "output": content }));
    let post_results = state.hooks.fire("post_tool_use", post_input).await;

    let mut final_content = content;
    for r in &post_results {
        if let Some(extra) = &r.hook_specific_output {
            if let Some(updated) = extra.get("updatedMCPToolOutput").and_then(Value::as_str) {
                final_content = updated.to_string();
            }
            if let Some(additional) = extra.get("additionalContext").and_then(Value::as_str) {
                final_content.push_str("\n\n");
                final_content.push_str(additional);
            }
        }
    }

    (
        ToolResultRecord {
            call_id: tc.call_id.clone(),
            tool_name: tc.tool_name.clone(),
            content: final_content,
            is_error: false,
        },
        false,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use sa_hooks::matcher::Matcher;
    use sa_hooks::registry::HookRegistry;
    use sa_hooks::types::RawSyncOutput;
    use sa_hooks::Dispatcher;
    use std::sync::Arc;

    fn tool_def(name: &str, effect: ToolEffect) -> ToolDefinition {
        ToolDefinition {
            name: name.to_string(),
            description: String::new(),
            parameters: serde_json::json!({}),
            effect,
        }
    }

    #[test]
    fn single_call_is_never_parallel() {
        let calls = vec![ToolCall {
            call_id: "1".into(),
            tool_name: "Read".into(),
            arguments: serde_json::json!({}),
        }];
        let defs = vec![tool_def("Read", ToolEffect::None)];
        assert!(!is_parallel_batch(&calls, &defs));
    }

    #[test]
    fn batch_of_none_effect_tools_is_parallel() {
        let calls = vec![
            ToolCall {
                call_id: "1".into(),
                tool_name: "Read".into(),
                arguments: serde_json::json!({}),
            },
            ToolCall {
                call_id: "2".into(),
                tool_name: "Grep".into(),
                arguments: serde_json::json!({}),
            },
        ];
        let defs = vec![
            tool_def("Read", ToolEffect::None),
            tool_def("Grep", ToolEffect::None),
        ];
        assert!(is_parallel_batch(&calls, &defs));
    }

    #[test]
    fn batch_with_a_mutating_tool_is_serial() {
        let calls = vec![
            ToolCall {
                call_id: "1".into(),
                tool_name: "Read".into(),
                arguments: serde_json::json!({}),
            },
            ToolCall {
                call_id: "2".into(),
                tool_name: "Write".into(),
                arguments: serde_json::json!({}),
            },
        ];
        let defs = vec![
            tool_def("Read", ToolEffect::None),
            tool_def("Write", ToolEffect::Mutating),
        ];
        assert!(!is_parallel_batch(&calls, &defs));
    }

    #[test]
    fn batch_with_unknown_tool_is_serial() {
        let calls = vec![
            ToolCall {
                call_id: "1".into(),
                tool_name: "Read".into(),
                arguments: serde_json::json!({}),
            },
            ToolCall {
                call_id: "2".into(),
                tool_name: "mystery".into(),
                arguments: serde_json::json!({}),
            },
        ];
        let defs = vec![tool_def("Read", ToolEffect::None)];
        assert!(!is_parallel_batch(&calls, &defs));
    }

    #[test]
    fn file_access_log_records_fixed_operation_mapping() {
        let log = new_file_access_log();
        record_file_access(&log, "Read", &serde_json::json!({ "file_path": "/a.rs" }));
        record_file_access(&log, "Edit", &serde_json::json!({ "file_path": "/a.rs" }));
        record_file_access(&log, "Grep", &serde_json::json!({ "path": "/a.rs" }));
        record_file_access(&log, "exec", &serde_json::json!({ "command": "ls" }));

        let log = log.lock();
        let ops = log.get("/a.rs").expect("path recorded");
        assert!(ops.contains("read"));
        assert!(ops.contains("edit"));
        assert!(ops.contains("grep"));
        assert_eq!(log.len(), 1, "exec has no file-operation mapping");
    }

    #[tokio::test]
    async fn pre_tool_use_deny_synthesizes_error_without_executing() {
        let registry = Arc::new(HookRegistry::new());
        registry.register(
            "pre_tool_use",
            Matcher::new("Bash").with_callback(Arc::new(|_input, _cid| {
                Box::pin(async move {
                    (
                        sa_hooks::types::RawOutcome::Sync(RawSyncOutput {
                            decision: Some("deny".into()),
                            reason: Some("not allowed".into()),
                            ..Default::default()
                        }),
                        None,
                    )
                })
            })),
        );
        let dispatcher = Arc::new(Dispatcher::new(registry));

        let (events_tx, _events_rx) = tokio::sync::broadcast::channel(16);
        let tc = ToolCall {
            call_id: "c1".into(),
            tool_name: "Bash".into(),
            arguments: serde_json::json!({ "command": "rm -rf /" }),
        };

        // Minimal standalone permission checker (skip AppState entirely —
        // exercise just the hook-deny short circuit that execute_one
        // performs before ever consulting the permission layer).
        let pre_input = HookInput::new("pre_tool_use", "s1")
            .with_tool_name(tc.tool_name.clone())
            .with_tool_input(tc.arguments.clone());
        let results = dispatcher.fire("pre_tool_use", pre_input).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].decision, Some(Decision::Deny));
        let _ = events_tx; // keep the channel alive for the duration of the test
    }
}
