//! The hook external-process contract: the JSON document written to a
//! shell-command hook's stdin, and the two JSON shapes it may write back.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a shell-command hook or in-process callback receives.
///
/// Mirrors the teacher's `tool_input`/`tool_response` convention of carrying
/// opaque tool payloads as `serde_json::Value` rather than a fixed shape,
/// since the hook dispatcher never interprets them itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookInput {
    pub hook_event_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_response: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
}

impl HookInput {
    pub fn new(hook_event_name: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            hook_event_name: hook_event_name.into(),
            tool_name: None,
            tool_input: None,
            tool_response: None,
            error: None,
            session_id: session_id.into(),
            transcript_path: None,
            cwd: None,
            permission_mode: None,
        }
    }

    pub fn with_tool_name(mut self, name: impl Into<String>) -> Self {
        self.tool_name = Some(name.into());
        self
    }

    pub fn with_tool_input(mut self, input: Value) -> Self {
        self.tool_input = Some(input);
        self
    }

    pub fn with_tool_response(mut self, response: Value) -> Self {
        self.tool_response = Some(response);
        self
    }
}

/// A hook's decision, normalized from the four accepted spellings on the
/// wire (`approve`/`allow` collapse to `Allow`, `block`/`deny` to `Deny`).
/// A string outside that set is not an error: it passes through unchanged
/// as `Other`, so a caller-defined decision value still reaches whatever
/// reads `HookResult::decision` instead of silently vanishing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
    Other(String),
}

pub fn normalize_decision(raw: &str) -> Decision {
    match raw {
        "approve" | "allow" => Decision::Allow,
        "block" | "deny" => Decision::Deny,
        other => Decision::Other(other.to_string()),
    }
}

/// The sync shape a hook may write to stdout, exactly as specified on the
/// wire (camelCase field names, each optional).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawSyncOutput {
    #[serde(rename = "continue", skip_serializing_if = "Option::is_none")]
    pub continue_: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suppress_output: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hook_specific_output: Option<Value>,
}

/// The async shape: a hook that wants a second, blocking invocation under a
/// dedicated deadline before it produces its real answer.
#[derive(Debug, Clone, Deserialize)]
pub struct RawAsyncOutput {
    #[serde(rename = "async")]
    pub is_async: bool,
    #[serde(rename = "asyncTimeout", default)]
    pub async_timeout: Option<u64>,
}

/// What one callback/shell-command invocation produced, before the
/// dispatcher decides whether to re-invoke it under the async deadline.
#[derive(Debug, Clone)]
pub enum RawOutcome {
    Sync(RawSyncOutput),
    Async { timeout_sec: Option<u64> },
}

impl RawOutcome {
    /// Parse a hook's raw stdout/return value: presence of a truthy `async`
    /// key switches the interpretation, matching the wire contract.
    pub fn from_value(value: &Value) -> Self {
        let is_async = value
            .get("async")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if is_async {
            let timeout_sec = value.get("asyncTimeout").and_then(Value::as_u64);
            RawOutcome::Async { timeout_sec }
        } else {
            let sync = serde_json::from_value(value.clone()).unwrap_or_default();
            RawOutcome::Sync(sync)
        }
    }
}

/// Normalized, typed outcome of one hook invocation, ready to fold into a
/// `HookResponse` event and to feed back into the scheduler/loop.
#[derive(Debug, Clone, Default)]
pub struct HookResult {
    pub decision: Option<Decision>,
    pub cont: bool,
    pub suppress_output: bool,
    pub stop_reason: Option<String>,
    pub system_message: Option<String>,
    pub reason: Option<String>,
    pub hook_specific_output: Option<Value>,
}

impl From<RawSyncOutput> for HookResult {
    fn from(raw: RawSyncOutput) -> Self {
        Self {
            decision: raw.decision.as_deref().map(normalize_decision),
            cont: raw.continue_.unwrap_or(true),
            suppress_output: raw.suppress_output.unwrap_or(false),
            stop_reason: raw.stop_reason,
            system_message: raw.system_message,
            reason: raw.reason,
            hook_specific_output: raw.hook_specific_output,
        }
    }
}

impl HookResult {
    /// The no-op result standing in for an empty-stdout shell hook: success,
    /// nothing decided, nothing to stop for.
    pub fn noop() -> Self {
        Self {
            cont: true,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_all_four_wire_spellings() {
        assert_eq!(normalize_decision("approve"), Decision::Allow);
        assert_eq!(normalize_decision("allow"), Decision::Allow);
        assert_eq!(normalize_decision("block"), Decision::Deny);
        assert_eq!(normalize_decision("deny"), Decision::Deny);
    }

    #[test]
    fn unrecognized_decision_strings_pass_through_unchanged() {
        assert_eq!(
            normalize_decision("shrug"),
            Decision::Other("shrug".to_string())
        );
    }

    #[test]
    fn raw_outcome_detects_async_marker() {
        let v = serde_json::json!({"async": true, "asyncTimeout": 2});
        match RawOutcome::from_value(&v) {
            RawOutcome::Async { timeout_sec } => assert_eq!(timeout_sec, Some(2)),
            RawOutcome::Sync(_) => panic!("expected async"),
        }
    }

    #[test]
    fn raw_outcome_defaults_to_sync_on_empty_object() {
        let v = serde_json::json!({});
        match RawOutcome::from_value(&v) {
            RawOutcome::Sync(sync) => assert!(sync.continue_.is_none()),
            RawOutcome::Async { .. } => panic!("expected sync"),
        }
    }

    #[test]
    fn sync_output_converts_and_defaults_continue_to_true() {
        let raw = RawSyncOutput {
            decision: Some("block".into()),
            ..Default::default()
        };
        let result: HookResult = raw.into();
        assert_eq!(result.decision, Some(Decision::Deny));
        assert!(result.cont);
    }
}
