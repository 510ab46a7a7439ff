//! The control-channel envelope: a side-band request/response protocol for
//! embedding systems driving the loop from outside the conversation stream
//! (interrupt a run, answer a permission prompt, change the model mid-run,
//! …). Distinct from [`crate::events::Event`], which is one-directional
//! (core → caller); this is bidirectional (caller → core → caller).
//!
//! Tagged-union shape mirrors `events.rs`'s own convention: a `type`
//! discriminator dispatches to a concrete variant, and responses carry the
//! originating request id so a caller juggling several in-flight requests
//! can match them up.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The inner discriminated union of control operations a caller may submit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum ControlRequestBody {
    /// Stop the current run as soon as it is safe to do so (same effect as
    /// the loop's own cancellation signal, §4.1).
    Interrupt,

    /// Ask whether a tool invocation should proceed; mirrors the permission
    /// checker's own allow/deny/ask contract (§4.2) for an embedder that
    /// wants to resolve `ask` interactively instead of the default
    /// fold-to-deny behavior.
    CanUseTool { tool_name: String, input: Value },

    /// Change the active permission mode (e.g. `default`, `acceptEdits`,
    /// `plan`) for the remainder of the run.
    SetPermissionMode { mode: String },

    /// Override the model used for subsequent turns.
    SetModel { model: String },

    /// Override the extended-thinking token budget for subsequent turns.
    SetMaxThinkingTokens { max_thinking_tokens: u32 },

    /// MCP server lifecycle/introspection operations, namespaced under one
    /// variant since the out-of-scope MCP plumbing owns their concrete
    /// shapes; `action` names the sub-operation (`list_tools`, `connect`,
    /// `disconnect`, …) and `payload` carries its arguments verbatim.
    McpAction { action: String, payload: Value },

    /// Roll back file-checkpointed writes (out-of-scope checkpointing
    /// subsystem) up to and including `checkpoint_id`.
    RewindFiles { checkpoint_id: String },

    /// Deliver the result of an async hook callback invoked out of band by
    /// the embedder rather than the in-process dispatcher.
    HookCallback { correlation_id: String, result: Value },

    /// Handshake sent once at session start, before any turn begins.
    Initialize { client_name: String, client_version: String },
}

/// An envelope carrying one control request, tagged with a caller-assigned
/// id so the matching `ControlResponse` can be correlated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    pub request_id: String,
    #[serde(flatten)]
    pub body: ControlRequestBody,
}

/// Cancels a previously submitted request that has not yet resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlCancelRequest {
    pub request_id: String,
}

/// The terminal reply to a `ControlRequest`: either a result payload or an
/// error message, never both.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlResponse {
    Ok { request_id: String, result: Value },
    Err { request_id: String, error: String },
}

impl ControlResponse {
    pub fn ok(request_id: impl Into<String>, result: Value) -> Self {
        ControlResponse::Ok {
            request_id: request_id.into(),
            result,
        }
    }

    pub fn err(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        ControlResponse::Err {
            request_id: request_id.into(),
            error: error.into(),
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            ControlResponse::Ok { request_id, .. } | ControlResponse::Err { request_id, .. } => {
                request_id
            }
        }
    }
}

/// The three message shapes that can appear on one control channel,
/// discriminated by `type` so a single decoder can read whichever arrives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    ControlRequest(ControlRequest),
    ControlResponse(ControlResponse),
    ControlCancelRequest(ControlCancelRequest),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_request_round_trips_through_json() {
        let req = ControlRequest {
            request_id: "r1".into(),
            body: ControlRequestBody::SetPermissionMode {
                mode: "plan".into(),
            },
        };
        let raw = serde_json::to_string(&req).unwrap();
        let decoded: ControlRequest = serde_json::from_str(&raw).unwrap();
        assert_eq!(decoded.request_id, "r1");
        assert!(matches!(
            decoded.body,
            ControlRequestBody::SetPermissionMode { mode } if mode == "plan"
        ));
    }

    #[test]
    fn control_response_ok_and_err_round_trip() {
        let ok = ControlResponse::ok("r1", serde_json::json!({"accepted": true}));
        let raw = serde_json::to_string(&ok).unwrap();
        let decoded: ControlResponse = serde_json::from_str(&raw).unwrap();
        assert_eq!(decoded.request_id(), "r1");
        assert!(matches!(decoded, ControlResponse::Ok { .. }));

        let err = ControlResponse::err("r2", "tool denied");
        let raw = serde_json::to_string(&err).unwrap();
        let decoded: ControlResponse = serde_json::from_str(&raw).unwrap();
        assert_eq!(decoded.request_id(), "r2");
        assert!(matches!(decoded, ControlResponse::Err { .. }));
    }

    #[test]
    fn cancel_request_carries_the_original_id() {
        let cancel = ControlCancelRequest {
            request_id: "r1".into(),
        };
        let raw = serde_json::to_string(&cancel).unwrap();
        let decoded: ControlCancelRequest = serde_json::from_str(&raw).unwrap();
        assert_eq!(decoded.request_id, "r1");
    }

    #[test]
    fn control_message_dispatches_on_type_discriminator() {
        let msg = ControlMessage::ControlCancelRequest(ControlCancelRequest {
            request_id: "r9".into(),
        });
        let raw = serde_json::to_value(&msg).unwrap();
        assert_eq!(raw["type"], "control_cancel_request");
        let decoded: ControlMessage = serde_json::from_value(raw).unwrap();
        assert!(matches!(decoded, ControlMessage::ControlCancelRequest(_)));
    }

    #[test]
    fn can_use_tool_request_carries_tool_name_and_input() {
        let req = ControlRequest {
            request_id: "r3".into(),
            body: ControlRequestBody::CanUseTool {
                tool_name: "Bash".into(),
                input: serde_json::json!({"command": "ls"}),
            },
        };
        let raw = serde_json::to_value(&req).unwrap();
        assert_eq!(raw["subtype"], "can_use_tool");
        assert_eq!(raw["tool_name"], "Bash");
    }
}
