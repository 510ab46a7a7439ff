use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;

/// A boxed async stream, used for LLM streaming responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Events emitted during LLM streaming (provider-agnostic).
///
/// Allows: dashboard live output, Discord/Telegram typing indicators,
/// partial responses, tool call assembly.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    /// A text token chunk.
    #[serde(rename = "token")]
    Token { text: String },

    /// A tool call has started.
    #[serde(rename = "tool_call_started")]
    ToolCallStarted { call_id: String, tool_name: String },

    /// Incremental tool call argument data.
    #[serde(rename = "tool_call_delta")]
    ToolCallDelta { call_id: String, delta: String },

    /// A tool call is complete with full arguments.
    #[serde(rename = "tool_call_finished")]
    ToolCallFinished {
        call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },

    /// A chain-of-thought token chunk. Kept separate from `Token` so the
    /// accumulator can preserve thinking-before-text block ordering.
    #[serde(rename = "thinking_delta")]
    ThinkingDelta { text: String },

    /// Stream is finished.
    #[serde(rename = "done")]
    Done {
        usage: Option<Usage>,
        finish_reason: Option<String>,
    },

    /// An error occurred during streaming.
    #[serde(rename = "error")]
    Error { message: String },
}

/// Token usage for a single LLM call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    #[serde(default)]
    pub cache_read_tokens: u32,
    #[serde(default)]
    pub cache_creation_tokens: u32,
    #[serde(default)]
    pub web_search_requests: u32,
    #[serde(default)]
    pub cost_usd: f64,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_creation_tokens += other.cache_creation_tokens;
        self.web_search_requests += other.web_search_requests;
        self.cost_usd += other.cost_usd;
    }
}

/// Accumulates usage across the lifetime of one loop run, in total and
/// broken down per model identifier (a turn may switch models between
/// calls, e.g. planner vs executor roles).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageLedger {
    pub total: Usage,
    pub per_model: HashMap<String, Usage>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one LLM call's usage against the running totals.
    pub fn record(&mut self, model: &str, usage: &Usage) {
        self.total.add(usage);
        self.per_model
            .entry(model.to_string())
            .or_default()
            .add(usage);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_accumulates_total_and_per_model() {
        let mut ledger = UsageLedger::new();
        ledger.record(
            "claude-opus",
            &Usage {
                prompt_tokens: 100,
                completion_tokens: 50,
                total_tokens: 150,
                cost_usd: 0.01,
                ..Default::default()
            },
        );
        ledger.record(
            "claude-haiku",
            &Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
                cost_usd: 0.001,
                ..Default::default()
            },
        );

        assert_eq!(ledger.total.total_tokens, 165);
        assert!((ledger.total.cost_usd - 0.011).abs() < 1e-9);
        assert_eq!(ledger.per_model["claude-opus"].total_tokens, 150);
        assert_eq!(ledger.per_model["claude-haiku"].total_tokens, 15);
    }
}
