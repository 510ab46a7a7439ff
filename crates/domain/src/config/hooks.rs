use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Hook dispatcher configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Declarative hook registrations loaded at process start. In-process
/// callbacks are always registered from code; this config only covers
/// external shell-command hooks, since those are the representable-in-TOML
/// half of the hook system.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HooksConfig {
    #[serde(default)]
    pub registrations: Vec<HookRegistrationConfig>,
    /// Default async-hook second-invocation deadline, in seconds.
    #[serde(default = "d_async_timeout_sec")]
    pub default_async_timeout_sec: u64,
}

/// One configured matcher: which event it fires on, which tool names it
/// matches, and the ordered shell commands it runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookRegistrationConfig {
    /// Event name, e.g. `pre_tool_use`, `post_tool_use`, `stop`.
    pub event: String,
    /// Tool-name pattern; empty matches every invocation for this event.
    #[serde(default)]
    pub matcher: String,
    /// Per-invocation timeout in seconds; 0 or absent means no timeout.
    #[serde(default)]
    pub timeout_sec: u64,
    /// Shell commands run in registration order, after any in-process
    /// callbacks registered for the same matcher.
    pub commands: Vec<String>,
    /// Scope this registration belongs to; `None` registers into the base
    /// hook map, `Some(id)` registers into the named scope.
    #[serde(default)]
    pub scope: Option<String>,
}

fn d_async_timeout_sec() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_from_toml_with_defaults() {
        let toml_str = r#"
            [[registrations]]
            event = "pre_tool_use"
            matcher = "Bash"
            commands = ["./hooks/audit.sh"]
        "#;
        let cfg: HooksConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.registrations.len(), 1);
        assert_eq!(cfg.registrations[0].timeout_sec, 0);
        assert_eq!(cfg.default_async_timeout_sec, 30);
    }
}
