//! The permission checker: decides allow/deny/ask for a (tool name, input)
//! pair, wrapped by an active-skill scope when one is set on loop state.
//!
//! Grounded on `ExecSecurityConfig`'s denylist/approval-pattern pair
//! (`domain/src/config/tools.rs`) and `ToolPolicy`'s allow/deny list
//! (`domain/src/config/agents.rs`), the same two config shapes
//! `runtime/tools.rs::build_tool_definitions` already filters through.

use std::sync::Arc;

use sa_domain::config::ToolPolicy;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Decision
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Outcome of a permission check for one tool invocation.
#[derive(Debug, Clone)]
pub enum PermissionDecision {
    /// Allowed, optionally with a replacement input (a hook/checker may
    /// rewrite arguments before execution).
    Allow { updated_input: Option<serde_json::Value> },
    /// Denied. `interrupt` stops the whole scheduler run; otherwise only
    /// this tool call is synthesized as an error result.
    Deny { message: String, interrupt: bool },
    /// Needs interactive confirmation. No resolver is wired in this build,
    /// so the scheduler folds this into `Deny` at its single call site
    /// (`fold_ask_to_deny`), per the Open Question decision in DESIGN.md.
    Ask { message: String },
}

impl PermissionDecision {
    pub fn allow() -> Self {
        PermissionDecision::Allow { updated_input: None }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        PermissionDecision::Deny {
            message: message.into(),
            interrupt: false,
        }
    }

    pub fn deny_interrupt(message: impl Into<String>) -> Self {
        PermissionDecision::Deny {
            message: message.into(),
            interrupt: true,
        }
    }
}

/// Fold an `Ask` decision into `Deny` — the single point where the "no
/// interactive resolver configured" policy is applied.
pub fn fold_ask_to_deny(decision: PermissionDecision) -> PermissionDecision {
    match decision {
        PermissionDecision::Ask { message } => PermissionDecision::Deny {
            message: format!("{message} (no interactive resolver configured)"),
            interrupt: false,
        },
        other => other,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Checker trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub trait PermissionChecker: Send + Sync {
    fn check(&self, tool_name: &str, input: &serde_json::Value) -> PermissionDecision;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ConfigPermissionChecker — the default, config-backed checker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Default checker: denies tools excluded by a `ToolPolicy`, denies `exec`
/// invocations whose command matches a denied pattern, and asks (folded to
/// deny by the scheduler) for commands matching an approval pattern.
pub struct ConfigPermissionChecker {
    tool_policy: Option<ToolPolicy>,
    denied_command_set: Arc<regex::RegexSet>,
    approval_command_set: Arc<regex::RegexSet>,
}

impl ConfigPermissionChecker {
    pub fn new(
        tool_policy: Option<ToolPolicy>,
        denied_command_set: Arc<regex::RegexSet>,
        approval_command_set: Arc<regex::RegexSet>,
    ) -> Self {
        Self {
            tool_policy,
            denied_command_set,
            approval_command_set,
        }
    }

    fn command_of(input: &serde_json::Value) -> Option<&str> {
        input.get("command").and_then(|v| v.as_str())
    }
}

impl PermissionChecker for ConfigPermissionChecker {
    fn check(&self, tool_name: &str, input: &serde_json::Value) -> PermissionDecision {
        if let Some(policy) = &self.tool_policy {
            if !policy.allows(tool_name) {
                return PermissionDecision::deny(format!(
                    "tool '{tool_name}' is not permitted by the active tool policy"
                ));
            }
        }

        if tool_name == "exec" {
            if let Some(command) = Self::command_of(input) {
                if self.denied_command_set.is_match(command) {
                    return PermissionDecision::deny(format!(
                        "command matches a denied pattern: {command}"
                    ));
                }
                if self.approval_command_set.is_match(command) {
                    return PermissionDecision::Ask {
                        message: format!("command requires approval: {command}"),
                    };
                }
            }
        }

        PermissionDecision::allow()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Active-skill scoping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One entry in a skill's `allowed-tools` list: `NAME`, `NAME(ARG_PATTERN)`,
/// or a glob over the tool name.
#[derive(Debug, Clone)]
pub struct ToolAllowEntry {
    pub name_pattern: String,
    /// For the `NAME(ARG_PATTERN)` form: the argument key checked (`command`
    /// for `Bash`/`exec`-style tools) and the prefix it must match, parsed
    /// from `gh:*` style constraints into `("command", "gh ")`.
    pub arg_prefix: Option<(String, String)>,
}

impl ToolAllowEntry {
    /// Parse one allow-list entry, e.g. `"Bash"`, `"Bash(gh:*)"`, `"mcp__*"`.
    pub fn parse(raw: &str) -> Self {
        if let Some(open) = raw.find('(') {
            if let Some(close) = raw.rfind(')') {
                let name_pattern = raw[..open].to_string();
                let inner = &raw[open + 1..close];
                if let Some((key, pattern)) = inner.split_once(':') {
                    let prefix = pattern.trim_end_matches('*').to_string();
                    return Self {
                        name_pattern,
                        arg_prefix: Some((key.to_string(), format!("{prefix} "))),
                    };
                }
                return Self {
                    name_pattern,
                    arg_prefix: None,
                };
            }
        }
        Self {
            name_pattern: raw.to_string(),
            arg_prefix: None,
        }
    }

    pub fn matches(&self, tool_name: &str, input: &serde_json::Value) -> bool {
        let name_ok = self.name_pattern == tool_name
            || glob::Pattern::new(&self.name_pattern)
                .map(|p| p.matches(tool_name))
                .unwrap_or(false);
        if !name_ok {
            return false;
        }
        match &self.arg_prefix {
            None => true,
            Some((key, prefix)) => input
                .get(key)
                .and_then(|v| v.as_str())
                .map(|s| s.starts_with(prefix.as_str()))
                .unwrap_or(false),
        }
    }
}

/// An active skill scope narrowing the permission checker to its declared
/// `allowed-tools` list for the remainder of its execution.
#[derive(Debug, Clone, Default)]
pub struct ActiveSkill {
    pub name: String,
    pub allowed_tools: Vec<ToolAllowEntry>,
}

impl ActiveSkill {
    pub fn new(name: impl Into<String>, allowed_tools: &[String]) -> Self {
        Self {
            name: name.into(),
            allowed_tools: allowed_tools.iter().map(|s| ToolAllowEntry::parse(s)).collect(),
        }
    }
}

/// Wraps a base checker with an active-skill allow-list, per SPEC_FULL
/// §4.2's "Active-skill scoping" rule.
pub struct ScopedPermissionChecker<'a> {
    base: &'a dyn PermissionChecker,
    active_skill: Option<&'a ActiveSkill>,
}

impl<'a> ScopedPermissionChecker<'a> {
    pub fn new(base: &'a dyn PermissionChecker, active_skill: Option<&'a ActiveSkill>) -> Self {
        Self { base, active_skill }
    }

    pub fn check_scoped(&self, tool_name: &str, input: &serde_json::Value) -> PermissionDecision {
        if let Some(skill) = self.active_skill {
            if !skill.allowed_tools.is_empty() {
                let allowed = skill
                    .allowed_tools
                    .iter()
                    .any(|entry| entry.matches(tool_name, input));
                if allowed {
                    return PermissionDecision::allow();
                }
                return self.base.check(tool_name, input);
            }
        }
        self.base.check(tool_name, input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_entry_plain_name() {
        let e = ToolAllowEntry::parse("Bash");
        assert!(e.matches("Bash", &serde_json::json!({})));
        assert!(!e.matches("Write", &serde_json::json!({})));
    }

    #[test]
    fn allow_entry_arg_prefix() {
        let e = ToolAllowEntry::parse("Bash(gh:*)");
        assert!(e.matches("Bash", &serde_json::json!({"command": "gh pr create"})));
        assert!(!e.matches("Bash", &serde_json::json!({"command": "rm -rf /"})));
    }

    #[test]
    fn allow_entry_glob() {
        let e = ToolAllowEntry::parse("mcp__*");
        assert!(e.matches("mcp__fs__read", &serde_json::json!({})));
        assert!(!e.matches("exec", &serde_json::json!({})));
    }

    #[test]
    fn ask_folds_to_deny_without_interrupt() {
        let decision = fold_ask_to_deny(PermissionDecision::Ask {
            message: "needs approval".into(),
        });
        match decision {
            PermissionDecision::Deny { interrupt, .. } => assert!(!interrupt),
            _ => panic!("expected Deny"),
        }
    }

    struct AllowAll;
    impl PermissionChecker for AllowAll {
        fn check(&self, _tool_name: &str, _input: &serde_json::Value) -> PermissionDecision {
            PermissionDecision::deny("base denies everything")
        }
    }

    #[test]
    fn scoped_checker_allows_matching_tool_without_consulting_base() {
        let base = AllowAll;
        let skill = ActiveSkill::new("demo", &["Bash(gh:*)".to_string()]);
        let scoped = ScopedPermissionChecker::new(&base, Some(&skill));
        let decision = scoped.check_scoped("Bash", &serde_json::json!({"command": "gh pr list"}));
        assert!(matches!(decision, PermissionDecision::Allow { .. }));
    }

    #[test]
    fn scoped_checker_falls_through_to_base_for_non_matching_tool() {
        let base = AllowAll;
        let skill = ActiveSkill::new("demo", &["Bash(gh:*)".to_string()]);
        let scoped = ScopedPermissionChecker::new(&base, Some(&skill));
        let decision = scoped.check_scoped("Write", &serde_json::json!({}));
        assert!(matches!(decision, PermissionDecision::Deny { .. }));
    }
}
