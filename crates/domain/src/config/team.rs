use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Team coordination configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Feature-flag and path configuration for the team coordination subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamConfig {
    /// Master switch. Mirrors the `SA_TEAM_ENABLED=1` environment flag;
    /// the env var, when set, overrides this field.
    #[serde(default)]
    pub enabled: bool,
    /// Root directory under which `teams/<name>/` and `tasks/<name>/` are
    /// created.
    #[serde(default = "d_base_dir")]
    pub base_dir: String,
    /// Default timeout (seconds) for the forceful teammate-shutdown path:
    /// interrupt, wait this long, then kill.
    #[serde(default = "d_shutdown_timeout_sec")]
    pub shutdown_timeout_sec: u64,
    /// Named teammate archetypes a lead can spawn, keyed by `agent_type`.
    #[serde(default)]
    pub agent_types: std::collections::HashMap<String, TeammateTypeConfig>,
}

impl Default for TeamConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_dir: d_base_dir(),
            shutdown_timeout_sec: d_shutdown_timeout_sec(),
            agent_types: std::collections::HashMap::new(),
        }
    }
}

/// A teammate archetype: what a spawned process of this type is allowed to
/// do and which model it prefers, before any per-invocation override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeammateTypeConfig {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub workspace_path: Option<String>,
}

fn d_base_dir() -> String {
    "./data/team".into()
}

fn d_shutdown_timeout_sec() -> u64 {
    10
}

/// Environment variables a spawned teammate process inherits, identifying
/// which team/member/agent it is and where its shared state lives.
pub mod env_vars {
    pub const TEAM_ENABLED: &str = "SA_TEAM_ENABLED";
    pub const TEAM_NAME: &str = "SA_TEAM_NAME";
    pub const MEMBER_NAME: &str = "SA_TEAM_MEMBER";
    pub const AGENT_ID: &str = "SA_TEAM_AGENT_ID";
    pub const BASE_DIR: &str = "SA_TEAM_BASE_DIR";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_disabled_with_sane_base_dir() {
        let cfg = TeamConfig::default();
        assert!(!cfg.enabled);
        assert_eq!(cfg.base_dir, "./data/team");
        assert_eq!(cfg.shutdown_timeout_sec, 10);
    }

    #[test]
    fn deserializes_agent_types_from_toml() {
        let toml_str = r#"
            enabled = true
            [agent_types.researcher]
            model = "claude-haiku"
        "#;
        let cfg: TeamConfig = toml::from_str(toml_str).unwrap();
        assert!(cfg.enabled);
        assert_eq!(
            cfg.agent_types["researcher"].model.as_deref(),
            Some("claude-haiku")
        );
    }
}
