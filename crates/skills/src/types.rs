use serde::{Deserialize, Serialize};
use std::fmt;

use crate::manifest::{ReadinessStatus, SkillManifest, SkillReadiness};

/// Risk tier for a skill — controls permission prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskTier {
    Pure,
    Io,
    Net,
    Admin,
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskTier::Pure => write!(f, "PURE"),
            RiskTier::Io => write!(f, "IO"),
            RiskTier::Net => write!(f, "NET"),
            RiskTier::Admin => write!(f, "ADMIN"),
        }
    }
}

/// A skill definition loaded from `skill.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillEntry {
    pub name: String,
    pub description: String,
    pub location: String,
    pub risk: RiskTier,
    #[serde(default)]
    pub inputs: Option<String>,
    #[serde(default)]
    pub outputs: Option<String>,
    #[serde(default)]
    pub permission_scope: Option<String>,
    /// SKILL.md frontmatter, when present. Not part of `skill.toml` itself —
    /// filled in after load by enriching with the sibling SKILL.md.
    #[serde(skip)]
    pub manifest: Option<SkillManifest>,
    /// Readiness computed from `manifest.requires` on the current system.
    #[serde(skip)]
    pub readiness: Option<SkillReadiness>,
}

impl SkillEntry {
    pub fn render_index_line(&self) -> String {
        let mut line = format!("- {}: {}", self.name, self.description);
        line.push_str(&format!(" location={}", self.location));
        line.push_str(&format!(" risk={}", self.risk));
        if let Some(ref inputs) = self.inputs {
            line.push_str(&format!(" inputs={inputs}"));
        }
        if let Some(ref outputs) = self.outputs {
            line.push_str(&format!(" outputs={outputs}"));
        }
        line
    }

    /// A skill with no computed readiness is assumed ready (legacy
    /// `skill.toml`-only entries with no SKILL.md never get checked).
    pub fn is_ready(&self) -> bool {
        self.readiness
            .as_ref()
            .map(|r| r.status == ReadinessStatus::Ready)
            .unwrap_or(true)
    }

    /// Tool names this skill declares it uses, for active-skill scoping.
    /// Falls back to `tool_prefixes` rendered as glob patterns when the
    /// manifest lists prefixes but no exact tool names.
    pub fn allowed_tools(&self) -> Vec<String> {
        let Some(manifest) = &self.manifest else {
            return Vec::new();
        };
        let mut tools = manifest.tools.clone();
        tools.extend(manifest.tool_prefixes.iter().map(|p| format!("{p}*")));
        tools
    }
}
