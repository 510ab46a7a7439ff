//! Legacy (non-staging) OpenClaw scan/import endpoints — direct filesystem
//! copy from a named OpenClaw root, no staging directory involved.
//!
//! Superseded for new integrations by [`super::import_staging`], which stages
//! archives and supports preview-before-apply. Kept for callers that already
//! point at an on-disk OpenClaw checkout.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::state::AppState;

use super::guard::AdminGuard;

#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    /// Path to the OpenClaw root (e.g. `/var/lib/serialagent/imports/openclaw`
    /// or the user's `~/.openclaw`).
    pub path: String,
}

/// What we find in an OpenClaw directory.
#[derive(Debug, Serialize)]
pub struct ScanResult {
    pub path: String,
    pub valid: bool,
    pub agents: Vec<ScannedAgent>,
    pub workspaces: Vec<ScannedWorkspace>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ScannedAgent {
    pub name: String,
    pub has_models: bool,
    pub has_auth: bool,
    pub session_count: usize,
    pub models: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct ScannedWorkspace {
    pub name: String,
    pub path: String,
    pub files: Vec<String>,
    pub total_size_bytes: u64,
}

/// Sanitize a path component to prevent traversal attacks.
fn sanitize_component(s: &str) -> bool {
    !s.is_empty()
        && !s.contains('/')
        && !s.contains('\\')
        && s != ".."
        && s != "."
        && !s.contains('\0')
}

/// Scan an OpenClaw root directory and report what's importable.
fn scan_openclaw_dir(root: &Path) -> ScanResult {
    let mut result = ScanResult {
        path: root.display().to_string(),
        valid: false,
        agents: Vec::new(),
        workspaces: Vec::new(),
        warnings: Vec::new(),
    };

    if !root.is_dir() {
        result.warnings.push(format!("{} is not a directory", root.display()));
        return result;
    }

    // ── Scan agents/ ─────────────────────────────────────────────
    let agents_dir = root.join("agents");
    if agents_dir.is_dir() {
        if let Ok(entries) = std::fs::read_dir(&agents_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if !sanitize_component(&name) {
                    continue;
                }
                let agent_root = entry.path();
                let agent_dir = agent_root.join("agent");
                if !agent_dir.is_dir() {
                    continue;
                }

                let models_path = agent_dir.join("models.json");
                let auth_path = agent_dir.join("auth-profiles.json");
                let sessions_dir = agent_root.join("sessions");

                let has_models = models_path.is_file();
                let has_auth = auth_path.is_file();

                let models: HashMap<String, String> = if has_models {
                    std::fs::read_to_string(&models_path)
                        .ok()
                        .and_then(|s| serde_json::from_str(&s).ok())
                        .unwrap_or_default()
                } else {
                    HashMap::new()
                };

                let session_count = if sessions_dir.is_dir() {
                    std::fs::read_dir(&sessions_dir)
                        .map(|rd| {
                            rd.filter(|e| {
                                e.as_ref()
                                    .map(|e| {
                                        e.path()
                                            .extension()
                                            .map(|x| x == "jsonl")
                                            .unwrap_or(false)
                                    })
                                    .unwrap_or(false)
                            })
                            .count()
                        })
                        .unwrap_or(0)
                } else {
                    0
                };

                if has_auth {
                    result.warnings.push(format!(
                        "Agent '{}' has auth-profiles.json (contains credentials — import with caution)",
                        name
                    ));
                }

                result.agents.push(ScannedAgent {
                    name,
                    has_models,
                    has_auth,
                    session_count,
                    models,
                });
            }
        }
    }

    // ── Scan workspace* directories ──────────────────────────────
    if let Ok(entries) = std::fs::read_dir(root) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with("workspace") || !entry.path().is_dir() {
                continue;
            }
            if !sanitize_component(&name) {
                continue;
            }

            let ws_path = entry.path();
            let mut files = Vec::new();
            let mut total_size: u64 = 0;

            if let Ok(ws_entries) = std::fs::read_dir(&ws_path) {
                for ws_entry in ws_entries.flatten() {
                    if ws_entry.path().is_file() {
                        let fname = ws_entry.file_name().to_string_lossy().to_string();
                        let size = ws_entry.metadata().map(|m| m.len()).unwrap_or(0);
                        total_size += size;
                        files.push(fname);
                    }
                }
            }
            files.sort();

            result.workspaces.push(ScannedWorkspace {
                name: name.clone(),
                path: ws_path.display().to_string(),
                files,
                total_size_bytes: total_size,
            });
        }
    }

    result.valid = !result.agents.is_empty() || !result.workspaces.is_empty();
    result
}

pub async fn scan_openclaw(
    _guard: AdminGuard,
    State(_state): State<AppState>,
    Json(body): Json<ScanRequest>,
) -> impl IntoResponse {
    let path = PathBuf::from(&body.path);

    let canonical = match std::fs::canonicalize(&path) {
        Ok(p) => p,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": format!("cannot resolve path: {e}"),
                })),
            )
                .into_response();
        }
    };

    let result = scan_openclaw_dir(&canonical);
    Json(serde_json::to_value(&result).unwrap_or_default()).into_response()
}

#[derive(Debug, Deserialize)]
pub struct ImportApplyRequest {
    /// Path to the OpenClaw root that was previously scanned.
    pub path: String,

    /// Which workspaces to import (names from scan, e.g. "workspace", "workspace-kimi").
    #[serde(default)]
    pub workspaces: Vec<String>,

    /// Which agents to import (names from scan, e.g. "main", "kimi-agent").
    #[serde(default)]
    pub agents: Vec<String>,

    /// Import models.json for selected agents.
    #[serde(default)]
    pub import_models: bool,

    /// Import auth-profiles.json for selected agents.
    /// Default false — credentials are sensitive.
    #[serde(default)]
    pub import_auth: bool,

    /// Import session JSONL files for selected agents.
    #[serde(default)]
    pub import_sessions: bool,
}

#[derive(Debug, Serialize)]
pub struct ImportApplyResult {
    pub success: bool,
    pub workspaces_imported: Vec<String>,
    pub agents_imported: Vec<String>,
    pub sessions_imported: usize,
    pub files_copied: usize,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

pub async fn apply_openclaw_import(
    _guard: AdminGuard,
    State(state): State<AppState>,
    Json(body): Json<ImportApplyRequest>,
) -> impl IntoResponse {
    let source = match std::fs::canonicalize(PathBuf::from(&body.path)) {
        Ok(p) => p,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": format!("invalid path: {e}") })),
            )
                .into_response();
        }
    };

    let mut result = ImportApplyResult {
        success: true,
        workspaces_imported: Vec::new(),
        agents_imported: Vec::new(),
        sessions_imported: 0,
        files_copied: 0,
        warnings: Vec::new(),
        errors: Vec::new(),
    };

    let dest_workspace = &state.config.workspace.path;
    let dest_state = &state.config.workspace.state_path;

    // ── Import workspaces ────────────────────────────────────────
    for ws_name in &body.workspaces {
        if !sanitize_component(ws_name) {
            result.errors.push(format!("invalid workspace name: {ws_name}"));
            continue;
        }

        let src_ws = source.join(ws_name);
        if !src_ws.is_dir() {
            result
                .warnings
                .push(format!("workspace '{ws_name}' not found at source, skipping"));
            continue;
        }

        let target = if ws_name == "workspace" {
            dest_workspace.clone()
        } else {
            dest_workspace
                .parent()
                .unwrap_or(dest_workspace.as_path())
                .join(ws_name)
        };

        if let Err(e) = std::fs::create_dir_all(&target) {
            result.errors.push(format!("create dir {}: {e}", target.display()));
            continue;
        }

        match std::fs::read_dir(&src_ws) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    if entry.path().is_file() {
                        let fname = entry.file_name();
                        let dest_file = target.join(&fname);
                        match std::fs::copy(entry.path(), &dest_file) {
                            Ok(_) => result.files_copied += 1,
                            Err(e) => {
                                result.errors.push(format!(
                                    "copy {}/{}: {e}",
                                    ws_name,
                                    fname.to_string_lossy()
                                ));
                            }
                        }
                    }
                }
            }
            Err(e) => {
                result.errors.push(format!("read dir {ws_name}: {e}"));
            }
        }

        result.workspaces_imported.push(ws_name.clone());
    }

    // ── Import agents ────────────────────────────────────────────
    let agents_import_dir = dest_state.join("imported_agents");
    if !body.agents.is_empty() {
        let _ = std::fs::create_dir_all(&agents_import_dir);
    }

    for agent_name in &body.agents {
        if !sanitize_component(agent_name) {
            result.errors.push(format!("invalid agent name: {agent_name}"));
            continue;
        }

        let src_agent = source.join("agents").join(agent_name).join("agent");
        if !src_agent.is_dir() {
            result
                .warnings
                .push(format!("agent '{agent_name}' not found at source, skipping"));
            continue;
        }

        let dest_agent = agents_import_dir.join(agent_name);
        let _ = std::fs::create_dir_all(&dest_agent);

        if body.import_models {
            let models_src = src_agent.join("models.json");
            if models_src.is_file() {
                let dest = dest_agent.join("models.json");
                match std::fs::copy(&models_src, &dest) {
                    Ok(_) => result.files_copied += 1,
                    Err(e) => result
                        .errors
                        .push(format!("copy {agent_name}/models.json: {e}")),
                }
            }
        }

        if body.import_auth {
            let auth_src = src_agent.join("auth-profiles.json");
            if auth_src.is_file() {
                result.warnings.push(format!(
                    "Importing credentials for agent '{}' — ensure these are rotated if needed",
                    agent_name
                ));
                let dest = dest_agent.join("auth-profiles.json");
                match std::fs::copy(&auth_src, &dest) {
                    Ok(_) => result.files_copied += 1,
                    Err(e) => result
                        .errors
                        .push(format!("copy {agent_name}/auth-profiles.json: {e}")),
                }
            }
        }

        if body.import_sessions {
            let sessions_src = source.join("agents").join(agent_name).join("sessions");
            if sessions_src.is_dir() {
                let dest_sessions = dest_agent.join("sessions");
                let _ = std::fs::create_dir_all(&dest_sessions);
                if let Ok(entries) = std::fs::read_dir(&sessions_src) {
                    for entry in entries.flatten() {
                        if entry
                            .path()
                            .extension()
                            .map(|x| x == "jsonl")
                            .unwrap_or(false)
                        {
                            let dest = dest_sessions.join(entry.file_name());
                            match std::fs::copy(entry.path(), &dest) {
                                Ok(_) => {
                                    result.files_copied += 1;
                                    result.sessions_imported += 1;
                                }
                                Err(e) => result.errors.push(format!(
                                    "copy session {}: {e}",
                                    entry.file_name().to_string_lossy()
                                )),
                            }
                        }
                    }
                }
            }
        }

        result.agents_imported.push(agent_name.clone());
    }

    if !result.workspaces_imported.is_empty() {
        state.workspace.refresh();
    }

    result.success = result.errors.is_empty();

    Json(serde_json::to_value(&result).unwrap_or_default()).into_response()
}
