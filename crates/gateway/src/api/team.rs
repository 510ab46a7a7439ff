//! Team coordination API — create/inspect the single active team, spawn and
//! shut down teammates, and drive the shared task list and mailbox.
//!
//! - `POST   /v1/team`                       — create the active team
//! - `GET    /v1/team`                       — snapshot of the active team
//! - `DELETE /v1/team`                       — cleanup (requires all members stopped)
//! - `POST   /v1/team/members`                — spawn a teammate
//! - `POST   /v1/team/members/:name/shutdown` — request cooperative shutdown
//! - `GET    /v1/team/tasks`                  — list tasks
//! - `GET    /v1/team/tasks/unblocked`        — unblocked (claimable) tasks
//! - `POST   /v1/team/tasks`                  — create a task
//! - `POST   /v1/team/tasks/:id/claim`        — claim a task
//! - `POST   /v1/team/tasks/:id/complete`     — complete a task
//! - `POST   /v1/team/mailbox/:recipient`     — send a mailbox message
//! - `GET    /v1/team/mailbox/:recipient`     — drain a recipient's mailbox

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Json};
use serde::Deserialize;

use sa_team::{MessageKind, Task};

use crate::state::AppState;

fn err_response(status: axum::http::StatusCode, e: impl ToString) -> axum::response::Response {
    (status, Json(serde_json::json!({ "error": e.to_string() }))).into_response()
}

#[derive(Debug, Deserialize)]
pub struct CreateTeamRequest {
    pub name: String,
}

pub async fn create_team(
    State(state): State<AppState>,
    Json(body): Json<CreateTeamRequest>,
) -> impl IntoResponse {
    match state.team.create_team(&body.name) {
        Ok(()) => Json(serde_json::json!({ "created": true, "name": body.name })).into_response(),
        Err(e) => err_response(axum::http::StatusCode::CONFLICT, e),
    }
}

pub async fn get_team(State(state): State<AppState>) -> impl IntoResponse {
    match state.team.get_team() {
        Some(snapshot) => Json(snapshot).into_response(),
        None => err_response(axum::http::StatusCode::NOT_FOUND, "no team is active"),
    }
}

pub async fn cleanup_team(State(state): State<AppState>) -> impl IntoResponse {
    match state.team.cleanup() {
        Ok(()) => Json(serde_json::json!({ "cleaned_up": true })).into_response(),
        Err(e) => err_response(axum::http::StatusCode::CONFLICT, e),
    }
}

#[derive(Debug, Deserialize)]
pub struct SpawnTeammateRequest {
    pub name: String,
    pub agent_type: String,
    #[serde(default)]
    pub initial_prompt: String,
}

pub async fn spawn_teammate(
    State(state): State<AppState>,
    Json(body): Json<SpawnTeammateRequest>,
) -> impl IntoResponse {
    match state
        .team
        .spawn_teammate(&body.name, &body.agent_type, &body.initial_prompt)
        .await
    {
        Ok(agent_id) => Json(serde_json::json!({ "agent_id": agent_id })).into_response(),
        Err(e) => err_response(axum::http::StatusCode::CONFLICT, e),
    }
}

pub async fn shutdown_teammate(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.team.request_shutdown(&name) {
        Ok(()) => Json(serde_json::json!({ "shutdown_requested": true, "member": name })).into_response(),
        Err(e) => err_response(axum::http::StatusCode::NOT_FOUND, e),
    }
}

pub async fn list_tasks(State(state): State<AppState>) -> impl IntoResponse {
    match state.team.list_tasks() {
        Ok(tasks) => Json(serde_json::json!({ "tasks": tasks })).into_response(),
        Err(e) => err_response(axum::http::StatusCode::NOT_FOUND, e),
    }
}

pub async fn unblocked_tasks(State(state): State<AppState>) -> impl IntoResponse {
    match state.team.get_unblocked_tasks() {
        Ok(tasks) => Json(serde_json::json!({ "tasks": tasks })).into_response(),
        Err(e) => err_response(axum::http::StatusCode::NOT_FOUND, e),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub id: String,
    #[serde(default)]
    pub subject: String,
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
}

pub async fn create_task(
    State(state): State<AppState>,
    Json(body): Json<CreateTaskRequest>,
) -> impl IntoResponse {
    let mut task = Task::new(body.id, body.description).with_subject(body.subject);
    task = task.with_depends_on(body.depends_on);
    if let Some(assigned_to) = body.assigned_to {
        task = task.with_assigned_to(assigned_to);
    }
    if let Some(created_by) = body.created_by {
        task = task.with_created_by(created_by);
    }
    match state.team.create_task(task) {
        Ok(()) => Json(serde_json::json!({ "created": true })).into_response(),
        Err(e) => err_response(axum::http::StatusCode::CONFLICT, e),
    }
}

#[derive(Debug, Deserialize)]
pub struct ClaimTaskRequest {
    pub agent: String,
}

pub async fn claim_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ClaimTaskRequest>,
) -> impl IntoResponse {
    match state.team.claim_task(&id, &body.agent) {
        Ok(task) => Json(task).into_response(),
        Err(e) => err_response(axum::http::StatusCode::CONFLICT, e),
    }
}

pub async fn complete_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.team.complete_task(&id) {
        Ok(task) => Json(task).into_response(),
        Err(e) => err_response(axum::http::StatusCode::CONFLICT, e),
    }
}

#[derive(Debug, Deserialize)]
pub struct SendMailRequest {
    pub from: String,
    #[serde(default)]
    pub kind: Option<String>,
    pub content: String,
    #[serde(default)]
    pub summary: Option<String>,
}

fn parse_kind(raw: Option<&str>) -> MessageKind {
    match raw {
        Some("broadcast") => MessageKind::Broadcast,
        Some("shutdown_request") => MessageKind::ShutdownRequest,
        Some("shutdown_response") => MessageKind::ShutdownResponse,
        Some("custom") => MessageKind::Custom,
        _ => MessageKind::Message,
    }
}

pub async fn send_mail(
    State(state): State<AppState>,
    Path(recipient): Path<String>,
    Json(body): Json<SendMailRequest>,
) -> impl IntoResponse {
    let kind = parse_kind(body.kind.as_deref());
    match state
        .team
        .send_mail(&body.from, &recipient, kind, &body.content, body.summary.as_deref())
    {
        Ok(()) => Json(serde_json::json!({ "sent": true })).into_response(),
        Err(e) => err_response(axum::http::StatusCode::BAD_REQUEST, e),
    }
}

pub async fn receive_mail(
    State(state): State<AppState>,
    Path(recipient): Path<String>,
) -> impl IntoResponse {
    match state.team.receive_mail(&recipient) {
        Ok(messages) => Json(serde_json::json!({ "messages": messages })).into_response(),
        Err(e) => err_response(axum::http::StatusCode::BAD_REQUEST, e),
    }
}
