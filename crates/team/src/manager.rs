//! Single-active-team-per-process team manager: lifecycle of the team
//! itself, teammate subprocess spawn/shutdown, and the two hook-integration
//! points (`teammate_idle`, `task_completed`).
//!
//! Process spawning mirrors `tools/src/exec.rs`'s `Command` usage; the
//! active-team pointer is guarded by a `parking_lot::RwLock` the same way
//! the hook registry is, per SPEC_FULL's shared-resource policy.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sa_domain::config::{env_vars, TeamConfig};
use sa_domain::{Error, Result};
use sa_hooks::{Decision, Dispatcher, HookInput};
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::mailbox::{Mailbox, Message, MessageKind};
use crate::task_list::TaskList;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberState {
    Active,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberRecord {
    pub name: String,
    pub agent_type: String,
    pub agent_id: Uuid,
    pub state: MemberState,
    pub spawned_at: DateTime<Utc>,
}

/// On-disk team config, rewritten whole (rename-over-temp) on every
/// membership change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamConfigFile {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub members: Vec<MemberRecord>,
}

/// Serializable snapshot returned by `get_team`, distinct from the internal
/// state (which also carries process handles that cannot be serialized).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamSnapshot {
    pub name: String,
    pub members: Vec<MemberRecord>,
}

pub struct SpawnRequest {
    pub team_name: String,
    pub member_name: String,
    pub agent_type: String,
    pub agent_id: Uuid,
    pub base_dir: PathBuf,
}

/// Pluggable subprocess launcher. Production code spawns the binary itself
/// via self-invocation; tests substitute a fake that returns no process
/// handle without touching `exec`.
pub type SpawnFn = Arc<dyn Fn(&SpawnRequest) -> Result<Option<Child>> + Send + Sync>;

/// Default spawn function: self-invoke this binary in hidden teammate mode.
pub fn self_invoke_spawn() -> SpawnFn {
    Arc::new(|req: &SpawnRequest| {
        let exe = std::env::current_exe().map_err(Error::Io)?;
        let child = Command::new(exe)
            .arg("teammate")
            .env(env_vars::TEAM_ENABLED, "1")
            .env(env_vars::TEAM_NAME, &req.team_name)
            .env(env_vars::MEMBER_NAME, &req.member_name)
            .env(env_vars::AGENT_ID, req.agent_id.to_string())
            .env(env_vars::BASE_DIR, req.base_dir.to_string_lossy().to_string())
            .spawn()
            .map_err(Error::Io)?;
        Ok(Some(child))
    })
}

struct ActiveTeam {
    name: String,
    dir: PathBuf,
    config: TeamConfigFile,
    mailbox: Mailbox,
    task_list: TaskList,
    /// One kill switch per member with a live subprocess; the watcher task
    /// spawned in `watch_for_exit` owns the actual `Child` and selects
    /// between it exiting on its own and a kill signal arriving here.
    kill_switches: HashMap<String, mpsc::Sender<()>>,
}

pub struct TeamManager {
    base_dir: PathBuf,
    /// Shared so the background waiter spawned by `watch_for_exit` can
    /// reach `mark_stopped` after the caller's `&self` borrow has ended.
    active: Arc<RwLock<Option<ActiveTeam>>>,
    spawn_fn: SpawnFn,
}

impl TeamManager {
    pub fn new(config: &TeamConfig) -> Self {
        Self {
            base_dir: PathBuf::from(&config.base_dir),
            active: Arc::new(RwLock::new(None)),
            spawn_fn: self_invoke_spawn(),
        }
    }

    pub fn with_spawn_fn(mut self, spawn_fn: SpawnFn) -> Self {
        self.spawn_fn = spawn_fn;
        self
    }

    fn write_config(team_dir: &std::path::Path, config: &TeamConfigFile) -> Result<()> {
        let final_path = team_dir.join("config.json");
        let tmp_path = team_dir.join("config.json.tmp");
        let raw = serde_json::to_string_pretty(config)?;
        std::fs::write(&tmp_path, raw)?;
        std::fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }

    /// Create a new team. Fails if one is already active for this process.
    pub fn create_team(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::Team("team name must not be empty".into()));
        }
        let mut active = self.active.write();
        if active.is_some() {
            return Err(Error::Team(
                "a team is already active for this process".into(),
            ));
        }

        let team_dir = self.base_dir.join("teams").join(name);
        let tasks_dir = self.base_dir.join("tasks").join(name);
        std::fs::create_dir_all(&team_dir)?;

        let config = TeamConfigFile {
            name: name.to_string(),
            created_at: Utc::now(),
            members: Vec::new(),
        };
        Self::write_config(&team_dir, &config)?;

        let mailbox = Mailbox::new(team_dir.join("mailbox"))?;
        let task_list = TaskList::new(&tasks_dir)?;

        *active = Some(ActiveTeam {
            name: name.to_string(),
            dir: team_dir,
            config,
            mailbox,
            task_list,
            kill_switches: HashMap::new(),
        });
        Ok(())
    }

    pub fn get_team(&self) -> Option<TeamSnapshot> {
        self.active.read().as_ref().map(|t| TeamSnapshot {
            name: t.name.clone(),
            members: t.config.members.clone(),
        })
    }

    /// Tear down the active team. Permitted only once every member has
    /// transitioned to `Stopped`.
    pub fn cleanup(&self) -> Result<()> {
        let mut active = self.active.write();
        let Some(team) = active.as_ref() else {
            return Err(Error::Team("no team is active".into()));
        };
        if team
            .config
            .members
            .iter()
            .any(|m| m.state != MemberState::Stopped)
        {
            return Err(Error::Team(
                "cannot clean up a team with active members".into(),
            ));
        }
        let dir = team.dir.clone();
        let tasks_dir = team.task_list.dir().to_path_buf();
        *active = None;
        drop(active);
        let _ = std::fs::remove_dir_all(dir);
        let _ = std::fs::remove_dir_all(tasks_dir);
        Ok(())
    }

    /// Spawn a teammate subprocess, record it as an active member, and
    /// optionally send it an initial mailbox prompt from `lead`.
    pub async fn spawn_teammate(
        &self,
        member_name: &str,
        agent_type: &str,
        initial_prompt: &str,
    ) -> Result<Uuid> {
        let agent_id = Uuid::new_v4();
        let spawn_req = {
            let active = self.active.read();
            let team = active
                .as_ref()
                .ok_or_else(|| Error::Team("no team is active".into()))?;
            if team.config.members.iter().any(|m| m.name == member_name) {
                return Err(Error::Team(format!(
                    "teammate {member_name} already exists in this team"
                )));
            }
            SpawnRequest {
                team_name: team.name.clone(),
                member_name: member_name.to_string(),
                agent_type: agent_type.to_string(),
                agent_id,
                base_dir: self.base_dir.clone(),
            }
        };

        let child = (self.spawn_fn)(&spawn_req)?;

        {
            let mut active = self.active.write();
            let team = active
                .as_mut()
                .ok_or_else(|| Error::Team("no team is active".into()))?;
            team.config.members.push(MemberRecord {
                name: member_name.to_string(),
                agent_type: agent_type.to_string(),
                agent_id,
                state: MemberState::Active,
                spawned_at: Utc::now(),
            });
            Self::write_config(&team.dir, &team.config)?;

            if !initial_prompt.is_empty() {
                let message = Message::new("lead", MessageKind::Message, initial_prompt);
                team.mailbox.send(member_name, &message)?;
            }
        }

        if let Some(child) = child {
            let (kill_tx, kill_rx) = mpsc::channel(1);
            {
                let mut active = self.active.write();
                if let Some(team) = active.as_mut() {
                    team.kill_switches.insert(member_name.to_string(), kill_tx);
                }
            }
            self.watch_for_exit(child, member_name.to_string(), kill_rx);
        }
        Ok(agent_id)
    }

    /// Spawn the background task that waits for `child` to exit (or is
    /// killed via `kill_rx` by `shutdown_teammate`'s timeout-then-kill
    /// branch) and then marks the member `Stopped`, mirroring
    /// `tools/src/exec.rs`'s `spawn_monitor`. Runs detached from the
    /// `&self` call that spawned it, so the shared state is reached through
    /// a clone of the `Arc`-wrapped `active` lock rather than `self`.
    fn watch_for_exit(&self, mut child: Child, member_name: String, mut kill_rx: mpsc::Receiver<()>) {
        let active = Arc::clone(&self.active);
        tokio::spawn(async move {
            tokio::select! {
                _ = child.wait() => {}
                _ = kill_rx.recv() => {
                    let _ = child.kill().await;
                }
            }
            let _ = Self::mark_stopped_locked(&active, &member_name);
        });
    }

    fn mark_stopped_locked(active: &RwLock<Option<ActiveTeam>>, member_name: &str) -> Result<()> {
        let mut guard = active.write();
        let team = guard
            .as_mut()
            .ok_or_else(|| Error::Team("no team is active".into()))?;
        if let Some(member) = team.config.members.iter_mut().find(|m| m.name == member_name) {
            member.state = MemberState::Stopped;
        }
        Self::write_config(&team.dir, &team.config)?;
        Ok(())
    }

    fn mark_stopped(&self, member_name: &str) -> Result<()> {
        Self::mark_stopped_locked(&self.active, member_name)
    }

    fn member_is_stopped(&self, member_name: &str) -> bool {
        self.active
            .read()
            .as_ref()
            .map(|t| {
                t.config
                    .members
                    .iter()
                    .any(|m| m.name == member_name && m.state == MemberState::Stopped)
            })
            .unwrap_or(false)
    }

    /// Cooperative shutdown: ask the teammate to stop; it replies via
    /// mailbox with a `shutdown_response`.
    pub fn request_shutdown(&self, member_name: &str) -> Result<()> {
        let active = self.active.read();
        let team = active
            .as_ref()
            .ok_or_else(|| Error::Team("no team is active".into()))?;
        let message = Message::new("lead", MessageKind::ShutdownRequest, "please wrap up");
        team.mailbox.send(member_name, &message)
    }

    /// Forceful shutdown: wait up to `timeout` for the process to exit on
    /// its own (observed through the same `Stopped` transition the
    /// `watch_for_exit` waiter drives), then signal its kill switch. Mirrors
    /// `tools/src/exec.rs`'s timeout-then-kill branch.
    pub async fn shutdown_teammate(&self, member_name: &str, timeout: Duration) -> Result<()> {
        self.request_shutdown(member_name)?;

        let has_live_process = self
            .active
            .read()
            .as_ref()
            .map(|team| team.kill_switches.contains_key(member_name))
            .unwrap_or(false);

        if has_live_process {
            let deadline = tokio::time::Instant::now() + timeout;
            while !self.member_is_stopped(member_name) {
                if tokio::time::Instant::now() >= deadline {
                    let kill_tx = {
                        let mut active = self.active.write();
                        active
                            .as_mut()
                            .and_then(|team| team.kill_switches.remove(member_name))
                    };
                    if let Some(kill_tx) = kill_tx {
                        let _ = kill_tx.send(()).await;
                    }
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }

        self.mark_stopped(member_name)?;

        let active = self.active.read();
        if let Some(team) = active.as_ref() {
            let message = Message::new(member_name, MessageKind::ShutdownResponse, "Shutdown approved.");
            team.mailbox.send("lead", &message)?;
        }
        Ok(())
    }

    /// Fire `teammate_idle` and, if any hook result asks to keep working,
    /// return its message as feedback for the teammate instead of letting it
    /// stand down.
    pub async fn on_teammate_idle(
        &self,
        dispatcher: &Dispatcher,
        session_id: &str,
        member_name: &str,
    ) -> Option<String> {
        let input = HookInput::new("teammate_idle", session_id).with_tool_name(member_name);
        let results = dispatcher.fire("teammate_idle", input).await;
        results
            .into_iter()
            .find(|r| !r.cont)
            .and_then(|r| r.system_message.or(r.reason))
    }

    /// Fire `task_completed` and, if any hook result refuses the
    /// completion, return its message as feedback (the caller keeps the
    /// task `in_progress`).
    pub async fn on_task_completed(
        &self,
        dispatcher: &Dispatcher,
        session_id: &str,
        task_id: &str,
    ) -> Option<String> {
        let input = HookInput::new("task_completed", session_id).with_tool_name(task_id);
        let results = dispatcher.fire("task_completed", input).await;
        results
            .into_iter()
            .find(|r| !r.cont)
            .and_then(|r| r.system_message.or(r.reason))
    }

    pub fn decision_allows(result: &sa_hooks::HookResult) -> bool {
        !matches!(result.decision, Some(Decision::Deny))
    }

    /// Create a task on the active team's shared task list.
    pub fn create_task(&self, task: crate::task_list::Task) -> Result<()> {
        let active = self.active.read();
        let team = active
            .as_ref()
            .ok_or_else(|| Error::Team("no team is active".into()))?;
        team.task_list.create(task)
    }

    pub fn claim_task(&self, id: &str, agent: &str) -> Result<crate::task_list::Task> {
        let active = self.active.read();
        let team = active
            .as_ref()
            .ok_or_else(|| Error::Team("no team is active".into()))?;
        team.task_list.claim(id, agent)
    }

    pub fn complete_task(&self, id: &str) -> Result<crate::task_list::Task> {
        let active = self.active.read();
        let team = active
            .as_ref()
            .ok_or_else(|| Error::Team("no team is active".into()))?;
        team.task_list.complete(id)
    }

    pub fn list_tasks(&self) -> Result<Vec<crate::task_list::Task>> {
        let active = self.active.read();
        let team = active
            .as_ref()
            .ok_or_else(|| Error::Team("no team is active".into()))?;
        team.task_list.list()
    }

    pub fn get_unblocked_tasks(&self) -> Result<Vec<crate::task_list::Task>> {
        let active = self.active.read();
        let team = active
            .as_ref()
            .ok_or_else(|| Error::Team("no team is active".into()))?;
        team.task_list.get_unblocked()
    }

    /// Send a mailbox message to `recipient` from `sender`.
    pub fn send_mail(
        &self,
        sender: &str,
        recipient: &str,
        kind: MessageKind,
        content: &str,
        summary: Option<&str>,
    ) -> Result<()> {
        let active = self.active.read();
        let team = active
            .as_ref()
            .ok_or_else(|| Error::Team("no team is active".into()))?;
        let mut message = Message::new(sender, kind, content);
        message.summary = summary.map(|s| s.to_string());
        team.mailbox.send(recipient, &message)
    }

    /// Drain every message currently queued for `recipient`.
    pub fn receive_mail(&self, recipient: &str) -> Result<Vec<Message>> {
        let active = self.active.read();
        let team = active
            .as_ref()
            .ok_or_else(|| Error::Team("no team is active".into()))?;
        team.mailbox.receive(recipient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with_base(base: &std::path::Path) -> TeamManager {
        let config = TeamConfig {
            enabled: true,
            base_dir: base.to_string_lossy().to_string(),
            shutdown_timeout_sec: 1,
            agent_types: HashMap::new(),
        };
        TeamManager::new(&config).with_spawn_fn(Arc::new(|_req| Ok(None)))
    }

    #[test]
    fn create_team_rejects_second_concurrent_team() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_base(dir.path());
        manager.create_team("alpha").unwrap();
        let err = manager.create_team("beta").unwrap_err();
        assert!(err.to_string().contains("already active"));
    }

    #[tokio::test]
    async fn spawn_teammate_records_active_member_and_sends_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_base(dir.path());
        manager.create_team("alpha").unwrap();
        manager
            .spawn_teammate("researcher-1", "researcher", "start digging")
            .await
            .unwrap();

        let snapshot = manager.get_team().unwrap();
        assert_eq!(snapshot.members.len(), 1);
        assert_eq!(snapshot.members[0].state, MemberState::Active);
    }

    #[tokio::test]
    async fn cleanup_refuses_while_members_are_active() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_base(dir.path());
        manager.create_team("alpha").unwrap();
        manager
            .spawn_teammate("researcher-1", "researcher", "")
            .await
            .unwrap();

        let err = manager.cleanup().unwrap_err();
        assert!(err.to_string().contains("active members"));
    }

    #[tokio::test]
    async fn cleanup_succeeds_once_every_member_is_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_base(dir.path());
        manager.create_team("alpha").unwrap();
        manager
            .spawn_teammate("researcher-1", "researcher", "")
            .await
            .unwrap();
        manager.mark_stopped("researcher-1").unwrap();

        manager.cleanup().unwrap();
        assert!(manager.get_team().is_none());
    }

    #[test]
    fn create_team_rejects_empty_name() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_base(dir.path());
        let err = manager.create_team("").unwrap_err();
        assert!(err.to_string().contains("must not be empty"));
    }

    #[tokio::test]
    async fn spawn_teammate_rejects_duplicate_member_name() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_base(dir.path());
        manager.create_team("alpha").unwrap();
        manager
            .spawn_teammate("researcher-1", "researcher", "")
            .await
            .unwrap();
        let err = manager
            .spawn_teammate("researcher-1", "researcher", "")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn task_accessors_round_trip_through_the_active_team() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_base(dir.path());
        manager.create_team("alpha").unwrap();

        manager
            .create_task(crate::task_list::Task::new("t1", "do the thing"))
            .unwrap();
        assert_eq!(manager.get_unblocked_tasks().unwrap().len(), 1);

        manager.claim_task("t1", "researcher-1").unwrap();
        assert!(manager.get_unblocked_tasks().unwrap().is_empty());

        manager.complete_task("t1").unwrap();
        assert_eq!(manager.list_tasks().unwrap()[0].status, crate::task_list::TaskStatus::Completed);
    }

    #[tokio::test]
    async fn a_teammate_that_exits_on_its_own_is_marked_stopped_without_shutdown_teammate() {
        let dir = tempfile::tempdir().unwrap();
        let config = TeamConfig {
            enabled: true,
            base_dir: dir.path().to_string_lossy().to_string(),
            shutdown_timeout_sec: 1,
            agent_types: HashMap::new(),
        };
        let manager = TeamManager::new(&config).with_spawn_fn(Arc::new(|_req| {
            let child = tokio::process::Command::new("true").spawn().map_err(Error::Io)?;
            Ok(Some(child))
        }));
        manager.create_team("alpha").unwrap();
        manager
            .spawn_teammate("researcher-1", "researcher", "")
            .await
            .unwrap();

        for _ in 0..100 {
            if manager.member_is_stopped("researcher-1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let snapshot = manager.get_team().unwrap();
        assert_eq!(snapshot.members[0].state, MemberState::Stopped);
        manager.cleanup().unwrap();
    }

    #[tokio::test]
    async fn shutdown_teammate_kills_a_process_that_will_not_exit_on_its_own() {
        let dir = tempfile::tempdir().unwrap();
        let config = TeamConfig {
            enabled: true,
            base_dir: dir.path().to_string_lossy().to_string(),
            shutdown_timeout_sec: 1,
            agent_types: HashMap::new(),
        };
        let manager = TeamManager::new(&config).with_spawn_fn(Arc::new(|_req| {
            let child = tokio::process::Command::new("sleep")
                .arg("30")
                .spawn()
                .map_err(Error::Io)?;
            Ok(Some(child))
        }));
        manager.create_team("alpha").unwrap();
        manager
            .spawn_teammate("researcher-1", "researcher", "")
            .await
            .unwrap();

        manager
            .shutdown_teammate("researcher-1", Duration::from_millis(100))
            .await
            .unwrap();

        assert!(manager.member_is_stopped("researcher-1"));
        manager.cleanup().unwrap();
    }

    #[test]
    fn mail_accessors_round_trip_through_the_active_team() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_base(dir.path());
        manager.create_team("alpha").unwrap();

        manager
            .send_mail("lead", "researcher-1", MessageKind::Message, "hi", None)
            .unwrap();
        let messages = manager.receive_mail("researcher-1").unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "hi");
        assert!(manager.receive_mail("researcher-1").unwrap().is_empty());
    }
}
