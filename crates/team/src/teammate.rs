//! Teammate-side runtime: what a spawned subprocess uses to talk back to
//! the lead, claim shared tasks, and watch its own mailbox.
//!
//! Constructed from the four `SA_TEAM_*` environment variables
//! (`sa_domain::config::env_vars`) the manager sets on spawn.

use std::path::PathBuf;

use sa_domain::{Error, Result};
use uuid::Uuid;

use crate::mailbox::{Mailbox, Message, MessageKind};
use crate::manager::TeamConfigFile;
use crate::task_list::{Task, TaskList};

pub struct Teammate {
    pub team_name: String,
    pub member_name: String,
    pub agent_id: Uuid,
    mailbox: Mailbox,
    task_list: TaskList,
    team_dir: PathBuf,
}

impl Teammate {
    /// Build a teammate runtime from the environment a spawned process
    /// inherits. Returns an error if any required variable is missing,
    /// which is always a misconfiguration (the manager sets all four).
    pub fn from_env() -> Result<Self> {
        use sa_domain::config::env_vars;
        let team_name = std::env::var(env_vars::TEAM_NAME)
            .map_err(|_| Error::Team(format!("missing {} in environment", env_vars::TEAM_NAME)))?;
        let member_name = std::env::var(env_vars::MEMBER_NAME)
            .map_err(|_| Error::Team(format!("missing {} in environment", env_vars::MEMBER_NAME)))?;
        let agent_id_raw = std::env::var(env_vars::AGENT_ID)
            .map_err(|_| Error::Team(format!("missing {} in environment", env_vars::AGENT_ID)))?;
        let agent_id = Uuid::parse_str(&agent_id_raw)
            .map_err(|e| Error::Team(format!("invalid {}: {e}", env_vars::AGENT_ID)))?;
        let base_dir = std::env::var(env_vars::BASE_DIR)
            .map_err(|_| Error::Team(format!("missing {} in environment", env_vars::BASE_DIR)))?;

        Self::new(PathBuf::from(base_dir), team_name, member_name, agent_id)
    }

    pub fn new(
        base_dir: PathBuf,
        team_name: String,
        member_name: String,
        agent_id: Uuid,
    ) -> Result<Self> {
        let team_dir = base_dir.join("teams").join(&team_name);
        let tasks_dir = base_dir.join("tasks").join(&team_name);
        let mailbox = Mailbox::new(team_dir.join("mailbox"))?;
        let task_list = TaskList::new(&tasks_dir)?;
        Ok(Self {
            team_name,
            member_name,
            agent_id,
            mailbox,
            task_list,
            team_dir,
        })
    }

    pub fn load_config(&self) -> Result<TeamConfigFile> {
        let raw = std::fs::read_to_string(self.team_dir.join("config.json"))?;
        serde_json::from_str(&raw).map_err(Error::Json)
    }

    pub fn receive_messages(&self) -> Result<Vec<Message>> {
        self.mailbox.receive(&self.member_name)
    }

    pub fn watch_messages(&self) -> Result<tokio::sync::mpsc::UnboundedReceiver<Message>> {
        self.mailbox.watch(&self.member_name)
    }

    pub fn send_to_lead(&self, content: &str, kind: MessageKind) -> Result<()> {
        let message = Message::new(&self.member_name, kind, content);
        self.mailbox.send("lead", &message)
    }

    fn send_custom_to_lead(&self, content: &str, summary: &str) -> Result<()> {
        let message = Message::with_summary(&self.member_name, MessageKind::Custom, content, summary);
        self.mailbox.send("lead", &message)
    }

    /// Idle is a `custom` signal (§3 names no dedicated idle type): the
    /// `summary` carries the human-readable gloss, `content` the bare tag a
    /// lead-side matcher keys off.
    pub fn notify_idle(&self) -> Result<()> {
        self.send_custom_to_lead("idle", "Teammate is idle")
    }

    pub fn respond_to_shutdown(&self, approve: bool, reason: Option<&str>) -> Result<()> {
        let content = if approve {
            "Shutdown approved.".to_string()
        } else {
            format!("Shutdown rejected: {}", reason.unwrap_or("no reason given"))
        };
        self.send_to_lead(&content, MessageKind::ShutdownResponse)
    }

    pub fn claim_task(&self, id: &str) -> Result<Task> {
        self.task_list.claim(id, &self.member_name)
    }

    /// Task completion is also a `custom` signal; `content` is the task id
    /// so the lead can correlate it against the shared task list.
    pub fn complete_task(&self, id: &str) -> Result<Task> {
        let task = self.task_list.complete(id)?;
        self.send_custom_to_lead(id, "Task completed")?;
        Ok(task)
    }

    pub fn get_unblocked_tasks(&self) -> Result<Vec<Task>> {
        self.task_list.get_unblocked()
    }
}

/// Convenience predicate used to stop a teammate's own loop when the lead
/// asks it to shut down.
pub fn is_shutdown_request(message: &Message) -> bool {
    message.is_shutdown_request()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn teammate(base: &std::path::Path) -> Teammate {
        Teammate::new(
            base.to_path_buf(),
            "alpha".to_string(),
            "researcher-1".to_string(),
            Uuid::new_v4(),
        )
        .unwrap()
    }

    #[test]
    fn notify_idle_reaches_the_lead_mailbox() {
        let dir = tempfile::tempdir().unwrap();
        let mate = teammate(dir.path());
        mate.notify_idle().unwrap();

        let lead_mailbox = Mailbox::new(
            dir.path().join("teams").join("alpha").join("mailbox"),
        )
        .unwrap();
        let messages = lead_mailbox.receive("lead").unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind, MessageKind::Custom);
        assert_eq!(messages[0].content, "idle");
    }

    #[test]
    fn claim_and_complete_round_trip_through_the_shared_task_list() {
        let dir = tempfile::tempdir().unwrap();
        let mate = teammate(dir.path());
        let tasks_dir = dir.path().join("tasks").join("alpha");
        let task_list = TaskList::new(&tasks_dir).unwrap();
        task_list.create(Task::new("t1", "do the thing")).unwrap();

        mate.claim_task("t1").unwrap();
        let completed = mate.complete_task("t1").unwrap();
        assert_eq!(completed.status, crate::task_list::TaskStatus::Completed);
    }
}
