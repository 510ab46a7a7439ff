//! File-backed shared task list: one `<id>.json` per task, one adjacent
//! `<id>.lock` per task used for cross-process exclusion.
//!
//! The lock acquisition (`OpenOptions::create(true)` + `fs2::FileExt`) is
//! the same shape the teacher uses for its single-instance PID file in
//! `cli/pid.rs`, applied per task instead of once per process.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use sa_domain::{Error, Result};
use serde::{Deserialize, Serialize};

/// Lifecycle state of one shared task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub subject: String,
    pub description: String,
    pub status: TaskStatus,
    /// Advisory hint of who should work this task; unlike `claimed_by` this
    /// is not exclusive and carries no claim semantics.
    #[serde(default)]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub claimed_by: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            subject: String::new(),
            description: description.into(),
            status: TaskStatus::Pending,
            assigned_to: None,
            claimed_by: None,
            depends_on: Vec::new(),
            created_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_depends_on(mut self, ids: Vec<String>) -> Self {
        self.depends_on = ids;
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    pub fn with_assigned_to(mut self, assigned_to: impl Into<String>) -> Self {
        self.assigned_to = Some(assigned_to.into());
        self
    }

    pub fn with_created_by(mut self, created_by: impl Into<String>) -> Self {
        self.created_by = Some(created_by.into());
        self
    }
}

/// One directory of task files for a single team.
pub struct TaskList {
    dir: PathBuf,
}

impl TaskList {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn task_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn lock_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.lock"))
    }

    fn open_lock(&self, id: &str) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .write(true)
            .open(self.lock_path(id))
            .map_err(Error::Io)
    }

    fn read_task(&self, id: &str) -> Result<Task> {
        let raw = fs::read_to_string(self.task_path(id))
            .map_err(|e| Error::TaskList(format!("reading task {id}: {e}")))?;
        serde_json::from_str(&raw).map_err(Error::Json)
    }

    fn write_task(&self, task: &Task) -> Result<()> {
        let raw = serde_json::to_string_pretty(task)?;
        fs::write(self.task_path(&task.id), raw)?;
        Ok(())
    }

    /// Create a new task. Rejects duplicate ids.
    pub fn create(&self, task: Task) -> Result<()> {
        if self.task_path(&task.id).exists() {
            return Err(Error::TaskList(format!("task {} already exists", task.id)));
        }
        self.write_task(&task)
    }

    /// Claim a pending, unblocked task for `agent`. Exactly one concurrent
    /// claimer succeeds; the rest get a deterministic error because the
    /// file lock serializes the read-verify-write sequence.
    pub fn claim(&self, id: &str, agent: &str) -> Result<Task> {
        let lock = self.open_lock(id)?;
        lock.lock_exclusive()
            .map_err(|e| Error::TaskList(format!("locking task {id}: {e}")))?;

        let result = (|| {
            let mut task = self.read_task(id)?;
            if task.status != TaskStatus::Pending || task.claimed_by.is_some() {
                return Err(Error::TaskList(format!("task {id} already claimed")));
            }
            for dep in &task.depends_on {
                let dep_task = self.read_task(dep).map_err(|_| {
                    Error::TaskList(format!("task {id} depends on missing task {dep}"))
                })?;
                if dep_task.status != TaskStatus::Completed {
                    return Err(Error::TaskList(format!(
                        "task {id} blocked on incomplete dependency {dep}"
                    )));
                }
            }
            task.status = TaskStatus::InProgress;
            task.claimed_by = Some(agent.to_string());
            task.updated_at = Utc::now();
            self.write_task(&task)?;
            Ok(task)
        })();

        FileExt::unlock(&lock).ok();
        result
    }

    /// Mark a task completed. Idempotent guard: rejects an already-completed
    /// task rather than silently re-stamping it.
    pub fn complete(&self, id: &str) -> Result<Task> {
        let lock = self.open_lock(id)?;
        lock.lock_exclusive()
            .map_err(|e| Error::TaskList(format!("locking task {id}: {e}")))?;

        let result = (|| {
            let mut task = self.read_task(id)?;
            if task.status == TaskStatus::Completed {
                return Err(Error::TaskList(format!("task {id} is already completed")));
            }
            task.status = TaskStatus::Completed;
            task.updated_at = Utc::now();
            self.write_task(&task)?;
            Ok(task)
        })();

        FileExt::unlock(&lock).ok();
        result
    }

    /// All tasks, skipping lock files and unreadable entries, sorted by
    /// creation time ascending.
    pub fn list(&self) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Ok(raw) = fs::read_to_string(&path) {
                if let Ok(task) = serde_json::from_str::<Task>(&raw) {
                    tasks.push(task);
                }
            }
        }
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    /// Pending tasks whose every dependency is completed and which are not
    /// yet claimed.
    pub fn get_unblocked(&self) -> Result<Vec<Task>> {
        let all = self.list()?;
        let by_id: HashMap<&str, &Task> = all.iter().map(|t| (t.id.as_str(), t)).collect();
        Ok(all
            .iter()
            .filter(|t| {
                t.status == TaskStatus::Pending
                    && t.claimed_by.is_none()
                    && t.depends_on.iter().all(|dep| {
                        by_id
                            .get(dep.as_str())
                            .is_some_and(|d| d.status == TaskStatus::Completed)
                    })
            })
            .cloned()
            .collect())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list() -> (tempfile::TempDir, TaskList) {
        let dir = tempfile::tempdir().unwrap();
        let list = TaskList::new(dir.path()).unwrap();
        (dir, list)
    }

    #[test]
    fn create_rejects_duplicate_ids() {
        let (_dir, list) = list();
        list.create(Task::new("t1", "first")).unwrap();
        let err = list.create(Task::new("t1", "again")).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn claim_transitions_pending_to_in_progress() {
        let (_dir, list) = list();
        list.create(Task::new("t1", "first")).unwrap();
        let claimed = list.claim("t1", "agent-a").unwrap();
        assert_eq!(claimed.status, TaskStatus::InProgress);
        assert_eq!(claimed.claimed_by.as_deref(), Some("agent-a"));
    }

    #[test]
    fn second_claim_of_same_task_fails() {
        let (_dir, list) = list();
        list.create(Task::new("t1", "first")).unwrap();
        list.claim("t1", "agent-a").unwrap();
        let err = list.claim("t1", "agent-b").unwrap_err();
        assert!(err.to_string().contains("already claimed"));
    }

    #[test]
    fn claim_is_blocked_by_incomplete_dependency() {
        let (_dir, list) = list();
        list.create(Task::new("dep", "dependency")).unwrap();
        list.create(Task::new("t1", "first").with_depends_on(vec!["dep".into()]))
            .unwrap();
        let err = list.claim("t1", "agent-a").unwrap_err();
        assert!(err.to_string().contains("incomplete dependency"));
    }

    #[test]
    fn claim_succeeds_once_dependency_completes() {
        let (_dir, list) = list();
        list.create(Task::new("dep", "dependency")).unwrap();
        list.create(Task::new("t1", "first").with_depends_on(vec!["dep".into()]))
            .unwrap();
        list.claim("dep", "agent-a").unwrap();
        list.complete("dep").unwrap();
        let claimed = list.claim("t1", "agent-b").unwrap();
        assert_eq!(claimed.status, TaskStatus::InProgress);
    }

    #[test]
    fn complete_rejects_already_completed_task() {
        let (_dir, list) = list();
        list.create(Task::new("t1", "first")).unwrap();
        list.claim("t1", "agent-a").unwrap();
        list.complete("t1").unwrap();
        let err = list.complete("t1").unwrap_err();
        assert!(err.to_string().contains("already completed"));
    }

    #[test]
    fn get_unblocked_excludes_claimed_and_blocked_tasks() {
        let (_dir, list) = list();
        list.create(Task::new("dep", "dependency")).unwrap();
        list.create(Task::new("blocked", "waits").with_depends_on(vec!["dep".into()]))
            .unwrap();
        list.create(Task::new("ready", "go")).unwrap();
        list.create(Task::new("claimed", "taken")).unwrap();
        list.claim("claimed", "agent-a").unwrap();

        let unblocked: Vec<_> = list.get_unblocked().unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(unblocked, vec!["ready".to_string()]);
    }

    #[test]
    fn list_sorts_by_creation_time_and_skips_lock_files() {
        let (_dir, list) = list();
        list.create(Task::new("a", "first")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        list.create(Task::new("b", "second")).unwrap();
        list.claim("a", "agent-a").unwrap();

        let ids: Vec<_> = list.list().unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }
}
