/// Shared error type used across all SerialAgent crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("SerialMemory: {0}")]
    SerialMemory(String),

    #[error("skill not found: {0}")]
    SkillNotFound(String),

    #[error("config: {0}")]
    Config(String),

    #[error("auth: {0}")]
    Auth(String),

    /// Protocol errors on the external hook channel: malformed JSON, missing
    /// discriminator, or an unrecognized decision/event-name value.
    #[error("hook protocol: {0}")]
    Hook(String),

    /// Shared-task-list errors: duplicate id, lock contention, claim on an
    /// already-claimed or blocked task, completion of a non-existent task.
    #[error("task list: {0}")]
    TaskList(String),

    /// Mailbox errors: empty recipient, unreadable message file.
    #[error("mailbox: {0}")]
    Mailbox(String),

    /// Team-lifecycle errors: duplicate team/teammate, cleanup with active
    /// members, shutdown of an unknown or already-stopped member.
    #[error("team: {0}")]
    Team(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
