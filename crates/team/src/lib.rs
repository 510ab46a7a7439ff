//! The team coordination layer: a single-active-team-per-process manager
//! over a shared task list (file-locked JSON, one file per task) and a
//! mailbox (one directory per recipient, one file per message), with a
//! cooperative shutdown protocol and hook-driven idle/completion gating.

pub mod mailbox;
pub mod manager;
pub mod task_list;
pub mod teammate;

pub use mailbox::{Mailbox, Message, MessageKind};
pub use manager::{MemberRecord, MemberState, TeamManager, TeamSnapshot};
pub use task_list::{Task, TaskList, TaskStatus};
pub use teammate::Teammate;
