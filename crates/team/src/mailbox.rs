//! Directory-per-recipient, file-per-message mailbox.
//!
//! Delivery via directory scan (`receive`) or live directory watch
//! (`watch`), the latter adapted from the teacher pack's
//! `notify`-crate-based file watcher: a debounce-free `RecommendedWatcher`
//! whose callback forwards raw events into a `tokio::mpsc` channel that a
//! spawned task turns into typed deliveries.

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use sa_domain::{Error, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Message,
    Broadcast,
    ShutdownRequest,
    ShutdownResponse,
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub from: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    pub kind: MessageKind,
    pub content: String,
    /// Short human-readable gloss of `content`, e.g. for a `custom` signal
    /// like a task-completed or idle notice where the body is a bare id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl Message {
    pub fn new(from: impl Into<String>, kind: MessageKind, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            from: from.into(),
            timestamp: Utc::now(),
            kind,
            content: content.into(),
            summary: None,
        }
    }

    pub fn with_summary(
        from: impl Into<String>,
        kind: MessageKind,
        content: impl Into<String>,
        summary: impl Into<String>,
    ) -> Self {
        let mut message = Self::new(from, kind, content);
        message.summary = Some(summary.into());
        message
    }

    pub fn is_shutdown_request(&self) -> bool {
        self.kind == MessageKind::ShutdownRequest
    }
}

/// Root directory holding one subdirectory per recipient.
pub struct Mailbox {
    base: PathBuf,
}

impl Mailbox {
    pub fn new(base: impl Into<PathBuf>) -> Result<Self> {
        let base = base.into();
        fs::create_dir_all(&base)?;
        Ok(Self { base })
    }

    fn recipient_dir(&self, recipient: &str) -> Result<PathBuf> {
        if recipient.is_empty() {
            return Err(Error::Mailbox("recipient must not be empty".into()));
        }
        let dir = self.base.join(recipient);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Write one message file under the recipient's directory. File names
    /// interleave a timestamp with the message id so concurrent senders to
    /// the same recipient never collide and `receive`'s lexical sort doubles
    /// as a timestamp sort.
    pub fn send(&self, recipient: &str, message: &Message) -> Result<()> {
        let dir = self.recipient_dir(recipient)?;
        let file_name = format!("{}-{}.json", message.timestamp.timestamp_nanos_opt().unwrap_or_default(), message.id);
        let raw = serde_json::to_string_pretty(message)?;
        fs::write(dir.join(file_name), raw)?;
        Ok(())
    }

    pub fn broadcast(&self, sender: &str, content: &str, recipients: &[String]) -> Result<()> {
        for recipient in recipients {
            let message = Message::new(sender, MessageKind::Broadcast, content);
            self.send(recipient, &message)?;
        }
        Ok(())
    }

    /// Every message currently present for `recipient`, sorted by timestamp,
    /// deleted after being read. A message file that fails to parse is
    /// skipped and left on disk rather than aborting the whole drain.
    pub fn receive(&self, recipient: &str) -> Result<Vec<Message>> {
        let dir = self.recipient_dir(recipient)?;
        let mut entries: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
            .collect();
        entries.sort();

        let mut messages = Vec::new();
        for path in entries {
            let Ok(raw) = fs::read_to_string(&path) else {
                continue;
            };
            match serde_json::from_str::<Message>(&raw) {
                Ok(message) => {
                    let _ = fs::remove_file(&path);
                    messages.push(message);
                }
                Err(_) => continue,
            }
        }
        messages.sort_by_key(|m| m.timestamp);
        Ok(messages)
    }

    /// Start watching `recipient`'s directory and stream each new message as
    /// it arrives. Messages already present at watch start are delivered on
    /// the first scan, before the watcher callback can fire.
    pub fn watch(&self, recipient: &str) -> Result<mpsc::UnboundedReceiver<Message>> {
        let dir = self.recipient_dir(recipient)?;
        let (tx, rx) = mpsc::unbounded_channel::<Message>();

        for message in self.receive(recipient)? {
            let _ = tx.send(message);
        }

        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<Event>();
        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = raw_tx.send(event);
                }
            },
            notify::Config::default(),
        )
        .map_err(|e| Error::Mailbox(format!("failed to create watcher: {e}")))?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| Error::Mailbox(format!("failed to watch {}: {e}", dir.display())))?;

        tokio::spawn(async move {
            // Keep the watcher alive for the life of the forwarding task.
            let _watcher = watcher;
            while let Some(event) = raw_rx.recv().await {
                if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    continue;
                }
                for path in event.paths {
                    if path.extension().and_then(|e| e.to_str()) != Some("json") {
                        continue;
                    }
                    let Ok(raw) = fs::read_to_string(&path) else {
                        continue;
                    };
                    if let Ok(message) = serde_json::from_str::<Message>(&raw) {
                        let _ = fs::remove_file(&path);
                        if tx.send(message).is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mailbox() -> (tempfile::TempDir, Mailbox) {
        let dir = tempfile::tempdir().unwrap();
        let mailbox = Mailbox::new(dir.path()).unwrap();
        (dir, mailbox)
    }

    #[test]
    fn send_to_empty_recipient_is_an_error() {
        let (_dir, mailbox) = mailbox();
        let message = Message::new("lead", MessageKind::Message, "hi");
        let err = mailbox.send("", &message).unwrap_err();
        assert!(err.to_string().contains("recipient"));
    }

    #[test]
    fn receive_returns_sorted_and_drains_files() {
        let (_dir, mailbox) = mailbox();
        let first = Message::new("lead", MessageKind::Message, "first");
        let mut second = Message::new("lead", MessageKind::Message, "second");
        second.timestamp = first.timestamp + chrono::Duration::seconds(1);
        mailbox.send("member-a", &second).unwrap();
        mailbox.send("member-a", &first).unwrap();

        let received = mailbox.receive("member-a").unwrap();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].content, "first");
        assert_eq!(received[1].content, "second");

        assert!(mailbox.receive("member-a").unwrap().is_empty());
    }

    #[test]
    fn broadcast_sends_one_copy_per_recipient() {
        let (_dir, mailbox) = mailbox();
        mailbox
            .broadcast("lead", "stand down", &["a".into(), "b".into()])
            .unwrap();
        assert_eq!(mailbox.receive("a").unwrap().len(), 1);
        assert_eq!(mailbox.receive("b").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn watch_delivers_preexisting_then_new_messages() {
        let (_dir, mailbox) = mailbox();
        mailbox
            .send("member-a", &Message::new("lead", MessageKind::Message, "already here"))
            .unwrap();

        let mut rx = mailbox.watch("member-a").unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(first.content, "already here");

        mailbox
            .send("member-a", &Message::new("lead", MessageKind::Message, "new one"))
            .unwrap();
        let second = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.content, "new one");
    }
}
