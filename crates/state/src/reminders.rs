//! One-shot deferred reminders, created from the operator conversation.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reminder {
    pub id: String,
    pub text: String,
    pub fire_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub fired: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_message: Option<String>,
}

/// JSON-file backed reminder list. The `fired` flag enforces
/// fire-exactly-once; cancelled reminders are marked fired rather than
/// deleted so history survives.
pub struct ReminderStore {
    path: PathBuf,
    reminders: Mutex<Vec<Reminder>>,
}

impl ReminderStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let reminders = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self {
            path,
            reminders: Mutex::new(reminders),
        }
    }

    pub async fn set_reminder(
        &self,
        text: &str,
        fire_at: DateTime<Utc>,
        source_message: Option<&str>,
    ) -> String {
        let reminder = Reminder {
            id: Uuid::new_v4().to_string(),
            text: text.to_string(),
            fire_at,
            created_at: Utc::now(),
            fired: false,
            source_message: source_message.map(str::to_string),
        };
        let id = reminder.id.clone();
        let mut reminders = self.reminders.lock().await;
        reminders.push(reminder);
        self.persist(&reminders).await;
        id
    }

    /// Mark and return every pending reminder due at or before `now`.
    pub async fn check_and_fire(&self, now: DateTime<Utc>) -> Vec<Reminder> {
        let mut reminders = self.reminders.lock().await;
        let mut due = vec![];
        for reminder in reminders.iter_mut() {
            if !reminder.fired && reminder.fire_at <= now {
                reminder.fired = true;
                due.push(reminder.clone());
            }
        }
        if !due.is_empty() {
            self.persist(&reminders).await;
        }
        due
    }

    /// Pending reminders, soonest first.
    pub async fn list_pending(&self) -> Vec<Reminder> {
        let reminders = self.reminders.lock().await;
        let mut pending: Vec<Reminder> =
            reminders.iter().filter(|r| !r.fired).cloned().collect();
        pending.sort_by_key(|r| r.fire_at);
        pending
    }

    /// Fuzzy-cancel: mark fired every pending reminder whose text contains
    /// `query` (case-insensitive). Returns how many were cancelled.
    pub async fn cancel_by_text(&self, query: &str) -> usize {
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return 0;
        }
        let mut reminders = self.reminders.lock().await;
        let mut cancelled = 0;
        for reminder in reminders.iter_mut() {
            if !reminder.fired && reminder.text.to_lowercase().contains(&query) {
                reminder.fired = true;
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            self.persist(&reminders).await;
        }
        cancelled
    }

    async fn persist(&self, reminders: &[Reminder]) {
        if let Err(err) = write_reminders(&self.path, reminders).await {
            warn!(?err, "reminder persist failed; keeping in-memory list");
        }
    }
}

async fn write_reminders(path: &Path, reminders: &[Reminder]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    let raw = serde_json::to_vec_pretty(reminders)?;
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)
        .await?;
    file.write_all(&raw).await?;
    file.flush().await?;
    file.sync_all().await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
