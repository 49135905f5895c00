//! The single durable state document and its bounded history rings.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, warn};

use foreman_core::{AutonomyLevel, Decision, ExecutionRecord, SessionEvaluation, TrustRow};

const DECISION_RING: usize = 50;
const EXECUTION_RING: usize = 100;
const EVALUATION_RING: usize = 100;

/// Most recent alert sent for a project, used to avoid re-alert spam.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertEntry {
    pub reason: String,
    pub ts: DateTime<Utc>,
}

/// The persisted daemon state. Round-trippable as a single record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StateDocument {
    pub last_row_id: u64,
    pub last_scan: Option<DateTime<Utc>>,
    pub last_digest: Option<DateTime<Utc>>,
    pub alert_history: HashMap<String, AlertEntry>,
    pub decision_history: Vec<Decision>,
    pub state_version: u64,
    pub execution_history: Vec<ExecutionRecord>,
    pub error_retry_counts: HashMap<String, u32>,
    pub runtime_autonomy_level: Option<AutonomyLevel>,
    pub evaluation_history: Vec<SessionEvaluation>,
    /// Keyed per-level trust counters (the tracker tables).
    pub trust_rows: HashMap<AutonomyLevel, TrustRow>,
}

impl StateDocument {
    pub fn push_decision(&mut self, decision: Decision) {
        push_capped(&mut self.decision_history, decision, DECISION_RING);
    }

    pub fn push_execution(&mut self, record: ExecutionRecord) {
        push_capped(&mut self.execution_history, record, EXECUTION_RING);
    }

    pub fn push_evaluation(&mut self, evaluation: SessionEvaluation) {
        push_capped(&mut self.evaluation_history, evaluation, EVALUATION_RING);
    }
}

fn push_capped<T>(ring: &mut Vec<T>, item: T, cap: usize) {
    ring.push(item);
    if ring.len() > cap {
        let overflow = ring.len() - cap;
        ring.drain(..overflow);
    }
}

/// Serialized access to the durable document. Every mutation bumps
/// `state_version` and persists atomically; readers always see a
/// consistent snapshot.
pub struct StateStore {
    path: PathBuf,
    doc: Mutex<StateDocument>,
}

impl StateStore {
    /// Open (or create) the store at `path`. A corrupt document is moved
    /// aside to `<path>.corrupt` and replaced with the default rather
    /// than taking the daemon down.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let doc = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(doc) => doc,
                Err(err) => {
                    let corrupt = path.with_extension("json.corrupt");
                    error!(?err, preserved = %corrupt.display(), "state document corrupt; starting fresh");
                    let _ = std::fs::rename(&path, &corrupt);
                    StateDocument::default()
                }
            },
            Err(_) => StateDocument::default(),
        };
        Self { path, doc: Mutex::new(doc) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read under the lock without mutating.
    pub async fn read<R>(&self, f: impl FnOnce(&StateDocument) -> R) -> R {
        let doc = self.doc.lock().await;
        f(&doc)
    }

    /// Full consistent copy of the document.
    pub async fn snapshot(&self) -> StateDocument {
        self.doc.lock().await.clone()
    }

    /// Apply a mutation, bump the version, and persist. A persistence
    /// failure is logged and swallowed: the in-memory document remains
    /// authoritative until the next successful write.
    pub async fn update<R>(&self, f: impl FnOnce(&mut StateDocument) -> R) -> R {
        let mut doc = self.doc.lock().await;
        let result = f(&mut doc);
        doc.state_version += 1;
        if let Err(err) = persist(&self.path, &doc).await {
            warn!(?err, path = %self.path.display(), "state persist failed; keeping in-memory state");
        }
        result
    }
}

/// Write-temp → fsync → rename so readers never observe a torn document.
async fn persist(path: &Path, doc: &StateDocument) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp_path = {
        let filename = path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| "state.json".to_string());
        path.with_file_name(format!("{filename}.tmp"))
    };

    let raw = serde_json::to_vec_pretty(doc)?;
    let write_result: anyhow::Result<()> = async {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .await?;
        file.write_all(&raw).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }
    .await;

    if let Err(err) = write_result {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(err);
    }

    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}
