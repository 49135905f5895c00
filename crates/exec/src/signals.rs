//! Signal-file protocol between mux sessions and the supervisor.
//!
//! A session asks for attention by writing one of three JSON files under
//! its project's `.orchestrator/` directory. The scanner reads them and
//! clears each by moving it into `.orchestrator/history/`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use foreman_core::{ProjectSignal, SignalKind};

const SIGNAL_KINDS: [SignalKind; 3] =
    [SignalKind::NeedsInput, SignalKind::Completed, SignalKind::Error];

#[derive(Debug, Deserialize)]
struct SignalFile {
    #[serde(default)]
    message: String,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

pub struct SignalScanner {
    projects_root: PathBuf,
}

impl SignalScanner {
    pub fn new(projects_root: impl Into<PathBuf>) -> Self {
        Self { projects_root: projects_root.into() }
    }

    /// Read and clear every pending signal across the fleet. Clearing
    /// moves the file into `history/` so a signal is delivered once.
    pub async fn scan(&self) -> Vec<ProjectSignal> {
        let mut signals = vec![];
        let Ok(mut entries) = tokio::fs::read_dir(&self.projects_root).await else {
            return signals;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(file_type) = entry.file_type().await else { continue };
            if !file_type.is_dir() {
                continue;
            }
            let project = entry.file_name().to_string_lossy().to_string();
            if project.starts_with('.') {
                continue;
            }
            for kind in SIGNAL_KINDS {
                if let Some(signal) = self.take_signal(&entry.path(), &project, kind).await {
                    signals.push(signal);
                }
            }
        }
        signals
    }

    async fn take_signal(
        &self,
        project_dir: &Path,
        project: &str,
        kind: SignalKind,
    ) -> Option<ProjectSignal> {
        let path = project_dir.join(".orchestrator").join(kind.file_name());
        let raw = tokio::fs::read_to_string(&path).await.ok()?;

        let parsed: SignalFile = match serde_json::from_str(&raw) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(?err, path = %path.display(), "malformed signal file");
                SignalFile { message: String::new(), timestamp: None }
            }
        };

        self.archive(&path).await;
        debug!(project, ?kind, "signal consumed");
        Some(ProjectSignal {
            project: project.to_string(),
            kind,
            message: parsed.message,
            timestamp: parsed.timestamp.unwrap_or_else(Utc::now),
        })
    }

    async fn archive(&self, path: &Path) {
        let Some(dir) = path.parent() else { return };
        let history = dir.join("history");
        let file_name = path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| "signal.json".to_string());
        let dest = history.join(format!("{}-{file_name}", Utc::now().timestamp_millis()));
        let result: anyhow::Result<()> = async {
            tokio::fs::create_dir_all(&history).await?;
            tokio::fs::rename(path, &dest).await?;
            Ok(())
        }
        .await;
        if let Err(err) = result {
            warn!(?err, path = %path.display(), "failed to archive signal; removing");
            let _ = tokio::fs::remove_file(path).await;
        }
    }
}
