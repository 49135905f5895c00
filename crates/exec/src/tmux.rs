//! tmux session driver for the interactive coding CLI.
//!
//! Sessions are named `fm-<project>` and run the CLI in the project
//! directory. All control happens through the tmux binary; failures come
//! back as `{ok: false, msg}` rather than errors so the executor can log
//! and move on.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use foreman_core::{MuxDriver, MuxResult, SessionInfo};

const SESSION_PREFIX: &str = "fm-";
const STOP_GRACE_MS: u64 = 2_000;

pub struct TmuxDriver {
    projects_root: PathBuf,
    /// Command line launched inside each session.
    cli_command: String,
}

impl TmuxDriver {
    pub fn new(projects_root: impl Into<PathBuf>) -> Self {
        Self {
            projects_root: projects_root.into(),
            // The permissions escape is deliberate here and only here:
            // interactive mux sessions are operator-supervised, unlike
            // the non-interactive gateway calls.
            cli_command: "claude --dangerously-skip-permissions".to_string(),
        }
    }

    pub fn with_cli_command(mut self, command: impl Into<String>) -> Self {
        self.cli_command = command.into();
        self
    }

    fn session_name(project: &str) -> String {
        format!("{SESSION_PREFIX}{project}")
    }

    async fn tmux(args: &[&str]) -> MuxResult {
        match Command::new("tmux").args(args).output().await {
            Ok(out) if out.status.success() => {
                MuxResult::ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
            }
            Ok(out) => MuxResult::err(String::from_utf8_lossy(&out.stderr).trim().to_string()),
            Err(err) => MuxResult::err(format!("tmux not available: {err}")),
        }
    }

    async fn session_exists(name: &str) -> bool {
        Self::tmux(&["has-session", "-t", name]).await.ok
    }

    /// Drop the session marker the signal protocol keys off.
    async fn write_session_marker(&self, project: &str) {
        let dir = self.projects_root.join(project).join(".orchestrator");
        let marker = serde_json::json!({
            "sessionId": Uuid::new_v4().to_string(),
            "project": project,
            "startedAt": Utc::now().to_rfc3339(),
        });
        let result: anyhow::Result<()> = async {
            tokio::fs::create_dir_all(&dir).await?;
            tokio::fs::write(dir.join("session.json"), marker.to_string()).await?;
            Ok(())
        }
        .await;
        if let Err(err) = result {
            warn!(?err, project, "failed to write session marker");
        }
    }
}

#[async_trait]
impl MuxDriver for TmuxDriver {
    async fn start(&self, project: &str, prompt: Option<&str>) -> MuxResult {
        let name = Self::session_name(project);
        if Self::session_exists(&name).await {
            return MuxResult::err(format!("session {name} already running"));
        }
        let dir = self.projects_root.join(project);
        if !dir.is_dir() {
            return MuxResult::err(format!("no project directory at {}", dir.display()));
        }

        self.write_session_marker(project).await;

        let dir_str = dir.to_string_lossy().to_string();
        let result = Self::tmux(&[
            "new-session", "-d", "-s", &name, "-c", &dir_str, &self.cli_command,
        ])
        .await;
        if !result.ok {
            return result;
        }
        debug!(project, session = %name, "session started");

        if let Some(prompt) = prompt {
            // give the CLI a beat to come up before typing at it
            tokio::time::sleep(std::time::Duration::from_millis(1_500)).await;
            let sent = self.send_input(project, prompt).await;
            if !sent.ok {
                warn!(project, msg = %sent.msg, "initial prompt not delivered");
            }
        }
        MuxResult::ok(format!("started {name}"))
    }

    async fn stop(&self, project: &str) -> MuxResult {
        let name = Self::session_name(project);
        if !Self::session_exists(&name).await {
            return MuxResult::err(format!("no session {name}"));
        }
        // interrupt first; force-kill if the CLI does not exit in time
        let _ = Self::tmux(&["send-keys", "-t", &name, "C-c"]).await;
        tokio::time::sleep(std::time::Duration::from_millis(STOP_GRACE_MS)).await;
        if Self::session_exists(&name).await {
            let killed = Self::tmux(&["kill-session", "-t", &name]).await;
            if !killed.ok {
                return killed;
            }
        }
        MuxResult::ok(format!("stopped {name}"))
    }

    async fn restart(&self, project: &str, prompt: Option<&str>) -> MuxResult {
        let stopped = self.stop(project).await;
        if !stopped.ok && !stopped.msg.contains("no session") {
            return stopped;
        }
        self.start(project, prompt).await
    }

    async fn send_input(&self, project: &str, input: &str) -> MuxResult {
        let name = Self::session_name(project);
        if !Self::session_exists(&name).await {
            return MuxResult::err(format!("no session {name}"));
        }
        let typed = Self::tmux(&["send-keys", "-t", &name, "-l", input]).await;
        if !typed.ok {
            return typed;
        }
        Self::tmux(&["send-keys", "-t", &name, "Enter"]).await
    }

    async fn list_active(&self) -> Vec<SessionInfo> {
        let result = Self::tmux(&[
            "list-sessions",
            "-F",
            "#{session_name} #{session_created}",
        ])
        .await;
        if !result.ok {
            // no server running ⇒ no sessions
            return vec![];
        }
        result
            .msg
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let name = parts.next()?;
                let project = name.strip_prefix(SESSION_PREFIX)?;
                let created: i64 = parts.next()?.parse().ok()?;
                let started_at: DateTime<Utc> =
                    Utc.timestamp_opt(created, 0).single().unwrap_or_else(Utc::now);
                Some(SessionInfo {
                    name: name.to_string(),
                    project: project.to_string(),
                    started_at,
                })
            })
            .collect()
    }

    async fn capture_pane(&self, name: &str, max_bytes: usize) -> Option<String> {
        if !Self::session_exists(name).await {
            return None;
        }
        let result = Self::tmux(&["capture-pane", "-p", "-t", name]).await;
        if !result.ok {
            return None;
        }
        let text = result.msg;
        if text.len() <= max_bytes {
            return Some(text);
        }
        let mut start = text.len() - max_bytes;
        while start < text.len() && !text.is_char_boundary(start) {
            start += 1;
        }
        Some(text[start..].to_string())
    }
}
