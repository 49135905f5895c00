//! Capability traits behind which external collaborators are injected.
//!
//! The decision engine depends only on these traits; the concrete tmux,
//! SMS-gateway, scanner, and git implementations live in their own crates
//! and are wired in by the composition root.

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::types::{GitProgress, InboundSms, MuxResult, ProjectRecord, ResourceSnapshot, SessionInfo};

/// Read/send interface to the operator's phone.
///
/// `poll` returns messages strictly after `last_id`, ascending; the caller
/// owns the cursor. `send` accepts text of any length — the transport is
/// responsible for chunking.
#[async_trait]
pub trait SmsTransport: Send + Sync {
    async fn poll(&self, last_id: i64) -> Result<Vec<InboundSms>>;
    async fn send(&self, text: &str) -> Result<()>;
}

/// Control plane for named terminal-multiplexer sessions hosting the
/// external coding CLI.
#[async_trait]
pub trait MuxDriver: Send + Sync {
    async fn start(&self, project: &str, prompt: Option<&str>) -> MuxResult;
    async fn stop(&self, project: &str) -> MuxResult;
    async fn restart(&self, project: &str, prompt: Option<&str>) -> MuxResult;
    async fn send_input(&self, project: &str, input: &str) -> MuxResult;
    async fn list_active(&self) -> Vec<SessionInfo>;
    /// Last `max_bytes` of the session's pane, or `None` when the session
    /// does not exist.
    async fn capture_pane(&self, name: &str, max_bytes: usize) -> Option<String>;
}

/// Parses per-project status markdown into structured records.
#[async_trait]
pub trait ProjectScanner: Send + Sync {
    async fn scan(&self) -> Result<Vec<ProjectRecord>>;
}

/// Commit/diff introspection for session evaluation.
#[async_trait]
pub trait GitInspector: Send + Sync {
    async fn progress_since(&self, dir: &Path, since: DateTime<Utc>) -> GitProgress;
}

/// Host memory/load readings for think preconditions and context.
#[async_trait]
pub trait ResourceProbe: Send + Sync {
    async fn snapshot(&self) -> ResourceSnapshot;
}
