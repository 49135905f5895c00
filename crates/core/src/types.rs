//! Domain records shared across the supervisor crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

// ── autonomy ladder ───────────────────────────────────────────────────────────

/// Runtime privilege tier controlling which actions the executor may apply.
///
/// Levels only move by explicit operator command; the trust tracker may
/// *recommend* a promotion but never performs one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AutonomyLevel {
    #[default]
    Observe,
    Cautious,
    Moderate,
    Full,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown autonomy level '{0}' (expected observe|cautious|moderate|full)")]
pub struct ParseAutonomyLevelError(pub String);

impl FromStr for AutonomyLevel {
    type Err = ParseAutonomyLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "observe" => Ok(Self::Observe),
            "cautious" => Ok(Self::Cautious),
            "moderate" => Ok(Self::Moderate),
            "full" => Ok(Self::Full),
            other => Err(ParseAutonomyLevelError(other.to_string())),
        }
    }
}

impl fmt::Display for AutonomyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AutonomyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Observe => "observe",
            Self::Cautious => "cautious",
            Self::Moderate => "moderate",
            Self::Full => "full",
        }
    }

    /// The action matrix: which actions each level may execute.
    pub fn allows(&self, action: Action) -> bool {
        match self {
            Self::Observe => matches!(action, Action::Skip),
            Self::Cautious => matches!(action, Action::Start | Action::Notify | Action::Skip),
            Self::Moderate | Self::Full => true,
        }
    }
}

// ── recommendations ───────────────────────────────────────────────────────────

/// The bare action kind, used for matrix checks and cooldown keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Start,
    Stop,
    Restart,
    Notify,
    Skip,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Notify => "notify",
            Self::Skip => "skip",
        }
    }

    /// Past-tense form for operator-facing confirmations.
    pub fn past_tense(&self) -> &'static str {
        match self {
            Self::Start => "started",
            Self::Stop => "stopped",
            Self::Restart => "restarted",
            Self::Notify => "notified",
            Self::Skip => "skipped",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the model asked for, discriminated on the `action` field.
///
/// Each variant carries only the payload that action can use, so an
/// unknown action or a misplaced field fails at decode time instead of
/// deep inside the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ActionRequest {
    Start {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
    },
    Stop,
    Restart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
    },
    Notify {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Skip,
}

impl ActionRequest {
    pub fn kind(&self) -> Action {
        match self {
            Self::Start { .. } => Action::Start,
            Self::Stop => Action::Stop,
            Self::Restart { .. } => Action::Restart,
            Self::Notify { .. } => Action::Notify,
            Self::Skip => Action::Skip,
        }
    }

    /// Session prompt for start/restart requests.
    pub fn prompt(&self) -> Option<&str> {
        match self {
            Self::Start { prompt } | Self::Restart { prompt } => prompt.as_deref(),
            _ => None,
        }
    }

    /// Operator message for notify requests.
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Notify { message } => message.as_deref(),
            _ => None,
        }
    }
}

/// One model recommendation, straight out of constrained decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub project: String,
    #[serde(flatten)]
    pub request: ActionRequest,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_tier: Option<u8>,
}

impl Recommendation {
    pub fn action(&self) -> Action {
        self.request.kind()
    }
}

/// Outcome of validation and gating for a single recommendation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub validated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected: Option<String>,
    pub observe_only: bool,
    pub autonomy_level: AutonomyLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_remaining_ms: Option<i64>,
}

/// A recommendation plus the verdict the executor attached to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatedRecommendation {
    #[serde(flatten)]
    pub rec: Recommendation,
    #[serde(flatten)]
    pub verdict: Verdict,
}

// ── decision / execution records ──────────────────────────────────────────────

/// One complete think-cycle outcome. Immutable once appended to the ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub timestamp: DateTime<Utc>,
    pub prompt_length: usize,
    /// First 500 chars of the raw model output, for `ai explain`.
    pub response_raw_prefix: String,
    pub recommendations: Vec<Recommendation>,
    pub summary: String,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub evaluated: Vec<EvaluatedRecommendation>,
}

/// One applied (or autonomy-rejected) action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub timestamp: DateTime<Utc>,
    pub action: Action,
    pub project: String,
    pub ok: bool,
    pub message: String,
    pub autonomy_level: AutonomyLevel,
    pub state_version: u64,
}

// ── session evaluation ────────────────────────────────────────────────────────

/// Commit activity observed in a project directory since a timestamp.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitProgress {
    pub commit_count: u32,
    pub insertions: u32,
    pub deletions: u32,
    pub files_changed: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_commit_message: Option<String>,
    /// True when the project directory is not a git repository.
    #[serde(default)]
    pub no_git: bool,
}

/// Judge verdict on what the session should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvalOutcome {
    Continue,
    Retry,
    Escalate,
    Complete,
}

/// LLM-as-judge scoring of a finished session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvaluation {
    pub session_id: String,
    pub project_name: String,
    pub started_at: DateTime<Utc>,
    pub stopped_at: DateTime<Utc>,
    pub duration_minutes: i64,
    pub git_progress: GitProgress,
    /// 1..=5, anchored by the rubric in the judge prompt.
    pub score: u8,
    pub recommendation: EvalOutcome,
    #[serde(default)]
    pub accomplishments: Vec<String>,
    #[serde(default)]
    pub failures: Vec<String>,
    pub reasoning: String,
    pub evaluated_at: DateTime<Utc>,
}

// ── health ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    Http,
    Tcp,
    Process,
    Container,
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Http => "http",
            Self::Tcp => "tcp",
            Self::Process => "process",
            Self::Container => "container",
        };
        f.write_str(s)
    }
}

/// Latest probe outcome for one monitored service. In-memory only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResult {
    pub name: String,
    pub kind: ProbeKind,
    pub status: HealthStatus,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub consecutive_fails: u32,
    pub last_checked: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

// ── trust ─────────────────────────────────────────────────────────────────────

/// Accumulated per-level counters backing promotion recommendations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustRow {
    pub total_sessions: u64,
    pub total_evaluations: u64,
    pub sum_eval_scores: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_entered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_entered_at: Option<DateTime<Utc>>,
    /// Days accumulated at this level across previous visits.
    pub total_days: f64,
    /// Latch: a promotion recommendation was already sent for this stay.
    pub promotion_sent: bool,
}

impl TrustRow {
    pub fn avg_score(&self) -> f64 {
        if self.total_evaluations == 0 {
            0.0
        } else {
            self.sum_eval_scores / self.total_evaluations as f64
        }
    }

    /// Days at this level: current stay plus prior accumulated visits.
    pub fn days_at_level(&self, now: DateTime<Utc>) -> f64 {
        let current = self
            .last_entered_at
            .map(|t| (now - t).num_seconds().max(0) as f64 / 86_400.0)
            .unwrap_or(0.0);
        current + self.total_days
    }
}

// ── projects & sessions ───────────────────────────────────────────────────────

/// Structured view of one managed project, produced by the scanner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRecord {
    pub name: String,
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
    #[serde(default)]
    pub needs_attention: bool,
    #[serde(default)]
    pub blockers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
    /// Operator asked the supervisor to prioritise this project.
    #[serde(default)]
    pub focus: bool,
}

/// A live tmux-hosted coding session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub name: String,
    pub project: String,
    pub started_at: DateTime<Utc>,
}

/// Host resource snapshot fed into think preconditions and context.
/// Session counts live with the mux driver, not here.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSnapshot {
    pub free_memory_mb: u64,
    pub total_memory_mb: u64,
    pub load_average: f64,
}

/// Operator-declared priorities folded into the think prompt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPriorities {
    #[serde(default)]
    pub focus: Vec<String>,
    #[serde(default)]
    pub block: Vec<String>,
    #[serde(default)]
    pub skip: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

// ── signal protocol ───────────────────────────────────────────────────────────

/// Which of the three attention files a session wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    NeedsInput,
    Completed,
    Error,
}

impl SignalKind {
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::NeedsInput => "needs-input.json",
            Self::Completed => "completed.json",
            Self::Error => "error.json",
        }
    }
}

/// A signal file read from a project's `.orchestrator/` directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSignal {
    pub project: String,
    pub kind: SignalKind,
    #[serde(default)]
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

// ── transport messages ────────────────────────────────────────────────────────

/// One inbound operator SMS, identified monotonically for poll cursors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundSms {
    pub id: i64,
    pub text: String,
}

/// Result of a mux control-plane command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuxResult {
    pub ok: bool,
    pub msg: String,
}

impl MuxResult {
    pub fn ok(msg: impl Into<String>) -> Self {
        Self { ok: true, msg: msg.into() }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self { ok: false, msg: msg.into() }
    }
}

// ── tests ─────────────────────────────────────────────────────────────────────
