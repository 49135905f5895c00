//! Message routing: kill switch, `ai` sub-commands, deterministic action
//! commands, then the natural-language fallback.
//!
//! Deterministic commands never touch the LLM; the NL path goes through
//! the gateway with a read-only tool allowlist and may create reminders
//! via a trailing `REMINDER_JSON:` sentinel.

use std::sync::{Arc, RwLock};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use foreman_brain::{ContextAssembler, ThinkEngine};
use foreman_config::SessionsConfig;
use foreman_core::{MuxDriver, ProjectScanner, UserPriorities};
use foreman_llm::{CallOptions, SubprocessGateway};
use foreman_notify::{NotificationPipeline, truncate_sms};
use foreman_state::{AutonomyState, ConversationRole, ConversationStore, ReminderStore, StateStore};

use crate::matcher::match_project;

/// Read-only tool allowlist granted to the natural-language path.
const READ_ONLY_TOOLS: &[&str] = &[
    "Read", "Glob", "Grep", "git-log", "git-show", "git-diff", "ls", "tail",
];

const CONTEXT_TTL_MINUTES: i64 = 30;
const NL_CONTEXT_CHARS: usize = 3_000;
const NL_HISTORY_TURNS: usize = 10;
const REMINDER_SENTINEL: &str = "REMINDER_JSON:";

/// What the current conversational context refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    Command,
    NeedsInput,
    Completed,
    Error,
}

/// Single-slot conversational context: the project the operator and the
/// daemon are currently "talking about". Written by handlers and by
/// notified events; expires after 30 minutes of silence.
#[derive(Debug, Clone)]
pub struct ConvContext {
    pub project: String,
    pub kind: ContextKind,
    pub timestamp: DateTime<Utc>,
}

pub struct CommandRouter {
    think: Arc<ThinkEngine>,
    gateway: Arc<SubprocessGateway>,
    assembler: Arc<ContextAssembler>,
    mux: Arc<dyn MuxDriver>,
    scanner: Arc<dyn ProjectScanner>,
    autonomy: Arc<AutonomyState>,
    store: Arc<StateStore>,
    conversation: Arc<ConversationStore>,
    reminders: Arc<ReminderStore>,
    pipeline: Arc<NotificationPipeline>,
    priorities: Arc<RwLock<UserPriorities>>,
    sessions: SessionsConfig,
    model: String,
    context: Mutex<Option<ConvContext>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReminderPayload {
    text: String,
    fire_at: String,
}

impl CommandRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        think: Arc<ThinkEngine>,
        gateway: Arc<SubprocessGateway>,
        assembler: Arc<ContextAssembler>,
        mux: Arc<dyn MuxDriver>,
        scanner: Arc<dyn ProjectScanner>,
        autonomy: Arc<AutonomyState>,
        store: Arc<StateStore>,
        conversation: Arc<ConversationStore>,
        reminders: Arc<ReminderStore>,
        pipeline: Arc<NotificationPipeline>,
        priorities: Arc<RwLock<UserPriorities>>,
        sessions: SessionsConfig,
        model: String,
    ) -> Self {
        Self {
            think,
            gateway,
            assembler,
            mux,
            scanner,
            autonomy,
            store,
            conversation,
            reminders,
            pipeline,
            priorities,
            sessions,
            model,
            context: Mutex::new(None),
        }
    }

    /// Record an event (signal file, executed command) into the context
    /// slot so bare confirmations can act on it.
    pub async fn note_event(&self, project: &str, kind: ContextKind) {
        *self.context.lock().await = Some(ConvContext {
            project: project.to_string(),
            kind,
            timestamp: Utc::now(),
        });
    }

    pub async fn current_context(&self) -> Option<ConvContext> {
        self.current_context_at(Utc::now()).await
    }

    pub async fn current_context_at(&self, now: DateTime<Utc>) -> Option<ConvContext> {
        let slot = self.context.lock().await;
        slot.as_ref()
            .filter(|ctx| now - ctx.timestamp <= Duration::minutes(CONTEXT_TTL_MINUTES))
            .cloned()
    }

    /// Route one operator message and produce the SMS reply.
    pub async fn handle_message(&self, text: &str) -> String {
        self.handle_message_at(text, Utc::now()).await
    }

    pub async fn handle_message_at(&self, text: &str, now: DateTime<Utc>) -> String {
        let trimmed = text.trim();
        let lower = trimmed.to_lowercase();
        info!(message = %trimmed, "operator message");

        // 1. kill switch — always honored
        match lower.as_str() {
            "ai off" => {
                self.think.set_enabled(false);
                return "AI disabled. Deterministic commands still work; say 'ai on' to re-enable."
                    .to_string();
            }
            "ai on" => {
                self.think.set_enabled(true);
                return "AI enabled.".to_string();
            }
            _ => {}
        }

        // 2. ai sub-commands
        if let Some(rest) = lower.strip_prefix("ai ") {
            return self.handle_ai_command(rest.trim()).await;
        }

        // 3. deterministic action commands
        if let Some(reply) = self.handle_deterministic(trimmed, &lower, now).await {
            return reply;
        }

        // 4/5. natural language or the off hint
        if self.think.is_enabled() {
            self.handle_natural_language(trimmed).await
        } else {
            "AI is off — deterministic commands only (try 'help'), or say 'ai on'.".to_string()
        }
    }

    // ── ai sub-commands ────────────────────────────────────────────────────

    async fn handle_ai_command(&self, command: &str) -> String {
        match command {
            "status" => {
                let last = self
                    .think
                    .last_think_at()
                    .map(|t| format!("{}", t.format("%Y-%m-%d %H:%M UTC")))
                    .unwrap_or_else(|| "never".to_string());
                format!(
                    "AI: {} | level: {} | last think: {} | llm calls active: {}, queued: {}",
                    if self.think.is_enabled() { "on" } else { "off" },
                    self.autonomy.current(),
                    last,
                    self.gateway.active_calls(),
                    self.gateway.pending_calls(),
                )
            }
            "think" => match self.think.think().await {
                Some(decision) => format!(
                    "Thought for {}ms: {} ({} recommendations)",
                    decision.duration_ms,
                    decision.summary,
                    decision.recommendations.len()
                ),
                None => "Think skipped (disabled, already thinking, or low memory).".to_string(),
            },
            "explain" => self.explain_last_decision().await,
            "help" => [
                "ai on|off - enable/disable the brain",
                "ai status - engine state",
                "ai think - run a think cycle now",
                "ai explain - last decision in detail",
                "ai level [observe|cautious|moderate|full] - show or set autonomy",
            ]
            .join("\n"),
            "level" => format!("Autonomy level: {}", self.autonomy.current()),
            other => {
                if let Some(raw) = other.strip_prefix("level ") {
                    return match self.autonomy.set(raw.trim()).await {
                        Ok((old, new)) if old != new => {
                            format!("Autonomy level: {old} -> {new}")
                        }
                        Ok((_, new)) => format!("Autonomy level already {new}"),
                        Err(err) => format!("Error: {err}"),
                    };
                }
                "Unknown ai command. Try 'ai help'.".to_string()
            }
        }
    }

    async fn explain_last_decision(&self) -> String {
        let Some(decision) = self
            .store
            .read(|doc| doc.decision_history.last().cloned())
            .await
        else {
            return "No decisions yet.".to_string();
        };
        let mut lines = vec![format!(
            "[{}] {} ({}ms, prompt {} chars)",
            decision.timestamp.format("%m-%d %H:%M"),
            decision.summary,
            decision.duration_ms,
            decision.prompt_length
        )];
        if let Some(ref error) = decision.error {
            lines.push(format!("Error: {error}"));
        }
        for er in &decision.evaluated {
            let verdict = if er.verdict.validated {
                if er.verdict.observe_only { "observe-only" } else { "valid" }
            } else {
                er.verdict.rejected.as_deref().unwrap_or("rejected")
            };
            lines.push(format!(
                "- {} {} ({}): {}",
                er.rec.action(),
                er.rec.project,
                verdict,
                er.rec.reason
            ));
        }
        truncate_sms(&lines.join("\n"))
    }

    // ── deterministic commands ─────────────────────────────────────────────

    async fn handle_deterministic(
        &self,
        raw: &str,
        lower: &str,
        now: DateTime<Utc>,
    ) -> Option<String> {
        match lower {
            "help" | "?" => Some(
                [
                    "start|stop|restart <project>",
                    "sessions | list - active sessions",
                    "startall | stopall",
                    "status [project]",
                    "priority [focus|block|skip <project> | note <text> | clear]",
                    "reply <project>: <message>",
                    "go|continue|yes|ok - confirm current context",
                    "pause|unpause - pause the brain",
                    "shh|wake, quiet on|off - mute non-urgent SMS",
                    "ai ... - brain controls (see 'ai help')",
                ]
                .join("\n"),
            ),
            "sessions" | "list" => Some(self.list_sessions(now).await),
            "startall" => Some(self.start_all().await),
            "stopall" => Some(self.stop_all().await),
            "status" => Some(self.fleet_status().await),
            "priority" => Some(self.show_priorities()),
            "pause" => {
                self.think.set_enabled(false);
                Some("Brain paused.".to_string())
            }
            "unpause" => {
                self.think.set_enabled(true);
                Some("Brain resumed.".to_string())
            }
            "shh" | "quiet on" => {
                self.pipeline.set_force_quiet(true);
                Some("Quiet mode on — only urgent messages will come through.".to_string())
            }
            "wake" | "quiet off" => {
                self.pipeline.set_force_quiet(false);
                Some("Quiet mode off.".to_string())
            }
            "go" | "continue" | "yes" | "ok" => Some(self.confirm_context(now).await),
            "stop" => {
                // bare stop acts on the context slot
                let Some(ctx) = self.current_context_at(now).await else {
                    return Some("Stop what? No recent context — try 'stop <project>'.".to_string());
                };
                Some(self.stop_project(&ctx.project, now).await)
            }
            _ => {
                if let Some(arg) = strip_command(raw, "start ") {
                    return Some(self.start_project(&arg, None, now).await);
                }
                if let Some(arg) = strip_command(raw, "stop ") {
                    return Some(match self.resolve_or_complain(&arg).await {
                        Ok(name) => self.stop_project(&name, now).await,
                        Err(reply) => reply,
                    });
                }
                if let Some(arg) = strip_command(raw, "restart ") {
                    return Some(self.restart_project(&arg, now).await);
                }
                if let Some(arg) = strip_command(raw, "status ") {
                    return Some(self.project_status(&arg, now).await);
                }
                if let Some(arg) = strip_command(raw, "priority ") {
                    return Some(self.set_priority(&arg).await);
                }
                if let Some(rest) = strip_command(raw, "reply ") {
                    return Some(self.reply_to_session(&rest, now).await);
                }
                None
            }
        }
    }

    async fn resolve(&self, input: &str) -> Option<String> {
        let projects = self.scanner.scan().await.unwrap_or_default();
        match_project(input, projects.iter().map(|p| p.name.as_str()))
    }

    async fn resolve_or_complain(&self, input: &str) -> Result<String, String> {
        self.resolve(input)
            .await
            .ok_or_else(|| format!("No project matching '{input}'."))
    }

    async fn start_project(&self, input: &str, prompt: Option<&str>, now: DateTime<Utc>) -> String {
        let name = match self.resolve_or_complain(input).await {
            Ok(name) => name,
            Err(reply) => return reply,
        };
        let result = self.mux.start(&name, prompt).await;
        self.set_context(&name, ContextKind::Command, now).await;
        if result.ok {
            format!("Started {name}.")
        } else {
            format!("Could not start {name}: {}", result.msg)
        }
    }

    async fn stop_project(&self, name: &str, now: DateTime<Utc>) -> String {
        let result = self.mux.stop(name).await;
        self.set_context(name, ContextKind::Command, now).await;
        if result.ok {
            format!("Stopped {name}.")
        } else {
            format!("Could not stop {name}: {}", result.msg)
        }
    }

    async fn restart_project(&self, input: &str, now: DateTime<Utc>) -> String {
        let name = match self.resolve_or_complain(input).await {
            Ok(name) => name,
            Err(reply) => return reply,
        };
        let result = self.mux.restart(&name, None).await;
        self.set_context(&name, ContextKind::Command, now).await;
        if result.ok {
            format!("Restarted {name}.")
        } else {
            format!("Could not restart {name}: {}", result.msg)
        }
    }

    async fn list_sessions(&self, now: DateTime<Utc>) -> String {
        let sessions = self.mux.list_active().await;
        if sessions.is_empty() {
            return "No active sessions.".to_string();
        }
        let mut lines = vec![format!("{} active:", sessions.len())];
        for session in sessions {
            let minutes = (now - session.started_at).num_minutes();
            lines.push(format!("- {} ({minutes}m)", session.project));
        }
        lines.join("\n")
    }

    async fn start_all(&self) -> String {
        let projects = self.scanner.scan().await.unwrap_or_default();
        let active: Vec<String> = self
            .mux
            .list_active()
            .await
            .into_iter()
            .map(|s| s.project)
            .collect();
        let mut started = vec![];
        let mut slots = self.sessions.max_concurrent.saturating_sub(active.len());
        for project in projects {
            if slots == 0 {
                break;
            }
            if active.contains(&project.name) {
                continue;
            }
            let result = self.mux.start(&project.name, None).await;
            if result.ok {
                started.push(project.name);
                slots -= 1;
            }
        }
        if started.is_empty() {
            "Nothing to start (all running or at capacity).".to_string()
        } else {
            format!("Started: {}", started.join(", "))
        }
    }

    async fn stop_all(&self) -> String {
        let sessions = self.mux.list_active().await;
        if sessions.is_empty() {
            return "No active sessions.".to_string();
        }
        let mut stopped = vec![];
        for session in sessions {
            let result = self.mux.stop(&session.project).await;
            if result.ok {
                stopped.push(session.project);
            }
        }
        format!("Stopped: {}", stopped.join(", "))
    }

    async fn fleet_status(&self) -> String {
        let projects = self.scanner.scan().await.unwrap_or_default();
        let sessions = self.mux.list_active().await;
        let active: Vec<&str> = sessions.iter().map(|s| s.project.as_str()).collect();
        let attention: Vec<&str> = projects
            .iter()
            .filter(|p| p.needs_attention)
            .map(|p| p.name.as_str())
            .collect();
        let mut lines = vec![format!(
            "{} projects, {} sessions active, level {}",
            projects.len(),
            sessions.len(),
            self.autonomy.current()
        )];
        if !active.is_empty() {
            lines.push(format!("Running: {}", active.join(", ")));
        }
        if !attention.is_empty() {
            lines.push(format!("Needs attention: {}", attention.join(", ")));
        }
        truncate_sms(&lines.join("\n"))
    }

    async fn project_status(&self, input: &str, now: DateTime<Utc>) -> String {
        let name = match self.resolve_or_complain(input).await {
            Ok(name) => name,
            Err(reply) => return reply,
        };
        let projects = self.scanner.scan().await.unwrap_or_default();
        let Some(project) = projects.iter().find(|p| p.name == name) else {
            return format!("No project matching '{input}'.");
        };
        let running = self
            .mux
            .list_active()
            .await
            .iter()
            .any(|s| s.project == name);
        self.set_context(&name, ContextKind::Command, now).await;

        let mut lines = vec![format!(
            "{}: {}{}",
            project.name,
            project.phase.as_deref().unwrap_or("unknown phase"),
            if running { " [session active]" } else { "" }
        )];
        if let Some(ref progress) = project.progress {
            lines.push(format!("Progress: {progress}"));
        }
        if !project.blockers.is_empty() {
            lines.push(format!("Blockers: {}", project.blockers.join("; ")));
        }
        if let Some(ref note) = project.note {
            lines.push(format!("Note: {note}"));
        }
        truncate_sms(&lines.join("\n"))
    }

    fn show_priorities(&self) -> String {
        let p = self.priorities.read().expect("priorities poisoned").clone();
        if p.focus.is_empty() && p.block.is_empty() && p.skip.is_empty() && p.notes.is_none() {
            return "No priorities set. Try 'priority focus <project>'.".to_string();
        }
        let mut lines = vec![];
        if !p.focus.is_empty() {
            lines.push(format!("Focus: {}", p.focus.join(", ")));
        }
        if !p.block.is_empty() {
            lines.push(format!("Block: {}", p.block.join(", ")));
        }
        if !p.skip.is_empty() {
            lines.push(format!("Skip: {}", p.skip.join(", ")));
        }
        if let Some(notes) = p.notes {
            lines.push(format!("Notes: {notes}"));
        }
        lines.join("\n")
    }

    async fn set_priority(&self, args: &str) -> String {
        let mut parts = args.splitn(2, ' ');
        let verb = parts.next().unwrap_or_default().to_lowercase();
        let rest = parts.next().unwrap_or_default().trim().to_string();

        if verb == "clear" {
            *self.priorities.write().expect("priorities poisoned") = UserPriorities::default();
            return "Priorities cleared.".to_string();
        }
        if verb == "note" {
            if rest.is_empty() {
                return "Usage: priority note <text>".to_string();
            }
            self.priorities.write().expect("priorities poisoned").notes = Some(rest.clone());
            return format!("Noted: {rest}");
        }

        let Some(name) = self.resolve(&rest).await else {
            return format!("No project matching '{rest}'.");
        };
        let mut priorities = self.priorities.write().expect("priorities poisoned");
        match verb.as_str() {
            "focus" => {
                if !priorities.focus.contains(&name) {
                    priorities.focus.push(name.clone());
                }
                format!("Focusing on {name}.")
            }
            "block" => {
                if !priorities.block.contains(&name) {
                    priorities.block.push(name.clone());
                }
                format!("Blocking {name}.")
            }
            "skip" => {
                if !priorities.skip.contains(&name) {
                    priorities.skip.push(name.clone());
                }
                format!("Skipping {name}.")
            }
            _ => "Usage: priority [focus|block|skip <project> | note <text> | clear]".to_string(),
        }
    }

    async fn reply_to_session(&self, rest: &str, now: DateTime<Utc>) -> String {
        let Some((project_raw, message)) = rest.split_once(':') else {
            return "Usage: reply <project>: <message>".to_string();
        };
        let name = match self.resolve_or_complain(project_raw.trim()).await {
            Ok(name) => name,
            Err(reply) => return reply,
        };
        let message = message.trim();
        if message.is_empty() {
            return "Usage: reply <project>: <message>".to_string();
        }
        let result = self.mux.send_input(&name, message).await;
        self.set_context(&name, ContextKind::Command, now).await;
        if result.ok {
            format!("Sent to {name}.")
        } else {
            format!("Could not reach {name}: {}", result.msg)
        }
    }

    /// Bare `go`/`continue`/`yes`/`ok`: act on the context slot.
    async fn confirm_context(&self, now: DateTime<Utc>) -> String {
        let Some(ctx) = self.current_context_at(now).await else {
            return "Nothing to confirm — no recent context.".to_string();
        };
        match ctx.kind {
            ContextKind::NeedsInput => {
                let result = self.mux.send_input(&ctx.project, "yes, proceed").await;
                if result.ok {
                    format!("Told {} to proceed.", ctx.project)
                } else {
                    format!("Could not reach {}: {}", ctx.project, result.msg)
                }
            }
            ContextKind::Error => {
                let result = self.mux.restart(&ctx.project, None).await;
                if result.ok {
                    format!("Restarted {} after the error.", ctx.project)
                } else {
                    format!("Could not restart {}: {}", ctx.project, result.msg)
                }
            }
            ContextKind::Completed | ContextKind::Command => {
                let result = self.mux.start(&ctx.project, None).await;
                if result.ok {
                    format!("Started {}.", ctx.project)
                } else {
                    format!("Could not start {}: {}", ctx.project, result.msg)
                }
            }
        }
    }

    async fn set_context(&self, project: &str, kind: ContextKind, now: DateTime<Utc>) {
        *self.context.lock().await = Some(ConvContext {
            project: project.to_string(),
            kind,
            timestamp: now,
        });
    }

    // ── natural language ───────────────────────────────────────────────────

    async fn handle_natural_language(&self, text: &str) -> String {
        let lower = text.to_lowercase();

        // reminder intents stay deterministic even on the NL path
        if lower == "reminders" || lower.contains("list reminders") {
            return self.list_reminders().await;
        }
        if let Some(query) = lower
            .strip_prefix("cancel reminders")
            .or_else(|| lower.strip_prefix("cancel reminder"))
        {
            let cancelled = self.reminders.cancel_by_text(query.trim()).await;
            return match cancelled {
                0 => "No matching pending reminders.".to_string(),
                n => format!("Cancelled {n} reminder(s)."),
            };
        }

        let context = {
            let full = self.assembler.assemble().await;
            let mut cut = full.len().min(NL_CONTEXT_CHARS);
            while cut > 0 && !full.is_char_boundary(cut) {
                cut -= 1;
            }
            full[..cut].to_string()
        };
        let history = self
            .conversation
            .recent(NL_HISTORY_TURNS)
            .await
            .iter()
            .map(|entry| {
                let who = match entry.role {
                    ConversationRole::User => "operator",
                    ConversationRole::Assistant => "you",
                };
                format!("{who}: {}", entry.text)
            })
            .collect::<Vec<_>>()
            .join("\n");
        let last_summary = self
            .store
            .read(|doc| doc.decision_history.last().map(|d| d.summary.clone()))
            .await
            .unwrap_or_else(|| "none yet".to_string());
        let sessions: Vec<String> = self
            .mux
            .list_active()
            .await
            .into_iter()
            .map(|s| s.project)
            .collect();

        let prompt = format!(
            "You are Foreman, a supervisor daemon texting with your operator. Answer briefly \
             in plain text (no markdown), under 1200 characters.\n\
             Autonomy level: {level}. Active sessions: {sessions}.\n\
             Last decision: {last_summary}\n\n\
             FLEET CONTEXT (truncated):\n{context}\n\n\
             RECENT CONVERSATION:\n{history}\n\n\
             If the operator asks to be reminded of something, end your reply with one line:\n\
             {sentinel}{{\"text\":\"...\",\"fireAt\":\"<ISO-8601 UTC>\"}}\n\n\
             Operator: {text}",
            level = self.autonomy.current(),
            sessions = if sessions.is_empty() { "none".to_string() } else { sessions.join(", ") },
            sentinel = REMINDER_SENTINEL,
        );

        let opts = CallOptions {
            model: self.model.clone(),
            max_turns: 8,
            timeout: StdDuration::from_secs(120),
            allowed_tools: READ_ONLY_TOOLS.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        };

        let raw = match self.gateway.call_gated(&prompt, &opts).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!(%err, "natural-language call failed");
                return format!("Sorry, I couldn't think about that: {}", err.kind());
            }
        };

        let mut reply = strip_markdown(&raw);
        if let Some((body, payload)) = extract_reminder(&reply) {
            reply = body;
            match payload.fire_at.parse::<DateTime<Utc>>() {
                Ok(fire_at) => {
                    self.reminders
                        .set_reminder(&payload.text, fire_at, Some(text))
                        .await;
                    reply.push_str(&format!(
                        "\n(reminder set for {})",
                        fire_at.format("%Y-%m-%d %H:%M UTC")
                    ));
                }
                Err(err) => {
                    warn!(%err, fire_at = %payload.fire_at, "unparseable reminder time");
                }
            }
        }
        let reply = truncate_sms(reply.trim());

        self.conversation.push(ConversationRole::User, text).await;
        self.conversation.push(ConversationRole::Assistant, &reply).await;
        reply
    }

    async fn list_reminders(&self) -> String {
        let pending = self.reminders.list_pending().await;
        if pending.is_empty() {
            return "No pending reminders.".to_string();
        }
        let mut lines = vec![format!("{} pending:", pending.len())];
        for reminder in pending {
            lines.push(format!(
                "- {} at {}",
                reminder.text,
                reminder.fire_at.format("%Y-%m-%d %H:%M UTC")
            ));
        }
        lines.join("\n")
    }
}

fn strip_command(raw: &str, prefix: &str) -> Option<String> {
    let lower = raw.to_lowercase();
    if !lower.starts_with(prefix) {
        return None;
    }
    let arg = raw[prefix.len()..].trim();
    if arg.is_empty() {
        return None;
    }
    Some(arg.to_string())
}

/// Strip the markdown the model tends to emit despite instructions.
fn strip_markdown(text: &str) -> String {
    let mut out = text.replace("**", "").replace("__", "").replace('`', "");
    out = out
        .lines()
        .map(|line| line.trim_start_matches('#').trim_start())
        .collect::<Vec<_>>()
        .join("\n");
    out.trim().to_string()
}

/// Split off a trailing `REMINDER_JSON:{...}` sentinel line.
fn extract_reminder(reply: &str) -> Option<(String, ReminderPayload)> {
    let idx = reply.rfind(REMINDER_SENTINEL)?;
    let json = reply[idx + REMINDER_SENTINEL.len()..].trim();
    let payload: ReminderPayload = serde_json::from_str(json).ok()?;
    let body = reply[..idx].trim_end().to_string();
    Some((body, payload))
}
