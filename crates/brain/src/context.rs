//! Prompt assembly — one compact, bounded snapshot of the whole fleet.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use foreman_core::{
    HealthResult, HealthStatus, MuxDriver, ProjectRecord, ProjectScanner, ResourceProbe,
    ResourceSnapshot, SessionInfo, UserPriorities,
};
use foreman_notify::QuietHours;
use foreman_state::StateStore;

const SECTION_SEPARATOR: &str = "\n\n---\n\n";
const TRUNCATION_MARKER: &str = "\n[Context truncated]";
const RECENT_DECISIONS: usize = 5;

/// Everything a think prompt is rendered from. Gathered once per cycle so
/// rendering stays pure and testable.
#[derive(Debug, Clone, Default)]
pub struct ContextInputs {
    pub projects: Vec<ProjectRecord>,
    pub sessions: Vec<SessionInfo>,
    pub resources: ResourceSnapshot,
    pub health: Vec<HealthResult>,
    /// `(timestamp, summary)` of the most recent decisions, newest last.
    pub recent_decisions: Vec<(DateTime<Utc>, String)>,
    pub priorities: UserPriorities,
    pub quiet_now: bool,
    pub now: DateTime<Utc>,
}

pub struct ContextAssembler {
    scanner: Arc<dyn ProjectScanner>,
    mux: Arc<dyn MuxDriver>,
    resources: Arc<dyn ResourceProbe>,
    store: Arc<StateStore>,
    health: Arc<RwLock<Vec<HealthResult>>>,
    priorities: Arc<RwLock<UserPriorities>>,
    quiet: QuietHours,
    max_prompt_length: usize,
}

impl ContextAssembler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scanner: Arc<dyn ProjectScanner>,
        mux: Arc<dyn MuxDriver>,
        resources: Arc<dyn ResourceProbe>,
        store: Arc<StateStore>,
        health: Arc<RwLock<Vec<HealthResult>>>,
        priorities: Arc<RwLock<UserPriorities>>,
        quiet: QuietHours,
        max_prompt_length: usize,
    ) -> Self {
        Self {
            scanner,
            mux,
            resources,
            store,
            health,
            priorities,
            quiet,
            max_prompt_length,
        }
    }

    pub async fn gather(&self) -> ContextInputs {
        let now = Utc::now();
        let priorities = self.priorities.read().expect("priorities poisoned").clone();
        let mut projects = self.scanner.scan().await.unwrap_or_default();
        for project in &mut projects {
            project.focus = priorities.focus.contains(&project.name);
        }
        let sessions = self.mux.list_active().await;
        let resources = self.resources.snapshot().await;
        let recent_decisions = self
            .store
            .read(|doc| {
                doc.decision_history
                    .iter()
                    .rev()
                    .take(RECENT_DECISIONS)
                    .map(|d| (d.timestamp, d.summary.clone()))
                    .collect::<Vec<_>>()
            })
            .await
            .into_iter()
            .rev()
            .collect();
        let health = self.health.read().expect("health snapshot poisoned").clone();
        ContextInputs {
            quiet_now: self.quiet.is_quiet_at(now),
            projects,
            sessions,
            resources,
            health,
            recent_decisions,
            priorities,
            now,
        }
    }

    pub async fn assemble(&self) -> String {
        let inputs = self.gather().await;
        self.render(&inputs)
    }

    /// Render the bounded prompt. Section order is fixed: preamble, time,
    /// priorities, sessions, projects, recent decisions, output contract.
    pub fn render(&self, inputs: &ContextInputs) -> String {
        let mut sections: Vec<String> = vec![];

        sections.push(self.preamble(inputs));
        sections.push(self.time_section(inputs));
        if let Some(priorities) = self.priorities_section(inputs) {
            sections.push(priorities);
        }
        sections.push(self.sessions_section(inputs));
        sections.push(self.projects_section(inputs));
        if let Some(decisions) = self.decisions_section(inputs) {
            sections.push(decisions);
        }
        sections.push(OUTPUT_CONTRACT.to_string());

        let prompt = sections.join(SECTION_SEPARATOR);
        if prompt.len() <= self.max_prompt_length {
            return prompt;
        }
        let mut cut = self.max_prompt_length.saturating_sub(TRUNCATION_MARKER.len());
        while cut > 0 && !prompt.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}{TRUNCATION_MARKER}", &prompt[..cut])
    }

    fn preamble(&self, inputs: &ContextInputs) -> String {
        let down = inputs
            .health
            .iter()
            .filter(|h| h.status == HealthStatus::Down)
            .count();
        let mut line = format!(
            "You are the supervisor of {} projects with {} active coding sessions. \
             Host: {} MB free of {} MB, load {:.2}.",
            inputs.projects.len(),
            inputs.sessions.len(),
            inputs.resources.free_memory_mb,
            inputs.resources.total_memory_mb,
            inputs.resources.load_average,
        );
        if down > 0 {
            let names: Vec<&str> = inputs
                .health
                .iter()
                .filter(|h| h.status == HealthStatus::Down)
                .map(|h| h.name.as_str())
                .collect();
            line.push_str(&format!(" Services DOWN: {}.", names.join(", ")));
        }
        line
    }

    fn time_section(&self, inputs: &ContextInputs) -> String {
        let local = inputs.now.with_timezone(&self.quiet.timezone());
        format!(
            "Time: {}. Quiet hours: {}.",
            local.format("%Y-%m-%d %H:%M %Z"),
            if inputs.quiet_now { "active" } else { "inactive" }
        )
    }

    fn priorities_section(&self, inputs: &ContextInputs) -> Option<String> {
        let p = &inputs.priorities;
        if p.focus.is_empty() && p.block.is_empty() && p.skip.is_empty() && p.notes.is_none() {
            return None;
        }
        let mut lines = vec!["Operator priorities:".to_string()];
        if !p.focus.is_empty() {
            lines.push(format!("Focus: {}", p.focus.join(", ")));
        }
        if !p.block.is_empty() {
            lines.push(format!("Do not touch: {}", p.block.join(", ")));
        }
        if !p.skip.is_empty() {
            lines.push(format!("Skip for now: {}", p.skip.join(", ")));
        }
        if let Some(ref notes) = p.notes {
            lines.push(format!("Notes: {notes}"));
        }
        Some(lines.join("\n"))
    }

    fn sessions_section(&self, inputs: &ContextInputs) -> String {
        if inputs.sessions.is_empty() {
            return "Active sessions: none".to_string();
        }
        let mut lines = vec![format!("Active sessions ({}):", inputs.sessions.len())];
        for session in &inputs.sessions {
            let minutes = (inputs.now - session.started_at).num_minutes();
            lines.push(format!("- {} ({}m)", session.project, minutes));
        }
        lines.join("\n")
    }

    fn projects_section(&self, inputs: &ContextInputs) -> String {
        let mut projects: Vec<&ProjectRecord> = inputs.projects.iter().collect();
        projects.sort_by(|a, b| {
            b.focus
                .cmp(&a.focus)
                .then(b.needs_attention.cmp(&a.needs_attention))
                .then(a.name.cmp(&b.name))
        });

        let active: std::collections::HashSet<&str> =
            inputs.sessions.iter().map(|s| s.project.as_str()).collect();

        let mut blocks = vec![];
        for project in projects {
            let mut lines = vec![format!("## {}", project.name)];
            let mut status = String::from("Status: ");
            status.push_str(project.phase.as_deref().unwrap_or("unknown"));
            if let Some(ref progress) = project.progress {
                status.push_str(&format!(" ({progress})"));
            }
            if active.contains(project.name.as_str()) {
                status.push_str(" | SESSION ACTIVE");
            }
            lines.push(status);
            if project.needs_attention {
                lines.push("ATTENTION: flagged for operator input".to_string());
            }
            if !project.blockers.is_empty() {
                lines.push(format!("Blockers: {}", project.blockers.join("; ")));
            }
            if let Some(ref note) = project.note {
                lines.push(format!("Note: {note}"));
            }
            if let Some(last) = project.last_activity {
                lines.push(format!("Last activity: {}", last.format("%Y-%m-%d %H:%M")));
            }
            blocks.push(lines.join("\n"));
        }
        blocks.join("\n\n")
    }

    fn decisions_section(&self, inputs: &ContextInputs) -> Option<String> {
        if inputs.recent_decisions.is_empty() {
            return None;
        }
        let mut lines = vec!["Recent decisions:".to_string()];
        for (ts, summary) in &inputs.recent_decisions {
            lines.push(format!("- [{}] {}", ts.format("%m-%d %H:%M"), summary));
        }
        Some(lines.join("\n"))
    }
}

const OUTPUT_CONTRACT: &str = "Decide what to do next. For each project that needs action, emit a \
recommendation with project, action (start|stop|restart|notify|skip) and a short reason. Only \
recommend actions that clearly help; prefer skip when uncertain. Include an overall summary. \
Optionally set nextThinkIn (seconds, 60-1800) if the fleet needs faster or slower attention.";
