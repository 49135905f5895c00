//! Recommendation validation, gating, and dispatch.
//!
//! `evaluate` is a pure transformation over the current gate state;
//! `format_for_sms` owns content-dedup of outbound recommendations;
//! `execute` re-checks the autonomy matrix, applies just-in-time
//! preconditions, dispatches through the mux, and records the outcome.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};

use foreman_config::AiConfig;
use foreman_core::{
    Action, ActionRequest, AutonomyLevel, EvaluatedRecommendation, ExecutionRecord, MuxDriver,
    MuxResult, Recommendation, ResourceProbe, Verdict,
};
use foreman_notify::{NotificationPipeline, Tier, truncate_sms};
use foreman_state::{AutonomyState, StateStore};

/// What `execute` reports back to the caller for logging.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub executed: bool,
    pub rejected: Option<String>,
    pub message: String,
}

struct Gates {
    /// `(project, action)` → last applied, for the same-action window.
    by_action: HashMap<(String, Action), DateTime<Utc>>,
    /// project → last applied (any action), for the same-project window.
    by_project: HashMap<String, DateTime<Utc>>,
    /// content hash → last surfaced, for outbound dedup.
    dedup: HashMap<u32, DateTime<Utc>>,
}

pub struct DecisionExecutor {
    mux: Arc<dyn MuxDriver>,
    pipeline: Arc<NotificationPipeline>,
    store: Arc<StateStore>,
    autonomy: Arc<AutonomyState>,
    resources: Arc<dyn ResourceProbe>,
    ai: AiConfig,
    max_concurrent_sessions: usize,
    gates: Mutex<Gates>,
}

impl DecisionExecutor {
    pub fn new(
        mux: Arc<dyn MuxDriver>,
        pipeline: Arc<NotificationPipeline>,
        store: Arc<StateStore>,
        autonomy: Arc<AutonomyState>,
        resources: Arc<dyn ResourceProbe>,
        ai: AiConfig,
        max_concurrent_sessions: usize,
    ) -> Self {
        Self {
            mux,
            pipeline,
            store,
            autonomy,
            resources,
            ai,
            max_concurrent_sessions,
            gates: Mutex::new(Gates {
                by_action: HashMap::new(),
                by_project: HashMap::new(),
                dedup: HashMap::new(),
            }),
        }
    }

    // ── evaluate ───────────────────────────────────────────────────────────

    pub async fn evaluate(&self, recs: &[Recommendation]) -> Vec<EvaluatedRecommendation> {
        self.evaluate_at(recs, Utc::now()).await
    }

    /// Validate each recommendation in input order, stopping at the first
    /// failing check: protected project, same-action cooldown, then
    /// same-project cooldown. No side effects beyond reading gate state.
    pub async fn evaluate_at(
        &self,
        recs: &[Recommendation],
        now: DateTime<Utc>,
    ) -> Vec<EvaluatedRecommendation> {
        let level = self.autonomy.current();
        let gates = self.gates.lock().await;
        recs.iter()
            .map(|rec| EvaluatedRecommendation {
                rec: rec.clone(),
                verdict: self.verdict_for(rec, level, &gates, now),
            })
            .collect()
    }

    fn verdict_for(
        &self,
        rec: &Recommendation,
        level: AutonomyLevel,
        gates: &Gates,
        now: DateTime<Utc>,
    ) -> Verdict {
        let reject = |cause: &str, remaining: Option<i64>| Verdict {
            validated: false,
            rejected: Some(cause.to_string()),
            observe_only: false,
            autonomy_level: level,
            cooldown_remaining_ms: remaining,
        };

        if self
            .ai
            .protected_projects
            .iter()
            .any(|p| p.eq_ignore_ascii_case(&rec.project))
        {
            return reject("protected project", None);
        }

        let action = rec.action();
        if let Some(last) = gates.by_action.get(&(rec.project.clone(), action)) {
            let elapsed = (now - *last).num_milliseconds();
            if elapsed < self.ai.cooldowns.same_action_ms {
                return reject(
                    "cooldown active",
                    Some(self.ai.cooldowns.same_action_ms - elapsed),
                );
            }
        }
        if let Some(last) = gates.by_project.get(&rec.project) {
            let elapsed = (now - *last).num_milliseconds();
            if elapsed < self.ai.cooldowns.same_project_ms {
                return reject(
                    "cooldown active",
                    Some(self.ai.cooldowns.same_project_ms - elapsed),
                );
            }
        }

        Verdict {
            validated: true,
            rejected: None,
            observe_only: level == AutonomyLevel::Observe,
            autonomy_level: level,
            cooldown_remaining_ms: None,
        }
    }

    // ── format_for_sms ─────────────────────────────────────────────────────

    pub async fn format_for_sms(
        &self,
        evaluated: &[EvaluatedRecommendation],
        summary: Option<&str>,
    ) -> Option<String> {
        self.format_for_sms_at(evaluated, summary, Utc::now()).await
    }

    /// Assemble the operator SMS, deduplicating validated recommendations
    /// against the content-hash map. Returns `None` when every validated
    /// recommendation was suppressed and there are no rejections to
    /// report — the SMS is withheld entirely.
    pub async fn format_for_sms_at(
        &self,
        evaluated: &[EvaluatedRecommendation],
        summary: Option<&str>,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let ttl = Duration::milliseconds(self.ai.dedup_ttl_ms);
        let mut kept: Vec<&EvaluatedRecommendation> = vec![];
        let mut suppressed = 0usize;
        {
            let mut gates = self.gates.lock().await;
            gates.dedup.retain(|_, seen| now - *seen < ttl);
            for er in evaluated.iter().filter(|e| e.verdict.validated) {
                let hash = content_hash(&er.rec.project, er.rec.action(), &er.rec.reason);
                if gates.dedup.contains_key(&hash) {
                    suppressed += 1;
                    continue;
                }
                gates.dedup.insert(hash, now);
                kept.push(er);
            }
        }

        let rejected: Vec<&EvaluatedRecommendation> =
            evaluated.iter().filter(|e| !e.verdict.validated).collect();

        if kept.is_empty() && rejected.is_empty() {
            if suppressed > 0 {
                return None;
            }
            return Some("AI brain: No recommendations.".to_string());
        }

        let mut lines = vec!["AI brain:".to_string()];
        for (i, er) in kept.iter().enumerate() {
            lines.push(format!(
                "{}. {} -> {}: {}",
                i + 1,
                er.rec.project,
                er.rec.action(),
                er.rec.reason
            ));
        }
        if !rejected.is_empty() {
            let mut causes: BTreeMap<&str, usize> = BTreeMap::new();
            for er in &rejected {
                let cause = er.verdict.rejected.as_deref().unwrap_or("rejected");
                *causes.entry(cause).or_default() += 1;
            }
            let parts: Vec<String> =
                causes.iter().map(|(cause, n)| format!("{cause}: {n}")).collect();
            lines.push(format!("Rejected {}: {}", rejected.len(), parts.join(", ")));
        }
        if let Some(summary) = summary {
            if !summary.trim().is_empty() {
                lines.push(summary.trim().to_string());
            }
        }
        if self.autonomy.current() == AutonomyLevel::Observe {
            lines.push("(observe mode - no actions taken)".to_string());
        }
        Some(truncate_sms(&lines.join("\n")))
    }

    // ── execute ────────────────────────────────────────────────────────────

    pub async fn execute(&self, er: &EvaluatedRecommendation) -> ExecutionOutcome {
        self.execute_at(er, Utc::now()).await
    }

    pub async fn execute_at(
        &self,
        er: &EvaluatedRecommendation,
        now: DateTime<Utc>,
    ) -> ExecutionOutcome {
        let rec = &er.rec;
        if !er.verdict.validated {
            return ExecutionOutcome {
                executed: false,
                rejected: er.verdict.rejected.clone(),
                message: "not validated".to_string(),
            };
        }

        // Re-check against the *current* level: it may have changed since
        // evaluation, and observe-only verdicts land here too.
        let action = rec.action();
        let level = self.autonomy.current();
        if !level.allows(action) {
            self.pipeline
                .notify(
                    &format!("AI would {} {}: {}", action, rec.project, rec.reason),
                    Tier::Summary,
                )
                .await;
            return ExecutionOutcome {
                executed: false,
                rejected: Some("autonomy_level".to_string()),
                message: format!("level {level} does not permit {action}"),
            };
        }

        if let Some(refusal) = self.precondition_failure(rec, action).await {
            info!(project = %rec.project, %action, %refusal, "precondition refused");
            return ExecutionOutcome {
                executed: false,
                rejected: Some("precondition_failed".to_string()),
                message: refusal,
            };
        }

        let result = self.dispatch(rec).await;
        if !result.ok {
            warn!(project = %rec.project, %action, msg = %result.msg, "dispatch failed");
        }

        // Only mux-affecting actions arm the cooldown windows; a skip or
        // notify must not block a later real action on the project.
        if matches!(action, Action::Start | Action::Stop | Action::Restart) {
            let mut gates = self.gates.lock().await;
            gates.by_action.insert((rec.project.clone(), action), now);
            gates.by_project.insert(rec.project.clone(), now);
        }

        let state_version = self.store.read(|doc| doc.state_version).await;
        self.store
            .update(|doc| {
                doc.push_execution(ExecutionRecord {
                    timestamp: now,
                    action,
                    project: rec.project.clone(),
                    ok: result.ok,
                    message: result.msg.clone(),
                    autonomy_level: level,
                    state_version,
                })
            })
            .await;

        if result.ok && matches!(action, Action::Start | Action::Stop | Action::Restart) {
            self.pipeline
                .notify(
                    &format!("AI {} {}: {}", action.past_tense(), rec.project, rec.reason),
                    Tier::Action,
                )
                .await;
        }

        ExecutionOutcome {
            executed: result.ok,
            rejected: None,
            message: result.msg,
        }
    }

    async fn dispatch(&self, rec: &Recommendation) -> MuxResult {
        match &rec.request {
            ActionRequest::Start { prompt } => {
                self.mux.start(&rec.project, prompt.as_deref()).await
            }
            ActionRequest::Stop => self.mux.stop(&rec.project).await,
            ActionRequest::Restart { prompt } => {
                self.mux.restart(&rec.project, prompt.as_deref()).await
            }
            ActionRequest::Notify { message } => {
                let body = message.as_deref().unwrap_or(&rec.reason);
                let tier = Tier::from_num(rec.notification_tier.unwrap_or(2));
                self.pipeline.notify(body, tier).await;
                MuxResult::ok("notification routed")
            }
            ActionRequest::Skip => MuxResult::ok("skipped"),
        }
    }

    async fn precondition_failure(&self, rec: &Recommendation, action: Action) -> Option<String> {
        match action {
            Action::Start => {
                let active = self.mux.list_active().await;
                if active.iter().any(|s| s.project == rec.project) {
                    return Some("session already running".to_string());
                }
                if active.len() >= self.max_concurrent_sessions {
                    return Some(format!(
                        "max concurrent sessions reached ({})",
                        self.max_concurrent_sessions
                    ));
                }
                let snapshot = self.resources.snapshot().await;
                if snapshot.free_memory_mb < self.ai.resource_limits.min_free_memory_mb {
                    return Some(format!(
                        "low memory: {} MB free, {} MB required",
                        snapshot.free_memory_mb, self.ai.resource_limits.min_free_memory_mb
                    ));
                }
                let retries = self
                    .store
                    .read(|doc| doc.error_retry_counts.get(&rec.project).copied().unwrap_or(0))
                    .await;
                if retries >= self.ai.max_error_retries {
                    return Some(format!("error retry budget exhausted ({retries})"));
                }
                None
            }
            Action::Stop | Action::Restart => {
                let active = self.mux.list_active().await;
                if active.iter().any(|s| s.project == rec.project) {
                    None
                } else {
                    Some("no session running".to_string())
                }
            }
            Action::Notify | Action::Skip => None,
        }
    }
}

/// FNV-1a over `project:action:reason` (reason lowercased, first 100
/// chars). Non-cryptographic by design: a collision only suppresses one
/// notification and self-heals when the TTL lapses.
fn content_hash(project: &str, action: Action, reason: &str) -> u32 {
    let reason: String = reason.to_lowercase().chars().take(100).collect();
    let key = format!("{project}:{}:{reason}", action.as_str());
    let mut hash: u32 = 0x811c_9dc5;
    for byte in key.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}
