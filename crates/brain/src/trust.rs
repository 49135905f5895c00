//! Advisory trust accounting over the autonomy ladder.
//!
//! The tracker accumulates per-level counters from the execution and
//! evaluation histories and recommends promotions when thresholds are
//! met. It never changes the level itself — promotion is always a human
//! command.

use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use tracing::debug;

use foreman_config::{TrustThreshold, TrustThresholds};
use foreman_core::{Action, AutonomyLevel};
use foreman_state::{AutonomyState, StateStore};

struct Cursor {
    level: Option<AutonomyLevel>,
    last_execution_ts: Option<DateTime<Utc>>,
    last_evaluation_ts: Option<DateTime<Utc>>,
}

pub struct TrustTracker {
    store: Arc<StateStore>,
    autonomy: Arc<AutonomyState>,
    thresholds: TrustThresholds,
    cursor: StdMutex<Cursor>,
}

impl TrustTracker {
    pub fn new(
        store: Arc<StateStore>,
        autonomy: Arc<AutonomyState>,
        thresholds: TrustThresholds,
    ) -> Self {
        Self {
            store,
            autonomy,
            thresholds,
            cursor: StdMutex::new(Cursor {
                level: None,
                last_execution_ts: None,
                last_evaluation_ts: None,
            }),
        }
    }

    /// One accounting pass: fold any level transition into the rows, then
    /// credit the current level with sessions started and evaluations
    /// scored since the previous tick.
    pub async fn tick(&self, now: DateTime<Utc>) {
        let level = self.autonomy.current();

        let (transition_from, exec_cutoff, eval_cutoff) = {
            let mut cursor = self.cursor.lock().expect("trust cursor poisoned");
            let transition = if cursor.level != Some(level) {
                let prev = cursor.level;
                cursor.level = Some(level);
                Some(prev)
            } else {
                None
            };
            (transition, cursor.last_execution_ts, cursor.last_evaluation_ts)
        };

        let (new_sessions, new_scores, max_exec_ts, max_eval_ts) = self
            .store
            .read(|doc| {
                let mut sessions = 0u64;
                let mut max_exec = exec_cutoff;
                for record in &doc.execution_history {
                    if exec_cutoff.is_some_and(|cut| record.timestamp <= cut) {
                        continue;
                    }
                    if record.action == Action::Start && record.ok {
                        sessions += 1;
                    }
                    if max_exec.is_none_or(|m| record.timestamp > m) {
                        max_exec = Some(record.timestamp);
                    }
                }
                let mut scores: Vec<f64> = vec![];
                let mut max_eval = eval_cutoff;
                for evaluation in &doc.evaluation_history {
                    if eval_cutoff.is_some_and(|cut| evaluation.evaluated_at <= cut) {
                        continue;
                    }
                    scores.push(evaluation.score as f64);
                    if max_eval.is_none_or(|m| evaluation.evaluated_at > m) {
                        max_eval = Some(evaluation.evaluated_at);
                    }
                }
                (sessions, scores, max_exec, max_eval)
            })
            .await;

        {
            let mut cursor = self.cursor.lock().expect("trust cursor poisoned");
            cursor.last_execution_ts = max_exec_ts;
            cursor.last_evaluation_ts = max_eval_ts;
        }

        let nothing_new = new_sessions == 0 && new_scores.is_empty();
        if transition_from.is_none() && nothing_new {
            return;
        }

        self.store
            .update(|doc| {
                if let Some(prev) = transition_from {
                    if let Some(prev) = prev {
                        if let Some(row) = doc.trust_rows.get_mut(&prev) {
                            if let Some(entered) = row.last_entered_at.take() {
                                row.total_days +=
                                    (now - entered).num_seconds().max(0) as f64 / 86_400.0;
                            }
                        }
                    }
                    let row = doc.trust_rows.entry(level).or_default();
                    if row.first_entered_at.is_none() {
                        row.first_entered_at = Some(now);
                    }
                    row.last_entered_at = Some(now);
                    // The latch only rearms on an observed level change.
                    row.promotion_sent = false;
                }

                let row = doc.trust_rows.entry(level).or_default();
                row.total_sessions += new_sessions;
                row.total_evaluations += new_scores.len() as u64;
                row.sum_eval_scores += new_scores.iter().sum::<f64>();
            })
            .await;

        debug!(
            %level,
            new_sessions,
            new_evaluations = new_scores.len(),
            "trust tick applied"
        );
    }

    /// Purely advisory promotion check. Observe never promotes (humans
    /// move that gate) and full has nowhere to go. Returns the
    /// recommendation text at most once per stay at a level.
    pub async fn promotion_check(&self, now: DateTime<Utc>) -> Option<String> {
        let level = self.autonomy.current();
        let (threshold, target): (&TrustThreshold, AutonomyLevel) = match level {
            AutonomyLevel::Observe | AutonomyLevel::Full => return None,
            AutonomyLevel::Cautious => {
                (&self.thresholds.cautious_to_moderate, AutonomyLevel::Moderate)
            }
            AutonomyLevel::Moderate => (&self.thresholds.moderate_to_full, AutonomyLevel::Full),
        };

        let row = self
            .store
            .read(|doc| doc.trust_rows.get(&level).cloned())
            .await?;
        if row.promotion_sent {
            return None;
        }

        let days = row.days_at_level(now);
        if row.total_sessions < threshold.min_sessions
            || row.avg_score() < threshold.min_avg_score
            || days < threshold.min_days_at_level
        {
            return None;
        }

        self.store
            .update(|doc| {
                if let Some(row) = doc.trust_rows.get_mut(&level) {
                    row.promotion_sent = true;
                }
            })
            .await;

        Some(format!(
            "Trust check: {} sessions at {level} (avg score {:.1}) over {:.0} days. \
             Consider 'ai level {target}' to promote.",
            row.total_sessions,
            row.avg_score(),
            days,
        ))
    }
}
