//! Tiered outbound notification pipeline — the sole SMS waist.
//!
//! Four tiers: URGENT sends immediately (optionally even during quiet
//! hours) and never counts against the daily budget; ACTION sends now
//! when awake and in budget, otherwise batches; SUMMARY always batches;
//! DEBUG only logs. The batch queue flushes on a timer and piggybacks on
//! any tier-1/2 send.

mod quiet;

pub use quiet::{QuietHours, resolve_timezone};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use foreman_config::NotificationsConfig;
use foreman_core::SmsTransport;

/// Hard per-message cap; longer bodies are truncated with a marker.
pub const MAX_SMS_LEN: usize = 1_500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tier {
    Urgent = 1,
    Action = 2,
    Summary = 3,
    Debug = 4,
}

impl Tier {
    /// Clamp a numeric tier (e.g. from a model recommendation) into range.
    pub fn from_num(n: u8) -> Self {
        match n {
            0 | 1 => Self::Urgent,
            2 => Self::Action,
            3 => Self::Summary,
            _ => Self::Debug,
        }
    }
}

/// Truncate to the SMS cap, appending `[truncated]` when content is lost.
pub fn truncate_sms(text: &str) -> String {
    if text.len() <= MAX_SMS_LEN {
        return text.to_string();
    }
    let suffix = " [truncated]";
    let mut cut = MAX_SMS_LEN - suffix.len();
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{suffix}", &text[..cut])
}

struct PipelineState {
    batch_queue: Vec<String>,
    sends_today: u32,
    budget_day: Option<NaiveDate>,
    budget_warned: bool,
}

pub struct NotificationPipeline {
    transport: Arc<dyn SmsTransport>,
    quiet: QuietHours,
    config: NotificationsConfig,
    /// Operator override (`shh`/`quiet on`): behaves like quiet hours
    /// regardless of the clock.
    force_quiet: AtomicBool,
    state: Mutex<PipelineState>,
}

impl NotificationPipeline {
    pub fn new(
        transport: Arc<dyn SmsTransport>,
        quiet: QuietHours,
        config: NotificationsConfig,
    ) -> Self {
        Self {
            transport,
            quiet,
            config,
            force_quiet: AtomicBool::new(false),
            state: Mutex::new(PipelineState {
                batch_queue: vec![],
                sends_today: 0,
                budget_day: None,
                budget_warned: false,
            }),
        }
    }

    /// Route one message. Ordering within a tier follows call order.
    pub async fn notify(&self, message: &str, tier: Tier) {
        self.notify_at(message, tier, Utc::now()).await;
    }

    /// Clock-explicit variant backing [`notify`]; the instant decides
    /// quiet-hours membership and the budget day.
    ///
    /// [`notify`]: Self::notify
    pub async fn notify_at(&self, message: &str, tier: Tier, now: DateTime<Utc>) {
        match tier {
            Tier::Debug => {
                debug!(target: "foreman::notify", %message, "tier-4 notification");
            }
            Tier::Summary => {
                let mut state = self.state.lock().await;
                state.batch_queue.push(message.to_string());
            }
            Tier::Urgent => {
                let quiet_now = self.is_quiet(now);
                if quiet_now && !self.config.urgent_bypass_quiet {
                    let mut state = self.state.lock().await;
                    state.batch_queue.push(message.to_string());
                    return;
                }
                // Urgent never counts against the budget.
                self.send(message).await;
                self.flush_at(now).await;
            }
            Tier::Action => {
                let should_send = {
                    let mut state = self.state.lock().await;
                    self.roll_budget_day(&mut state, now);
                    if self.is_quiet(now) || state.sends_today >= self.config.daily_budget {
                        state.batch_queue.push(message.to_string());
                        false
                    } else {
                        self.count_send(&mut state);
                        true
                    }
                };
                if should_send {
                    self.send(message).await;
                    self.flush_at(now).await;
                }
            }
        }
    }

    /// Drain the batch queue into a single SMS. Counted as one send;
    /// skipped (queue retained) when the daily budget is exhausted.
    pub async fn flush(&self) {
        self.flush_at(Utc::now()).await;
    }

    pub async fn flush_at(&self, now: DateTime<Utc>) {
        let body = {
            let mut state = self.state.lock().await;
            if state.batch_queue.is_empty() {
                return;
            }
            self.roll_budget_day(&mut state, now);
            if state.sends_today >= self.config.daily_budget {
                debug!(
                    queued = state.batch_queue.len(),
                    "batch flush deferred: daily budget exhausted"
                );
                return;
            }
            self.count_send(&mut state);
            let items: Vec<String> = state.batch_queue.drain(..).collect();
            let mut body = format!("Batch update ({} items):", items.len());
            for item in items {
                body.push_str("\n- ");
                body.push_str(&item);
            }
            body
        };
        self.send(&body).await;
    }

    /// Operator-forced quiet: on while `shh`/`quiet on` is in effect.
    pub fn set_force_quiet(&self, quiet: bool) {
        self.force_quiet.store(quiet, Ordering::SeqCst);
    }

    pub fn force_quiet(&self) -> bool {
        self.force_quiet.load(Ordering::SeqCst)
    }

    fn is_quiet(&self, now: DateTime<Utc>) -> bool {
        self.force_quiet.load(Ordering::SeqCst) || self.quiet.is_quiet_at(now)
    }

    /// Queued batch items, for observability and tests.
    pub async fn queued(&self) -> usize {
        self.state.lock().await.batch_queue.len()
    }

    /// SMS sent so far in the current budget day.
    pub async fn sends_today(&self) -> u32 {
        self.state.lock().await.sends_today
    }

    async fn send(&self, message: &str) {
        let body = truncate_sms(message);
        if let Err(err) = self.transport.send(&body).await {
            warn!(?err, "sms send failed");
        }
    }

    fn roll_budget_day(&self, state: &mut PipelineState, now: DateTime<Utc>) {
        let today = self.quiet.local_date(now);
        if state.budget_day != Some(today) {
            state.budget_day = Some(today);
            state.sends_today = 0;
            state.budget_warned = false;
        }
    }

    fn count_send(&self, state: &mut PipelineState) {
        state.sends_today += 1;
        let threshold = (self.config.daily_budget as f64 * 0.8).ceil() as u32;
        if !state.budget_warned && state.sends_today >= threshold {
            state.budget_warned = true;
            info!(
                sends_today = state.sends_today,
                budget = self.config.daily_budget,
                "daily SMS budget at 80%"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use foreman_core::InboundSms;
    use std::sync::Mutex as StdMutex;

    struct RecordingTransport {
        sent: StdMutex<Vec<String>>,
    }

    impl RecordingTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self { sent: StdMutex::new(vec![]) })
        }
        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SmsTransport for RecordingTransport {
        async fn poll(&self, _last_id: i64) -> Result<Vec<InboundSms>> {
            Ok(vec![])
        }
        async fn send(&self, text: &str) -> Result<()> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    fn quiet_hours(enabled: bool) -> QuietHours {
        QuietHours::new(enabled, "22:00", "07:00", "UTC").unwrap()
    }

    fn pipeline(transport: Arc<RecordingTransport>, budget: u32) -> NotificationPipeline {
        NotificationPipeline::new(
            transport,
            quiet_hours(true),
            NotificationsConfig {
                daily_budget: budget,
                batch_interval_ms: 1000,
                urgent_bypass_quiet: true,
            },
        )
    }

    fn daytime() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 14, 0, 0).unwrap()
    }

    fn nighttime() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 23, 30, 0).unwrap()
    }

    #[tokio::test]
    async fn action_sends_immediately_during_active_hours() {
        let transport = RecordingTransport::new();
        let pipe = pipeline(transport.clone(), 20);
        pipe.notify_at("deploy done", Tier::Action, daytime()).await;
        assert_eq!(transport.sent(), vec!["deploy done".to_string()]);
        assert_eq!(pipe.sends_today().await, 1);
    }

    #[tokio::test]
    async fn action_queues_during_quiet_hours() {
        let transport = RecordingTransport::new();
        let pipe = pipeline(transport.clone(), 20);
        pipe.notify_at("deploy done", Tier::Action, nighttime()).await;
        assert!(transport.sent().is_empty());
        assert_eq!(pipe.queued().await, 1);
    }

    #[tokio::test]
    async fn urgent_bypasses_quiet_hours_and_budget() {
        let transport = RecordingTransport::new();
        let pipe = pipeline(transport.clone(), 0);
        pipe.notify_at("fire", Tier::Urgent, nighttime()).await;
        assert_eq!(transport.sent(), vec!["fire".to_string()]);
        // urgent does not count against the budget
        assert_eq!(pipe.sends_today().await, 0);
    }

    #[tokio::test]
    async fn urgent_queues_when_bypass_disabled() {
        let transport = RecordingTransport::new();
        let pipe = NotificationPipeline::new(
            transport.clone(),
            quiet_hours(true),
            NotificationsConfig {
                daily_budget: 20,
                batch_interval_ms: 1000,
                urgent_bypass_quiet: false,
            },
        );
        pipe.notify_at("fire", Tier::Urgent, nighttime()).await;
        assert!(transport.sent().is_empty());
        assert_eq!(pipe.queued().await, 1);
    }

    #[tokio::test]
    async fn summary_always_batches_and_flush_drains() {
        let transport = RecordingTransport::new();
        let pipe = pipeline(transport.clone(), 20);
        pipe.notify_at("a finished", Tier::Summary, daytime()).await;
        pipe.notify_at("b finished", Tier::Summary, daytime()).await;
        assert!(transport.sent().is_empty());

        pipe.flush_at(daytime()).await;
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with("Batch update (2 items):"));
        assert!(sent[0].contains("- a finished"));
        assert!(sent[0].contains("- b finished"));
        assert_eq!(pipe.sends_today().await, 1);
    }

    #[tokio::test]
    async fn debug_tier_never_sends_or_queues() {
        let transport = RecordingTransport::new();
        let pipe = pipeline(transport.clone(), 20);
        pipe.notify_at("noisy detail", Tier::Debug, daytime()).await;
        assert!(transport.sent().is_empty());
        assert_eq!(pipe.queued().await, 0);
    }

    #[tokio::test]
    async fn budget_exhaustion_downgrades_action_to_batch() {
        let transport = RecordingTransport::new();
        let pipe = pipeline(transport.clone(), 2);
        pipe.notify_at("one", Tier::Action, daytime()).await;
        pipe.notify_at("two", Tier::Action, daytime()).await;
        pipe.notify_at("three", Tier::Action, daytime()).await;

        assert_eq!(transport.sent().len(), 2);
        assert_eq!(pipe.queued().await, 1);
    }

    /// Property 1: sends in one day never exceed budget + #tier-1 sends.
    #[tokio::test]
    async fn daily_send_count_is_bounded_by_budget_plus_urgent() {
        let transport = RecordingTransport::new();
        let budget = 3u32;
        let pipe = pipeline(transport.clone(), budget);
        let mut urgent_count = 0u32;
        for i in 0..30 {
            let tier = match i % 4 {
                0 => Tier::Urgent,
                1 => Tier::Action,
                2 => Tier::Summary,
                _ => Tier::Debug,
            };
            if tier == Tier::Urgent {
                urgent_count += 1;
            }
            pipe.notify_at(&format!("m{i}"), tier, daytime()).await;
        }
        pipe.flush_at(daytime()).await;
        assert!(
            (transport.sent().len() as u32) <= budget + urgent_count,
            "sent {} > budget {budget} + urgent {urgent_count}",
            transport.sent().len()
        );
    }

    #[tokio::test]
    async fn budget_resets_on_new_local_day() {
        let transport = RecordingTransport::new();
        let pipe = pipeline(transport.clone(), 1);
        pipe.notify_at("day1", Tier::Action, daytime()).await;
        pipe.notify_at("day1 over", Tier::Action, daytime()).await;
        assert_eq!(transport.sent().len(), 1);

        let next_day = daytime() + chrono::Duration::days(1);
        pipe.notify_at("day2", Tier::Action, next_day).await;
        assert_eq!(transport.sent().len(), 2);
    }

    #[tokio::test]
    async fn tier1_piggybacks_a_flush_of_queued_batch() {
        let transport = RecordingTransport::new();
        let pipe = pipeline(transport.clone(), 20);
        pipe.notify_at("queued summary", Tier::Summary, daytime()).await;
        pipe.notify_at("URGENT thing", Tier::Urgent, daytime()).await;

        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], "URGENT thing");
        assert!(sent[1].starts_with("Batch update (1 items):"));
    }

    #[tokio::test]
    async fn long_messages_are_truncated_with_marker() {
        let long = "x".repeat(2 * MAX_SMS_LEN);
        let out = truncate_sms(&long);
        assert!(out.len() <= MAX_SMS_LEN);
        assert!(out.ends_with("[truncated]"));
        assert_eq!(truncate_sms("short"), "short");
    }
}
