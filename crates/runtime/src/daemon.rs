//! The composition root and the scan/think/flush loops.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use foreman_brain::{
    ContextAssembler, DecisionExecutor, SessionEvaluator, SessionHandle, ThinkEngine, TrustTracker,
};
use foreman_config::ForemanConfig;
use foreman_core::{
    AutonomyLevel, HealthResult, MuxDriver, ProjectScanner, ProjectSignal, ResourceProbe,
    SignalKind, SmsTransport, UserPriorities,
};
use foreman_exec::{Git2Inspector, SignalScanner, StatusScanner, SysinfoProbe, TmuxDriver};
use foreman_health::{HealthController, SystemProber};
use foreman_llm::SubprocessGateway;
use foreman_notify::{NotificationPipeline, QuietHours, Tier};
use foreman_router::{CommandRouter, ContextKind};
use foreman_sms::HttpSmsGateway;
use foreman_state::{AutonomyState, ConversationStore, ReminderStore, StateStore};

use crate::digests::spawn_digest_task;

const CONVERSATION_CAP: usize = 100;
const CONVERSATION_TTL_DAYS: i64 = 7;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionMarker {
    session_id: String,
    #[serde(default)]
    started_at: Option<DateTime<Utc>>,
}

/// The assembled daemon. Everything is shared behind `Arc` so the timer
/// loops can run concurrently against the same components.
pub struct Foreman {
    pub config: ForemanConfig,
    pub store: Arc<StateStore>,
    pub autonomy: Arc<AutonomyState>,
    pub transport: Arc<dyn SmsTransport>,
    pub mux: Arc<dyn MuxDriver>,
    pub scanner: Arc<dyn ProjectScanner>,
    pub pipeline: Arc<NotificationPipeline>,
    pub think: Arc<ThinkEngine>,
    pub router: Arc<CommandRouter>,
    pub health: Arc<HealthController>,
    pub trust: Arc<TrustTracker>,
    pub evaluator: Arc<SessionEvaluator>,
    pub reminders: Arc<ReminderStore>,
    signals: SignalScanner,
    projects_root: PathBuf,
}

impl Foreman {
    /// Compose the daemon from config with the production collaborators.
    pub async fn build(config: ForemanConfig) -> Result<Self> {
        let transport: Arc<dyn SmsTransport> = Arc::new(HttpSmsGateway::new(config.sms.clone()));
        let mux: Arc<dyn MuxDriver> = Arc::new(TmuxDriver::new(&config.sessions.projects_root));
        let scanner: Arc<dyn ProjectScanner> =
            Arc::new(StatusScanner::new(&config.sessions.projects_root));
        let resources: Arc<dyn ResourceProbe> = Arc::new(SysinfoProbe::new());
        let prober = Arc::new(SystemProber::new(config.health.probe_timeout_ms));
        Self::build_with(config, transport, mux, scanner, resources, prober).await
    }

    /// Composition seam: tests and alternative deployments swap any
    /// collaborator here.
    pub async fn build_with(
        config: ForemanConfig,
        transport: Arc<dyn SmsTransport>,
        mux: Arc<dyn MuxDriver>,
        scanner: Arc<dyn ProjectScanner>,
        resources: Arc<dyn ResourceProbe>,
        prober: Arc<dyn foreman_health::Prober>,
    ) -> Result<Self> {
        let state_dir = PathBuf::from(&config.daemon.state_dir);
        let store = Arc::new(StateStore::open(state_dir.join("state.json")));

        let config_level = AutonomyLevel::from_str(&config.ai.autonomy_level)
            .context("invalid ai.autonomy_level in config")?;
        let autonomy = Arc::new(AutonomyState::load(store.clone(), config_level).await);

        let quiet = QuietHours::from_config(&config.quiet_hours)
            .context("invalid quiet_hours config")?;
        let pipeline = Arc::new(NotificationPipeline::new(
            transport.clone(),
            quiet.clone(),
            config.ai.notifications.clone(),
        ));

        let gateway = Arc::new(SubprocessGateway::new(
            config.llm.binary.clone(),
            config.llm.max_concurrent_calls,
        ));
        let call_timeout = Duration::from_millis(config.llm.default_timeout_ms);

        let health_snapshot: Arc<RwLock<Vec<HealthResult>>> = Arc::new(RwLock::new(vec![]));
        let priorities = Arc::new(RwLock::new(UserPriorities::default()));

        let assembler = Arc::new(ContextAssembler::new(
            scanner.clone(),
            mux.clone(),
            resources.clone(),
            store.clone(),
            health_snapshot.clone(),
            priorities.clone(),
            quiet,
            config.ai.max_prompt_length,
        ));
        let executor = Arc::new(DecisionExecutor::new(
            mux.clone(),
            pipeline.clone(),
            store.clone(),
            autonomy.clone(),
            resources.clone(),
            config.ai.clone(),
            config.sessions.max_concurrent,
        ));
        let think = Arc::new(ThinkEngine::new(
            gateway.clone(),
            assembler.clone(),
            executor,
            store.clone(),
            resources.clone(),
            pipeline.clone(),
            config.ai.clone(),
            call_timeout,
        ));

        let conversation = Arc::new(ConversationStore::open(
            state_dir.join("conversation.jsonl"),
            CONVERSATION_CAP,
            CONVERSATION_TTL_DAYS,
        ));
        let reminders = Arc::new(ReminderStore::open(state_dir.join("reminders.json")));

        let router = Arc::new(CommandRouter::new(
            think.clone(),
            gateway.clone(),
            assembler,
            mux.clone(),
            scanner.clone(),
            autonomy.clone(),
            store.clone(),
            conversation,
            reminders.clone(),
            pipeline.clone(),
            priorities,
            config.sessions.clone(),
            config.ai.model.clone(),
        ));

        let health = Arc::new(HealthController::new(
            config.health.clone(),
            prober,
            autonomy.clone(),
            pipeline.clone(),
            health_snapshot,
        ));
        let trust = Arc::new(TrustTracker::new(
            store.clone(),
            autonomy.clone(),
            config.trust.thresholds.clone(),
        ));
        let evaluator = Arc::new(SessionEvaluator::new(
            gateway,
            mux.clone(),
            Arc::new(Git2Inspector),
            store.clone(),
            config.ai.model.clone(),
            call_timeout,
        ));

        let signals = SignalScanner::new(&config.sessions.projects_root);
        let projects_root = PathBuf::from(&config.sessions.projects_root);

        Ok(Self {
            config,
            store,
            autonomy,
            transport,
            mux,
            scanner,
            pipeline,
            think,
            router,
            health,
            trust,
            evaluator,
            reminders,
            signals,
            projects_root,
        })
    }

    /// Spawn the scan, think, flush, and digest loops. Each loop exits
    /// when the shutdown channel flips to true.
    pub fn spawn_loops(self: &Arc<Self>, shutdown: &watch::Sender<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = vec![
            self.spawn_scan_loop(shutdown),
            self.spawn_think_loop(shutdown),
            self.spawn_flush_loop(shutdown),
        ];
        for (label, digest) in [
            ("morning", &self.config.morning_digest),
            ("evening", &self.config.evening_digest),
            ("weekly-revenue", &self.config.weekly_revenue),
        ] {
            if digest.enabled {
                handles.push(spawn_digest_task(
                    label,
                    digest.clone(),
                    self.think.clone(),
                    self.pipeline.clone(),
                    self.store.clone(),
                    shutdown,
                ));
            }
        }
        handles
    }

    fn spawn_scan_loop(self: &Arc<Self>, shutdown: &watch::Sender<bool>) -> JoinHandle<()> {
        let daemon = self.clone();
        let mut rx = shutdown.subscribe();
        let interval = Duration::from_millis(self.config.daemon.scan_interval_ms);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        daemon.scan_tick().await;
                    }
                    changed = rx.changed() => {
                        if changed.is_ok() && *rx.borrow() { break; }
                    }
                }
            }
        })
    }

    fn spawn_think_loop(self: &Arc<Self>, shutdown: &watch::Sender<bool>) -> JoinHandle<()> {
        let daemon = self.clone();
        let mut rx = shutdown.subscribe();
        let default_interval = Duration::from_millis(self.config.ai.think_interval_ms);
        tokio::spawn(async move {
            loop {
                // one-shot override from the previous cycle, else default
                let delay = daemon
                    .think
                    .take_next_override()
                    .unwrap_or(default_interval);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        let _ = daemon.think.think().await;
                    }
                    changed = rx.changed() => {
                        if changed.is_ok() && *rx.borrow() { break; }
                    }
                }
            }
        })
    }

    fn spawn_flush_loop(self: &Arc<Self>, shutdown: &watch::Sender<bool>) -> JoinHandle<()> {
        let daemon = self.clone();
        let mut rx = shutdown.subscribe();
        let interval = Duration::from_millis(self.config.ai.notifications.batch_interval_ms);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        daemon.pipeline.flush().await;
                    }
                    changed = rx.changed() => {
                        if changed.is_ok() && *rx.borrow() { break; }
                    }
                }
            }
        })
    }

    /// One scan tick: health, inbound SMS, reminders, signal files,
    /// trust accounting. Errors are logged; the loop always proceeds.
    pub async fn scan_tick(&self) {
        let now = Utc::now();

        if self.config.health.enabled {
            self.health.scan().await;
        }

        self.poll_sms().await;
        self.fire_reminders(now).await;
        self.handle_signals().await;

        self.trust.tick(now).await;
        if let Some(recommendation) = self.trust.promotion_check(now).await {
            self.pipeline.notify(&recommendation, Tier::Action).await;
        }

        self.store.update(|doc| doc.last_scan = Some(now)).await;
    }

    async fn poll_sms(&self) {
        let last_id = self.store.read(|doc| doc.last_row_id).await;
        let messages = match self.transport.poll(last_id as i64).await {
            Ok(messages) => messages,
            Err(err) => {
                debug!(?err, "sms poll failed");
                return;
            }
        };
        for message in messages {
            self.store
                .update(|doc| doc.last_row_id = message.id as u64)
                .await;
            let reply = self.router.handle_message(&message.text).await;
            if reply.is_empty() {
                continue;
            }
            if let Err(err) = self.transport.send(&reply).await {
                warn!(?err, "reply send failed");
            }
        }
    }

    async fn fire_reminders(&self, now: DateTime<Utc>) {
        for reminder in self.reminders.check_and_fire(now).await {
            self.pipeline
                .notify(&format!("Reminder: {}", reminder.text), Tier::Urgent)
                .await;
        }
    }

    /// React to signal files: update the conversational context, notify
    /// the operator, evaluate completed sessions, track error retries.
    pub async fn handle_signals(&self) {
        for signal in self.signals.scan().await {
            self.handle_signal(signal).await;
        }
    }

    async fn handle_signal(&self, signal: ProjectSignal) {
        let kind = match signal.kind {
            SignalKind::NeedsInput => ContextKind::NeedsInput,
            SignalKind::Completed => ContextKind::Completed,
            SignalKind::Error => ContextKind::Error,
        };
        self.router.note_event(&signal.project, kind).await;

        match signal.kind {
            SignalKind::NeedsInput => {
                self.pipeline
                    .notify(
                        &format!("{} needs input: {}", signal.project, signal.message),
                        Tier::Urgent,
                    )
                    .await;
            }
            SignalKind::Error => {
                self.store
                    .update(|doc| {
                        *doc.error_retry_counts
                            .entry(signal.project.clone())
                            .or_default() += 1;
                    })
                    .await;
                self.pipeline
                    .notify(
                        &format!("{} hit an error: {}", signal.project, signal.message),
                        Tier::Urgent,
                    )
                    .await;
            }
            SignalKind::Completed => {
                self.store
                    .update(|doc| {
                        doc.error_retry_counts.remove(&signal.project);
                    })
                    .await;
                let evaluation = self.evaluate_completed(&signal).await;
                let summary = format!(
                    "{} completed: {} (score {}/5, {:?})",
                    signal.project, signal.message, evaluation.score, evaluation.recommendation
                );
                self.pipeline.notify(&summary, Tier::Action).await;
            }
        }
    }

    async fn evaluate_completed(&self, signal: &ProjectSignal) -> foreman_core::SessionEvaluation {
        let project_path = self.projects_root.join(&signal.project);
        let marker_path = project_path.join(".orchestrator/session.json");
        let marker: Option<SessionMarker> = tokio::fs::read_to_string(&marker_path)
            .await
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok());

        let stopped_at = signal.timestamp;
        let (session_id, started_at) = match marker {
            Some(marker) => (
                marker.session_id,
                marker
                    .started_at
                    .unwrap_or(stopped_at - chrono::Duration::hours(1)),
            ),
            None => {
                debug!(project = %signal.project, "no session marker; using defaults");
                (
                    format!("unknown-{}", stopped_at.timestamp()),
                    stopped_at - chrono::Duration::hours(1),
                )
            }
        };

        let handle = SessionHandle {
            session_id,
            project_name: signal.project.clone(),
            project_path,
            started_at,
            stopped_at,
        };
        self.evaluator.evaluate_session(&handle).await
    }

    /// Graceful shutdown: cancel pending verifications, flush the batch
    /// queue, and stop every live session cleanly.
    pub async fn shutdown(&self) {
        info!("daemon shutting down");
        self.health.cancel_verifications().await;
        self.pipeline.flush().await;
        for session in self.mux.list_active().await {
            let result = self.mux.stop(&session.project).await;
            if !result.ok {
                warn!(project = %session.project, msg = %result.msg, "session did not stop cleanly");
            }
        }
    }
}
