//! The periodic think cycle: assemble → LLM → parse → evaluate → execute
//! → publish → record.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info, warn};

use foreman_config::AiConfig;
use foreman_core::{Decision, Recommendation, ResourceProbe};
use foreman_llm::{CallOptions, GatewayError, SubprocessGateway, think_schema};
use foreman_notify::{NotificationPipeline, Tier, truncate_sms};
use foreman_state::StateStore;

use crate::context::ContextAssembler;
use crate::executor::DecisionExecutor;

const RAW_PREFIX_LIMIT: usize = 500;
const NEXT_THINK_MIN_SECS: u64 = 60;
const NEXT_THINK_MAX_SECS: u64 = 1800;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThinkOutput {
    #[serde(default)]
    recommendations: Vec<Recommendation>,
    summary: String,
    #[serde(default)]
    next_think_in: Option<u64>,
}

/// Owns the single-flight think state machine. At most one cycle (or
/// digest generation) runs at a time; re-entry is dropped, never queued.
pub struct ThinkEngine {
    gateway: Arc<SubprocessGateway>,
    assembler: Arc<ContextAssembler>,
    executor: Arc<DecisionExecutor>,
    store: Arc<StateStore>,
    resources: Arc<dyn ResourceProbe>,
    pipeline: Arc<NotificationPipeline>,
    ai: AiConfig,
    call_timeout: StdDuration,
    enabled: AtomicBool,
    thinking: AtomicBool,
    last_think_at: StdMutex<Option<DateTime<Utc>>>,
    /// One-shot delay override for the next tick, consumed by the loop.
    next_override: StdMutex<Option<StdDuration>>,
}

/// Clears the in-flight flag on every exit path.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ThinkEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway: Arc<SubprocessGateway>,
        assembler: Arc<ContextAssembler>,
        executor: Arc<DecisionExecutor>,
        store: Arc<StateStore>,
        resources: Arc<dyn ResourceProbe>,
        pipeline: Arc<NotificationPipeline>,
        ai: AiConfig,
        call_timeout: StdDuration,
    ) -> Self {
        let enabled = ai.enabled;
        Self {
            gateway,
            assembler,
            executor,
            store,
            resources,
            pipeline,
            ai,
            call_timeout,
            enabled: AtomicBool::new(enabled),
            thinking: AtomicBool::new(false),
            last_think_at: StdMutex::new(None),
            next_override: StdMutex::new(None),
        }
    }

    // ── kill switch ────────────────────────────────────────────────────────

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        info!(enabled, "ai engine toggled");
    }

    pub fn last_think_at(&self) -> Option<DateTime<Utc>> {
        *self.last_think_at.lock().expect("think state poisoned")
    }

    /// Consume the one-shot `nextThinkIn` override, if the model set one.
    pub fn take_next_override(&self) -> Option<StdDuration> {
        self.next_override.lock().expect("think state poisoned").take()
    }

    // ── think cycle ────────────────────────────────────────────────────────

    /// Run one cycle. Returns `None` when dropped before entering the
    /// Thinking state (disabled, re-entry, or resource floor).
    pub async fn think(&self) -> Option<Decision> {
        if !self.is_enabled() {
            return None;
        }
        if self
            .thinking
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("think already in flight; dropping re-entry");
            return None;
        }
        let _guard = FlightGuard(&self.thinking);

        let snapshot = self.resources.snapshot().await;
        if snapshot.free_memory_mb < self.ai.resource_limits.min_free_memory_mb {
            debug!(
                free_mb = snapshot.free_memory_mb,
                floor_mb = self.ai.resource_limits.min_free_memory_mb,
                "skipping think: below memory floor"
            );
            return None;
        }

        let decision = self.run_cycle().await;
        self.store.update(|doc| doc.push_decision(decision.clone())).await;
        *self.last_think_at.lock().expect("think state poisoned") = Some(decision.timestamp);
        Some(decision)
    }

    async fn run_cycle(&self) -> Decision {
        let started = std::time::Instant::now();
        let timestamp = Utc::now();
        let prompt = self.assembler.assemble().await;
        let opts = CallOptions {
            model: self.ai.model.clone(),
            max_turns: 1,
            json_schema: Some(think_schema()),
            timeout: self.call_timeout,
            ..Default::default()
        };

        let empty = |error: String, raw_prefix: String, prompt_length: usize, duration_ms: u64| {
            Decision {
                timestamp,
                prompt_length,
                response_raw_prefix: raw_prefix,
                recommendations: vec![],
                summary: "No summary".to_string(),
                duration_ms,
                error: Some(error),
                evaluated: vec![],
            }
        };

        let raw = match self.gateway.call_gated(&prompt, &opts).await {
            Ok(raw) => raw,
            Err(err) => {
                let kind = match &err {
                    GatewayError::Timeout(_) => "timeout".to_string(),
                    GatewayError::Exit { code, .. } => format!("exit_code_{code}"),
                    GatewayError::Spawn(_) => "exec_error".to_string(),
                };
                warn!(%err, kind, "think cycle llm failure");
                return empty(
                    kind,
                    err.to_string(),
                    prompt.len(),
                    started.elapsed().as_millis() as u64,
                );
            }
        };

        let raw_prefix: String = raw.chars().take(RAW_PREFIX_LIMIT).collect();
        let output: ThinkOutput = match serde_json::from_str(&raw) {
            Ok(output) => output,
            Err(err) => {
                // Constrained decoding should prevent this; defense in depth.
                warn!(%err, "think output failed to parse");
                return empty(
                    "parse_error".to_string(),
                    raw_prefix,
                    prompt.len(),
                    started.elapsed().as_millis() as u64,
                );
            }
        };

        let evaluated = self.executor.evaluate(&output.recommendations).await;
        for er in evaluated.iter().filter(|e| e.verdict.validated) {
            // Sequential by design: two actions from one cycle are never
            // concurrent. The matrix re-check inside execute handles
            // observe-only verdicts.
            let outcome = self.executor.execute(er).await;
            debug!(
                project = %er.rec.project,
                action = %er.rec.action(),
                executed = outcome.executed,
                "cycle action"
            );
        }

        if let Some(sms) = self
            .executor
            .format_for_sms(&evaluated, Some(&output.summary))
            .await
        {
            self.pipeline.notify(&sms, Tier::Action).await;
        }

        if let Some(secs) = output.next_think_in {
            let clamped = secs.clamp(NEXT_THINK_MIN_SECS, NEXT_THINK_MAX_SECS);
            *self.next_override.lock().expect("think state poisoned") =
                Some(StdDuration::from_secs(clamped));
        }

        Decision {
            timestamp,
            prompt_length: prompt.len(),
            response_raw_prefix: raw_prefix,
            recommendations: output.recommendations,
            summary: output.summary,
            duration_ms: started.elapsed().as_millis() as u64,
            error: None,
            evaluated,
        }
    }

    // ── digest ─────────────────────────────────────────────────────────────

    /// Human-readable overnight digest, sized for a single SMS. Shares
    /// the single-flight flag with [`think`].
    ///
    /// [`think`]: Self::think
    pub async fn generate_digest(&self) -> Option<String> {
        if self
            .thinking
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("digest dropped: think in flight");
            return None;
        }
        let _guard = FlightGuard(&self.thinking);

        let context = self.assembler.assemble().await;
        let prompt = format!(
            "{context}\n\n---\n\nWrite a short plain-text digest of the fleet for the operator: \
             what happened, what needs attention, what you plan next. No markdown, under 1200 \
             characters."
        );
        let opts = CallOptions {
            model: self.ai.model.clone(),
            max_turns: 1,
            timeout: self.call_timeout,
            ..Default::default()
        };
        match self.gateway.call_gated(&prompt, &opts).await {
            Ok(text) => Some(truncate_sms(&text)),
            Err(err) => {
                warn!(%err, "digest generation failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use foreman_config::NotificationsConfig;
    use foreman_core::{
        InboundSms, MuxDriver, MuxResult, ProjectRecord, ProjectScanner, ResourceSnapshot,
        SessionInfo, SmsTransport, UserPriorities,
    };
    use foreman_notify::QuietHours;
    use foreman_state::AutonomyState;
    use std::sync::Mutex as SyncMutex;
    use std::sync::RwLock;

    struct NullScanner;
    #[async_trait]
    impl ProjectScanner for NullScanner {
        async fn scan(&self) -> anyhow::Result<Vec<ProjectRecord>> {
            Ok(vec![ProjectRecord {
                name: "web-scraper".to_string(),
                ..Default::default()
            }])
        }
    }

    #[derive(Default)]
    struct NullMux {
        started: SyncMutex<Vec<String>>,
    }
    #[async_trait]
    impl MuxDriver for NullMux {
        async fn start(&self, project: &str, _prompt: Option<&str>) -> MuxResult {
            self.started.lock().unwrap().push(project.to_string());
            MuxResult::ok("started")
        }
        async fn stop(&self, _p: &str) -> MuxResult {
            MuxResult::ok("stopped")
        }
        async fn restart(&self, _p: &str, _prompt: Option<&str>) -> MuxResult {
            MuxResult::ok("restarted")
        }
        async fn send_input(&self, _p: &str, _i: &str) -> MuxResult {
            MuxResult::ok("")
        }
        async fn list_active(&self) -> Vec<SessionInfo> {
            vec![]
        }
        async fn capture_pane(&self, _n: &str, _m: usize) -> Option<String> {
            None
        }
    }

    struct BigMemory;
    #[async_trait]
    impl ResourceProbe for BigMemory {
        async fn snapshot(&self) -> ResourceSnapshot {
            ResourceSnapshot {
                free_memory_mb: 16_384,
                total_memory_mb: 32_768,
                load_average: 0.5,
            }
        }
    }

    struct TinyMemory;
    #[async_trait]
    impl ResourceProbe for TinyMemory {
        async fn snapshot(&self) -> ResourceSnapshot {
            ResourceSnapshot {
                free_memory_mb: 64,
                ..Default::default()
            }
        }
    }

    struct RecordingTransport {
        sent: SyncMutex<Vec<String>>,
    }
    #[async_trait]
    impl SmsTransport for RecordingTransport {
        async fn poll(&self, _last_id: i64) -> anyhow::Result<Vec<InboundSms>> {
            Ok(vec![])
        }
        async fn send(&self, text: &str) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    fn fake_llm(tag: &str, body: &str) -> (std::path::PathBuf, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!("fm-think-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let script = dir.join("fake-llm");
        std::fs::write(&script, format!("#!/bin/sh\ncat > /dev/null\n{body}\n")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        (dir, script)
    }

    struct Rig {
        engine: ThinkEngine,
        transport: Arc<RecordingTransport>,
        mux: Arc<NullMux>,
        store: Arc<StateStore>,
        _dir: tempfile::TempDir,
        script_dir: std::path::PathBuf,
    }

    impl Drop for Rig {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.script_dir);
        }
    }

    async fn rig(tag: &str, script_body: &str, level: foreman_core::AutonomyLevel) -> Rig {
        let (script_dir, script) = fake_llm(tag, script_body);
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open(dir.path().join("state.json")));
        let autonomy = Arc::new(AutonomyState::load(store.clone(), level).await);
        let mux = Arc::new(NullMux::default());
        let transport = Arc::new(RecordingTransport { sent: SyncMutex::new(vec![]) });
        let quiet = QuietHours::new(false, "22:00", "07:00", "UTC").unwrap();
        let pipeline = Arc::new(NotificationPipeline::new(
            transport.clone(),
            quiet.clone(),
            NotificationsConfig::default(),
        ));
        let resources: Arc<dyn ResourceProbe> = Arc::new(BigMemory);
        let assembler = Arc::new(ContextAssembler::new(
            Arc::new(NullScanner),
            mux.clone(),
            resources.clone(),
            store.clone(),
            Arc::new(RwLock::new(vec![])),
            Arc::new(RwLock::new(UserPriorities::default())),
            quiet,
            8_000,
        ));
        let executor = Arc::new(DecisionExecutor::new(
            mux.clone(),
            pipeline.clone(),
            store.clone(),
            autonomy,
            resources.clone(),
            AiConfig::default(),
            3,
        ));
        let gateway = Arc::new(SubprocessGateway::new(
            script.to_string_lossy().to_string(),
            2,
        ));
        let engine = ThinkEngine::new(
            gateway,
            assembler,
            executor,
            store.clone(),
            resources,
            pipeline,
            AiConfig::default(),
            StdDuration::from_secs(5),
        );
        Rig { engine, transport, mux, store, _dir: dir, script_dir }
    }

    #[tokio::test]
    async fn full_cycle_executes_and_notifies() {
        let body = r#"echo '{"recommendations":[{"project":"web-scraper","action":"start","reason":"needs work"}],"summary":"one project idle"}'"#;
        let r = rig("full", body, foreman_core::AutonomyLevel::Moderate).await;

        let decision = r.engine.think().await.unwrap();
        assert!(decision.error.is_none());
        assert_eq!(decision.recommendations.len(), 1);
        assert_eq!(decision.evaluated.len(), 1);
        assert!(decision.evaluated[0].verdict.validated);

        // the start action reached the mux
        assert_eq!(*r.mux.started.lock().unwrap(), vec!["web-scraper".to_string()]);
        // decision landed in the ring
        let doc = r.store.snapshot().await;
        assert_eq!(doc.decision_history.len(), 1);
        // and the operator heard about it
        let sent = r.transport.sent.lock().unwrap().clone();
        assert!(sent.iter().any(|m| m.contains("1. web-scraper -> start")), "{sent:?}");
    }

    /// S6: non-JSON output → parse_error decision, no recommendations,
    /// "No summary", and no SMS.
    #[tokio::test]
    async fn parse_error_yields_empty_decision_and_no_sms() {
        let r = rig("parse", "echo 'I feel great today!'", foreman_core::AutonomyLevel::Moderate)
            .await;

        let decision = r.engine.think().await.unwrap();
        assert_eq!(decision.error.as_deref(), Some("parse_error"));
        assert!(decision.recommendations.is_empty());
        assert_eq!(decision.summary, "No summary");
        assert!(r.transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn subprocess_exit_is_classified() {
        let r = rig("exit", "exit 9", foreman_core::AutonomyLevel::Moderate).await;
        let decision = r.engine.think().await.unwrap();
        assert_eq!(decision.error.as_deref(), Some("exit_code_9"));
        assert!(decision.recommendations.is_empty());
    }

    #[tokio::test]
    async fn disabled_engine_skips_cycle() {
        let r = rig("off", "echo '{}'", foreman_core::AutonomyLevel::Moderate).await;
        r.engine.set_enabled(false);
        assert!(r.engine.think().await.is_none());
        assert_eq!(r.store.snapshot().await.decision_history.len(), 0);
    }

    #[tokio::test]
    async fn memory_floor_blocks_cycle() {
        let mut r = rig("mem", "echo '{}'", foreman_core::AutonomyLevel::Moderate).await;
        r.engine.resources = Arc::new(TinyMemory);
        assert!(r.engine.think().await.is_none());
    }

    #[tokio::test]
    async fn next_think_override_is_single_use_and_clamped() {
        let body = r#"echo '{"recommendations":[],"summary":"all quiet","nextThinkIn":90}'"#;
        let r = rig("override", body, foreman_core::AutonomyLevel::Moderate).await;
        r.engine.think().await.unwrap();

        assert_eq!(r.engine.take_next_override(), Some(StdDuration::from_secs(90)));
        // consumed: second take yields nothing
        assert_eq!(r.engine.take_next_override(), None);
    }

    #[tokio::test]
    async fn single_flight_drops_concurrent_think() {
        // Slow LLM holds the flag; the second think must return None fast.
        let body = r#"sleep 1; echo '{"recommendations":[],"summary":"slow"}'"#;
        let r = Arc::new(rig("flight", body, foreman_core::AutonomyLevel::Moderate).await);

        let r2 = r.clone();
        let first = tokio::spawn(async move { r2.engine.think().await });
        tokio::time::sleep(StdDuration::from_millis(200)).await;

        let second = r.engine.think().await;
        assert!(second.is_none(), "re-entry must be dropped, not queued");

        let first = first.await.unwrap();
        assert!(first.is_some());
    }

    #[tokio::test]
    async fn digest_truncates_to_sms_size() {
        let body = format!("echo '{}'", "d".repeat(4_000));
        let r = rig("digest", &body, foreman_core::AutonomyLevel::Moderate).await;
        let digest = r.engine.generate_digest().await.unwrap();
        assert!(digest.len() <= 1_500);
        assert!(digest.ends_with("[truncated]"));
    }
}
