//! The remediation state machine over probe results.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use foreman_config::{HealthConfig, ServiceConfig};
use foreman_core::{AutonomyLevel, HealthResult, HealthStatus, ProbeKind};
use foreman_notify::{NotificationPipeline, Tier};
use foreman_state::AutonomyState;

/// One probe's verdict, before failure accounting.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub status: HealthStatus,
    pub latency_ms: u64,
    pub error: Option<String>,
    pub details: Option<String>,
}

/// Result of a restart attempt.
#[derive(Debug, Clone)]
pub struct RestartOutcome {
    pub ok: bool,
    pub message: String,
}

/// Probing and restarting, injected so the state machine is testable
/// without sockets or subprocesses.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, service: &ServiceConfig, kind: ProbeKind) -> ProbeOutcome;
    async fn restart(&self, service: &ServiceConfig, kind: ProbeKind) -> RestartOutcome;
}

struct ControllerState {
    results: HashMap<String, HealthResult>,
    last_probe: HashMap<String, DateTime<Utc>>,
    /// UTC timestamps of restart attempts inside the trailing window.
    restarts: Vec<DateTime<Utc>>,
    /// Rising-edge latch for the correlated-failure guard.
    correlated_alerted: bool,
    verifications: Vec<JoinHandle<()>>,
}

pub struct HealthController {
    services: Vec<(ServiceConfig, ProbeKind)>,
    config: HealthConfig,
    prober: Arc<dyn Prober>,
    autonomy: Arc<AutonomyState>,
    pipeline: Arc<NotificationPipeline>,
    /// Snapshot shared with the context assembler.
    snapshot: Arc<RwLock<Vec<HealthResult>>>,
    state: Mutex<ControllerState>,
}

impl HealthController {
    pub fn new(
        config: HealthConfig,
        prober: Arc<dyn Prober>,
        autonomy: Arc<AutonomyState>,
        pipeline: Arc<NotificationPipeline>,
        snapshot: Arc<RwLock<Vec<HealthResult>>>,
    ) -> Self {
        let services = config
            .services
            .iter()
            .filter_map(|service| match parse_kind(&service.kind) {
                Some(kind) => Some((service.clone(), kind)),
                None => {
                    warn!(name = %service.name, kind = %service.kind, "unknown probe kind; service ignored");
                    None
                }
            })
            .collect();
        Self {
            services,
            config,
            prober,
            autonomy,
            pipeline,
            snapshot,
            state: Mutex::new(ControllerState {
                results: HashMap::new(),
                last_probe: HashMap::new(),
                restarts: vec![],
                correlated_alerted: false,
                verifications: vec![],
            }),
        }
    }

    /// One scan step: probe every service whose interval has elapsed,
    /// update failure counters, then run remediation.
    pub async fn scan(&self) {
        self.scan_at(Utc::now()).await;
    }

    pub async fn scan_at(&self, now: DateTime<Utc>) {
        if !self.config.enabled {
            return;
        }

        let due: Vec<&(ServiceConfig, ProbeKind)> = {
            let state = self.state.lock().await;
            self.services
                .iter()
                .filter(|(service, _)| {
                    state
                        .last_probe
                        .get(&service.name)
                        .is_none_or(|last| {
                            (now - *last).num_milliseconds() >= service.interval_ms as i64
                        })
                })
                .collect()
        };
        if due.is_empty() {
            return;
        }

        // http/tcp tolerate fanout; process/container probes shell out to
        // tools that do not.
        let (parallel, sequential): (Vec<_>, Vec<_>) = due
            .into_iter()
            .partition(|(_, kind)| matches!(kind, ProbeKind::Http | ProbeKind::Tcp));

        let mut outcomes: Vec<(String, ProbeKind, ProbeOutcome)> = join_all(
            parallel.iter().map(|(service, kind)| async move {
                (service.name.clone(), *kind, self.prober.probe(service, *kind).await)
            }),
        )
        .await;
        for (service, kind) in sequential {
            outcomes.push((
                service.name.clone(),
                *kind,
                self.prober.probe(service, *kind).await,
            ));
        }

        {
            let mut state = self.state.lock().await;
            for (name, kind, outcome) in outcomes {
                state.last_probe.insert(name.clone(), now);
                let consecutive_fails = match outcome.status {
                    HealthStatus::Up => 0,
                    HealthStatus::Down => {
                        state
                            .results
                            .get(&name)
                            .map(|r| r.consecutive_fails)
                            .unwrap_or(0)
                            + 1
                    }
                };
                state.results.insert(
                    name.clone(),
                    HealthResult {
                        name,
                        kind,
                        status: outcome.status,
                        latency_ms: outcome.latency_ms,
                        error: outcome.error,
                        consecutive_fails,
                        last_checked: now,
                        details: outcome.details,
                    },
                );
            }
            let mut published: Vec<HealthResult> = state.results.values().cloned().collect();
            published.sort_by(|a, b| a.name.cmp(&b.name));
            *self.snapshot.write().expect("health snapshot poisoned") = published;
        }

        self.process_results(now).await;
    }

    /// Current results, sorted by name.
    pub async fn results(&self) -> Vec<HealthResult> {
        let state = self.state.lock().await;
        let mut results: Vec<HealthResult> = state.results.values().cloned().collect();
        results.sort_by(|a, b| a.name.cmp(&b.name));
        results
    }

    /// Abort pending post-restart verifications (shutdown path).
    pub async fn cancel_verifications(&self) {
        let mut state = self.state.lock().await;
        for handle in state.verifications.drain(..) {
            handle.abort();
        }
    }

    async fn process_results(&self, now: DateTime<Utc>) {
        let threshold = self.config.consecutive_fails_before_alert;

        let (failing, correlated_was_alerted) = {
            let state = self.state.lock().await;
            let failing: Vec<HealthResult> = state
                .results
                .values()
                .filter(|r| r.status == HealthStatus::Down && r.consecutive_fails >= threshold)
                .cloned()
                .collect();
            (failing, state.correlated_alerted)
        };

        // Correlated-failure guard: a host-wide event must not trigger a
        // cascade of restart attempts.
        if failing.len() >= self.config.correlated_failure_threshold {
            if !correlated_was_alerted {
                let mut names: Vec<&str> = failing.iter().map(|r| r.name.as_str()).collect();
                names.sort();
                self.pipeline
                    .notify(
                        &format!(
                            "INFRASTRUCTURE EVENT: {} services failing simultaneously ({}). \
                             Holding all restarts.",
                            failing.len(),
                            names.join(", ")
                        ),
                        Tier::Urgent,
                    )
                    .await;
                self.state.lock().await.correlated_alerted = true;
            }
            return;
        }
        if correlated_was_alerted {
            self.state.lock().await.correlated_alerted = false;
        }

        // Edge-triggered per-service handling: act only at the exact
        // crossing, not on every subsequent down tick.
        let crossing: Vec<HealthResult> = {
            let state = self.state.lock().await;
            state
                .results
                .values()
                .filter(|r| r.status == HealthStatus::Down && r.consecutive_fails == threshold)
                .cloned()
                .collect()
        };

        for result in crossing {
            self.remediate(&result, now).await;
        }
    }

    async fn remediate(&self, result: &HealthResult, now: DateTime<Utc>) {
        let Some((service, kind)) = self
            .services
            .iter()
            .find(|(s, _)| s.name == result.name)
            .cloned()
        else {
            return;
        };

        let level = self.autonomy.current();
        let autonomy_ok = matches!(level, AutonomyLevel::Moderate | AutonomyLevel::Full);
        let budget_ok = {
            let mut state = self.state.lock().await;
            let window_start = now - Duration::hours(1);
            state.restarts.retain(|ts| *ts > window_start);
            state.restarts.len() < self.config.restart_budget.max_per_hour
        };

        if !autonomy_ok || !budget_ok || !service.restartable {
            let reason = if !autonomy_ok {
                format!("autonomy level {level} does not permit restarts")
            } else if !budget_ok {
                format!(
                    "restart budget exhausted ({}/hour)",
                    self.config.restart_budget.max_per_hour
                )
            } else {
                "no restart procedure configured".to_string()
            };
            self.pipeline
                .notify(
                    &format!(
                        "{} is DOWN ({} consecutive fails) — not restarting: {reason}",
                        result.name, result.consecutive_fails
                    ),
                    Tier::Urgent,
                )
                .await;
            return;
        }

        {
            let mut state = self.state.lock().await;
            state.restarts.push(now);
        }
        info!(service = %service.name, "attempting automatic restart");
        let outcome = self.prober.restart(&service, kind).await;
        if !outcome.ok {
            self.pipeline
                .notify(
                    &format!("Restart of {} FAILED: {}", service.name, outcome.message),
                    Tier::Urgent,
                )
                .await;
            return;
        }

        self.schedule_verification(service, kind).await;
    }

    /// Re-probe after the verification delay: recovered → tier-3 summary,
    /// still down → tier-1 escalation.
    async fn schedule_verification(&self, service: ServiceConfig, kind: ProbeKind) {
        let prober = self.prober.clone();
        let pipeline = self.pipeline.clone();
        let delay = std::time::Duration::from_millis(self.config.verify_delay_ms);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let outcome = prober.probe(&service, kind).await;
            match outcome.status {
                HealthStatus::Up => {
                    pipeline
                        .notify(
                            &format!("SERVICE RECOVERED: {} is back up after restart", service.name),
                            Tier::Summary,
                        )
                        .await;
                }
                HealthStatus::Down => {
                    pipeline
                        .notify(
                            &format!(
                                "{} is STILL DOWN after restart — manual intervention needed",
                                service.name
                            ),
                            Tier::Urgent,
                        )
                        .await;
                }
            }
        });
        self.state.lock().await.verifications.push(handle);
    }
}

fn parse_kind(raw: &str) -> Option<ProbeKind> {
    match raw.trim().to_lowercase().as_str() {
        "http" => Some(ProbeKind::Http),
        "tcp" => Some(ProbeKind::Tcp),
        "process" => Some(ProbeKind::Process),
        "container" => Some(ProbeKind::Container),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_config::{NotificationsConfig, RestartBudgetConfig};
    use foreman_core::{InboundSms, SmsTransport};
    use foreman_notify::QuietHours;
    use foreman_state::StateStore;
    use std::sync::Mutex as StdMutex;

    struct ScriptedProber {
        /// service name → up?
        up: StdMutex<HashMap<String, bool>>,
        restarts: StdMutex<Vec<String>>,
        restart_heals: bool,
    }

    impl ScriptedProber {
        fn new(restart_heals: bool) -> Arc<Self> {
            Arc::new(Self {
                up: StdMutex::new(HashMap::new()),
                restarts: StdMutex::new(vec![]),
                restart_heals,
            })
        }
        fn set_up(&self, name: &str, up: bool) {
            self.up.lock().unwrap().insert(name.to_string(), up);
        }
        fn restarted(&self) -> Vec<String> {
            self.restarts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn probe(&self, service: &ServiceConfig, _kind: ProbeKind) -> ProbeOutcome {
            let up = self
                .up
                .lock()
                .unwrap()
                .get(&service.name)
                .copied()
                .unwrap_or(true);
            ProbeOutcome {
                status: if up { HealthStatus::Up } else { HealthStatus::Down },
                latency_ms: 5,
                error: (!up).then(|| "connection refused".to_string()),
                details: None,
            }
        }
        async fn restart(&self, service: &ServiceConfig, _kind: ProbeKind) -> RestartOutcome {
            self.restarts.lock().unwrap().push(service.name.clone());
            if self.restart_heals {
                self.set_up(&service.name, true);
            }
            RestartOutcome { ok: true, message: "restarted".to_string() }
        }
    }

    struct RecordingTransport {
        sent: StdMutex<Vec<String>>,
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

    fn service(name: &str, restartable: bool) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            kind: "http".to_string(),
            url: Some(format!("http://localhost/{name}")),
            interval_ms: 0, // always due
            restartable,
            ..Default::default()
        }
    }

    struct Rig {
        controller: HealthController,
        prober: Arc<ScriptedProber>,
        transport: Arc<RecordingTransport>,
        pipeline: Arc<NotificationPipeline>,
        _dir: tempfile::TempDir,
    }

    async fn rig(
        services: Vec<ServiceConfig>,
        level: AutonomyLevel,
        restart_heals: bool,
        max_per_hour: usize,
    ) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open(dir.path().join("state.json")));
        let autonomy = Arc::new(AutonomyState::load(store, level).await);
        let transport = Arc::new(RecordingTransport { sent: StdMutex::new(vec![]) });
        let pipeline = Arc::new(NotificationPipeline::new(
            transport.clone(),
            QuietHours::new(false, "22:00", "07:00", "UTC").unwrap(),
            NotificationsConfig::default(),
        ));
        let prober = ScriptedProber::new(restart_heals);
        let config = HealthConfig {
            enabled: true,
            services,
            consecutive_fails_before_alert: 3,
            correlated_failure_threshold: 3,
            restart_budget: RestartBudgetConfig { max_per_hour },
            verify_delay_ms: 30,
            probe_timeout_ms: 1_000,
        };
        let controller = HealthController::new(
            config,
            prober.clone(),
            autonomy,
            pipeline.clone(),
            Arc::new(RwLock::new(vec![])),
        );
        Rig { controller, prober, transport, pipeline, _dir: dir }
    }

    fn sent(rig: &Rig) -> Vec<String> {
        rig.transport.sent.lock().unwrap().clone()
    }

    async fn ticks(rig: &Rig, base: DateTime<Utc>, n: usize) {
        for i in 0..n {
            rig.controller
                .scan_at(base + Duration::seconds(60 * i as i64))
                .await;
        }
    }

    #[tokio::test]
    async fn consecutive_fails_reset_on_recovery() {
        let r = rig(vec![service("api", true)], AutonomyLevel::Observe, false, 2).await;
        let base = Utc::now();
        r.prober.set_up("api", false);
        ticks(&r, base, 2).await;
        assert_eq!(r.controller.results().await[0].consecutive_fails, 2);

        r.prober.set_up("api", true);
        r.controller.scan_at(base + Duration::seconds(180)).await;
        let result = &r.controller.results().await[0];
        assert_eq!(result.status, HealthStatus::Up);
        assert_eq!(result.consecutive_fails, 0);
    }

    /// Property 5: a down service triggers remediation exactly once per
    /// threshold crossing.
    #[tokio::test]
    async fn restart_is_edge_triggered() {
        let r = rig(vec![service("api", true)], AutonomyLevel::Moderate, false, 10).await;
        r.prober.set_up("api", false);
        ticks(&r, Utc::now(), 6).await;
        // crossing happened at tick 3 only
        assert_eq!(r.prober.restarted(), vec!["api".to_string()]);
    }

    /// S4: three simultaneous failures → one INFRASTRUCTURE EVENT, zero
    /// restarts.
    #[tokio::test]
    async fn correlated_failure_holds_all_restarts() {
        let r = rig(
            vec![service("a", true), service("b", true), service("c", true)],
            AutonomyLevel::Full,
            false,
            10,
        )
        .await;
        for name in ["a", "b", "c"] {
            r.prober.set_up(name, false);
        }
        ticks(&r, Utc::now(), 4).await;

        assert!(r.prober.restarted().is_empty(), "no restart during a correlated event");
        let messages = sent(&r);
        let count = messages.iter().filter(|m| m.contains("INFRASTRUCTURE EVENT")).count();
        assert_eq!(count, 1, "exactly one alert: {messages:?}");
        let body = messages
            .into_iter()
            .find(|m| m.contains("INFRASTRUCTURE EVENT"))
            .unwrap();
        for name in ["a", "b", "c"] {
            assert!(body.contains(name));
        }
    }

    #[tokio::test]
    async fn two_down_services_alert_individually() {
        let r = rig(
            vec![service("a", false), service("b", false), service("c", false)],
            AutonomyLevel::Observe,
            false,
            2,
        )
        .await;
        r.prober.set_up("a", false);
        r.prober.set_up("b", false);
        ticks(&r, Utc::now(), 3).await;

        let messages = sent(&r);
        assert!(!messages.iter().any(|m| m.contains("INFRASTRUCTURE EVENT")));
        assert!(messages.iter().any(|m| m.contains("a is DOWN")));
        assert!(messages.iter().any(|m| m.contains("b is DOWN")));
    }

    #[tokio::test]
    async fn observe_level_refuses_restart_with_reason() {
        let r = rig(vec![service("api", true)], AutonomyLevel::Observe, false, 2).await;
        r.prober.set_up("api", false);
        ticks(&r, Utc::now(), 3).await;

        assert!(r.prober.restarted().is_empty());
        assert!(
            sent(&r)
                .iter()
                .any(|m| m.contains("not restarting") && m.contains("autonomy level"))
        );
    }

    /// Property 4: never more than max_per_hour restarts in the window.
    #[tokio::test]
    async fn restart_budget_is_enforced() {
        let services: Vec<ServiceConfig> =
            ["a", "b", "c", "d"].iter().map(|n| service(n, true)).collect();
        let r = rig(services, AutonomyLevel::Full, false, 2).await;
        let base = Utc::now();

        // stagger the failures so each crosses the threshold alone
        for (i, name) in ["a", "b", "c", "d"].iter().enumerate() {
            r.prober.set_up(name, false);
            ticks(&r, base + Duration::seconds(300 * i as i64), 3).await;
            r.prober.set_up(name, true);
            r.controller
                .scan_at(base + Duration::seconds(300 * i as i64 + 200))
                .await;
        }

        assert_eq!(r.prober.restarted().len(), 2, "budget of 2/hour must cap restarts");
        assert!(sent(&r).iter().any(|m| m.contains("restart budget exhausted")));
    }

    #[tokio::test]
    async fn verification_reports_recovery() {
        let r = rig(vec![service("api", true)], AutonomyLevel::Full, true, 5).await;
        r.prober.set_up("api", false);
        ticks(&r, Utc::now(), 3).await;
        assert_eq!(r.prober.restarted(), vec!["api".to_string()]);

        // verification fires after verify_delay_ms (30 ms in tests); the
        // tier-3 recovery note batches, so flush before asserting
        tokio::time::sleep(std::time::Duration::from_millis(120)).await;
        r.pipeline.flush().await;
        assert!(sent(&r).iter().any(|m| m.contains("SERVICE RECOVERED: api")));
    }

    #[tokio::test]
    async fn verification_escalates_when_still_down() {
        let r = rig(vec![service("api", true)], AutonomyLevel::Full, false, 5).await;
        r.prober.set_up("api", false);
        ticks(&r, Utc::now(), 3).await;

        tokio::time::sleep(std::time::Duration::from_millis(120)).await;
        assert!(sent(&r).iter().any(|m| m.contains("STILL DOWN after restart")));
    }

    #[tokio::test]
    async fn respects_per_service_interval() {
        let mut svc = service("api", false);
        svc.interval_ms = 120_000;
        let r = rig(vec![svc], AutonomyLevel::Observe, false, 2).await;
        let base = Utc::now();
        r.controller.scan_at(base).await;
        r.controller.scan_at(base + Duration::seconds(60)).await;

        // only the first scan probed; the second was inside the interval
        let result = &r.controller.results().await[0];
        assert_eq!(result.last_checked, base);
    }
}
