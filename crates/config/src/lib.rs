use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CooldownConfig {
    /// Same (project, action) pair may not repeat within this window.
    pub same_action_ms: i64,
    /// Any action on the same project may not repeat within this window.
    pub same_project_ms: i64,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            same_action_ms: 300_000,
            same_project_ms: 600_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimitsConfig {
    pub min_free_memory_mb: u64,
}

impl Default for ResourceLimitsConfig {
    fn default() -> Self {
        Self { min_free_memory_mb: 512 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    /// Maximum non-urgent SMS per local calendar day.
    pub daily_budget: u32,
    pub batch_interval_ms: u64,
    pub urgent_bypass_quiet: bool,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            daily_budget: 20,
            batch_interval_ms: 4 * 60 * 60 * 1000,
            urgent_bypass_quiet: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub enabled: bool,
    pub model: String,
    /// Config-default level; overridden by the persisted runtime level.
    pub autonomy_level: String,
    pub protected_projects: Vec<String>,
    pub cooldowns: CooldownConfig,
    pub dedup_ttl_ms: i64,
    pub resource_limits: ResourceLimitsConfig,
    pub max_error_retries: u32,
    pub max_prompt_length: usize,
    pub think_interval_ms: u64,
    pub notifications: NotificationsConfig,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: "sonnet".to_string(),
            autonomy_level: "observe".to_string(),
            protected_projects: vec![],
            cooldowns: CooldownConfig::default(),
            dedup_ttl_ms: 3_600_000,
            resource_limits: ResourceLimitsConfig::default(),
            max_error_retries: 3,
            max_prompt_length: 8_000,
            think_interval_ms: 5 * 60 * 1000,
            notifications: NotificationsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    pub max_concurrent: usize,
    /// Directory containing one subdirectory per managed project.
    pub projects_root: String,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            projects_root: "./projects".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuietHoursConfig {
    pub enabled: bool,
    /// "HH:MM", local to `timezone`.
    pub start: String,
    pub end: String,
    /// IANA zone name; empty means the host's zone.
    pub timezone: String,
}

impl Default for QuietHoursConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            start: "22:00".to_string(),
            end: "07:00".to_string(),
            timezone: "America/New_York".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DigestConfig {
    pub enabled: bool,
    pub cron: String,
    /// IANA zone name; empty means the host's zone.
    pub timezone: String,
}

impl Default for DigestConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cron: "0 0 8 * * *".to_string(),
            timezone: "America/New_York".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartBudgetConfig {
    pub max_per_hour: usize,
}

impl Default for RestartBudgetConfig {
    fn default() -> Self {
        Self { max_per_hour: 2 }
    }
}

/// One monitored service. `kind` selects which of the optional fields are
/// meaningful: `url` for http, `host`/`port` for tcp, `label` for process,
/// `containers` for container probes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub kind: String,
    pub url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub label: Option<String>,
    pub containers: Vec<String>,
    pub interval_ms: u64,
    /// Whether the controller knows how to restart this service.
    pub restartable: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: "http".to_string(),
            url: None,
            host: None,
            port: None,
            label: None,
            containers: vec![],
            interval_ms: 60_000,
            restartable: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,
    pub services: Vec<ServiceConfig>,
    pub consecutive_fails_before_alert: u32,
    pub correlated_failure_threshold: usize,
    pub restart_budget: RestartBudgetConfig,
    pub verify_delay_ms: u64,
    pub probe_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            services: vec![],
            consecutive_fails_before_alert: 3,
            correlated_failure_threshold: 3,
            restart_budget: RestartBudgetConfig::default(),
            verify_delay_ms: 30_000,
            probe_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustThreshold {
    pub min_sessions: u64,
    pub min_avg_score: f64,
    pub min_days_at_level: f64,
}

impl Default for TrustThreshold {
    fn default() -> Self {
        Self {
            min_sessions: 10,
            min_avg_score: 3.5,
            min_days_at_level: 7.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TrustThresholds {
    pub cautious_to_moderate: TrustThreshold,
    pub moderate_to_full: TrustThreshold,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TrustConfig {
    pub thresholds: TrustThresholds,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmsConfig {
    /// Base URL of the HTTP SMS gateway.
    pub gateway_url: String,
    pub from_number: String,
    pub to_number: String,
    pub poll_interval_ms: u64,
    /// Hard per-message cap before the transport chunks.
    pub max_chunk: usize,
}

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            gateway_url: "http://localhost:9100".to_string(),
            from_number: String::new(),
            to_number: String::new(),
            poll_interval_ms: 5_000,
            max_chunk: 1_500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Name of the constrained-decoding chat CLI on $PATH.
    pub binary: String,
    pub max_concurrent_calls: usize,
    pub default_timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            max_concurrent_calls: 2,
            default_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub state_dir: String,
    pub scan_interval_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_dir: ".foreman".to_string(),
            scan_interval_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ForemanConfig {
    pub ai: AiConfig,
    pub sessions: SessionsConfig,
    pub quiet_hours: QuietHoursConfig,
    pub morning_digest: DigestConfig,
    pub evening_digest: DigestConfig,
    pub weekly_revenue: DigestConfig,
    pub health: HealthConfig,
    pub trust: TrustConfig,
    pub sms: SmsConfig,
    pub llm: LlmConfig,
    pub daemon: DaemonConfig,
}

impl ForemanConfig {
    /// Load from a TOML file; missing file yields the defaults so a fresh
    /// checkout runs without any configuration step.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = toml::to_string_pretty(self).context("serialize config")?;
        fs::write(path, raw).with_context(|| format!("write config {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ForemanConfig::default();
        assert_eq!(config.ai.model, "sonnet");
        assert_eq!(config.ai.autonomy_level, "observe");
        assert_eq!(config.ai.cooldowns.same_action_ms, 300_000);
        assert_eq!(config.ai.cooldowns.same_project_ms, 600_000);
        assert_eq!(config.ai.dedup_ttl_ms, 3_600_000);
        assert_eq!(config.ai.notifications.daily_budget, 20);
        assert!(config.ai.notifications.urgent_bypass_quiet);
        assert_eq!(config.health.restart_budget.max_per_hour, 2);
        assert_eq!(config.health.correlated_failure_threshold, 3);
        assert_eq!(config.llm.max_concurrent_calls, 2);
        assert_eq!(config.llm.default_timeout_ms, 30_000);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = ForemanConfig::load_from("/nonexistent/foreman.toml").unwrap();
        assert_eq!(config.ai.model, "sonnet");
    }

    #[test]
    fn partial_toml_keeps_defaults_for_rest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foreman.toml");
        fs::write(
            &path,
            r#"
[ai]
model = "opus"
protected_projects = ["billing"]

[quiet_hours]
start = "23:00"
"#,
        )
        .unwrap();

        let config = ForemanConfig::load_from(&path).unwrap();
        assert_eq!(config.ai.model, "opus");
        assert_eq!(config.ai.protected_projects, vec!["billing".to_string()]);
        // untouched sections keep defaults
        assert_eq!(config.ai.cooldowns.same_action_ms, 300_000);
        assert_eq!(config.quiet_hours.start, "23:00");
        assert_eq!(config.quiet_hours.end, "07:00");
    }

    #[test]
    fn save_and_reload_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.toml");
        let mut config = ForemanConfig::default();
        config.ai.autonomy_level = "moderate".to_string();
        config.health.services.push(ServiceConfig {
            name: "api".to_string(),
            kind: "http".to_string(),
            url: Some("http://localhost:8080/health".to_string()),
            restartable: true,
            ..Default::default()
        });
        config.save_to(&path).unwrap();

        let back = ForemanConfig::load_from(&path).unwrap();
        assert_eq!(back.ai.autonomy_level, "moderate");
        assert_eq!(back.health.services.len(), 1);
        assert_eq!(back.health.services[0].name, "api");
    }
}
