//! Real probe and restart implementations.
//!
//! http: any response at all counts as up — a 500 still means the
//! process is serving. tcp: a completed connect. process: the launchd
//! catalog lists a PID for the label. container: every configured
//! container name appears with a running-state marker in `docker ps`.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use foreman_config::ServiceConfig;
use foreman_core::{HealthStatus, ProbeKind};

use crate::controller::{ProbeOutcome, Prober, RestartOutcome};

pub struct SystemProber {
    http: reqwest::Client,
    timeout: Duration,
}

impl SystemProber {
    pub fn new(timeout_ms: u64) -> Self {
        let timeout = Duration::from_millis(timeout_ms);
        Self {
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            timeout,
        }
    }

    async fn probe_http(&self, service: &ServiceConfig) -> ProbeOutcome {
        let Some(url) = service.url.as_deref() else {
            return down(0, "no url configured");
        };
        let started = Instant::now();
        match self.http.get(url).send().await {
            // Any HTTP response, 4xx/5xx included, means the service is
            // answering.
            Ok(response) => ProbeOutcome {
                status: HealthStatus::Up,
                latency_ms: started.elapsed().as_millis() as u64,
                error: None,
                details: Some(format!("http {}", response.status().as_u16())),
            },
            Err(err) => down(started.elapsed().as_millis() as u64, &err.to_string()),
        }
    }

    async fn probe_tcp(&self, service: &ServiceConfig) -> ProbeOutcome {
        let host = service.host.as_deref().unwrap_or("127.0.0.1");
        let Some(port) = service.port else {
            return down(0, "no port configured");
        };
        let started = Instant::now();
        let connect = tokio::net::TcpStream::connect((host, port));
        match tokio::time::timeout(self.timeout, connect).await {
            Ok(Ok(_stream)) => ProbeOutcome {
                status: HealthStatus::Up,
                latency_ms: started.elapsed().as_millis() as u64,
                error: None,
                details: None,
            },
            Ok(Err(err)) => down(started.elapsed().as_millis() as u64, &err.to_string()),
            Err(_elapsed) => down(self.timeout.as_millis() as u64, "connect timeout"),
        }
    }

    async fn probe_process(&self, service: &ServiceConfig) -> ProbeOutcome {
        let Some(label) = service.label.as_deref() else {
            return down(0, "no process label configured");
        };
        let started = Instant::now();
        let output = tokio::process::Command::new("launchctl")
            .args(["list", label])
            .output()
            .await;
        let latency = started.elapsed().as_millis() as u64;
        match output {
            Ok(out) if out.status.success() => {
                let stdout = String::from_utf8_lossy(&out.stdout);
                match extract_pid(&stdout) {
                    Some(pid) => ProbeOutcome {
                        status: HealthStatus::Up,
                        latency_ms: latency,
                        error: None,
                        details: Some(format!("pid {pid}")),
                    },
                    None => down(latency, "label listed without a pid"),
                }
            }
            Ok(out) => down(
                latency,
                String::from_utf8_lossy(&out.stderr).trim(),
            ),
            Err(err) => down(latency, &err.to_string()),
        }
    }

    async fn probe_container(&self, service: &ServiceConfig) -> ProbeOutcome {
        if service.containers.is_empty() {
            return down(0, "no containers configured");
        }
        let started = Instant::now();
        let output = tokio::process::Command::new("docker")
            .args(["ps", "--format", "{{.Names}} {{.Status}}"])
            .output()
            .await;
        let latency = started.elapsed().as_millis() as u64;
        match output {
            Ok(out) if out.status.success() => {
                let stdout = String::from_utf8_lossy(&out.stdout);
                let missing: Vec<&str> = service
                    .containers
                    .iter()
                    .map(String::as_str)
                    .filter(|name| !container_running(&stdout, name))
                    .collect();
                if missing.is_empty() {
                    ProbeOutcome {
                        status: HealthStatus::Up,
                        latency_ms: latency,
                        error: None,
                        details: Some(format!("{} containers running", service.containers.len())),
                    }
                } else {
                    down(latency, &format!("not running: {}", missing.join(", ")))
                }
            }
            Ok(out) => down(latency, String::from_utf8_lossy(&out.stderr).trim()),
            Err(err) => down(latency, &err.to_string()),
        }
    }
}

#[async_trait]
impl Prober for SystemProber {
    async fn probe(&self, service: &ServiceConfig, kind: ProbeKind) -> ProbeOutcome {
        debug!(name = %service.name, %kind, "probing");
        match kind {
            ProbeKind::Http => self.probe_http(service).await,
            ProbeKind::Tcp => self.probe_tcp(service).await,
            ProbeKind::Process => self.probe_process(service).await,
            ProbeKind::Container => self.probe_container(service).await,
        }
    }

    async fn restart(&self, service: &ServiceConfig, kind: ProbeKind) -> RestartOutcome {
        let result = match kind {
            ProbeKind::Process => {
                let Some(label) = service.label.as_deref() else {
                    return RestartOutcome { ok: false, message: "no label".to_string() };
                };
                tokio::process::Command::new("launchctl")
                    .args(["kickstart", "-k", label])
                    .output()
                    .await
            }
            ProbeKind::Container => {
                // restart the first container that is not running
                let target = match self.probe_container(service).await.error {
                    Some(err) => err
                        .strip_prefix("not running: ")
                        .and_then(|names| names.split(", ").next().map(str::to_string)),
                    None => None,
                }
                .or_else(|| service.containers.first().cloned());
                let Some(name) = target else {
                    return RestartOutcome { ok: false, message: "no container to restart".to_string() };
                };
                tokio::process::Command::new("docker")
                    .args(["restart", &name])
                    .output()
                    .await
            }
            ProbeKind::Http | ProbeKind::Tcp => {
                return RestartOutcome {
                    ok: false,
                    message: format!("no restart procedure for {kind} probes"),
                };
            }
        };

        match result {
            Ok(out) if out.status.success() => {
                RestartOutcome { ok: true, message: "restart issued".to_string() }
            }
            Ok(out) => RestartOutcome {
                ok: false,
                message: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            },
            Err(err) => RestartOutcome { ok: false, message: err.to_string() },
        }
    }
}

fn down(latency_ms: u64, error: &str) -> ProbeOutcome {
    ProbeOutcome {
        status: HealthStatus::Down,
        latency_ms,
        error: Some(error.to_string()),
        details: None,
    }
}

/// `launchctl list <label>` prints a plist-ish block with a `"PID" = 123;`
/// line when the job is running.
fn extract_pid(output: &str) -> Option<u32> {
    for line in output.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("\"PID\"") {
            let digits: String = rest.chars().filter(|c| c.is_ascii_digit()).collect();
            if let Ok(pid) = digits.parse() {
                return Some(pid);
            }
        }
    }
    None
}

fn container_running(ps_output: &str, name: &str) -> bool {
    ps_output.lines().any(|line| {
        let mut parts = line.splitn(2, ' ');
        let line_name = parts.next().unwrap_or_default();
        let status = parts.next().unwrap_or_default();
        line_name == name && status.starts_with("Up")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_extraction_from_launchctl_block() {
        let output = "{\n\t\"LimitLoadToSessionType\" = \"System\";\n\t\"PID\" = 4321;\n\t\"Program\" = \"/usr/local/bin/api\";\n};";
        assert_eq!(extract_pid(output), Some(4321));
    }

    #[test]
    fn pid_absent_when_job_is_loaded_but_dead() {
        let output = "{\n\t\"LastExitStatus\" = 256;\n\t\"Program\" = \"/usr/local/bin/api\";\n};";
        assert_eq!(extract_pid(output), None);
    }

    #[test]
    fn container_running_requires_up_status() {
        let ps = "api-db Up 3 hours\napi-web Restarting (1) 2 seconds ago\n";
        assert!(container_running(ps, "api-db"));
        assert!(!container_running(ps, "api-web"));
        assert!(!container_running(ps, "missing"));
    }

    #[tokio::test]
    async fn tcp_probe_reports_refused_connection() {
        let prober = SystemProber::new(500);
        let service = ServiceConfig {
            name: "dead".to_string(),
            kind: "tcp".to_string(),
            host: Some("127.0.0.1".to_string()),
            // reserved port that nothing listens on in CI
            port: Some(1),
            ..Default::default()
        };
        let outcome = prober.probe(&service, ProbeKind::Tcp).await;
        assert_eq!(outcome.status, HealthStatus::Down);
        assert!(outcome.error.is_some());
    }

    #[tokio::test]
    async fn tcp_probe_detects_live_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let prober = SystemProber::new(500);
        let service = ServiceConfig {
            name: "live".to_string(),
            kind: "tcp".to_string(),
            host: Some("127.0.0.1".to_string()),
            port: Some(port),
            ..Default::default()
        };
        let outcome = prober.probe(&service, ProbeKind::Tcp).await;
        assert_eq!(outcome.status, HealthStatus::Up);
    }
}
