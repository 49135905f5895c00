//! Subprocess gateway to the external constrained-decoding chat CLI.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::semaphore::FairSemaphore;

const STDERR_CAPTURE_LIMIT: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Json => "json",
        }
    }
}

/// Per-call options. `max_turns` is always passed; supplying a
/// `json_schema` forces JSON output and enables constrained decoding.
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub model: String,
    pub max_turns: u32,
    pub output_format: OutputFormat,
    pub json_schema: Option<serde_json::Value>,
    pub timeout: Duration,
    /// Opaque tool allowlist forwarded verbatim to the subprocess.
    pub allowed_tools: Vec<String>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            model: "sonnet".to_string(),
            max_turns: 1,
            output_format: OutputFormat::Text,
            json_schema: None,
            timeout: Duration::from_secs(30),
            allowed_tools: vec![],
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("llm call timed out after {0} ms")]
    Timeout(u64),
    #[error("llm exited with status {code}: {stderr}")]
    Exit { code: i32, stderr: String },
    #[error("failed to run llm subprocess: {0}")]
    Spawn(#[from] std::io::Error),
}

impl GatewayError {
    /// Wire-level kind string recorded in Decision/Execution logs.
    pub fn kind(&self) -> String {
        match self {
            Self::Timeout(_) => "ETIMEDOUT".to_string(),
            Self::Exit { code, .. } => format!("EXIT_{code}"),
            Self::Spawn(_) => "EEXEC".to_string(),
        }
    }
}

/// Bounded-concurrency invoker of the external LLM CLI.
///
/// The prompt travels on stdin and the response on stdout; a non-zero
/// exit carries captured stderr. Non-interactive calls never receive a
/// permissions-escape flag — that is reserved for the interactive mux
/// sessions, which do not go through this gateway.
pub struct SubprocessGateway {
    binary: String,
    semaphore: FairSemaphore,
}

impl SubprocessGateway {
    pub fn new(binary: impl Into<String>, max_concurrent: usize) -> Self {
        Self {
            binary: binary.into(),
            semaphore: FairSemaphore::new(max_concurrent),
        }
    }

    /// Direct call, bypassing the concurrency gate. Prefer [`call_gated`]
    /// everywhere outside of startup probes.
    ///
    /// [`call_gated`]: Self::call_gated
    pub async fn call(&self, prompt: &str, opts: &CallOptions) -> Result<String, GatewayError> {
        self.run(prompt, opts).await
    }

    /// Acquire a semaphore slot, then call. The slot is released on every
    /// path, including timeout, via the permit's drop.
    pub async fn call_gated(&self, prompt: &str, opts: &CallOptions) -> Result<String, GatewayError> {
        let _permit = self.semaphore.acquire().await;
        self.run(prompt, opts).await
    }

    /// In-flight call count.
    pub fn active_calls(&self) -> usize {
        self.semaphore.active()
    }

    /// Callers queued for a slot.
    pub fn pending_calls(&self) -> usize {
        self.semaphore.pending()
    }

    async fn run(&self, prompt: &str, opts: &CallOptions) -> Result<String, GatewayError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--model").arg(&opts.model);
        cmd.arg("--max-turns").arg(opts.max_turns.to_string());

        // A schema implies constrained JSON decoding regardless of the
        // requested format.
        let format = if opts.json_schema.is_some() {
            OutputFormat::Json
        } else {
            opts.output_format
        };
        cmd.arg("--output-format").arg(format.as_str());

        if let Some(ref schema) = opts.json_schema {
            // argv is passed directly to exec — no shell, no escaping
            // hazards with embedded quotes in the schema document.
            cmd.arg("--json-schema").arg(schema.to_string());
        }
        for tool in &opts.allowed_tools {
            cmd.arg("--allowedTools").arg(tool);
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(binary = %self.binary, model = %opts.model, prompt_len = prompt.len(), "llm call");

        let mut child = cmd.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(prompt.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let timeout_ms = opts.timeout.as_millis() as u64;
        let output = match tokio::time::timeout(opts.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_elapsed) => {
                // kill_on_drop reaps the abandoned child.
                warn!(timeout_ms, "llm call timed out");
                return Err(GatewayError::Timeout(timeout_ms));
            }
        };

        if !output.status.success() {
            let mut stderr = String::from_utf8_lossy(&output.stderr).to_string();
            stderr.truncate(floor_char_boundary(&stderr, STDERR_CAPTURE_LIMIT));
            return Err(GatewayError::Exit {
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}
