//! LLM-as-judge scoring of finished sessions, with a git-derived
//! fallback when the judge is unavailable.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use foreman_core::{EvalOutcome, GitInspector, GitProgress, MuxDriver, SessionEvaluation};
use foreman_llm::{CallOptions, SubprocessGateway, evaluation_schema};
use foreman_state::StateStore;

const PANE_CAPTURE_BYTES: usize = 4_000;
const TRANSCRIPT_TAIL_CHARS: usize = 2_000;

/// Identity of a session that just ended.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session_id: String,
    pub project_name: String,
    pub project_path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub stopped_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct JudgeOutput {
    score: u8,
    recommendation: EvalOutcome,
    #[serde(default)]
    accomplishments: Vec<String>,
    #[serde(default)]
    failures: Vec<String>,
    #[serde(default)]
    reasoning: String,
}

pub struct SessionEvaluator {
    gateway: Arc<SubprocessGateway>,
    mux: Arc<dyn MuxDriver>,
    git: Arc<dyn GitInspector>,
    store: Arc<StateStore>,
    model: String,
    call_timeout: StdDuration,
}

impl SessionEvaluator {
    pub fn new(
        gateway: Arc<SubprocessGateway>,
        mux: Arc<dyn MuxDriver>,
        git: Arc<dyn GitInspector>,
        store: Arc<StateStore>,
        model: String,
        call_timeout: StdDuration,
    ) -> Self {
        Self { gateway, mux, git, store, model, call_timeout }
    }

    /// Score a finished session: pane tail + git progress → judge prompt
    /// under constrained decoding. Persists to the project's
    /// `.orchestrator/evaluation.json` and the evaluation ring.
    pub async fn evaluate_session(&self, handle: &SessionHandle) -> SessionEvaluation {
        let pane = self
            .mux
            .capture_pane(&format!("fm-{}", handle.project_name), PANE_CAPTURE_BYTES)
            .await
            .unwrap_or_default();
        let transcript = tail_chars(&strip_ansi(&pane), TRANSCRIPT_TAIL_CHARS);
        let progress = self
            .git
            .progress_since(&handle.project_path, handle.started_at)
            .await;

        let prompt = judge_prompt(handle, &progress, &transcript);
        let opts = CallOptions {
            model: self.model.clone(),
            max_turns: 1,
            json_schema: Some(evaluation_schema()),
            timeout: self.call_timeout,
            ..Default::default()
        };

        let judged: Option<JudgeOutput> = match self.gateway.call_gated(&prompt, &opts).await {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(output) => Some(output),
                Err(err) => {
                    warn!(%err, project = %handle.project_name, "judge output failed to parse");
                    None
                }
            },
            Err(err) => {
                warn!(%err, project = %handle.project_name, "judge llm call failed");
                None
            }
        };

        let evaluation = match judged {
            Some(output) => SessionEvaluation {
                session_id: handle.session_id.clone(),
                project_name: handle.project_name.clone(),
                started_at: handle.started_at,
                stopped_at: handle.stopped_at,
                duration_minutes: (handle.stopped_at - handle.started_at).num_minutes(),
                git_progress: progress,
                score: output.score.clamp(1, 5),
                recommendation: output.recommendation,
                accomplishments: output.accomplishments,
                failures: output.failures,
                reasoning: output.reasoning,
                evaluated_at: Utc::now(),
            },
            None => self.fallback_evaluation(handle, progress),
        };

        self.persist_project_local(handle, &evaluation).await;
        self.store
            .update(|doc| doc.push_evaluation(evaluation.clone()))
            .await;
        evaluation
    }

    /// Commit-count heuristic used when the judge is unreachable:
    /// 0 commits → 1, 1–2 → 3, more → 4.
    fn fallback_evaluation(
        &self,
        handle: &SessionHandle,
        progress: GitProgress,
    ) -> SessionEvaluation {
        let score = match progress.commit_count {
            0 => 1,
            1 | 2 => 3,
            _ => 4,
        };
        let recommendation = if progress.commit_count == 0 {
            EvalOutcome::Retry
        } else {
            EvalOutcome::Continue
        };
        SessionEvaluation {
            session_id: handle.session_id.clone(),
            project_name: handle.project_name.clone(),
            started_at: handle.started_at,
            stopped_at: handle.stopped_at,
            duration_minutes: (handle.stopped_at - handle.started_at).num_minutes(),
            git_progress: progress,
            score,
            recommendation,
            accomplishments: vec![],
            failures: vec![],
            reasoning: "judge unavailable; scored from git activity".to_string(),
            evaluated_at: Utc::now(),
        }
    }

    async fn persist_project_local(&self, handle: &SessionHandle, evaluation: &SessionEvaluation) {
        let dir = handle.project_path.join(".orchestrator");
        let path = dir.join("evaluation.json");
        let result: anyhow::Result<()> = async {
            tokio::fs::create_dir_all(&dir).await?;
            let raw = serde_json::to_vec_pretty(evaluation)?;
            tokio::fs::write(&path, raw).await?;
            Ok(())
        }
        .await;
        if let Err(err) = result {
            warn!(?err, path = %path.display(), "evaluation persist failed");
        }
    }
}

fn judge_prompt(handle: &SessionHandle, progress: &GitProgress, transcript: &str) -> String {
    let git_line = if progress.no_git {
        "not a git repository".to_string()
    } else {
        format!(
            "{} commits, +{}/-{} across {} files{}",
            progress.commit_count,
            progress.insertions,
            progress.deletions,
            progress.files_changed,
            progress
                .last_commit_message
                .as_deref()
                .map(|m| format!(", last: \"{m}\""))
                .unwrap_or_default()
        )
    };
    format!(
        "You are judging a finished autonomous coding session.\n\n\
         Scoring rubric:\n\
         1 - no useful progress; session stalled, looped, or broke the build\n\
         2 - minor motion but nothing durable; no commits worth keeping\n\
         3 - some real progress; at least one meaningful commit, work remains\n\
         4 - solid progress; several coherent commits toward the goal\n\
         5 - the stated goal is complete and committed\n\n\
         Evidence:\n\
         Project: {project}\n\
         Duration: {minutes} minutes\n\
         Git since session start: {git_line}\n\n\
         Transcript tail:\n{transcript}\n\n\
         Score the session and recommend continue, retry, escalate, or complete.",
        project = handle.project_name,
        minutes = (handle.stopped_at - handle.started_at).num_minutes(),
    )
}

fn strip_ansi(text: &str) -> String {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    let re = ANSI.get_or_init(|| {
        Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").expect("static ansi regex")
    });
    re.replace_all(text, "").to_string()
}

fn tail_chars(text: &str, n: usize) -> String {
    let count = text.chars().count();
    if count <= n {
        return text.to_string();
    }
    text.chars().skip(count - n).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use foreman_core::{MuxResult, SessionInfo};
    use std::path::Path;

    struct PaneMux(String);
    #[async_trait]
    impl MuxDriver for PaneMux {
        async fn start(&self, _p: &str, _prompt: Option<&str>) -> MuxResult {
            MuxResult::ok("")
        }
        async fn stop(&self, _p: &str) -> MuxResult {
            MuxResult::ok("")
        }
        async fn restart(&self, _p: &str, _prompt: Option<&str>) -> MuxResult {
            MuxResult::ok("")
        }
        async fn send_input(&self, _p: &str, _i: &str) -> MuxResult {
            MuxResult::ok("")
        }
        async fn list_active(&self) -> Vec<SessionInfo> {
            vec![]
        }
        async fn capture_pane(&self, _n: &str, _m: usize) -> Option<String> {
            Some(self.0.clone())
        }
    }

    struct FixedGit(GitProgress);
    #[async_trait]
    impl GitInspector for FixedGit {
        async fn progress_since(&self, _dir: &Path, _since: DateTime<Utc>) -> GitProgress {
            self.0.clone()
        }
    }

    fn fake_llm(tag: &str, body: &str) -> (std::path::PathBuf, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!("fm-eval-{tag}-{}", std::process::id()));
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

    fn handle(project_path: PathBuf) -> SessionHandle {
        let stopped = Utc::now();
        SessionHandle {
            session_id: "sess-1".to_string(),
            project_name: "api".to_string(),
            project_path,
            started_at: stopped - chrono::Duration::minutes(90),
            stopped_at: stopped,
        }
    }

    fn evaluator(
        script: &Path,
        commits: u32,
        store: Arc<StateStore>,
    ) -> SessionEvaluator {
        SessionEvaluator::new(
            Arc::new(SubprocessGateway::new(script.to_string_lossy().to_string(), 2)),
            Arc::new(PaneMux("\x1b[32mtests passing\x1b[0m".to_string())),
            Arc::new(FixedGit(GitProgress {
                commit_count: commits,
                insertions: 10,
                deletions: 2,
                files_changed: 3,
                last_commit_message: Some("add pagination".to_string()),
                no_git: false,
            })),
            store,
            "sonnet".to_string(),
            StdDuration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn judge_verdict_is_recorded_and_persisted() {
        let body = r#"echo '{"score":4,"recommendation":"continue","accomplishments":["pagination"],"failures":[],"reasoning":"good commits"}'"#;
        let (script_dir, script) = fake_llm("ok", body);
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open(dir.path().join("state.json")));
        let eval = evaluator(&script, 3, store.clone());

        let handle = handle(dir.path().to_path_buf());
        let result = eval.evaluate_session(&handle).await;
        assert_eq!(result.score, 4);
        assert_eq!(result.recommendation, EvalOutcome::Continue);
        assert_eq!(result.accomplishments, vec!["pagination".to_string()]);
        assert_eq!(result.duration_minutes, 90);

        // project-local file and the ring both carry the evaluation
        let local = dir.path().join(".orchestrator/evaluation.json");
        assert!(local.exists());
        let doc = store.snapshot().await;
        assert_eq!(doc.evaluation_history.len(), 1);
        assert_eq!(doc.evaluation_history[0].project_name, "api");
        let _ = std::fs::remove_dir_all(&script_dir);
    }

    #[tokio::test]
    async fn fallback_scores_from_commit_count() {
        let cases = [(0u32, 1u8, EvalOutcome::Retry), (2, 3, EvalOutcome::Continue), (5, 4, EvalOutcome::Continue)];
        for (commits, expected_score, expected_rec) in cases {
            let (script_dir, script) = fake_llm(&format!("fb{commits}"), "exit 1");
            let dir = tempfile::tempdir().unwrap();
            let store = Arc::new(StateStore::open(dir.path().join("state.json")));
            let eval = evaluator(&script, commits, store);

            let result = eval.evaluate_session(&handle(dir.path().to_path_buf())).await;
            assert_eq!(result.score, expected_score, "commits={commits}");
            assert_eq!(result.recommendation, expected_rec);
            assert!(result.reasoning.contains("judge unavailable"));
            let _ = std::fs::remove_dir_all(&script_dir);
        }
    }

    #[test]
    fn ansi_sequences_are_stripped() {
        let colored = "\x1b[1;32mPASS\x1b[0m all \x1b[2Ktests";
        assert_eq!(strip_ansi(colored), "PASS all tests");
    }

    #[test]
    fn tail_keeps_the_last_n_chars() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("ab", 5), "ab");
    }
}
