//! Project status scanner: one `status.md` per project directory,
//! parsed into a structured record.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use foreman_core::{ProjectRecord, ProjectScanner};

pub struct StatusScanner {
    projects_root: PathBuf,
}

impl StatusScanner {
    pub fn new(projects_root: impl Into<PathBuf>) -> Self {
        Self { projects_root: projects_root.into() }
    }
}

#[async_trait]
impl ProjectScanner for StatusScanner {
    async fn scan(&self) -> Result<Vec<ProjectRecord>> {
        let root = self.projects_root.clone();
        tokio::task::spawn_blocking(move || scan_root(&root))
            .await
            .context("scanner task panicked")?
    }
}

fn scan_root(root: &Path) -> Result<Vec<ProjectRecord>> {
    if !root.is_dir() {
        return Ok(vec![]);
    }
    let mut records = vec![];
    for entry in fs::read_dir(root).with_context(|| format!("read {}", root.display()))? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        let path = entry.path();
        let mut record = ProjectRecord {
            name,
            path: path.clone(),
            ..Default::default()
        };

        let status_path = path.join("status.md");
        if let Ok(raw) = fs::read_to_string(&status_path) {
            parse_status(&raw, &mut record);
            if let Ok(meta) = fs::metadata(&status_path) {
                if let Ok(modified) = meta.modified() {
                    record.last_activity = Some(DateTime::<Utc>::from(modified));
                }
            }
        }
        records.push(record);
    }
    records.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(records)
}

fn parse_status(raw: &str, record: &mut ProjectRecord) {
    let mut in_blockers = false;
    for line in raw.lines() {
        let trimmed = line.trim();
        let lower = trimmed.to_lowercase();

        if let Some(rest) = value_after(trimmed, &lower, "phase:") {
            record.phase = non_empty(rest);
            in_blockers = false;
        } else if let Some(rest) = value_after(trimmed, &lower, "progress:") {
            record.progress = non_empty(rest);
            in_blockers = false;
        } else if let Some(rest) = value_after(trimmed, &lower, "note:") {
            record.note = non_empty(rest);
            in_blockers = false;
        } else if let Some(rest) = value_after(trimmed, &lower, "blockers:") {
            in_blockers = true;
            if let Some(inline) = non_empty(rest) {
                record.blockers.push(inline);
            }
        } else if lower.starts_with("status:") {
            record.needs_attention = lower.contains("needs-attention");
            in_blockers = false;
        } else if in_blockers {
            if let Some(item) = trimmed.strip_prefix("- ") {
                record.blockers.push(item.trim().to_string());
            } else if !trimmed.is_empty() {
                in_blockers = false;
            }
        }
    }
}

fn value_after<'a>(raw: &'a str, lower: &str, prefix: &str) -> Option<&'a str> {
    lower.starts_with(prefix).then(|| raw[prefix.len()..].trim())
}

fn non_empty(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_project(root: &Path, name: &str, status: Option<&str>) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        if let Some(status) = status {
            fs::write(dir.join("status.md"), status).unwrap();
        }
    }

    #[tokio::test]
    async fn parses_full_status_document() {
        let root = tempfile::tempdir().unwrap();
        write_project(
            root.path(),
            "web-scraper",
            Some(
                "# web-scraper\n\
                 Phase: building\n\
                 Progress: 60%\n\
                 Status: needs-attention\n\
                 Blockers:\n\
                 - waiting on API key\n\
                 - rate limits unclear\n\
                 Note: prioritize the crawler\n",
            ),
        );

        let records = StatusScanner::new(root.path()).scan().await.unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.name, "web-scraper");
        assert_eq!(record.phase.as_deref(), Some("building"));
        assert_eq!(record.progress.as_deref(), Some("60%"));
        assert!(record.needs_attention);
        assert_eq!(record.blockers.len(), 2);
        assert_eq!(record.blockers[0], "waiting on API key");
        assert_eq!(record.note.as_deref(), Some("prioritize the crawler"));
        assert!(record.last_activity.is_some());
    }

    #[tokio::test]
    async fn project_without_status_file_still_appears() {
        let root = tempfile::tempdir().unwrap();
        write_project(root.path(), "bare", None);

        let records = StatusScanner::new(root.path()).scan().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "bare");
        assert!(records[0].phase.is_none());
        assert!(!records[0].needs_attention);
    }

    #[tokio::test]
    async fn hidden_directories_and_files_are_skipped() {
        let root = tempfile::tempdir().unwrap();
        write_project(root.path(), ".git", None);
        write_project(root.path(), "real", None);
        fs::write(root.path().join("stray.txt"), "not a project").unwrap();

        let records = StatusScanner::new(root.path()).scan().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "real");
    }

    #[tokio::test]
    async fn records_are_sorted_and_root_may_be_missing() {
        let root = tempfile::tempdir().unwrap();
        write_project(root.path(), "zeta", None);
        write_project(root.path(), "alpha", None);
        let records = StatusScanner::new(root.path()).scan().await.unwrap();
        let names: Vec<&str> = records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["alpha", "zeta"]);

        let missing = StatusScanner::new(root.path().join("nope"));
        assert!(missing.scan().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn blocker_list_ends_at_next_section() {
        let root = tempfile::tempdir().unwrap();
        write_project(
            root.path(),
            "api",
            Some("Blockers:\n- one\nPhase: testing\n- stray dash line\n"),
        );
        let records = StatusScanner::new(root.path()).scan().await.unwrap();
        assert_eq!(records[0].blockers, vec!["one".to_string()]);
        assert_eq!(records[0].phase.as_deref(), Some("testing"));
    }
}
