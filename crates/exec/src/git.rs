//! Commit/diff introspection via libgit2, used for session evaluation.
//!
//! Best-effort: a directory that is not a repository yields
//! `no_git = true`; any other git error degrades to zeroed counts
//! rather than failing the evaluation.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use git2::{Repository, Sort};
use tracing::debug;

use foreman_core::{GitInspector, GitProgress};

pub struct Git2Inspector;

#[async_trait]
impl GitInspector for Git2Inspector {
    async fn progress_since(&self, dir: &Path, since: DateTime<Utc>) -> GitProgress {
        let dir = dir.to_path_buf();
        tokio::task::spawn_blocking(move || inspect(&dir, since))
            .await
            .unwrap_or_default()
    }
}

fn inspect(dir: &Path, since: DateTime<Utc>) -> GitProgress {
    let Ok(repo) = Repository::discover(dir) else {
        return GitProgress { no_git: true, ..Default::default() };
    };

    let new_commits = match commits_since(&repo, since) {
        Ok(commits) => commits,
        Err(err) => {
            debug!(?err, dir = %dir.display(), "revwalk failed");
            return GitProgress::default();
        }
    };
    if new_commits.is_empty() {
        return GitProgress::default();
    }

    let last_commit_message = repo
        .find_commit(new_commits[0])
        .ok()
        .and_then(|c| c.summary().map(str::to_string));

    let oldest_new = new_commits[new_commits.len() - 1];
    let (insertions, deletions, files_changed) =
        diff_stats(&repo, oldest_new).unwrap_or((0, 0, 0));

    GitProgress {
        commit_count: new_commits.len() as u32,
        insertions,
        deletions,
        files_changed,
        last_commit_message,
        no_git: false,
    }
}

/// Commit ids newer than `since`, newest first.
fn commits_since(repo: &Repository, since: DateTime<Utc>) -> Result<Vec<git2::Oid>, git2::Error> {
    let mut walk = repo.revwalk()?;
    walk.set_sorting(Sort::TIME)?;
    walk.push_head()?;

    let cutoff = since.timestamp();
    let mut commits = vec![];
    for oid in walk {
        let oid = oid?;
        let commit = repo.find_commit(oid)?;
        if commit.time().seconds() < cutoff {
            // TIME sort: everything after this is older too
            break;
        }
        commits.push(oid);
    }
    Ok(commits)
}

/// Aggregate diff between the oldest new commit's parent and HEAD.
fn diff_stats(
    repo: &Repository,
    oldest_new: git2::Oid,
) -> Result<(u32, u32, u32), git2::Error> {
    let oldest = repo.find_commit(oldest_new)?;
    let base_tree = match oldest.parent(0) {
        Ok(parent) => Some(parent.tree()?),
        // the session's first commit is the repository root
        Err(_) => None,
    };
    let head_tree = repo.head()?.peel_to_commit()?.tree()?;
    let diff = repo.diff_tree_to_tree(base_tree.as_ref(), Some(&head_tree), None)?;
    let stats = diff.stats()?;
    Ok((
        stats.insertions() as u32,
        stats.deletions() as u32,
        stats.files_changed() as u32,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Signature;
    use std::fs;

    fn commit_file(repo: &Repository, name: &str, content: &str, message: &str) {
        let workdir = repo.workdir().unwrap();
        fs::write(workdir.join(name), content).unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new(name)).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = Signature::now("test", "test@localhost").unwrap();
        let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
            .unwrap();
    }

    #[tokio::test]
    async fn non_repo_directory_reports_no_git() {
        let dir = tempfile::tempdir().unwrap();
        let progress = Git2Inspector
            .progress_since(dir.path(), Utc::now() - chrono::Duration::hours(1))
            .await;
        assert!(progress.no_git);
        assert_eq!(progress.commit_count, 0);
    }

    #[tokio::test]
    async fn counts_commits_and_diff_since_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        commit_file(&repo, "a.txt", "one\n", "first");
        commit_file(&repo, "b.txt", "two\nlines\n", "add b");

        let progress = Git2Inspector
            .progress_since(dir.path(), Utc::now() - chrono::Duration::hours(1))
            .await;
        assert!(!progress.no_git);
        assert_eq!(progress.commit_count, 2);
        assert_eq!(progress.last_commit_message.as_deref(), Some("add b"));
        assert_eq!(progress.files_changed, 2);
        assert!(progress.insertions >= 3);
    }

    #[tokio::test]
    async fn commits_before_the_cutoff_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        commit_file(&repo, "a.txt", "one\n", "old work");

        let progress = Git2Inspector
            .progress_since(dir.path(), Utc::now() + chrono::Duration::hours(1))
            .await;
        assert!(!progress.no_git);
        assert_eq!(progress.commit_count, 0);
    }
}
