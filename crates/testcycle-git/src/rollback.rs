use async_trait::async_trait;
use git2::build::CheckoutBuilder;
use git2::{ErrorCode, Repository, Tree};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use testcycle_executor::{ExecutorConfig, ExecutorError, RollbackHandler};
use tracing::{debug, info, warn};

use crate::{ChangeCapture, GitError, WorkdirSnapshot};

/// What a rollback did, with paths relative to the repository root
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreSummary {
    /// Files written back to their pre-fix or `HEAD` content
    pub restored: Vec<PathBuf>,
    /// Files absent before the fix, deleted from the working tree
    pub removed: Vec<PathBuf>,
    /// Listed files that exist neither on disk, before the fix, nor at `HEAD`
    pub missing: Vec<PathBuf>,
}

impl RestoreSummary {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Reverts the files a fix touched.
///
/// With a shared [`ChangeCapture`], files dirty before the most recent fix get
/// their pre-fix content back, and only files that were clean go back to
/// `HEAD`. Without one, every file goes back to `HEAD`.
#[derive(Debug, Clone, Default)]
pub struct GitRollback {
    capture: Option<Arc<ChangeCapture>>,
}

impl GitRollback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore to the baseline `capture` recorded before the most recent fix
    pub fn with_baseline(capture: Arc<ChangeCapture>) -> Self {
        Self {
            capture: Some(capture),
        }
    }

    /// Restore `files` (absolute, or relative to `working_dir`).
    pub fn restore(
        &self,
        working_dir: &Path,
        files: &[PathBuf],
    ) -> Result<RestoreSummary, GitError> {
        let mut summary = RestoreSummary::default();
        if files.is_empty() {
            return Ok(summary);
        }

        let repo = Repository::discover(working_dir)?;
        let raw_workdir = repo
            .workdir()
            .ok_or_else(|| GitError::NotARepo(working_dir.display().to_string()))?
            .to_path_buf();
        let workdir = raw_workdir.canonicalize()?;
        let working_dir = working_dir.canonicalize()?;

        let baseline = self.baseline_for(&workdir);
        let head_tree = match repo.head() {
            Ok(head) => Some(head.peel_to_tree()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(GitError::GitOperationFailed(e)),
        };

        let mut index = repo.index()?;
        let mut checkout = CheckoutBuilder::new();
        checkout.force().disable_pathspec_match(true);
        let mut from_head = false;

        for file in files {
            let rel = relative_to_repo(
                &[workdir.as_path(), raw_workdir.as_path()],
                &working_dir,
                file,
            )?;
            let full = workdir.join(&rel);

            match baseline.as_ref().and_then(|b| b.entry(&rel)) {
                Some(Some(blob)) => {
                    let blob = repo.find_blob(blob)?;
                    if let Some(parent) = full.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(&full, blob.content())?;
                    summary.restored.push(rel);
                }
                Some(None) => {
                    // Deleted before the fix
                    if full.exists() {
                        fs::remove_file(&full)?;
                    }
                    summary.removed.push(rel);
                }
                None if in_tree(head_tree.as_ref(), &rel) => {
                    checkout.path(rel.as_path());
                    from_head = true;
                    summary.restored.push(rel);
                }
                None => {
                    let staged = index.get_path(&rel, 0).is_some();
                    if staged {
                        index.remove_path(&rel)?;
                    }
                    if full.exists() {
                        fs::remove_file(&full)?;
                        summary.removed.push(rel);
                    } else if !staged {
                        summary.missing.push(rel);
                    }
                }
            }
        }
        index.write()?;

        if from_head {
            repo.checkout_head(Some(&mut checkout))?;
        }

        if !summary.is_complete() {
            warn!(missing = ?summary.missing, "Rollback could not resolve some files");
        }
        info!(
            restored = summary.restored.len(),
            removed = summary.removed.len(),
            missing = summary.missing.len(),
            "Rolled back fix changes"
        );
        Ok(summary)
    }

    fn baseline_for(&self, workdir: &Path) -> Option<WorkdirSnapshot> {
        self.capture
            .as_ref()
            .and_then(|c| c.last_baseline())
            .filter(|b| b.workdir() == workdir)
    }
}

fn in_tree(tree: Option<&Tree<'_>>, rel: &Path) -> bool {
    tree.is_some_and(|t| t.get_path(rel).is_ok())
}

fn relative_to_repo(
    workdirs: &[&Path],
    working_dir: &Path,
    file: &Path,
) -> Result<PathBuf, GitError> {
    let full = if file.is_absolute() {
        file.to_path_buf()
    } else {
        working_dir.join(file)
    };
    workdirs
        .iter()
        .find_map(|root| full.strip_prefix(root).ok())
        .map(Path::to_path_buf)
        .ok_or_else(|| GitError::OutsideRepository(full.display().to_string()))
}

#[async_trait]
impl RollbackHandler for GitRollback {
    fn name(&self) -> &str {
        "git"
    }

    async fn revert(
        &self,
        files: &[PathBuf],
        config: &ExecutorConfig,
    ) -> Result<bool, ExecutorError> {
        debug!(files = files.len(), "Reverting files touched by the last fix");
        self.restore(&config.working_dir, files)
            .map(|summary| summary.is_complete())
            .map_err(|e| ExecutorError::ExecutionFailed(format!("Git rollback failed: {}", e)))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use git2::Signature;
    use tempfile::TempDir;
    use testcycle_executor::ChangeTracker;

    /// A repository with `files` committed on `HEAD`
    pub(crate) fn init_repo(files: &[(&str, &str)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let mut index = repo.index().unwrap();
        for (name, content) in files {
            let path = dir.path().join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
            index.add_path(Path::new(name)).unwrap();
        }
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = Signature::now("test", "test@example.com").unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
            .unwrap();
        dir
    }

    #[test]
    fn test_restore_reverts_tracked_and_removes_new_files() {
        let dir = init_repo(&[("lib.rs", "fn ok() {}\n")]);
        fs::write(dir.path().join("lib.rs"), "fn broken( {}\n").unwrap();
        fs::write(dir.path().join("extra.rs"), "// new\n").unwrap();

        let summary = GitRollback::new()
            .restore(
                dir.path(),
                &[PathBuf::from("lib.rs"), PathBuf::from("extra.rs")],
            )
            .unwrap();

        assert_eq!(summary.restored, vec![PathBuf::from("lib.rs")]);
        assert_eq!(summary.removed, vec![PathBuf::from("extra.rs")]);
        assert_eq!(
            fs::read_to_string(dir.path().join("lib.rs")).unwrap(),
            "fn ok() {}\n"
        );
        assert!(!dir.path().join("extra.rs").exists());
    }

    #[test]
    fn test_restore_leaves_unlisted_files_alone() {
        let dir = init_repo(&[("a.rs", "a\n"), ("b.rs", "b\n")]);
        fs::write(dir.path().join("a.rs"), "a changed\n").unwrap();
        fs::write(dir.path().join("b.rs"), "b changed\n").unwrap();

        GitRollback::new()
            .restore(dir.path(), &[PathBuf::from("a.rs")])
            .unwrap();

        assert_eq!(fs::read_to_string(dir.path().join("a.rs")).unwrap(), "a\n");
        assert_eq!(
            fs::read_to_string(dir.path().join("b.rs")).unwrap(),
            "b changed\n"
        );
    }

    #[test]
    fn test_restore_recreates_deleted_file() {
        let dir = init_repo(&[("gone.rs", "keep me\n")]);
        fs::remove_file(dir.path().join("gone.rs")).unwrap();

        GitRollback::new()
            .restore(dir.path(), &[dir.path().join("gone.rs")])
            .unwrap();

        assert_eq!(
            fs::read_to_string(dir.path().join("gone.rs")).unwrap(),
            "keep me\n"
        );
    }

    /// Run one fix under `capture`, returning the files it reports
    fn apply_fix(
        capture: &ChangeCapture,
        working_dir: &Path,
        edit: impl FnOnce(),
    ) -> Vec<PathBuf> {
        capture.begin(working_dir);
        edit();
        capture.changed_files(working_dir)
    }

    #[test]
    fn test_rollback_keeps_earlier_fix_to_same_file() {
        let dir = init_repo(&[("lib.rs", "v0\n")]);
        let lib = dir.path().join("lib.rs");
        let capture = Arc::new(ChangeCapture::new());
        let rollback = GitRollback::with_baseline(capture.clone());

        apply_fix(&capture, dir.path(), || fs::write(&lib, "v0\nfixA\n").unwrap());
        let files = apply_fix(&capture, dir.path(), || {
            fs::write(&lib, "v0\nfixA\nbadB\n").unwrap()
        });

        let summary = rollback.restore(dir.path(), &files).unwrap();

        assert_eq!(summary.restored, vec![PathBuf::from("lib.rs")]);
        assert_eq!(fs::read_to_string(&lib).unwrap(), "v0\nfixA\n");
    }

    #[test]
    fn test_rollback_restores_each_file_to_its_pre_fix_state() {
        let dir = init_repo(&[("a.rs", "a0\n"), ("b.rs", "b0\n")]);
        let root = dir.path();
        let capture = Arc::new(ChangeCapture::new());
        let rollback = GitRollback::with_baseline(capture.clone());

        // First fix: edits a.rs, adds helper.rs, deletes b.rs
        apply_fix(&capture, root, || {
            fs::write(root.join("a.rs"), "a1\n").unwrap();
            fs::write(root.join("helper.rs"), "h1\n").unwrap();
            fs::remove_file(root.join("b.rs")).unwrap();
        });
        // Second fix touches all of them plus a new file
        let files = apply_fix(&capture, root, || {
            fs::write(root.join("a.rs"), "a2\n").unwrap();
            fs::write(root.join("helper.rs"), "h2\n").unwrap();
            fs::write(root.join("b.rs"), "b2\n").unwrap();
            fs::write(root.join("extra.rs"), "x2\n").unwrap();
        });
        assert_eq!(files.len(), 4);

        let summary = rollback.restore(root, &files).unwrap();

        assert!(summary.is_complete());
        assert_eq!(fs::read_to_string(root.join("a.rs")).unwrap(), "a1\n");
        assert_eq!(fs::read_to_string(root.join("helper.rs")).unwrap(), "h1\n");
        assert!(!root.join("b.rs").exists());
        assert!(!root.join("extra.rs").exists());
    }

    #[test]
    fn test_rollback_from_subdirectory_restores_file() {
        let dir = init_repo(&[("sub/a.rs", "orig\n")]);
        let sub = dir.path().join("sub");
        let capture = Arc::new(ChangeCapture::new());
        let rollback = GitRollback::with_baseline(capture.clone());

        let files = apply_fix(&capture, &sub, || {
            fs::write(sub.join("a.rs"), "broken\n").unwrap()
        });
        let summary = rollback.restore(&sub, &files).unwrap();

        assert_eq!(summary.restored, vec![PathBuf::from("sub/a.rs")]);
        assert_eq!(fs::read_to_string(sub.join("a.rs")).unwrap(), "orig\n");
    }

    #[test]
    fn test_relative_paths_resolve_against_working_dir() {
        let dir = init_repo(&[("sub/a.rs", "orig\n")]);
        let sub = dir.path().join("sub");
        fs::write(sub.join("a.rs"), "broken\n").unwrap();

        let summary = GitRollback::new()
            .restore(&sub, &[PathBuf::from("a.rs")])
            .unwrap();

        assert_eq!(summary.restored, vec![PathBuf::from("sub/a.rs")]);
        assert_eq!(fs::read_to_string(sub.join("a.rs")).unwrap(), "orig\n");
    }

    #[test]
    fn test_unresolvable_file_is_reported_missing() {
        let dir = init_repo(&[("sub/a.rs", "orig\n")]);
        let summary = GitRollback::new()
            .restore(dir.path(), &[PathBuf::from("sub/sub/a.rs")])
            .unwrap();

        assert_eq!(summary.missing, vec![PathBuf::from("sub/sub/a.rs")]);
        assert!(!summary.is_complete());
    }

    #[tokio::test]
    async fn test_revert_fails_when_a_file_cannot_be_resolved() {
        let dir = init_repo(&[("lib.rs", "ok\n")]);
        fs::write(dir.path().join("lib.rs"), "bad\n").unwrap();
        let config = ExecutorConfig::new(dir.path().to_path_buf());

        let reverted = GitRollback::new()
            .revert(&[PathBuf::from("lib.rs"), PathBuf::from("nowhere.rs")], &config)
            .await
            .unwrap();

        assert!(!reverted);
        assert_eq!(fs::read_to_string(dir.path().join("lib.rs")).unwrap(), "ok\n");
    }

    #[test]
    fn test_restore_rejects_paths_outside_repository() {
        let dir = init_repo(&[("a.rs", "a\n")]);
        let result = GitRollback::new().restore(dir.path(), &[PathBuf::from("/etc/hosts")]);
        assert!(matches!(result, Err(GitError::OutsideRepository(_))));
    }

    #[tokio::test]
    async fn test_revert_empty_list_needs_no_repository() {
        let dir = TempDir::new().unwrap();
        let config = ExecutorConfig::new(dir.path().to_path_buf());
        assert!(GitRollback::new().revert(&[], &config).await.unwrap());
    }

    #[tokio::test]
    async fn test_revert_reports_success() {
        let dir = init_repo(&[("lib.rs", "ok\n")]);
        fs::write(dir.path().join("lib.rs"), "bad\n").unwrap();
        let config = ExecutorConfig::new(dir.path().to_path_buf());

        let reverted = GitRollback::new()
            .revert(&[PathBuf::from("lib.rs")], &config)
            .await
            .unwrap();

        assert!(reverted);
        assert_eq!(fs::read_to_string(dir.path().join("lib.rs")).unwrap(), "ok\n");
    }
}
