use git2::{Oid, Repository, StatusOptions};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use testcycle_executor::ChangeTracker;
use tracing::{debug, warn};

use crate::GitError;

/// Dirty files of a working tree, with their content saved as blobs in the
/// repository's object database so it can be written back later.
///
/// A `None` blob means the file is deleted in the working tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkdirSnapshot {
    workdir: PathBuf,
    entries: BTreeMap<PathBuf, Option<Oid>>,
}

impl WorkdirSnapshot {
    /// Capture the dirty files of the repository containing `working_dir`
    pub fn capture(working_dir: &Path) -> Result<Self, GitError> {
        let repo = Repository::discover(working_dir)?;
        let workdir = repo
            .workdir()
            .ok_or_else(|| GitError::NotARepo(working_dir.display().to_string()))?
            .canonicalize()?;

        let mut opts = StatusOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let statuses = repo.statuses(Some(&mut opts))?;

        let mut entries = BTreeMap::new();
        for entry in statuses.iter() {
            let Some(path) = entry.path() else {
                continue;
            };
            let st = entry.status();
            if st.is_ignored() {
                continue;
            }

            let full = workdir.join(path);
            let blob = if st.is_wt_deleted() || !full.exists() {
                None
            } else if full.is_dir() {
                continue;
            } else {
                Some(repo.blob_path(&full)?)
            };
            entries.insert(PathBuf::from(path), blob);
        }

        debug!(dirty = entries.len(), "Captured working tree snapshot");
        Ok(Self { workdir, entries })
    }

    /// Root of the captured working tree
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// State of `rel` (relative to the repository root) at capture time.
    ///
    /// `None` means the file was clean, `Some(None)` that it was deleted.
    pub fn entry(&self, rel: &Path) -> Option<Option<Oid>> {
        self.entries.get(rel).copied()
    }

    /// Paths, relative to the repository root, whose state differs between
    /// `self` (before) and `after`.
    pub fn changed_since(&self, after: &WorkdirSnapshot) -> Vec<PathBuf> {
        let mut changed: Vec<PathBuf> = after
            .entries
            .iter()
            .filter(|(path, blob)| self.entries.get(*path) != Some(*blob))
            .map(|(path, _)| path.clone())
            .collect();

        // Dirty before and clean after: the fix reverted it to HEAD
        changed.extend(
            self.entries
                .keys()
                .filter(|path| !after.entries.contains_key(*path))
                .cloned(),
        );
        changed.sort();
        changed
    }
}

/// [`ChangeTracker`] that diffs working tree snapshots around a fix.
///
/// The snapshot taken before the most recent fix is kept after the fix ends,
/// so a [`GitRollback`](crate::GitRollback) sharing this capture can restore
/// it.
#[derive(Debug, Default)]
pub struct ChangeCapture {
    baseline: Mutex<Option<WorkdirSnapshot>>,
}

impl ChangeCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot taken when the most recent fix began
    pub fn last_baseline(&self) -> Option<WorkdirSnapshot> {
        self.baseline().clone()
    }

    fn baseline(&self) -> MutexGuard<'_, Option<WorkdirSnapshot>> {
        self.baseline.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ChangeTracker for ChangeCapture {
    fn begin(&self, working_dir: &Path) {
        let snapshot = match WorkdirSnapshot::capture(working_dir) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(error = %e, "Failed to capture baseline, changed files will be unknown");
                None
            }
        };
        *self.baseline() = snapshot;
    }

    /// Absolute paths of the files that changed since `begin`
    fn changed_files(&self, working_dir: &Path) -> Vec<PathBuf> {
        let Some(before) = self.last_baseline() else {
            return Vec::new();
        };
        match WorkdirSnapshot::capture(working_dir) {
            Ok(after) => before
                .changed_since(&after)
                .into_iter()
                .map(|rel| after.workdir.join(rel))
                .collect(),
            Err(e) => {
                warn!(error = %e, "Failed to capture working tree after fix");
                Vec::new()
            }
        }
    }
}
