use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use testcycle_policy::IterationRecord;
use tracing::debug;

use crate::error::StoreError;
use crate::parser::parse_session;
use crate::types::{SessionEnd, SessionLine, SessionStart, TaskCompletion};

/// Whether an append changed the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// A record with this iteration number already exists; nothing written
    Duplicate,
}

/// Durable, append-only record of a session's iteration history.
///
/// `append` is idempotent by iteration number and enforces strictly
/// consecutive iterations starting at 1.
pub trait IterationStateStore: Send + Sync {
    fn append(&self, record: &IterationRecord) -> Result<AppendOutcome, StoreError>;

    fn load_all(&self) -> Result<Vec<IterationRecord>, StoreError>;

    fn load_latest(&self) -> Result<Option<IterationRecord>, StoreError> {
        Ok(self.load_all()?.pop())
    }

    /// Mark a fix task as applied, so a resumed session does not dispatch it
    /// again
    fn record_task_completed(&self, task_id: &str) -> Result<(), StoreError>;

    /// Ids of every fix task marked applied
    fn completed_tasks(&self) -> Result<BTreeSet<String>, StoreError>;

    /// Mark the (re)start of a session
    fn record_start(&self, _start: &SessionStart) -> Result<(), StoreError> {
        Ok(())
    }

    /// Mark the end of a session
    fn record_end(&self, _end: &SessionEnd) -> Result<(), StoreError> {
        Ok(())
    }
}

fn check_order(latest: Option<u32>, iteration: u32) -> Result<AppendOutcome, StoreError> {
    let latest = latest.unwrap_or(0);
    if iteration != 0 && iteration <= latest {
        return Ok(AppendOutcome::Duplicate);
    }
    let expected = latest + 1;
    if iteration != expected {
        return Err(StoreError::OutOfOrder {
            expected,
            got: iteration,
        });
    }
    Ok(AppendOutcome::Appended)
}

/// In-memory store for embedding and tests
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    records: Mutex<Vec<IterationRecord>>,
    completed: Mutex<BTreeSet<String>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<IterationRecord>) -> Self {
        Self {
            records: Mutex::new(records),
            ..Self::default()
        }
    }

    pub fn with_completed_tasks(self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.completed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .extend(ids.into_iter().map(Into::into));
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<IterationRecord>> {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl IterationStateStore for MemoryStateStore {
    fn append(&self, record: &IterationRecord) -> Result<AppendOutcome, StoreError> {
        let mut records = self.lock();
        let outcome = check_order(records.last().map(|r| r.iteration), record.iteration)?;
        if outcome == AppendOutcome::Appended {
            records.push(record.clone());
        }
        Ok(outcome)
    }

    fn load_all(&self) -> Result<Vec<IterationRecord>, StoreError> {
        Ok(self.lock().clone())
    }

    fn record_task_completed(&self, task_id: &str) -> Result<(), StoreError> {
        self.completed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(task_id.to_string());
        Ok(())
    }

    fn completed_tasks(&self) -> Result<BTreeSet<String>, StoreError> {
        Ok(self
            .completed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone())
    }
}

/// Session history as JSON lines in `<dir>/<session_id>.jsonl`.
///
/// Every write is flushed and synced before returning, so a crash loses at
/// most the line being written, which the parser tolerates.
pub struct JsonlStateStore {
    path: PathBuf,
    latest: Mutex<Option<u32>>,
}

impl JsonlStateStore {
    /// Open or create the session file for `session_id` under `dir`.
    pub fn open(dir: &Path, session_id: &str) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.jsonl", session_id));

        let latest = if path.exists() {
            truncate_torn_tail(&path)?;
            parse_session(&path)?.latest_iteration().map(|r| r.iteration)
        } else {
            File::create(&path)?;
            None
        };

        debug!(path = %path.display(), ?latest, "Opened iteration state store");

        Ok(Self {
            path,
            latest: Mutex::new(latest),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_line(&self, line: &SessionLine) -> Result<(), StoreError> {
        let json = serde_json::to_string(line)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{}", json)?;
        writer.flush()?;
        writer.get_ref().sync_data()?;
        Ok(())
    }
}

/// Every complete line ends with a newline; anything after the last newline
/// is a partial write and would corrupt the next append.
fn truncate_torn_tail(path: &Path) -> Result<(), StoreError> {
    let content = fs::read(path)?;
    if content.is_empty() || content.ends_with(b"\n") {
        return Ok(());
    }
    let keep = content
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |pos| pos + 1);
    tracing::warn!(
        path = %path.display(),
        dropped_bytes = content.len() - keep,
        "Truncating torn write at end of session file"
    );
    OpenOptions::new()
        .write(true)
        .open(path)?
        .set_len(keep as u64)?;
    Ok(())
}

impl IterationStateStore for JsonlStateStore {
    fn append(&self, record: &IterationRecord) -> Result<AppendOutcome, StoreError> {
        let mut latest = self
            .latest
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let outcome = check_order(*latest, record.iteration)?;
        if outcome == AppendOutcome::Duplicate {
            debug!(iteration = record.iteration, "Skipping duplicate iteration record");
            return Ok(outcome);
        }

        self.write_line(&SessionLine::Iteration(record.clone()))?;
        *latest = Some(record.iteration);
        Ok(outcome)
    }

    fn load_all(&self) -> Result<Vec<IterationRecord>, StoreError> {
        Ok(parse_session(&self.path)?.iterations)
    }

    fn record_task_completed(&self, task_id: &str) -> Result<(), StoreError> {
        self.write_line(&SessionLine::TaskCompleted(TaskCompletion {
            task_id: task_id.to_string(),
            timestamp: Utc::now(),
        }))
    }

    fn completed_tasks(&self) -> Result<BTreeSet<String>, StoreError> {
        Ok(parse_session(&self.path)?
            .completed_tasks
            .into_iter()
            .collect())
    }

    fn record_start(&self, start: &SessionStart) -> Result<(), StoreError> {
        self.write_line(&SessionLine::SessionStart(start.clone()))
    }

    fn record_end(&self, end: &SessionEnd) -> Result<(), StoreError> {
        self.write_line(&SessionLine::SessionEnd(end.clone()))
    }
}
