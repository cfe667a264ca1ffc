use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use testcycle_policy::IterationRecord;

/// Each line of a session JSONL file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionLine {
    SessionStart(SessionStart),
    Iteration(IterationRecord),
    TaskCompleted(TaskCompletion),
    SessionEnd(SessionEnd),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStart {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub working_dir: PathBuf,
    pub max_iterations: u32,
    /// True when this start line continues an interrupted session
    #[serde(default)]
    pub resumed: bool,
}

/// A fix task that finished applying
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCompletion {
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEnd {
    /// `succeeded`, `partially_succeeded` or `blocked`
    pub outcome: String,
    pub iterations: u32,
    pub reason: Option<String>,
    pub duration_secs: f64,
    pub timestamp: DateTime<Utc>,
}

/// A fully parsed session.
///
/// A resumed session has several start lines and possibly several end lines;
/// the first start and the last end are kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub start: Option<SessionStart>,
    pub iterations: Vec<IterationRecord>,
    /// Ids of fix tasks applied so far, in completion order
    #[serde(default)]
    pub completed_tasks: Vec<String>,
    pub end: Option<SessionEnd>,
}

impl Session {
    pub fn latest_iteration(&self) -> Option<&IterationRecord> {
        self.iterations.last()
    }
}

/// Summary for list views.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub started_at: Option<DateTime<Utc>>,
    pub working_dir: Option<PathBuf>,
    pub outcome: Option<String>,
    pub iterations: usize,
    pub last_pass_rate: Option<f64>,
}

impl From<&Session> for SessionSummary {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            started_at: session.start.as_ref().map(|s| s.timestamp),
            working_dir: session.start.as_ref().map(|s| s.working_dir.clone()),
            outcome: session.end.as_ref().map(|e| e.outcome.clone()),
            iterations: session.iterations.len(),
            last_pass_rate: session.latest_iteration().map(|r| r.pass_rate),
        }
    }
}
