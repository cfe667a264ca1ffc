use serde::{Deserialize, Serialize};
use std::fmt;

/// What a task asks the executors to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    /// Generate or update tests
    TestGen,
    /// Run the test suite and report a `TestResult`
    TestRun,
    /// Apply a code fix
    Fix,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::TestGen => write!(f, "test-gen"),
            TaskKind::TestRun => write!(f, "test-run"),
            TaskKind::Fix => write!(f, "fix"),
        }
    }
}

/// Lifecycle status of a task in the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Blocked,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Blocked => write!(f, "blocked"),
        }
    }
}

/// Where a task came from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOrigin {
    /// Seeded by the initial plan
    #[default]
    Planned,
    /// Produced by the failure analyzer
    Synthesized,
    /// Produced by the heuristic fallback when analysis was unavailable
    Degraded,
}

/// Remediation strategy a synthesized fix task follows
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixStrategy {
    #[default]
    Standard,
    /// The previous fix made things worse and was rolled back
    RegressionRecovery,
    /// The same failures keep recurring, a different approach is required
    Alternate,
    /// Minimal fallback: re-run only the failing tests
    RerunFailing,
}

impl fmt::Display for FixStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FixStrategy::Standard => write!(f, "standard"),
            FixStrategy::RegressionRecovery => write!(f, "regression_recovery"),
            FixStrategy::Alternate => write!(f, "alternate"),
            FixStrategy::RerunFailing => write!(f, "rerun_failing"),
        }
    }
}

/// A unit of work in the dynamic task queue.
///
/// Identity is immutable once queued; only `status` changes over the task's
/// lifetime. Tasks are never removed, which keeps the queue auditable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub id: String,
    pub kind: TaskKind,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Opaque payload interpreted by the executor that receives the task
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default = "default_status")]
    pub status: TaskStatus,
    #[serde(default)]
    pub origin: TaskOrigin,
    #[serde(default)]
    pub strategy: FixStrategy,
}

fn default_status() -> TaskStatus {
    TaskStatus::Pending
}

impl TaskDescriptor {
    pub fn new(id: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            id: id.into(),
            kind,
            depends_on: Vec::new(),
            payload: serde_json::Value::Null,
            status: TaskStatus::Pending,
            origin: TaskOrigin::Planned,
            strategy: FixStrategy::Standard,
        }
    }

    pub fn test_run(id: impl Into<String>) -> Self {
        Self::new(id, TaskKind::TestRun)
    }

    pub fn test_gen(id: impl Into<String>) -> Self {
        Self::new(id, TaskKind::TestGen)
    }

    pub fn fix(id: impl Into<String>) -> Self {
        Self::new(id, TaskKind::Fix)
    }

    pub fn with_depends_on(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.depends_on = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_origin(mut self, origin: TaskOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_strategy(mut self, strategy: FixStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn is_synthesized(&self) -> bool {
        !matches!(self.origin, TaskOrigin::Planned)
    }
}
