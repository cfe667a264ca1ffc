use testcycle_policy::MetricsError;
use testcycle_store::StoreError;
use thiserror::Error;

use crate::queue::QueueError;

#[derive(Error, Debug)]
pub enum CycleError {
    #[error("Test suite is empty; zero tests cannot certify success")]
    EmptyTestSuite,

    #[error("Inconsistent test result: total={total}, passed={passed}, failed={failed}, failures listed={listed}")]
    InconsistentTestResult {
        total: usize,
        passed: usize,
        failed: usize,
        listed: usize,
    },

    #[error("Duplicate task id: {0}")]
    DuplicateTaskId(String),

    #[error("Unknown task id: {0}")]
    UnknownTaskId(String),

    #[error("Invalid task queue: {0}")]
    InvalidQueue(String),

    #[error("Executor failed on task {task_id}: {message}")]
    ExecutorFailure { task_id: String, message: String },

    /// Non-fatal: the heuristic fallback task was used
    #[error("Failure analyzer degraded: {0}")]
    AnalyzerDegraded(String),

    #[error("Iteration budget of {max_iterations} exhausted")]
    IterationBudgetExceeded { max_iterations: u32 },

    #[error("Queue deadlock: pending tasks {pending:?} have unmet dependencies")]
    QueueDeadlock { pending: Vec<String> },

    #[error("State store error: {0}")]
    Store(#[from] StoreError),

    #[error("Rollback failed: {0}")]
    Rollback(String),
}

impl From<MetricsError> for CycleError {
    fn from(err: MetricsError) -> Self {
        match err {
            MetricsError::EmptyTestSuite => CycleError::EmptyTestSuite,
            MetricsError::InconsistentTestResult {
                total,
                passed,
                failed,
                listed,
            } => CycleError::InconsistentTestResult {
                total,
                passed,
                failed,
                listed,
            },
        }
    }
}

impl From<QueueError> for CycleError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::DuplicateTaskId(id) => CycleError::DuplicateTaskId(id),
            QueueError::UnknownTaskId(id) => CycleError::UnknownTaskId(id),
            other => CycleError::InvalidQueue(other.to_string()),
        }
    }
}
