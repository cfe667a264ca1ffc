use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::{FixOutcome, TaskDescriptor, TestResult};

/// Errors that can occur while dispatching to a collaborator
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to spawn collaborator process: {0}")]
    SpawnFailed(#[from] std::io::Error),

    #[error("Collaborator timed out after {0:?}")]
    Timeout(Duration),

    #[error("Collaborator not configured: {0}")]
    NotConfigured(String),

    #[error("Collaborator execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Collaborator produced an invalid report: {0}")]
    InvalidReport(String),
}

impl ExecutorError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecutorError::Timeout(_))
    }
}

/// Configuration shared by every dispatch
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Working directory of the project under test
    pub working_dir: PathBuf,
    /// Upper bound for a single dispatch (None = no limit)
    pub timeout: Option<Duration>,
    /// Additional environment variables for spawned processes
    pub env_vars: HashMap<String, String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            timeout: None,
            env_vars: HashMap::new(),
        }
    }
}

impl ExecutorConfig {
    pub fn new(working_dir: PathBuf) -> Self {
        Self {
            working_dir,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }
}

/// Runs tests and reports results.
///
/// Implementations must fill in `FailureRecord::criticality`; the loop never
/// guesses severity itself.
#[async_trait]
pub trait TestExecutor: Send + Sync {
    fn name(&self) -> &str;

    /// Execute a test-run task
    async fn run(
        &self,
        task: &TaskDescriptor,
        config: &ExecutorConfig,
    ) -> Result<TestResult, ExecutorError>;

    /// Execute a test-gen task. Executors without generation support accept
    /// the task as a no-op.
    async fn generate(
        &self,
        task: &TaskDescriptor,
        config: &ExecutorConfig,
    ) -> Result<(), ExecutorError> {
        let _ = (task, config);
        Ok(())
    }
}

/// Applies fix tasks to the project
#[async_trait]
pub trait FixExecutor: Send + Sync {
    fn name(&self) -> &str;

    async fn apply(
        &self,
        task: &TaskDescriptor,
        config: &ExecutorConfig,
    ) -> Result<FixOutcome, ExecutorError>;
}

/// Undoes the effects of the most recent fix. Invoked only on regression.
#[async_trait]
pub trait RollbackHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Returns `Ok(false)` when the files could not be fully restored
    async fn revert(
        &self,
        files: &[PathBuf],
        config: &ExecutorConfig,
    ) -> Result<bool, ExecutorError>;
}

/// Rollback disabled: the regressing fix stays in place and recovery relies
/// on the next synthesized fix.
pub struct NoRollback;

#[async_trait]
impl RollbackHandler for NoRollback {
    fn name(&self) -> &str {
        "none"
    }

    async fn revert(
        &self,
        files: &[PathBuf],
        _config: &ExecutorConfig,
    ) -> Result<bool, ExecutorError> {
        if !files.is_empty() {
            tracing::warn!(files = files.len(), "Rollback disabled, keeping regressing changes");
        }
        Ok(true)
    }
}
