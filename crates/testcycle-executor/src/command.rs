use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{
    ExecutorConfig, ExecutorError, FixExecutor, FixOutcome, ProcessSpawner, TaskDescriptor,
    TestExecutor, TestResult,
};

/// Environment variable carrying the serialized task for spawned commands
pub const TASK_ENV: &str = "TESTCYCLE_TASK";

/// Detects the files a fix touched, for fix commands that do not report them.
pub trait ChangeTracker: Send + Sync {
    /// Called right before the fix command runs
    fn begin(&self, working_dir: &Path);

    /// Files that changed since `begin`
    fn changed_files(&self, working_dir: &Path) -> Vec<PathBuf>;
}

fn task_env(task: &TaskDescriptor) -> Result<Vec<(&'static str, String)>, ExecutorError> {
    let json = serde_json::to_string(task)
        .map_err(|e| ExecutorError::ExecutionFailed(format!("Failed to serialize task: {}", e)))?;
    Ok(vec![(TASK_ENV, json)])
}

/// Test executor backed by shell commands.
///
/// The test command must print a JSON `TestResult` on stdout. A non-zero exit
/// status is expected while tests fail and is not an error by itself.
pub struct CommandTestExecutor {
    test_command: String,
    test_gen_command: Option<String>,
}

impl CommandTestExecutor {
    pub fn new(test_command: impl Into<String>) -> Self {
        Self {
            test_command: test_command.into(),
            test_gen_command: None,
        }
    }

    pub fn with_test_gen(mut self, command: impl Into<String>) -> Self {
        self.test_gen_command = Some(command.into());
        self
    }
}

#[async_trait]
impl TestExecutor for CommandTestExecutor {
    fn name(&self) -> &str {
        "command"
    }

    async fn run(
        &self,
        task: &TaskDescriptor,
        config: &ExecutorConfig,
    ) -> Result<TestResult, ExecutorError> {
        let env = task_env(task)?;
        let output = ProcessSpawner::spawn(&self.test_command, config, &env).await?;

        match output.parse_json::<TestResult>() {
            Some(result) => {
                debug!(
                    task_id = %task.id,
                    total = result.total,
                    failed = result.failed,
                    "Parsed test report"
                );
                Ok(result)
            }
            None if !output.success() => Err(ExecutorError::ExecutionFailed(format!(
                "Test command exited with code {}: {}",
                output.exit_code,
                output.stderr_tail(5)
            ))),
            None => Err(ExecutorError::InvalidReport(
                "Test command printed no valid JSON test report".into(),
            )),
        }
    }

    async fn generate(
        &self,
        task: &TaskDescriptor,
        config: &ExecutorConfig,
    ) -> Result<(), ExecutorError> {
        let Some(ref command) = self.test_gen_command else {
            debug!(task_id = %task.id, "No test generation command, skipping");
            return Ok(());
        };

        let env = task_env(task)?;
        let output = ProcessSpawner::spawn(command, config, &env).await?;
        if output.success() {
            Ok(())
        } else {
            Err(ExecutorError::ExecutionFailed(format!(
                "Test generation exited with code {}: {}",
                output.exit_code,
                output.stderr_tail(5)
            )))
        }
    }
}

/// Fix executor backed by a shell command.
///
/// The command may print a JSON `FixOutcome`. Otherwise success is taken from
/// the exit status and applied files from the `ChangeTracker`, if any.
pub struct CommandFixExecutor {
    fix_command: String,
    tracker: Option<Arc<dyn ChangeTracker>>,
}

impl CommandFixExecutor {
    pub fn new(fix_command: impl Into<String>) -> Self {
        Self {
            fix_command: fix_command.into(),
            tracker: None,
        }
    }

    /// Shared so that a rollback handler can read what the tracker captured
    pub fn with_tracker(mut self, tracker: Arc<dyn ChangeTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }
}

#[async_trait]
impl FixExecutor for CommandFixExecutor {
    fn name(&self) -> &str {
        "command"
    }

    async fn apply(
        &self,
        task: &TaskDescriptor,
        config: &ExecutorConfig,
    ) -> Result<FixOutcome, ExecutorError> {
        let env = task_env(task)?;
        if let Some(ref tracker) = self.tracker {
            tracker.begin(&config.working_dir);
        }
        let output = ProcessSpawner::spawn(&self.fix_command, config, &env).await?;

        if let Some(outcome) = output.parse_json::<FixOutcome>() {
            return Ok(outcome);
        }

        if !output.success() {
            warn!(
                task_id = %task.id,
                exit_code = output.exit_code,
                "Fix command failed without a report"
            );
            return Ok(FixOutcome::failed());
        }

        let applied_files = self
            .tracker
            .as_ref()
            .map(|tracker| tracker.changed_files(&config.working_dir))
            .unwrap_or_default();
        Ok(FixOutcome::applied(applied_files))
    }
}
