use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use testcycle_executor::{
    ExecutorConfig, ExecutorError, FailureRecord, FixStrategy, ProcessSpawner, TaskDescriptor,
    TaskOrigin,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::IterationRecord;

/// Environment variable carrying the serialized failure context
pub const FAILURE_CONTEXT_ENV: &str = "TESTCYCLE_FAILURE_CONTEXT";
/// Environment variable carrying the serialized iteration history
pub const HISTORY_ENV: &str = "TESTCYCLE_HISTORY";

/// What the analyzer is told about the iteration that needs a fix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureContext {
    pub iteration: u32,
    pub pass_rate: f64,
    pub failures: Vec<FailureRecord>,
    /// Strategy requested by the policy decision
    pub strategy: FixStrategy,
    /// Test-run task whose result triggered synthesis
    pub source_task_id: String,
    /// Files reverted before this synthesis, when recovering from a regression
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rolled_back_files: Vec<PathBuf>,
}

impl FailureContext {
    pub fn failing_test_ids(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.test_id.as_str()).collect()
    }
}

/// Result of asking an analyzer for the next fix
#[derive(Debug, Clone, PartialEq)]
pub enum Synthesis {
    Task(TaskDescriptor),
    /// The analyzer could only produce a fallback task
    Degraded {
        task: TaskDescriptor,
        reason: String,
    },
}

impl Synthesis {
    pub fn task(&self) -> &TaskDescriptor {
        match self {
            Synthesis::Task(task) | Synthesis::Degraded { task, .. } => task,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Synthesis::Degraded { .. })
    }

    /// Normalize the task into a dependency-free fix rooted at the queue head.
    pub fn into_queued_task(self, strategy: FixStrategy) -> TaskDescriptor {
        let (mut task, origin) = match self {
            Synthesis::Task(task) => (task, TaskOrigin::Synthesized),
            Synthesis::Degraded { task, .. } => (task, TaskOrigin::Degraded),
        };
        task.depends_on.clear();
        task.status = testcycle_executor::TaskStatus::Pending;
        task.origin = origin;
        if task.strategy == FixStrategy::Standard {
            task.strategy = strategy;
        }
        task
    }
}

/// Produces the next remediation task from failure context and history
#[async_trait]
pub trait FailureAnalyzer: Send + Sync {
    fn name(&self) -> &str;

    async fn analyze(
        &self,
        context: &FailureContext,
        history: &[IterationRecord],
        config: &ExecutorConfig,
    ) -> Result<Synthesis, ExecutorError>;
}

/// Generate a fresh fix task id for an iteration
pub fn synthesized_task_id(iteration: u32) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("fix-{}-{}", iteration, &suffix[..8])
}

/// Minimal fallback when no analysis is available: re-run only the failing
/// tests so the next iteration still produces fresh metrics.
#[derive(Debug, Clone, Default)]
pub struct HeuristicAnalyzer;

impl HeuristicAnalyzer {
    pub fn fallback_task(context: &FailureContext) -> TaskDescriptor {
        TaskDescriptor::fix(synthesized_task_id(context.iteration))
            .with_origin(TaskOrigin::Degraded)
            .with_strategy(FixStrategy::RerunFailing)
            .with_payload(serde_json::json!({
                "action": "rerun_failing",
                "tests": context.failing_test_ids(),
                "requested_strategy": context.strategy.to_string(),
            }))
    }
}

#[async_trait]
impl FailureAnalyzer for HeuristicAnalyzer {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn analyze(
        &self,
        context: &FailureContext,
        _history: &[IterationRecord],
        _config: &ExecutorConfig,
    ) -> Result<Synthesis, ExecutorError> {
        Ok(Synthesis::Degraded {
            task: Self::fallback_task(context),
            reason: "no failure analyzer configured".into(),
        })
    }
}

/// Analyzer backed by a shell command.
///
/// The command receives the failure context and history as JSON in
/// [`FAILURE_CONTEXT_ENV`] and [`HISTORY_ENV`] and must print a
/// `TaskDescriptor` as JSON. A missing id is filled in.
pub struct CommandAnalyzer {
    command: String,
}

#[derive(Deserialize)]
struct AnalyzerReply {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(default)]
    strategy: Option<FixStrategy>,
}

impl CommandAnalyzer {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl FailureAnalyzer for CommandAnalyzer {
    fn name(&self) -> &str {
        "command"
    }

    async fn analyze(
        &self,
        context: &FailureContext,
        history: &[IterationRecord],
        config: &ExecutorConfig,
    ) -> Result<Synthesis, ExecutorError> {
        let encode = |value: serde_json::Result<String>| {
            value.map_err(|e| ExecutorError::ExecutionFailed(format!("Failed to encode: {}", e)))
        };
        let env = [
            (FAILURE_CONTEXT_ENV, encode(serde_json::to_string(context))?),
            (HISTORY_ENV, encode(serde_json::to_string(history))?),
        ];

        debug!(
            iteration = context.iteration,
            failures = context.failures.len(),
            "Running failure analyzer"
        );
        let output = ProcessSpawner::spawn(&self.command, config, &env).await?;

        if !output.success() {
            return Err(ExecutorError::ExecutionFailed(format!(
                "Analyzer exited with code {}: {}",
                output.exit_code,
                output.stderr_tail(5)
            )));
        }

        let reply: AnalyzerReply = output.parse_json().ok_or_else(|| {
            ExecutorError::InvalidReport("Analyzer printed no JSON task".into())
        })?;

        let id = reply
            .id
            .unwrap_or_else(|| synthesized_task_id(context.iteration));
        info!(task_id = %id, "Analyzer proposed fix task");

        Ok(Synthesis::Task(
            TaskDescriptor::fix(id)
                .with_payload(reply.payload)
                .with_strategy(reply.strategy.unwrap_or(context.strategy)),
        ))
    }
}
