//! Project configuration file support for testcycle.
//!
//! Loads configuration from `testcycle.toml` in the working directory.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use testcycle_core::DEFAULT_MAX_ITERATIONS;
use testcycle_executor::TaskDescriptor;
use testcycle_policy::PolicyConfig;

/// The config file name
pub const CONFIG_FILE_NAME: &str = "testcycle.toml";

/// Id of the default test-run task
pub const DEFAULT_RUN_TASK: &str = "run-tests";
/// Id of the default test-gen task, seeded when a generate command is set
pub const DEFAULT_GEN_TASK: &str = "generate-tests";

/// Project-level configuration loaded from `testcycle.toml`
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    /// Iteration budget (default 5)
    pub max_iterations: Option<u32>,
    /// Directory holding session journals
    pub state_dir: Option<PathBuf>,
    /// Directory for the diagnostic log file
    pub log_dir: Option<PathBuf>,
    /// Convergence thresholds
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub commands: CommandConfig,
    #[serde(default)]
    pub rollback: RollbackMode,
    /// Initial plan. Empty means the default plan derived from `[commands]`.
    #[serde(default)]
    pub tasks: Vec<TaskDescriptor>,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutConfig {
    /// Upper bound for each executor, analyzer or rollback call
    #[serde(with = "humantime_serde")]
    pub dispatch: Option<Duration>,
    /// Upper bound for the whole session
    #[serde(with = "humantime_serde")]
    pub session: Option<Duration>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            dispatch: Some(Duration::from_secs(600)),
            session: None,
        }
    }
}

/// Shell commands backing the collaborators
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct CommandConfig {
    /// Runs the suite and prints a JSON test result
    pub test: Option<String>,
    /// Applies a fix task
    pub fix: Option<String>,
    /// Turns a failure context into the next fix task
    pub analyze: Option<String>,
    /// Generates or updates tests
    pub test_gen: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollbackMode {
    #[default]
    Git,
    None,
}

impl ProjectConfig {
    /// Load configuration from the working directory.
    ///
    /// Returns:
    /// - `Ok(Some(config))` if file exists and parses successfully
    /// - `Ok(None)` if file does not exist
    /// - `Err(...)` if file exists but fails to parse (hard error)
    pub fn load(working_dir: &Path) -> Result<Option<Self>> {
        let config_path = working_dir.join(CONFIG_FILE_NAME);

        if !config_path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        Ok(Some(config))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: ProjectConfig = toml::from_str(content)?;
        config.policy.validate()?;
        if config.max_iterations == Some(0) {
            anyhow::bail!("max_iterations must be at least 1");
        }
        Ok(config)
    }

    /// Effective iteration budget.
    /// Priority: CLI flag > config file > default
    pub fn max_iterations(&self, cli: Option<u32>) -> u32 {
        cli.or(self.max_iterations)
            .unwrap_or(DEFAULT_MAX_ITERATIONS)
    }

    /// The initial task plan.
    ///
    /// Without explicit `[[tasks]]`, a single test run is seeded, preceded by a
    /// test-gen task when `commands.test_gen` is set.
    pub fn initial_tasks(&self) -> Vec<TaskDescriptor> {
        if !self.tasks.is_empty() {
            return self.tasks.clone();
        }

        match self.commands.test_gen {
            Some(_) => vec![
                TaskDescriptor::test_gen(DEFAULT_GEN_TASK),
                TaskDescriptor::test_run(DEFAULT_RUN_TASK).with_depends_on([DEFAULT_GEN_TASK]),
            ],
            None => vec![TaskDescriptor::test_run(DEFAULT_RUN_TASK)],
        }
    }
}
