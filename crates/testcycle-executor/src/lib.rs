//! # testcycle-executor
//!
//! Contracts between the test-fix loop and its external collaborators.
//!
//! The loop never runs tests or edits code itself. It hands
//! [`TaskDescriptor`]s to a [`TestExecutor`] or [`FixExecutor`] and reads
//! back a [`TestResult`] or [`FixOutcome`]. On regression it asks a
//! [`RollbackHandler`] to undo the last fix.
//!
//! Shell-command implementations ([`CommandTestExecutor`],
//! [`CommandFixExecutor`]) are provided for projects that expose their test
//! runner as a command printing a JSON report.

mod command;
mod output;
mod report;
mod spawner;
mod task;
mod traits;

pub use command::{ChangeTracker, CommandFixExecutor, CommandTestExecutor, TASK_ENV};
pub use output::CommandOutput;
pub use report::{Criticality, FailureRecord, FixOutcome, TestResult};
pub use spawner::ProcessSpawner;
pub use task::{FixStrategy, TaskDescriptor, TaskKind, TaskOrigin, TaskStatus};
pub use traits::{
    ExecutorConfig, ExecutorError, FixExecutor, NoRollback, RollbackHandler, TestExecutor,
};
