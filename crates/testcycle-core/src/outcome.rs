use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use testcycle_executor::FailureRecord;
use testcycle_policy::{FailureContext, IterationRecord};

use crate::CycleError;

/// Why a cycle stopped without converging
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockReason {
    /// The policy aborted at the iteration budget
    IterationBudgetExceeded { max_iterations: u32 },
    /// The same failures kept recurring with no budget left for a new strategy
    Stuck { failure_ids: Vec<String> },
    /// The queue ran dry while tests were still failing
    Unconverged,
    /// The queue ran dry without any test run
    NoTestResults,
    EmptyTestSuite,
    ExecutorFailure { task_id: String, error: String },
    RollbackFailed { message: String },
    QueueDeadlock { pending: Vec<String> },
    Interrupted,
    SessionTimeout,
    Error { message: String },
}

impl BlockReason {
    /// Reasons that mean "gave up" rather than "something broke"
    pub fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            Self::IterationBudgetExceeded { .. } | Self::Stuck { .. } | Self::Unconverged
        )
    }
}

impl From<&CycleError> for BlockReason {
    fn from(err: &CycleError) -> Self {
        match err {
            CycleError::EmptyTestSuite => Self::EmptyTestSuite,
            CycleError::ExecutorFailure { task_id, message } => Self::ExecutorFailure {
                task_id: task_id.clone(),
                error: message.clone(),
            },
            CycleError::IterationBudgetExceeded { max_iterations } => {
                Self::IterationBudgetExceeded {
                    max_iterations: *max_iterations,
                }
            }
            CycleError::QueueDeadlock { pending } => Self::QueueDeadlock {
                pending: pending.clone(),
            },
            CycleError::Rollback(message) => Self::RollbackFailed {
                message: message.clone(),
            },
            other => Self::Error {
                message: other.to_string(),
            },
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IterationBudgetExceeded { max_iterations } => {
                write!(f, "iteration budget of {} exhausted", max_iterations)
            }
            Self::Stuck { failure_ids } => {
                write!(f, "stuck on recurring failures: {}", failure_ids.join(", "))
            }
            Self::Unconverged => write!(f, "no tasks left and tests still failing"),
            Self::NoTestResults => write!(f, "no test run produced results"),
            Self::EmptyTestSuite => write!(f, "test suite is empty"),
            Self::ExecutorFailure { task_id, error } => {
                write!(f, "executor failed on {} after retry: {}", task_id, error)
            }
            Self::RollbackFailed { message } => write!(f, "rollback failed: {}", message),
            Self::QueueDeadlock { pending } => {
                write!(f, "queue deadlock, pending: {}", pending.join(", "))
            }
            Self::Interrupted => write!(f, "interrupted"),
            Self::SessionTimeout => write!(f, "session timeout"),
            Self::Error { message } => write!(f, "{}", message),
        }
    }
}

/// The final outcome of a test-fix cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Every test passes
    Succeeded {
        iterations: u32,
        history: Vec<IterationRecord>,
        total_duration_secs: f64,
    },
    /// Accepted with low-criticality failures left, listed for review
    PartiallySucceeded {
        iterations: u32,
        pass_rate: f64,
        caveats: Vec<FailureRecord>,
        history: Vec<IterationRecord>,
        total_duration_secs: f64,
    },
    /// Stopped for human intervention
    Blocked {
        iterations: u32,
        reason: BlockReason,
        history: Vec<IterationRecord>,
        last_failure: Option<FailureContext>,
        total_duration_secs: f64,
    },
}

impl CycleOutcome {
    pub fn succeeded(history: Vec<IterationRecord>, duration: Duration) -> Self {
        Self::Succeeded {
            iterations: history.len() as u32,
            history,
            total_duration_secs: duration.as_secs_f64(),
        }
    }

    pub fn partially_succeeded(
        pass_rate: f64,
        caveats: Vec<FailureRecord>,
        history: Vec<IterationRecord>,
        duration: Duration,
    ) -> Self {
        Self::PartiallySucceeded {
            iterations: history.len() as u32,
            pass_rate,
            caveats,
            history,
            total_duration_secs: duration.as_secs_f64(),
        }
    }

    pub fn blocked(
        reason: BlockReason,
        history: Vec<IterationRecord>,
        last_failure: Option<FailureContext>,
        duration: Duration,
    ) -> Self {
        Self::Blocked {
            iterations: history.len() as u32,
            reason,
            history,
            last_failure,
            total_duration_secs: duration.as_secs_f64(),
        }
    }

    pub fn iterations(&self) -> u32 {
        match self {
            Self::Succeeded { iterations, .. }
            | Self::PartiallySucceeded { iterations, .. }
            | Self::Blocked { iterations, .. } => *iterations,
        }
    }

    pub fn history(&self) -> &[IterationRecord] {
        match self {
            Self::Succeeded { history, .. }
            | Self::PartiallySucceeded { history, .. }
            | Self::Blocked { history, .. } => history,
        }
    }

    pub fn total_duration_secs(&self) -> f64 {
        match self {
            Self::Succeeded {
                total_duration_secs,
                ..
            }
            | Self::PartiallySucceeded {
                total_duration_secs,
                ..
            }
            | Self::Blocked {
                total_duration_secs,
                ..
            } => *total_duration_secs,
        }
    }

    pub fn block_reason(&self) -> Option<&BlockReason> {
        match self {
            Self::Blocked { reason, .. } => Some(reason),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    pub fn is_converged(&self) -> bool {
        !matches!(self, Self::Blocked { .. })
    }

    /// Label written to the session journal
    pub fn status(&self) -> &'static str {
        match self {
            Self::Succeeded { .. } => "succeeded",
            Self::PartiallySucceeded { .. } => "partially_succeeded",
            Self::Blocked { .. } => "blocked",
        }
    }

    /// Files reverted before the last synthesis, if any
    pub fn rolled_back_files(&self) -> &[PathBuf] {
        match self {
            Self::Blocked {
                last_failure: Some(context),
                ..
            } => &context.rolled_back_files,
            _ => &[],
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Succeeded { .. } | Self::PartiallySucceeded { .. } => 0,
            Self::Blocked {
                reason: BlockReason::Interrupted,
                ..
            } => 130,
            Self::Blocked { reason, .. } if reason.is_exhaustion() => 1,
            Self::Blocked { .. } => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocked(reason: BlockReason) -> CycleOutcome {
        CycleOutcome::blocked(reason, Vec::new(), None, Duration::from_secs(1))
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            CycleOutcome::succeeded(Vec::new(), Duration::ZERO).exit_code(),
            0
        );
        assert_eq!(
            CycleOutcome::partially_succeeded(96.0, Vec::new(), Vec::new(), Duration::ZERO)
                .exit_code(),
            0
        );
        assert_eq!(
            blocked(BlockReason::IterationBudgetExceeded { max_iterations: 5 }).exit_code(),
            1
        );
        assert_eq!(blocked(BlockReason::Unconverged).exit_code(), 1);
        assert_eq!(blocked(BlockReason::Interrupted).exit_code(), 130);
        assert_eq!(
            blocked(BlockReason::QueueDeadlock {
                pending: vec!["run".into()]
            })
            .exit_code(),
            2
        );
    }

    #[test]
    fn test_block_reason_from_error() {
        let err = CycleError::ExecutorFailure {
            task_id: "run".into(),
            message: "timed out".into(),
        };
        assert_eq!(
            BlockReason::from(&err),
            BlockReason::ExecutorFailure {
                task_id: "run".into(),
                error: "timed out".into()
            }
        );
        assert!(matches!(
            BlockReason::from(&CycleError::DuplicateTaskId("x".into())),
            BlockReason::Error { .. }
        ));
    }

    #[test]
    fn test_outcome_serializes_status_tag() {
        let json = serde_json::to_value(blocked(BlockReason::SessionTimeout)).unwrap();
        assert_eq!(json["status"], "blocked");
        assert_eq!(json["reason"]["kind"], "session_timeout");
    }
}
