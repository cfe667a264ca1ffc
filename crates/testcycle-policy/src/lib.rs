//! # testcycle-policy
//!
//! Decides what the test-fix loop does next.
//!
//! - [`evaluate`] turns a test report into [`Metrics`]
//! - [`ConvergencePolicy`] maps metrics, history and budget to a [`Decision`]
//! - [`stuck_failure_ids`] looks back over [`IterationRecord`]s
//! - [`FailureAnalyzer`] produces the next fix task, with
//!   [`HeuristicAnalyzer`] as the fallback when analysis is unavailable
//!
//! Everything except the analyzers is pure and free of I/O.

mod decision;
mod history;
mod metrics;
mod policy;
mod synthesis;

pub use decision::Decision;
pub use history::{previous_metrics, stuck_failure_ids, IterationRecord};
pub use metrics::{evaluate, Metrics, MetricsError};
pub use policy::{ConvergencePolicy, PolicyConfig, PolicyError, PolicyInput};
pub use synthesis::{
    synthesized_task_id, CommandAnalyzer, FailureAnalyzer, FailureContext, HeuristicAnalyzer,
    Synthesis, FAILURE_CONTEXT_ENV, HISTORY_ENV,
};
