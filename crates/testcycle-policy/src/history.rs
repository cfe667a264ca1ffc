use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use testcycle_executor::TaskDescriptor;

use crate::{Decision, Metrics};

/// Record of a single evaluated iteration.
///
/// Records form an append-only history; regression and stuck detection look
/// back over them, so they are never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    /// 1-based, strictly increasing
    pub iteration: u32,
    pub pass_rate: f64,
    /// Ids of the tests failing in this iteration
    pub failures: Vec<String>,
    #[serde(default)]
    pub critical_failures: usize,
    pub decision: Decision,
    /// Fix task queued in response to this iteration, if any
    pub synthesized_task_id: Option<String>,
    /// The queued fix itself, so a resumed session can dispatch it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthesized_task: Option<TaskDescriptor>,
    pub timestamp: DateTime<Utc>,
}

impl IterationRecord {
    pub fn new(iteration: u32, metrics: &Metrics, decision: Decision) -> Self {
        Self {
            iteration,
            pass_rate: metrics.pass_rate,
            failures: metrics.failure_ids.clone(),
            critical_failures: metrics.critical_failure_count,
            decision,
            synthesized_task_id: None,
            synthesized_task: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_synthesized_task(mut self, task: &TaskDescriptor) -> Self {
        self.synthesized_task_id = Some(task.id.clone());
        self.synthesized_task = Some(task.clone());
        self
    }

    /// Metrics as they were observed in this iteration
    pub fn metrics(&self) -> Metrics {
        Metrics {
            pass_rate: self.pass_rate,
            critical_failure_count: self.critical_failures,
            failure_ids: self.failures.clone(),
        }
    }
}

/// Failures of `current` that also failed in each of the previous
/// `window - 1` iterations.
///
/// The current iteration counts toward the window, so with the default window
/// of 3 a test is stuck when it failed in this iteration and the two before
/// it. Fewer than `window - 1` prior records yields an empty set.
pub fn stuck_failure_ids(
    history: &[IterationRecord],
    current: &Metrics,
    window: usize,
) -> BTreeSet<String> {
    let lookback = window.saturating_sub(1);
    if lookback == 0 || history.len() < lookback {
        return BTreeSet::new();
    }

    let recent = &history[history.len() - lookback..];
    current
        .failure_ids
        .iter()
        .filter(|id| recent.iter().all(|r| r.failures.contains(id)))
        .cloned()
        .collect()
}

/// Metrics of the most recent record, used as "previous" when deciding the
/// next iteration.
pub fn previous_metrics(history: &[IterationRecord]) -> Option<Metrics> {
    history.last().map(IterationRecord::metrics)
}
