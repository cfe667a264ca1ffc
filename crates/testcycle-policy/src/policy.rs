use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::debug;

use crate::{Decision, Metrics};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PolicyError {
    #[error("Invalid policy configuration: {0}")]
    InvalidConfig(String),
}

/// Thresholds of the convergence policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyConfig {
    /// Minimum pass rate for partial success (inclusive)
    pub partial_success_threshold: f64,
    /// Percentage-point drop versus the previous iteration that counts as a
    /// regression (exclusive)
    pub regression_drop: f64,
    /// Number of most recent iterations, including the current one, a failure
    /// must appear in to count as stuck
    pub stuck_window: usize,
    /// Share of current failures that must be stuck to declare the cycle stuck
    pub stuck_ratio: f64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            partial_success_threshold: 95.0,
            regression_drop: 10.0,
            stuck_window: 3,
            stuck_ratio: 0.5,
        }
    }
}

impl PolicyConfig {
    pub fn validate(&self) -> Result<(), PolicyError> {
        if !(0.0..=100.0).contains(&self.partial_success_threshold) {
            return Err(PolicyError::InvalidConfig(format!(
                "partial_success_threshold must be within 0..=100, got {}",
                self.partial_success_threshold
            )));
        }
        if self.regression_drop.is_nan() || self.regression_drop < 0.0 {
            return Err(PolicyError::InvalidConfig(format!(
                "regression_drop must be non-negative, got {}",
                self.regression_drop
            )));
        }
        if self.stuck_window < 2 {
            return Err(PolicyError::InvalidConfig(format!(
                "stuck_window must be at least 2, got {}",
                self.stuck_window
            )));
        }
        if !(self.stuck_ratio > 0.0 && self.stuck_ratio <= 1.0) {
            return Err(PolicyError::InvalidConfig(format!(
                "stuck_ratio must be within (0, 1], got {}",
                self.stuck_ratio
            )));
        }
        Ok(())
    }
}

/// Everything the policy looks at for one decision.
#[derive(Clone, Copy)]
pub struct PolicyInput<'a> {
    pub current: &'a Metrics,
    pub previous: Option<&'a Metrics>,
    /// 1-based number of the iteration being decided
    pub iteration: u32,
    pub max_iterations: u32,
    pub stuck_failure_ids: &'a BTreeSet<String>,
}

/// Pure decision function over iteration metrics.
///
/// Precedence: success, partial success, abort, regression, stuck, continue.
#[derive(Debug, Clone, Default)]
pub struct ConvergencePolicy {
    config: PolicyConfig,
}

impl ConvergencePolicy {
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn decide(&self, input: &PolicyInput<'_>) -> Decision {
        let decision = self.classify(input);
        debug!(
            iteration = input.iteration,
            pass_rate = input.current.pass_rate,
            critical = input.current.critical_failure_count,
            %decision,
            "Convergence decision"
        );
        decision
    }

    fn classify(&self, input: &PolicyInput<'_>) -> Decision {
        let current = input.current;

        if current.is_fully_passing() {
            return Decision::Success;
        }
        if self.meets_partial_success(current) {
            return Decision::PartialSuccess;
        }
        if input.iteration >= input.max_iterations {
            return Decision::Abort;
        }
        if let Some(previous) = input.previous {
            if previous.pass_rate - current.pass_rate > self.config.regression_drop {
                return Decision::Regression;
            }
        }
        if self.is_stuck(current, input.stuck_failure_ids) {
            return Decision::Stuck;
        }
        Decision::Continue
    }

    /// Pass rate at or above threshold with only low-criticality failures
    pub fn meets_partial_success(&self, metrics: &Metrics) -> bool {
        metrics.pass_rate >= self.config.partial_success_threshold
            && metrics.critical_failure_count == 0
    }

    fn is_stuck(&self, current: &Metrics, stuck_ids: &BTreeSet<String>) -> bool {
        if current.failure_ids.is_empty() || stuck_ids.is_empty() {
            return false;
        }
        let stuck = current
            .failure_ids
            .iter()
            .filter(|id| stuck_ids.contains(*id))
            .count();
        stuck as f64 / current.failure_ids.len() as f64 >= self.config.stuck_ratio
    }
}
