use serde::{Deserialize, Serialize};
use testcycle_executor::TestResult;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetricsError {
    /// No tests exist. Zero tests can never certify success.
    #[error("Test suite is empty")]
    EmptyTestSuite,

    #[error("Inconsistent test result: total={total}, passed={passed}, failed={failed}, failures listed={listed}")]
    InconsistentTestResult {
        total: usize,
        passed: usize,
        failed: usize,
        listed: usize,
    },
}

/// Measurements derived from one test run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    /// Percentage of passing tests, in `0.0..=100.0`
    pub pass_rate: f64,
    /// Failures with medium or high criticality
    pub critical_failure_count: usize,
    /// Ids of failing tests, in report order
    pub failure_ids: Vec<String>,
}

impl Metrics {
    pub fn is_fully_passing(&self) -> bool {
        self.failure_ids.is_empty() && self.pass_rate >= 100.0
    }
}

/// Compute metrics for a test report.
///
/// `passed + failed` must equal `total` and every failed test must be listed
/// in `failures`, which keeps `pass_rate == 100` equivalent to an empty
/// failure list.
pub fn evaluate(result: &TestResult) -> Result<Metrics, MetricsError> {
    if result.total == 0 {
        return Err(MetricsError::EmptyTestSuite);
    }
    if result.passed + result.failed != result.total || result.failures.len() != result.failed {
        return Err(MetricsError::InconsistentTestResult {
            total: result.total,
            passed: result.passed,
            failed: result.failed,
            listed: result.failures.len(),
        });
    }

    let pass_rate = result.passed as f64 / result.total as f64 * 100.0;
    let critical_failure_count = result
        .failures
        .iter()
        .filter(|f| f.criticality.is_critical())
        .count();
    let failure_ids = result.failures.iter().map(|f| f.test_id.clone()).collect();

    Ok(Metrics {
        pass_rate,
        critical_failure_count,
        failure_ids,
    })
}
