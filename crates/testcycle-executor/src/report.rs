use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Severity of a failing test, assigned by the test executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Criticality {
    Low,
    Medium,
    High,
}

impl Criticality {
    /// Medium and high failures block partial success
    pub fn is_critical(self) -> bool {
        !matches!(self, Criticality::Low)
    }
}

impl fmt::Display for Criticality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Criticality::Low => write!(f, "low"),
            Criticality::Medium => write!(f, "medium"),
            Criticality::High => write!(f, "high"),
        }
    }
}

/// A single failing test.
///
/// `criticality` is required: a report that leaves it out is invalid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub test_id: String,
    #[serde(default)]
    pub message: String,
    pub criticality: Criticality,
}

impl FailureRecord {
    pub fn new(test_id: impl Into<String>, criticality: Criticality) -> Self {
        Self {
            test_id: test_id.into(),
            message: String::new(),
            criticality,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

/// Report produced once per test-run task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    #[serde(default)]
    pub failures: Vec<FailureRecord>,
}

impl TestResult {
    pub fn new(total: usize, passed: usize, failures: Vec<FailureRecord>) -> Self {
        Self {
            total,
            passed,
            failed: total.saturating_sub(passed),
            failures,
        }
    }
}

/// Result of applying a fix task
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixOutcome {
    #[serde(default)]
    pub applied_files: Vec<PathBuf>,
    pub success: bool,
}

impl FixOutcome {
    pub fn applied(files: Vec<PathBuf>) -> Self {
        Self {
            applied_files: files,
            success: true,
        }
    }

    pub fn failed() -> Self {
        Self {
            applied_files: Vec::new(),
            success: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_criticality_ordering() {
        assert!(Criticality::High > Criticality::Medium);
        assert!(Criticality::Medium > Criticality::Low);
        assert!(!Criticality::Low.is_critical());
        assert!(Criticality::Medium.is_critical());
    }

    #[test]
    fn test_parse_report_json() {
        let json = r#"{
            "total": 10,
            "passed": 8,
            "failed": 2,
            "failures": [
                {"test_id": "auth::login", "message": "expected 200", "criticality": "high"},
                {"test_id": "ui::tooltip", "criticality": "low"}
            ]
        }"#;
        let result: TestResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.failures.len(), 2);
        assert_eq!(result.failures[0].criticality, Criticality::High);
        assert_eq!(result.failures[1].criticality, Criticality::Low);
        assert!(result.failures[1].message.is_empty());
    }

    #[test]
    fn test_failure_without_criticality_is_rejected() {
        let json = r#"{
            "total": 10,
            "passed": 9,
            "failed": 1,
            "failures": [{"test_id": "auth::login", "message": "expected 200"}]
        }"#;
        let err = serde_json::from_str::<TestResult>(json).unwrap_err();
        assert!(err.to_string().contains("criticality"));
    }

    #[test]
    fn test_new_derives_failed_count() {
        let result = TestResult::new(3, 2, vec![FailureRecord::new("a", Criticality::Medium)]);
        assert_eq!(result.failed, 1);
        assert_eq!(TestResult::new(3, 3, vec![]).failed, 0);
    }
}
