use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of evaluating one iteration against the convergence policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    /// Every test passes
    Success,
    /// Pass rate above threshold and only low-criticality failures remain.
    /// Terminal, but flagged for review.
    PartialSuccess,
    /// Keep going: synthesize the next fix
    Continue,
    /// Pass rate dropped sharply since the previous iteration; roll back the
    /// last fix before synthesizing another
    Regression,
    /// Most current failures have persisted across the look-back window; a
    /// different strategy is required
    Stuck,
    /// Iteration budget exhausted without convergence
    Abort,
}

impl Decision {
    /// Success and partial success end the cycle in an approved state
    pub fn is_converged(&self) -> bool {
        matches!(self, Decision::Success | Decision::PartialSuccess)
    }

    /// Decisions after which another fix is synthesized
    pub fn requires_synthesis(&self) -> bool {
        matches!(
            self,
            Decision::Continue | Decision::Regression | Decision::Stuck
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Success => "SUCCESS",
            Decision::PartialSuccess => "PARTIAL_SUCCESS",
            Decision::Continue => "CONTINUE",
            Decision::Regression => "REGRESSION",
            Decision::Stuck => "STUCK",
            Decision::Abort => "ABORT",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().replace('-', "_").as_str() {
            "SUCCESS" => Ok(Decision::Success),
            "PARTIAL_SUCCESS" => Ok(Decision::PartialSuccess),
            "CONTINUE" => Ok(Decision::Continue),
            "REGRESSION" => Ok(Decision::Regression),
            "STUCK" => Ok(Decision::Stuck),
            "ABORT" => Ok(Decision::Abort),
            _ => Err(format!("Unknown decision: {}", s)),
        }
    }
}
