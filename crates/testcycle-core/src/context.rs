use std::path::PathBuf;
use std::time::{Duration, Instant};
use testcycle_policy::{FailureContext, IterationRecord, Metrics};

/// Default iteration budget
pub const DEFAULT_MAX_ITERATIONS: u32 = 5;

/// Mutable state of one test-fix session
#[derive(Debug, Clone)]
pub struct CycleContext {
    pub session_id: String,
    pub working_dir: PathBuf,
    /// Evaluated test runs allowed before the policy aborts
    pub max_iterations: u32,
    /// Iteration history, oldest first
    pub history: Vec<IterationRecord>,
    /// Files touched by the most recent fix, reverted on regression
    pub last_applied_files: Vec<PathBuf>,
    /// Failure context of the most recent evaluation
    pub last_failure: Option<FailureContext>,
    /// Whether history was loaded from an earlier run
    pub resumed: bool,
    started_at: Instant,
}

impl CycleContext {
    pub fn new(session_id: impl Into<String>, working_dir: PathBuf) -> Self {
        Self {
            session_id: session_id.into(),
            working_dir,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            history: Vec::new(),
            last_applied_files: Vec::new(),
            last_failure: None,
            resumed: false,
            started_at: Instant::now(),
        }
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    /// Continue from persisted history
    pub fn resume_from(&mut self, history: Vec<IterationRecord>) {
        self.resumed = !history.is_empty();
        self.history = history;
    }

    /// Number of evaluated iterations so far
    pub fn iteration(&self) -> u32 {
        self.history.len() as u32
    }

    /// Number the next evaluated test run will get (1-based)
    pub fn next_iteration(&self) -> u32 {
        self.iteration() + 1
    }

    /// Evaluated test runs still allowed
    pub fn remaining_iterations(&self) -> u32 {
        self.max_iterations.saturating_sub(self.iteration())
    }

    pub fn budget_exhausted(&self) -> bool {
        self.remaining_iterations() == 0
    }

    pub fn push_record(&mut self, record: IterationRecord) {
        self.history.push(record);
    }

    pub fn last_metrics(&self) -> Option<Metrics> {
        self.history.last().map(IterationRecord::metrics)
    }

    pub fn total_duration(&self) -> Duration {
        self.started_at.elapsed()
    }
}
