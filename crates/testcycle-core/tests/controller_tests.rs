use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use testcycle_core::{
    BlockReason, Collaborators, CycleContext, CycleOutcome, IterationController, TaskQueue,
};
use testcycle_executor::{
    Criticality, ExecutorConfig, ExecutorError, FailureRecord, FixExecutor, FixOutcome,
    FixStrategy, RollbackHandler, TaskDescriptor, TaskKind, TaskOrigin, TaskStatus, TestExecutor,
    TestResult,
};
use testcycle_logging::Logger;
use testcycle_policy::{
    synthesized_task_id, Decision, FailureAnalyzer, FailureContext, IterationRecord, Metrics,
    Synthesis,
};
use testcycle_store::{
    parse_session, IterationStateStore, JsonlStateStore, MemoryStateStore,
};

// ============================================================
// Scripted collaborators
// ============================================================

/// Test executor that replays a script of results, one per run
#[derive(Default)]
struct ScriptedTests {
    script: Mutex<VecDeque<Result<TestResult, ExecutorError>>>,
    runs: Mutex<usize>,
    generated: Mutex<usize>,
    delay: Option<Duration>,
}

impl ScriptedTests {
    fn new(script: Vec<Result<TestResult, ExecutorError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    fn reports(reports: Vec<TestResult>) -> Self {
        Self::new(reports.into_iter().map(Ok).collect())
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::reports(vec![report(10, &[]), report(10, &[])])
        }
    }

    fn runs(&self) -> usize {
        *self.runs.lock().unwrap()
    }
}

#[async_trait]
impl TestExecutor for ScriptedTests {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn run(
        &self,
        _task: &TaskDescriptor,
        _config: &ExecutorConfig,
    ) -> Result<TestResult, ExecutorError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        *self.runs.lock().unwrap() += 1;
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ExecutorError::ExecutionFailed("script exhausted".into())))
    }

    async fn generate(
        &self,
        _task: &TaskDescriptor,
        _config: &ExecutorConfig,
    ) -> Result<(), ExecutorError> {
        *self.generated.lock().unwrap() += 1;
        Ok(())
    }
}

/// Fix executor that records what it applied
struct ScriptedFixer {
    applied: Mutex<Vec<String>>,
    files: Vec<PathBuf>,
    succeed: bool,
}

impl ScriptedFixer {
    fn touching(files: &[&str]) -> Self {
        Self {
            applied: Mutex::new(Vec::new()),
            files: files.iter().map(PathBuf::from).collect(),
            succeed: true,
        }
    }

    fn failing() -> Self {
        Self {
            succeed: false,
            ..Self::touching(&[])
        }
    }

    fn applied(&self) -> Vec<String> {
        self.applied.lock().unwrap().clone()
    }
}

#[async_trait]
impl FixExecutor for ScriptedFixer {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn apply(
        &self,
        task: &TaskDescriptor,
        _config: &ExecutorConfig,
    ) -> Result<FixOutcome, ExecutorError> {
        self.applied.lock().unwrap().push(task.id.clone());
        if self.succeed {
            Ok(FixOutcome::applied(self.files.clone()))
        } else {
            Ok(FixOutcome::failed())
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum AnalyzerMode {
    Answer,
    Fail,
    Hang,
}

/// Analyzer that proposes one fix per failing context, or fails on demand
struct ScriptedAnalyzer {
    mode: AnalyzerMode,
    contexts: Mutex<Vec<FailureContext>>,
}

impl ScriptedAnalyzer {
    fn new(mode: AnalyzerMode) -> Self {
        Self {
            mode,
            contexts: Mutex::new(Vec::new()),
        }
    }

    fn contexts(&self) -> Vec<FailureContext> {
        self.contexts.lock().unwrap().clone()
    }
}

#[async_trait]
impl FailureAnalyzer for ScriptedAnalyzer {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn analyze(
        &self,
        context: &FailureContext,
        _history: &[IterationRecord],
        _config: &ExecutorConfig,
    ) -> Result<Synthesis, ExecutorError> {
        self.contexts.lock().unwrap().push(context.clone());
        match self.mode {
            AnalyzerMode::Answer => Ok(Synthesis::Task(
                TaskDescriptor::fix(synthesized_task_id(context.iteration))
                    .with_payload(serde_json::json!({ "tests": context.failing_test_ids() })),
            )),
            AnalyzerMode::Fail => Err(ExecutorError::ExecutionFailed(
                "analysis service unavailable".into(),
            )),
            AnalyzerMode::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Err(ExecutorError::ExecutionFailed("unreachable".into()))
            }
        }
    }
}

/// Rollback handler that records reverted files
struct RecordingRollback {
    reverted: Mutex<Vec<Vec<PathBuf>>>,
    succeed: bool,
}

impl RecordingRollback {
    fn new(succeed: bool) -> Self {
        Self {
            reverted: Mutex::new(Vec::new()),
            succeed,
        }
    }
}

#[async_trait]
impl RollbackHandler for RecordingRollback {
    fn name(&self) -> &str {
        "recording"
    }

    async fn revert(
        &self,
        files: &[PathBuf],
        _config: &ExecutorConfig,
    ) -> Result<bool, ExecutorError> {
        self.reverted.lock().unwrap().push(files.to_vec());
        Ok(self.succeed)
    }
}

// ============================================================
// Helpers
// ============================================================

/// `total` tests, the listed ones failing with high criticality
fn report(total: usize, failing: &[&str]) -> TestResult {
    report_with(total, failing, Criticality::High)
}

fn report_with(total: usize, failing: &[&str], criticality: Criticality) -> TestResult {
    let failures = failing
        .iter()
        .map(|id| FailureRecord::new(*id, criticality).with_message("assertion failed"))
        .collect::<Vec<_>>();
    TestResult::new(total, total - failing.len(), failures)
}

fn suite() -> TaskQueue {
    TaskQueue::new(vec![TaskDescriptor::test_run("suite")]).unwrap()
}

fn context(max_iterations: u32) -> CycleContext {
    CycleContext::new("session", PathBuf::from("/tmp/project")).with_max_iterations(max_iterations)
}

fn logger() -> Arc<Logger> {
    Arc::new(Logger::quiet())
}

fn decisions(outcome: &CycleOutcome) -> Vec<Decision> {
    outcome.history().iter().map(|r| r.decision).collect()
}

fn synthesized(queue: &TaskQueue) -> Vec<&TaskDescriptor> {
    queue.tasks().filter(|t| t.is_synthesized()).collect()
}

// ============================================================
// Scenarios
// ============================================================

#[tokio::test]
async fn test_converges_to_success_in_three_iterations() {
    let tests = ScriptedTests::reports(vec![
        report(10, &["a", "b", "c"]),
        report(10, &["a"]),
        report(10, &[]),
    ]);
    let fixer = ScriptedFixer::touching(&["src/lib.rs"]);
    let analyzer = ScriptedAnalyzer::new(AnalyzerMode::Answer);
    let store = MemoryStateStore::new();
    let controller = IterationController::new(
        Collaborators::new(&tests, &fixer, &analyzer),
        &store,
        logger(),
    );

    let mut queue = suite();
    let outcome = controller.run(&mut queue, context(5)).await.unwrap();

    assert!(outcome.is_success());
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(
        decisions(&outcome),
        vec![Decision::Continue, Decision::Continue, Decision::Success]
    );

    let history = store.load_all().unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(
        history.iter().map(|r| r.iteration).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(history[0].pass_rate, 70.0);
    assert_eq!(history[1].pass_rate, 90.0);
    assert!(history[2].synthesized_task_id.is_none());

    let fixes = synthesized(&queue);
    assert_eq!(fixes.len(), 2);
    assert!(fixes.iter().all(|t| t.status == TaskStatus::Completed));
    assert!(fixes.iter().all(|t| t.depends_on.is_empty()));
    assert_eq!(queue.get("suite").unwrap().status, TaskStatus::Completed);

    // The most recent fix sits at the head
    assert_eq!(
        history[1].synthesized_task_id.as_deref(),
        Some(queue.tasks().next().unwrap().id.as_str())
    );
    assert_eq!(fixer.applied().len(), 2);
    assert_eq!(analyzer.contexts()[1].failing_test_ids(), vec!["a"]);
}

#[tokio::test]
async fn test_aborts_at_iteration_budget() {
    let dir = TempDir::new().unwrap();
    let tests = ScriptedTests::reports(vec![
        report(10, &["a", "b", "c", "d", "e"]),
        report(10, &["a", "b", "c", "d"]),
    ]);
    let fixer = ScriptedFixer::touching(&["src/lib.rs"]);
    let analyzer = ScriptedAnalyzer::new(AnalyzerMode::Answer);
    let store = JsonlStateStore::open(dir.path(), "abort").unwrap();
    let controller = IterationController::new(
        Collaborators::new(&tests, &fixer, &analyzer),
        &store,
        logger(),
    );

    let mut queue = suite();
    let outcome = controller.run(&mut queue, context(2)).await.unwrap();

    assert_eq!(
        outcome.block_reason(),
        Some(&BlockReason::IterationBudgetExceeded { max_iterations: 2 })
    );
    assert_eq!(outcome.exit_code(), 1);
    assert_eq!(decisions(&outcome), vec![Decision::Continue, Decision::Abort]);

    // Persisted, and no synthesis after the abort
    let session = parse_session(store.path()).unwrap();
    assert_eq!(session.iterations.len(), 2);
    assert!(session.iterations[1].synthesized_task_id.is_none());
    assert_eq!(session.end.unwrap().outcome, "blocked");
    assert_eq!(synthesized(&queue).len(), 1);

    match outcome {
        CycleOutcome::Blocked { last_failure, .. } => {
            let failure = last_failure.unwrap();
            assert_eq!(failure.iteration, 2);
            assert_eq!(failure.failures.len(), 4);
        }
        other => panic!("expected blocked outcome, got {:?}", other),
    }
}

#[tokio::test]
async fn test_regression_rolls_back_before_synthesizing() {
    let tests = ScriptedTests::reports(vec![
        report(20, &["a", "b"]),
        report(20, &["a", "b", "c", "d", "e"]),
        report(20, &[]),
    ]);
    let fixer = ScriptedFixer::touching(&["src/parser.rs"]);
    let analyzer = ScriptedAnalyzer::new(AnalyzerMode::Answer);
    let rollback = RecordingRollback::new(true);
    let store = MemoryStateStore::new();
    let controller = IterationController::new(
        Collaborators::new(&tests, &fixer, &analyzer).with_rollback(&rollback),
        &store,
        logger(),
    );

    let mut queue = suite();
    let outcome = controller.run(&mut queue, context(5)).await.unwrap();

    assert!(outcome.is_success());
    assert_eq!(
        decisions(&outcome),
        vec![Decision::Continue, Decision::Regression, Decision::Success]
    );

    let reverted = rollback.reverted.lock().unwrap().clone();
    assert_eq!(reverted, vec![vec![PathBuf::from("src/parser.rs")]]);

    let contexts = analyzer.contexts();
    assert_eq!(contexts[1].strategy, FixStrategy::RegressionRecovery);
    assert_eq!(contexts[1].rolled_back_files, vec![PathBuf::from("src/parser.rs")]);

    let recovery = queue.tasks().next().unwrap();
    assert_eq!(recovery.strategy, FixStrategy::RegressionRecovery);
}

#[tokio::test]
async fn test_failed_rollback_blocks() {
    let tests = ScriptedTests::reports(vec![report(20, &["a"]), report(20, &["a", "b", "c", "d"])]);
    let fixer = ScriptedFixer::touching(&["src/parser.rs"]);
    let analyzer = ScriptedAnalyzer::new(AnalyzerMode::Answer);
    let rollback = RecordingRollback::new(false);
    let store = MemoryStateStore::new();
    let controller = IterationController::new(
        Collaborators::new(&tests, &fixer, &analyzer).with_rollback(&rollback),
        &store,
        logger(),
    );

    let mut queue = suite();
    let outcome = controller.run(&mut queue, context(5)).await.unwrap();

    assert!(matches!(
        outcome.block_reason(),
        Some(BlockReason::RollbackFailed { .. })
    ));
    assert_eq!(outcome.exit_code(), 2);
    assert_eq!(store.load_all().unwrap().len(), 2);
    assert_eq!(queue.get("suite").unwrap().status, TaskStatus::Blocked);
}

#[tokio::test]
async fn test_stuck_requests_alternate_strategy_then_blocks() {
    let tests = ScriptedTests::reports(vec![
        report(10, &["a", "b", "c"]),
        report(10, &["a", "b"]),
        report(10, &["a", "b"]),
        report(10, &["a", "b"]),
    ]);
    let fixer = ScriptedFixer::touching(&["src/lib.rs"]);
    let analyzer = ScriptedAnalyzer::new(AnalyzerMode::Answer);
    let store = MemoryStateStore::new();
    let controller = IterationController::new(
        Collaborators::new(&tests, &fixer, &analyzer),
        &store,
        logger(),
    );

    let mut queue = suite();
    let outcome = controller.run(&mut queue, context(5)).await.unwrap();

    assert_eq!(
        decisions(&outcome),
        vec![
            Decision::Continue,
            Decision::Continue,
            Decision::Stuck,
            Decision::Stuck
        ]
    );
    assert_eq!(
        outcome.block_reason(),
        Some(&BlockReason::Stuck {
            failure_ids: vec!["a".into(), "b".into()]
        })
    );
    assert_eq!(outcome.exit_code(), 1);

    let contexts = analyzer.contexts();
    assert_eq!(contexts.len(), 3);
    assert_eq!(contexts[2].strategy, FixStrategy::Alternate);

    // The alternate fix got its verifying run at iteration 4; the fifth run
    // stays unused once the failures recur with one run left
    assert_eq!(tests.runs(), 4);
    assert_eq!(fixer.applied().len(), 3);
    assert_eq!(store.completed_tasks().unwrap().len(), 3);
}

#[tokio::test]
async fn test_executor_failure_is_retried_once() {
    let tests = ScriptedTests::new(vec![
        Err(ExecutorError::ExecutionFailed("runner crashed".into())),
        Ok(report(10, &[])),
    ]);
    let fixer = ScriptedFixer::touching(&[]);
    let analyzer = ScriptedAnalyzer::new(AnalyzerMode::Answer);
    let store = MemoryStateStore::new();
    let controller = IterationController::new(
        Collaborators::new(&tests, &fixer, &analyzer),
        &store,
        logger(),
    );

    let outcome = controller.run(&mut suite(), context(5)).await.unwrap();

    assert!(outcome.is_success());
    assert_eq!(tests.runs(), 2);
    assert_eq!(outcome.iterations(), 1);
}

#[tokio::test]
async fn test_executor_failing_twice_blocks_the_task() {
    let tests = ScriptedTests::new(vec![
        Err(ExecutorError::ExecutionFailed("runner crashed".into())),
        Err(ExecutorError::ExecutionFailed("runner crashed again".into())),
        Ok(report(10, &[])),
    ]);
    let fixer = ScriptedFixer::touching(&[]);
    let analyzer = ScriptedAnalyzer::new(AnalyzerMode::Answer);
    let store = MemoryStateStore::new();
    let controller = IterationController::new(
        Collaborators::new(&tests, &fixer, &analyzer),
        &store,
        logger(),
    );

    let mut queue = suite();
    let outcome = controller.run(&mut queue, context(5)).await.unwrap();

    match outcome.block_reason() {
        Some(BlockReason::ExecutorFailure { task_id, error }) => {
            assert_eq!(task_id, "suite");
            assert!(error.contains("runner crashed again"));
        }
        other => panic!("expected executor failure, got {:?}", other),
    }
    assert_eq!(outcome.exit_code(), 2);
    assert_eq!(tests.runs(), 2);
    assert_eq!(queue.get("suite").unwrap().status, TaskStatus::Blocked);
    assert!(store.load_all().unwrap().is_empty());
}

#[tokio::test]
async fn test_fix_reporting_failure_blocks_after_retry() {
    let tests = ScriptedTests::reports(vec![report(10, &["a"])]);
    let fixer = ScriptedFixer::failing();
    let analyzer = ScriptedAnalyzer::new(AnalyzerMode::Answer);
    let store = MemoryStateStore::new();
    let controller = IterationController::new(
        Collaborators::new(&tests, &fixer, &analyzer),
        &store,
        logger(),
    );

    let mut queue = suite();
    let outcome = controller.run(&mut queue, context(5)).await.unwrap();

    let fix_id = store.load_all().unwrap()[0]
        .synthesized_task_id
        .clone()
        .unwrap();
    assert!(matches!(
        outcome.block_reason(),
        Some(BlockReason::ExecutorFailure { task_id, .. }) if *task_id == fix_id
    ));
    assert_eq!(fixer.applied(), vec![fix_id.clone(), fix_id.clone()]);
    assert_eq!(queue.get(&fix_id).unwrap().status, TaskStatus::Blocked);
}

#[tokio::test]
async fn test_dispatch_timeout_counts_as_failure() {
    let tests = ScriptedTests::slow(Duration::from_millis(500));
    let fixer = ScriptedFixer::touching(&[]);
    let analyzer = ScriptedAnalyzer::new(AnalyzerMode::Answer);
    let store = MemoryStateStore::new();
    let controller = IterationController::new(
        Collaborators::new(&tests, &fixer, &analyzer),
        &store,
        logger(),
    )
    .with_dispatch_timeout(Duration::from_millis(20));

    let outcome = controller.run(&mut suite(), context(5)).await.unwrap();

    match outcome.block_reason() {
        Some(BlockReason::ExecutorFailure { error, .. }) => assert!(error.contains("timed out")),
        other => panic!("expected executor failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_analyzer_failure_degrades_to_heuristic_task() {
    let tests = ScriptedTests::reports(vec![report(10, &["a", "b"]), report(10, &[])]);
    let fixer = ScriptedFixer::touching(&[]);
    let analyzer = ScriptedAnalyzer::new(AnalyzerMode::Fail);
    let store = MemoryStateStore::new();
    let controller = IterationController::new(
        Collaborators::new(&tests, &fixer, &analyzer),
        &store,
        logger(),
    );

    let mut queue = suite();
    let outcome = controller.run(&mut queue, context(5)).await.unwrap();

    assert!(outcome.is_success());
    assert_eq!(outcome.iterations(), 2);

    let fallback = synthesized(&queue)[0];
    assert_eq!(fallback.origin, TaskOrigin::Degraded);
    assert_eq!(fallback.strategy, FixStrategy::RerunFailing);
    assert_eq!(fallback.kind, TaskKind::Fix);
    assert_eq!(fallback.payload["tests"], serde_json::json!(["a", "b"]));
    assert_eq!(fallback.status, TaskStatus::Completed);
    assert_eq!(
        outcome.history()[0].synthesized_task_id.as_deref(),
        Some(fallback.id.as_str())
    );
}

#[tokio::test]
async fn test_analyzer_timeout_degrades() {
    let tests = ScriptedTests::reports(vec![report(10, &["a"]), report(10, &[])]);
    let fixer = ScriptedFixer::touching(&[]);
    let analyzer = ScriptedAnalyzer::new(AnalyzerMode::Hang);
    let store = MemoryStateStore::new();
    let controller = IterationController::new(
        Collaborators::new(&tests, &fixer, &analyzer),
        &store,
        logger(),
    )
    .with_dispatch_timeout(Duration::from_millis(50));

    let mut queue = suite();
    let outcome = controller.run(&mut queue, context(5)).await.unwrap();

    assert!(outcome.is_success());
    assert_eq!(synthesized(&queue)[0].origin, TaskOrigin::Degraded);
}

#[tokio::test]
async fn test_unsatisfiable_dependency_is_a_deadlock() {
    let tests = ScriptedTests::reports(vec![report(10, &[])]);
    let fixer = ScriptedFixer::touching(&[]);
    let analyzer = ScriptedAnalyzer::new(AnalyzerMode::Answer);
    let store = MemoryStateStore::new();
    let controller = IterationController::new(
        Collaborators::new(&tests, &fixer, &analyzer),
        &store,
        logger(),
    );

    let mut queue =
        TaskQueue::new(vec![TaskDescriptor::test_run("suite").with_depends_on(["setup"])])
            .unwrap();
    let outcome = controller.run(&mut queue, context(5)).await.unwrap();

    assert_eq!(
        outcome.block_reason(),
        Some(&BlockReason::QueueDeadlock {
            pending: vec!["suite".into()]
        })
    );
    assert_eq!(tests.runs(), 0);
}

#[tokio::test]
async fn test_empty_suite_is_not_success() {
    let tests = ScriptedTests::reports(vec![TestResult::new(0, 0, Vec::new())]);
    let fixer = ScriptedFixer::touching(&[]);
    let analyzer = ScriptedAnalyzer::new(AnalyzerMode::Answer);
    let store = MemoryStateStore::new();
    let controller = IterationController::new(
        Collaborators::new(&tests, &fixer, &analyzer),
        &store,
        logger(),
    );

    let mut queue = suite();
    let outcome = controller.run(&mut queue, context(5)).await.unwrap();

    assert_eq!(outcome.block_reason(), Some(&BlockReason::EmptyTestSuite));
    assert_eq!(queue.get("suite").unwrap().status, TaskStatus::Blocked);
    assert!(store.load_all().unwrap().is_empty());
}

#[tokio::test]
async fn test_inconsistent_report_halts() {
    let mut bad = report(10, &["a"]);
    bad.passed = 10;
    let tests = ScriptedTests::reports(vec![bad]);
    let fixer = ScriptedFixer::touching(&[]);
    let analyzer = ScriptedAnalyzer::new(AnalyzerMode::Answer);
    let store = MemoryStateStore::new();
    let controller = IterationController::new(
        Collaborators::new(&tests, &fixer, &analyzer),
        &store,
        logger(),
    );

    let outcome = controller.run(&mut suite(), context(5)).await.unwrap();

    match outcome.block_reason() {
        Some(BlockReason::Error { message }) => assert!(message.contains("Inconsistent")),
        other => panic!("expected error, got {:?}", other),
    }
    assert!(analyzer.contexts().is_empty());
}

#[tokio::test]
async fn test_full_pass_with_listed_failure_is_not_success() {
    let mut bad = report(10, &[]);
    bad.failures = vec![FailureRecord::new("auth::login", Criticality::High)];
    let tests = ScriptedTests::reports(vec![bad]);
    let fixer = ScriptedFixer::touching(&[]);
    let analyzer = ScriptedAnalyzer::new(AnalyzerMode::Answer);
    let store = MemoryStateStore::new();
    let controller = IterationController::new(
        Collaborators::new(&tests, &fixer, &analyzer),
        &store,
        logger(),
    );

    let outcome = controller.run(&mut suite(), context(5)).await.unwrap();

    assert!(!matches!(outcome, CycleOutcome::Succeeded { .. }));
    match outcome.block_reason() {
        Some(BlockReason::Error { message }) => assert!(message.contains("failures listed=1")),
        other => panic!("expected error, got {:?}", other),
    }
    assert!(store.load_all().unwrap().is_empty());
}

#[tokio::test]
async fn test_partial_success_lists_low_criticality_caveats() {
    let tests = ScriptedTests::reports(vec![report_with(
        100,
        &["flaky-1", "flaky-2", "cosmetic"],
        Criticality::Low,
    )]);
    let fixer = ScriptedFixer::touching(&[]);
    let analyzer = ScriptedAnalyzer::new(AnalyzerMode::Answer);
    let store = MemoryStateStore::new();
    let controller = IterationController::new(
        Collaborators::new(&tests, &fixer, &analyzer),
        &store,
        logger(),
    );

    let outcome = controller.run(&mut suite(), context(5)).await.unwrap();

    assert_eq!(outcome.exit_code(), 0);
    match outcome {
        CycleOutcome::PartiallySucceeded {
            pass_rate, caveats, ..
        } => {
            assert_eq!(pass_rate, 97.0);
            let ids: Vec<_> = caveats.iter().map(|c| c.test_id.as_str()).collect();
            assert_eq!(ids, vec!["flaky-1", "flaky-2", "cosmetic"]);
        }
        other => panic!("expected partial success, got {:?}", other),
    }
}

/// Session file holding one CONTINUE iteration that queued `fix`
fn interrupted_after_synthesis(dir: &TempDir, fix: &TaskDescriptor) {
    let store = JsonlStateStore::open(dir.path(), "resume").unwrap();
    let metrics = Metrics {
        pass_rate: 70.0,
        critical_failure_count: 3,
        failure_ids: vec!["a".into(), "b".into(), "c".into()],
    };
    store
        .append(&IterationRecord::new(1, &metrics, Decision::Continue).with_synthesized_task(fix))
        .unwrap();
}

#[tokio::test]
async fn test_resume_requeues_fix_that_never_completed() {
    let dir = TempDir::new().unwrap();
    let fix = TaskDescriptor::fix("fix-1-abcd1234")
        .with_origin(TaskOrigin::Synthesized)
        .with_payload(serde_json::json!({"failing": ["a", "b", "c"]}));
    interrupted_after_synthesis(&dir, &fix);

    let tests = ScriptedTests::reports(vec![report(10, &[])]);
    let fixer = ScriptedFixer::touching(&["src/lib.rs"]);
    let analyzer = ScriptedAnalyzer::new(AnalyzerMode::Answer);
    let store = JsonlStateStore::open(dir.path(), "resume").unwrap();
    let controller = IterationController::new(
        Collaborators::new(&tests, &fixer, &analyzer),
        &store,
        logger(),
    );

    let mut queue = suite();
    let outcome = controller.run(&mut queue, context(5)).await.unwrap();

    assert!(outcome.is_success());
    assert_eq!(fixer.applied(), vec!["fix-1-abcd1234"]);
    assert_eq!(queue.get("fix-1-abcd1234").unwrap().status, TaskStatus::Completed);
    assert_eq!(
        outcome.history().iter().map(|r| r.iteration).collect::<Vec<_>>(),
        vec![1, 2]
    );

    let session = parse_session(store.path()).unwrap();
    assert_eq!(session.iterations.len(), 2);
    assert_eq!(session.completed_tasks, vec!["fix-1-abcd1234"]);
    assert!(session.start.unwrap().resumed);
    assert_eq!(session.end.unwrap().outcome, "succeeded");
}

#[tokio::test]
async fn test_resume_does_not_replay_completed_fix() {
    let dir = TempDir::new().unwrap();
    let fix = TaskDescriptor::fix("fix-1-abcd1234").with_origin(TaskOrigin::Synthesized);
    interrupted_after_synthesis(&dir, &fix);
    JsonlStateStore::open(dir.path(), "resume")
        .unwrap()
        .record_task_completed(&fix.id)
        .unwrap();

    let tests = ScriptedTests::reports(vec![report(10, &[])]);
    let fixer = ScriptedFixer::touching(&[]);
    let analyzer = ScriptedAnalyzer::new(AnalyzerMode::Answer);
    let store = JsonlStateStore::open(dir.path(), "resume").unwrap();
    let controller = IterationController::new(
        Collaborators::new(&tests, &fixer, &analyzer),
        &store,
        logger(),
    );

    let outcome = controller.run(&mut suite(), context(5)).await.unwrap();

    assert!(outcome.is_success());
    assert!(fixer.applied().is_empty());
    assert_eq!(tests.runs(), 1);
    assert_eq!(
        outcome.history().iter().map(|r| r.iteration).collect::<Vec<_>>(),
        vec![1, 2]
    );
}

#[tokio::test]
async fn test_resume_uses_history_for_regression_detection() {
    let store = MemoryStateStore::with_records(vec![IterationRecord::new(
        1,
        &Metrics {
            pass_rate: 90.0,
            critical_failure_count: 1,
            failure_ids: vec!["a".into()],
        },
        Decision::Continue,
    )]);
    let tests = ScriptedTests::reports(vec![report(10, &["a", "b", "c", "d"]), report(10, &[])]);
    let fixer = ScriptedFixer::touching(&[]);
    let analyzer = ScriptedAnalyzer::new(AnalyzerMode::Answer);
    let controller = IterationController::new(
        Collaborators::new(&tests, &fixer, &analyzer),
        &store,
        logger(),
    );

    let outcome = controller.run(&mut suite(), context(5)).await.unwrap();

    assert_eq!(
        decisions(&outcome),
        vec![Decision::Continue, Decision::Regression, Decision::Success]
    );
}

#[tokio::test]
async fn test_resume_with_exhausted_budget_does_not_run() {
    let records = (1..=2)
        .map(|i| {
            IterationRecord::new(
                i,
                &Metrics {
                    pass_rate: 50.0,
                    critical_failure_count: 1,
                    failure_ids: vec!["a".into()],
                },
                Decision::Continue,
            )
        })
        .collect();
    let store = MemoryStateStore::with_records(records);
    let tests = ScriptedTests::reports(vec![report(10, &[])]);
    let fixer = ScriptedFixer::touching(&[]);
    let analyzer = ScriptedAnalyzer::new(AnalyzerMode::Answer);
    let controller = IterationController::new(
        Collaborators::new(&tests, &fixer, &analyzer),
        &store,
        logger(),
    );

    let outcome = controller.run(&mut suite(), context(2)).await.unwrap();

    assert_eq!(
        outcome.block_reason(),
        Some(&BlockReason::IterationBudgetExceeded { max_iterations: 2 })
    );
    assert_eq!(tests.runs(), 0);
    assert_eq!(store.load_all().unwrap().len(), 2);
}

#[tokio::test]
async fn test_interrupt_blocks_before_next_turn() {
    let tests = ScriptedTests::reports(vec![report(10, &[])]);
    let fixer = ScriptedFixer::touching(&[]);
    let analyzer = ScriptedAnalyzer::new(AnalyzerMode::Answer);
    let store = MemoryStateStore::new();
    let controller = IterationController::new(
        Collaborators::new(&tests, &fixer, &analyzer),
        &store,
        logger(),
    );

    controller.interrupt_handle().store(true, Ordering::SeqCst);
    let mut queue = suite();
    let outcome = controller.run(&mut queue, context(5)).await.unwrap();

    assert_eq!(outcome.block_reason(), Some(&BlockReason::Interrupted));
    assert_eq!(outcome.exit_code(), 130);
    assert_eq!(tests.runs(), 0);
    assert_eq!(queue.get("suite").unwrap().status, TaskStatus::Pending);
}

#[tokio::test]
async fn test_session_timeout_blocks_and_releases_task() {
    let tests = ScriptedTests::slow(Duration::from_millis(500));
    let fixer = ScriptedFixer::touching(&[]);
    let analyzer = ScriptedAnalyzer::new(AnalyzerMode::Answer);
    let dir = TempDir::new().unwrap();
    let store = JsonlStateStore::open(dir.path(), "timeout").unwrap();
    let controller = IterationController::new(
        Collaborators::new(&tests, &fixer, &analyzer),
        &store,
        logger(),
    )
    .with_session_timeout(Duration::from_millis(50));

    let mut queue = suite();
    let outcome = controller.run(&mut queue, context(5)).await.unwrap();

    assert_eq!(outcome.block_reason(), Some(&BlockReason::SessionTimeout));
    assert_eq!(queue.get("suite").unwrap().status, TaskStatus::Pending);
    let end = parse_session(store.path()).unwrap().end.unwrap();
    assert_eq!(end.reason.as_deref(), Some("session timeout"));
}

#[tokio::test]
async fn test_test_generation_runs_before_dependent_suite() {
    let tests = ScriptedTests::reports(vec![report(4, &[])]);
    let fixer = ScriptedFixer::touching(&[]);
    let analyzer = ScriptedAnalyzer::new(AnalyzerMode::Answer);
    let store = MemoryStateStore::new();
    let controller = IterationController::new(
        Collaborators::new(&tests, &fixer, &analyzer),
        &store,
        logger(),
    );

    let mut queue = TaskQueue::new(vec![
        TaskDescriptor::test_gen("generate"),
        TaskDescriptor::test_run("suite").with_depends_on(["generate"]),
    ])
    .unwrap();
    let outcome = controller.run(&mut queue, context(5)).await.unwrap();

    assert!(outcome.is_success());
    assert_eq!(*tests.generated.lock().unwrap(), 1);
    assert_eq!(queue.get("generate").unwrap().status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_drained_queue_without_test_runs_blocks() {
    let tests = ScriptedTests::reports(vec![]);
    let fixer = ScriptedFixer::touching(&["src/lib.rs"]);
    let analyzer = ScriptedAnalyzer::new(AnalyzerMode::Answer);
    let store = MemoryStateStore::new();
    let controller = IterationController::new(
        Collaborators::new(&tests, &fixer, &analyzer),
        &store,
        logger(),
    );

    let mut queue = TaskQueue::new(vec![TaskDescriptor::fix("planned-fix")]).unwrap();
    let outcome = controller.run(&mut queue, context(5)).await.unwrap();

    assert_eq!(outcome.block_reason(), Some(&BlockReason::NoTestResults));
    assert_eq!(fixer.applied(), vec!["planned-fix".to_string()]);
}
