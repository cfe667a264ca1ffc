use chrono::Utc;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use testcycle_executor::{
    ExecutorConfig, ExecutorError, FixExecutor, FixStrategy, NoRollback, RollbackHandler,
    TaskDescriptor, TaskKind, TaskStatus, TestExecutor, TestResult,
};
use testcycle_logging::{LogEvent, Logger};
use testcycle_policy::{
    evaluate, previous_metrics, stuck_failure_ids, ConvergencePolicy, Decision, FailureAnalyzer,
    FailureContext, HeuristicAnalyzer, IterationRecord, PolicyInput, Synthesis,
};
use testcycle_store::{AppendOutcome, IterationStateStore, SessionEnd, SessionStart};

use crate::{BlockReason, CycleContext, CycleError, CycleOutcome, TaskQueue};

/// First attempt plus one retry
const DISPATCH_ATTEMPTS: u32 = 2;

static NO_ROLLBACK: NoRollback = NoRollback;

/// The external collaborators a cycle dispatches to
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub tests: &'a dyn TestExecutor,
    pub fixer: &'a dyn FixExecutor,
    pub analyzer: &'a dyn FailureAnalyzer,
    pub rollback: &'a dyn RollbackHandler,
}

impl<'a> Collaborators<'a> {
    /// Collaborators with rollback disabled
    pub fn new(
        tests: &'a dyn TestExecutor,
        fixer: &'a dyn FixExecutor,
        analyzer: &'a dyn FailureAnalyzer,
    ) -> Self {
        Self {
            tests,
            fixer,
            analyzer,
            rollback: &NO_ROLLBACK,
        }
    }

    pub fn with_rollback(mut self, rollback: &'a dyn RollbackHandler) -> Self {
        self.rollback = rollback;
        self
    }
}

/// Drives the test-fix loop: pulls the next runnable task, dispatches it,
/// evaluates test runs against the convergence policy and feeds synthesized
/// fixes back into the queue until a terminal state.
///
/// One task is in progress at a time. The queue and the state store are
/// mutated only from here.
pub struct IterationController<'a> {
    collaborators: Collaborators<'a>,
    store: &'a dyn IterationStateStore,
    policy: ConvergencePolicy,
    logger: Arc<Logger>,
    dispatch_timeout: Option<Duration>,
    session_timeout: Option<Duration>,
    interrupted: Arc<AtomicBool>,
}

impl<'a> IterationController<'a> {
    pub fn new(
        collaborators: Collaborators<'a>,
        store: &'a dyn IterationStateStore,
        logger: Arc<Logger>,
    ) -> Self {
        Self {
            collaborators,
            store,
            policy: ConvergencePolicy::default(),
            logger,
            dispatch_timeout: None,
            session_timeout: None,
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_policy(mut self, policy: ConvergencePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Bound every executor, analyzer and rollback call
    pub fn with_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout = Some(timeout);
        self
    }

    /// Bound the whole session; on expiry the cycle blocks with state persisted
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    /// Get a handle to signal interruption
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        self.interrupted.clone()
    }

    /// Run the cycle until it succeeds, partially succeeds or blocks.
    ///
    /// History already in the store is loaded first, so a rerun of an
    /// interrupted session continues from its last recorded iteration without
    /// replaying fixes. A fix queued by that iteration but never marked
    /// completed is queued again. Errors are returned only when the store
    /// cannot record the session; everything else ends in a `Blocked` outcome.
    pub async fn run(
        &self,
        queue: &mut TaskQueue,
        mut context: CycleContext,
    ) -> Result<CycleOutcome, CycleError> {
        context.resume_from(self.store.load_all()?);

        self.store.record_start(&SessionStart {
            session_id: context.session_id.clone(),
            timestamp: Utc::now(),
            working_dir: context.working_dir.clone(),
            max_iterations: context.max_iterations,
            resumed: context.resumed,
        })?;

        self.logger.log(&LogEvent::CycleStarted {
            session_id: context.session_id.clone(),
            working_dir: context.working_dir.clone(),
            max_iterations: context.max_iterations,
            queued_tasks: queue.len(),
        });

        if context.resumed {
            info!(
                session_id = %context.session_id,
                iterations = context.iteration(),
                "Resuming session"
            );
            self.logger.log(&LogEvent::CycleResumed {
                session_id: context.session_id.clone(),
                completed_iterations: context.iteration(),
            });

            if context
                .history
                .last()
                .is_some_and(|r| r.decision.is_converged())
            {
                let outcome = self.drained(&context);
                self.finish(&outcome)?;
                return Ok(outcome);
            }

            if let Some(fix) = self.unfinished_fix(&context)? {
                if queue.get(&fix.id).is_none() {
                    info!(task_id = %fix.id, "Re-queueing fix that never completed");
                    if let Err(e) = queue.insert_at_head(fix) {
                        let reason = BlockReason::from(&CycleError::from(e));
                        let outcome = self.blocked(&context, reason);
                        self.finish(&outcome)?;
                        return Ok(outcome);
                    }
                }
            }
        }

        let mut config = ExecutorConfig::new(context.working_dir.clone());
        if let Some(timeout) = self.dispatch_timeout {
            config = config.with_timeout(timeout);
        }

        let outcome = loop {
            if self.interrupted.load(Ordering::SeqCst) {
                info!("Cycle interrupted by user");
                queue.reset_in_progress();
                break self.blocked(&context, BlockReason::Interrupted);
            }

            let turn = match self.session_timeout {
                Some(limit) => {
                    let remaining = limit.saturating_sub(context.total_duration());
                    let result =
                        tokio::time::timeout(remaining, self.run_turn(queue, &mut context, &config))
                            .await;
                    match result {
                        Ok(turn) => turn,
                        Err(_) => {
                            warn!(?limit, "Session timeout reached");
                            queue.reset_in_progress();
                            break self.blocked(&context, BlockReason::SessionTimeout);
                        }
                    }
                }
                None => self.run_turn(queue, &mut context, &config).await,
            };

            match turn {
                Ok(Some(outcome)) => break outcome,
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "Cycle blocked");
                    break self.blocked(&context, BlockReason::from(&e));
                }
            }
        };

        self.finish(&outcome)?;
        Ok(outcome)
    }

    /// One loop turn. Returns `Some(outcome)` if the cycle should terminate,
    /// `None` to continue.
    async fn run_turn(
        &self,
        queue: &mut TaskQueue,
        context: &mut CycleContext,
        config: &ExecutorConfig,
    ) -> Result<Option<CycleOutcome>, CycleError> {
        let Some(task) = queue.next_runnable().cloned() else {
            if queue.has_pending() {
                return Err(CycleError::QueueDeadlock {
                    pending: queue.pending_ids(),
                });
            }
            return Ok(Some(self.drained(context)));
        };

        if task.kind == TaskKind::TestRun && context.budget_exhausted() {
            return Err(CycleError::IterationBudgetExceeded {
                max_iterations: context.max_iterations,
            });
        }

        queue.mark_in_progress(&task.id)?;
        let iteration = context.next_iteration();
        let task_ref = &task;

        match task.kind {
            TaskKind::TestGen => {
                let tests = self.collaborators.tests;
                let generated = self
                    .dispatch(iteration, task_ref, move || tests.generate(task_ref, config))
                    .await;
                block_on_error(queue, &task.id, generated)?;
                queue.mark_completed(&task.id)?;
                Ok(None)
            }
            TaskKind::Fix => {
                let fixer = self.collaborators.fixer;
                let applied = self
                    .dispatch(iteration, task_ref, move || async move {
                        let outcome = fixer.apply(task_ref, config).await?;
                        if outcome.success {
                            Ok(outcome)
                        } else {
                            Err(ExecutorError::ExecutionFailed(
                                "fix executor reported failure".into(),
                            ))
                        }
                    })
                    .await;
                let outcome = block_on_error(queue, &task.id, applied)?;
                debug!(
                    task_id = %task.id,
                    files = outcome.applied_files.len(),
                    "Fix applied"
                );
                self.store.record_task_completed(&task.id)?;
                context.last_applied_files = outcome.applied_files;
                queue.mark_completed(&task.id)?;
                Ok(None)
            }
            TaskKind::TestRun => {
                let tests = self.collaborators.tests;
                let ran = self
                    .dispatch(iteration, task_ref, move || tests.run(task_ref, config))
                    .await;
                let result = block_on_error(queue, &task.id, ran)?;
                self.evaluate_run(queue, context, &task, result, config)
                    .await
            }
        }
    }

    /// Evaluate a test run, decide, and either terminate or queue the next fix
    async fn evaluate_run(
        &self,
        queue: &mut TaskQueue,
        context: &mut CycleContext,
        task: &TaskDescriptor,
        result: TestResult,
        config: &ExecutorConfig,
    ) -> Result<Option<CycleOutcome>, CycleError> {
        let metrics = match evaluate(&result) {
            Ok(metrics) => metrics,
            Err(e) => {
                queue.mark_blocked(&task.id)?;
                return Err(e.into());
            }
        };

        let iteration = context.next_iteration();
        self.logger.log(&LogEvent::TestsEvaluated {
            iteration,
            total: result.total as u32,
            passed: result.passed as u32,
            pass_rate: metrics.pass_rate,
            critical_failures: metrics.critical_failure_count,
        });

        let stuck_ids = stuck_failure_ids(
            &context.history,
            &metrics,
            self.policy.config().stuck_window,
        );
        let previous = previous_metrics(&context.history);
        let decision = self.policy.decide(&PolicyInput {
            current: &metrics,
            previous: previous.as_ref(),
            iteration,
            max_iterations: context.max_iterations,
            stuck_failure_ids: &stuck_ids,
        });
        self.logger.log(&LogEvent::DecisionMade {
            iteration,
            decision: decision.to_string(),
        });

        let record = IterationRecord::new(iteration, &metrics, decision);
        let mut failure = FailureContext {
            iteration,
            pass_rate: metrics.pass_rate,
            failures: result.failures,
            strategy: FixStrategy::Standard,
            source_task_id: task.id.clone(),
            rolled_back_files: Vec::new(),
        };

        match decision {
            Decision::Success => {
                queue.mark_completed(&task.id)?;
                self.append(context, record)?;
                context.last_failure = None;
                return Ok(Some(CycleOutcome::succeeded(
                    context.history.clone(),
                    context.total_duration(),
                )));
            }
            Decision::PartialSuccess => {
                queue.mark_completed(&task.id)?;
                self.append(context, record)?;
                let caveats = failure.failures.clone();
                context.last_failure = Some(failure);
                return Ok(Some(CycleOutcome::partially_succeeded(
                    metrics.pass_rate,
                    caveats,
                    context.history.clone(),
                    context.total_duration(),
                )));
            }
            Decision::Abort => {
                queue.mark_blocked(&task.id)?;
                self.append(context, record)?;
                context.last_failure = Some(failure);
                let reason = BlockReason::IterationBudgetExceeded {
                    max_iterations: context.max_iterations,
                };
                return Ok(Some(self.blocked(context, reason)));
            }
            Decision::Stuck if context.max_iterations.saturating_sub(iteration) <= 1 => {
                // At most one test run left: block with the recurring failures
                // and leave that run unused
                queue.mark_blocked(&task.id)?;
                self.append(context, record)?;
                context.last_failure = Some(failure);
                let reason = BlockReason::Stuck {
                    failure_ids: stuck_ids.into_iter().collect(),
                };
                return Ok(Some(self.blocked(context, reason)));
            }
            Decision::Stuck => {
                failure.strategy = FixStrategy::Alternate;
            }
            Decision::Regression => {
                let files = std::mem::take(&mut context.last_applied_files);
                if let Err(e) = self.rollback(iteration, &files, config).await {
                    queue.mark_blocked(&task.id)?;
                    self.append(context, record)?;
                    context.last_failure = Some(failure);
                    return Err(e);
                }
                failure.strategy = FixStrategy::RegressionRecovery;
                failure.rolled_back_files = files;
            }
            Decision::Continue => {}
        }

        let fix = self.synthesize(&failure, context, config).await;
        let record = record.with_synthesized_task(&fix);
        queue.insert_at_head(fix)?;
        // The test run repeats after the fix
        queue.mark_pending(&task.id)?;
        self.append(context, record)?;
        context.last_failure = Some(failure);
        Ok(None)
    }

    /// Dispatch with timeout, retrying once before giving up
    async fn dispatch<T, F, Fut>(
        &self,
        iteration: u32,
        task: &TaskDescriptor,
        mut call: F,
    ) -> Result<T, CycleError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExecutorError>>,
    {
        let mut attempt = 1;
        loop {
            self.logger.log(&LogEvent::TaskDispatched {
                iteration,
                task_id: task.id.clone(),
                kind: task.kind.to_string(),
                attempt,
            });

            let started = Instant::now();
            match self.with_timeout(call()).await {
                Ok(value) => {
                    self.logger.log(&LogEvent::TaskCompleted {
                        iteration,
                        task_id: task.id.clone(),
                        kind: task.kind.to_string(),
                        duration_secs: started.elapsed().as_secs_f64(),
                    });
                    return Ok(value);
                }
                Err(e) if attempt < DISPATCH_ATTEMPTS => {
                    warn!(
                        task_id = %task.id,
                        attempt,
                        timed_out = e.is_timeout(),
                        error = %e,
                        "Dispatch failed, retrying"
                    );
                    self.logger.log(&LogEvent::DispatchRetried {
                        iteration,
                        task_id: task.id.clone(),
                        error: e.to_string(),
                    });
                    attempt += 1;
                }
                Err(e) => {
                    warn!(
                        task_id = %task.id,
                        attempt,
                        timed_out = e.is_timeout(),
                        error = %e,
                        "Dispatch failed after retry"
                    );
                    return Err(CycleError::ExecutorFailure {
                        task_id: task.id.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }
    }

    async fn with_timeout<T, F>(&self, call: F) -> Result<T, ExecutorError>
    where
        F: Future<Output = Result<T, ExecutorError>>,
    {
        match self.dispatch_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .unwrap_or_else(|_| Err(ExecutorError::Timeout(limit))),
            None => call.await,
        }
    }

    /// Ask the analyzer for the next fix. Never fails: an analyzer error or
    /// timeout degrades to the heuristic fallback task.
    async fn synthesize(
        &self,
        failure: &FailureContext,
        context: &CycleContext,
        config: &ExecutorConfig,
    ) -> TaskDescriptor {
        let analyzer = self.collaborators.analyzer;
        let synthesis = match self
            .with_timeout(analyzer.analyze(failure, &context.history, config))
            .await
        {
            Ok(synthesis) => synthesis,
            Err(e) => {
                let degraded = CycleError::AnalyzerDegraded(e.to_string());
                warn!(analyzer = analyzer.name(), error = %degraded, "Using heuristic fix task");
                Synthesis::Degraded {
                    task: HeuristicAnalyzer::fallback_task(failure),
                    reason: e.to_string(),
                }
            }
        };

        if let Synthesis::Degraded { task, reason } = &synthesis {
            self.logger.log(&LogEvent::SynthesisDegraded {
                iteration: failure.iteration,
                task_id: task.id.clone(),
                reason: reason.clone(),
            });
        }

        let task = synthesis.into_queued_task(failure.strategy);
        self.logger.log(&LogEvent::TaskSynthesized {
            iteration: failure.iteration,
            task_id: task.id.clone(),
            strategy: task.strategy.to_string(),
        });
        task
    }

    async fn rollback(
        &self,
        iteration: u32,
        files: &[PathBuf],
        config: &ExecutorConfig,
    ) -> Result<(), CycleError> {
        let handler = self.collaborators.rollback;
        let result = self.with_timeout(handler.revert(files, config)).await;

        self.logger.log(&LogEvent::RollbackPerformed {
            iteration,
            files: files.len(),
            success: matches!(result, Ok(true)),
        });

        match result {
            Ok(true) => Ok(()),
            Ok(false) => Err(CycleError::Rollback(format!(
                "{} could not restore {} file(s)",
                handler.name(),
                files.len()
            ))),
            Err(e) => Err(CycleError::Rollback(e.to_string())),
        }
    }

    fn append(&self, context: &mut CycleContext, record: IterationRecord) -> Result<(), CycleError> {
        match self.store.append(&record)? {
            AppendOutcome::Appended => context.push_record(record),
            AppendOutcome::Duplicate => {
                debug!(iteration = record.iteration, "Iteration already recorded");
            }
        }
        Ok(())
    }

    /// The fix queued by the last recorded iteration, unless it was applied
    fn unfinished_fix(&self, context: &CycleContext) -> Result<Option<TaskDescriptor>, CycleError> {
        let Some(last) = context.history.last() else {
            return Ok(None);
        };
        if !last.decision.requires_synthesis() {
            return Ok(None);
        }
        let Some(ref fix) = last.synthesized_task else {
            if let Some(ref id) = last.synthesized_task_id {
                warn!(task_id = %id, "Queued fix was recorded without its task, cannot re-queue");
            }
            return Ok(None);
        };
        if self.store.completed_tasks()?.contains(&fix.id) {
            return Ok(None);
        }

        let mut fix = fix.clone();
        fix.status = TaskStatus::Pending;
        Ok(Some(fix))
    }

    /// Terminal state once no task is left: the last metrics decide
    fn drained(&self, context: &CycleContext) -> CycleOutcome {
        let Some(metrics) = context.last_metrics() else {
            return self.blocked(context, BlockReason::NoTestResults);
        };

        if metrics.is_fully_passing() {
            CycleOutcome::succeeded(context.history.clone(), context.total_duration())
        } else if self.policy.meets_partial_success(&metrics) {
            let caveats = context
                .last_failure
                .as_ref()
                .map(|f| f.failures.clone())
                .unwrap_or_default();
            CycleOutcome::partially_succeeded(
                metrics.pass_rate,
                caveats,
                context.history.clone(),
                context.total_duration(),
            )
        } else {
            self.blocked(context, BlockReason::Unconverged)
        }
    }

    fn blocked(&self, context: &CycleContext, reason: BlockReason) -> CycleOutcome {
        CycleOutcome::blocked(
            reason,
            context.history.clone(),
            context.last_failure.clone(),
            context.total_duration(),
        )
    }

    fn finish(&self, outcome: &CycleOutcome) -> Result<(), CycleError> {
        self.store.record_end(&SessionEnd {
            outcome: outcome.status().to_string(),
            iterations: outcome.iterations(),
            reason: outcome.block_reason().map(ToString::to_string),
            duration_secs: outcome.total_duration_secs(),
            timestamp: Utc::now(),
        })?;

        info!(
            status = outcome.status(),
            iterations = outcome.iterations(),
            "Cycle finished"
        );
        self.logger.log(&LogEvent::CycleFinished {
            outcome: outcome.status().to_string(),
            iterations: outcome.iterations(),
            duration_secs: outcome.total_duration_secs(),
        });
        Ok(())
    }
}

/// Mark the task blocked when its dispatch failed
fn block_on_error<T>(
    queue: &mut TaskQueue,
    task_id: &str,
    result: Result<T, CycleError>,
) -> Result<T, CycleError> {
    if result.is_err() {
        queue.mark_blocked(task_id)?;
    }
    result
}
