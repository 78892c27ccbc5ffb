//! Adaptive execution engine
//!
//! Drives one test run end to end: acquire a sandbox, then for each step in
//! order observe the page, validate the planned action, adapt it when the
//! page no longer matches, execute with retry, recover by failure category,
//! and apply the failure policy. The sandbox is released on every exit path,
//! panics included, before the run's terminal status is written and its test
//! case's reliability recomputed.

use crate::capability::{AdaptationRequest, PageStateCapturer, StepAdvisor, Validation};
use crate::config::{EngineConfig, FailurePolicy, RunOverrides};
use crate::feedback::ReliabilityAggregator;
use crate::pool::PoolManager;
use crate::recovery::Recovery;
use crate::retry::{retry, Backoff};
use crate::runtime::{run_action, ActionResult, ContainerRuntime};
use adaptest_common::{
    now, Adaptation, Error, PageSnapshot, Result, RunStatus, RunStore, StepAction, StepStatus,
    TestCase, TestResult, TestRun, TestStep,
};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Collaborators the engine is built from
pub struct EngineParts {
    pub pool: Arc<PoolManager>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub capturer: Arc<dyn PageStateCapturer>,
    pub advisor: Arc<dyn StepAdvisor>,
    pub store: Arc<dyn RunStore>,
    pub aggregator: ReliabilityAggregator,
}

/// Adaptive test execution engine
pub struct AdaptiveEngine {
    config: EngineConfig,
    pool: Arc<PoolManager>,
    runtime: Arc<dyn ContainerRuntime>,
    capturer: Arc<dyn PageStateCapturer>,
    advisor: Arc<dyn StepAdvisor>,
    store: Arc<dyn RunStore>,
    aggregator: ReliabilityAggregator,
}

/// Per-run settings fixed when the run starts
struct RunContext<'a> {
    case: &'a TestCase,
    config: EngineConfig,
    backoff: Backoff,
    container_id: String,
    cancel: CancellationToken,
}

/// Per-run state owned by the run's task
struct RunState {
    run: TestRun,
    steps: Vec<TestStep>,
    /// Actions executed so far, handed to the adapter
    history: Vec<StepAction>,
    /// Last page the run was known to be on
    last_url: Option<String>,
}

impl RunState {
    fn note_success(&mut self, action: &StepAction, result: Option<&ActionResult>) {
        if let Some(url) = result.and_then(|r| r.url.clone()) {
            self.last_url = Some(url);
        } else if action.action.targets_url() {
            self.last_url = Some(action.target.clone());
        }
    }

    fn fail_step(&mut self, index: usize, reason: String) {
        warn!(
            "Run {} step {} failed: {}",
            self.run.id, self.steps[index].step_number, reason
        );
        self.steps[index].finish(StepStatus::Failed, Some(reason));
    }
}

/// Resolve a relative navigation target against the case's base URL
fn resolve(case: &TestCase, action: &StepAction) -> StepAction {
    match &case.base_url {
        Some(base) if action.action.targets_url() && !action.target.contains("://") => action
            .retarget(format!(
                "{}/{}",
                base.trim_end_matches('/'),
                action.target.trim_start_matches('/')
            )),
        _ => action.clone(),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl AdaptiveEngine {
    pub fn new(config: EngineConfig, parts: EngineParts) -> Self {
        Self {
            config,
            pool: parts.pool,
            runtime: parts.runtime,
            capturer: parts.capturer,
            advisor: parts.advisor,
            store: parts.store,
            aggregator: parts.aggregator,
        }
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    pub fn pool(&self) -> &Arc<PoolManager> {
        &self.pool
    }

    /// Execute `case` as run `run_id`.
    ///
    /// Returns `Err` only when the run could not even be recorded; every
    /// other outcome is a terminal [`TestResult`].
    pub async fn execute(
        &self,
        case: &TestCase,
        run_id: &str,
        overrides: &RunOverrides,
        cancel: CancellationToken,
    ) -> Result<TestResult> {
        let started = Instant::now();
        let config = self.config.with_overrides(overrides);

        let mut state = RunState {
            run: TestRun::new(run_id, &case.id, case.steps.len() as u32),
            steps: case
                .steps
                .iter()
                .enumerate()
                .map(|(i, action)| TestStep::new(run_id, i as u32 + 1, action.clone()))
                .collect(),
            history: Vec::new(),
            last_url: None,
        };
        self.store.create_run(&state.run)?;
        info!(
            "Run {} of {} started ({} steps)",
            run_id,
            case.id,
            case.steps.len()
        );

        let acquire_timeout = self.pool.config().acquire_timeout();
        let lease = match self.pool.acquire(run_id, acquire_timeout, &cancel).await {
            Ok(lease) => lease,
            Err(e) => {
                let status = if matches!(e, Error::Cancelled) {
                    RunStatus::Cancelled
                } else {
                    RunStatus::Failed
                };
                warn!("Run {} could not get a sandbox: {}", run_id, e);
                return Ok(self
                    .finish(case, state, status, Some(e.to_string()), None, started)
                    .await);
            }
        };
        let sandbox_id = lease.sandbox.id.clone();

        let outcome = match lease.container_id() {
            Ok(container_id) => {
                let ctx = RunContext {
                    case,
                    backoff: Backoff::new(config.retry.clone()),
                    config,
                    container_id: container_id.to_string(),
                    cancel,
                };
                let begun = state
                    .run
                    .transition(RunStatus::Running)
                    .and_then(|_| self.store.update_run(&state.run));

                match begun {
                    Ok(()) => AssertUnwindSafe(self.run_steps(&ctx, &mut state))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| {
                            let message = panic_message(panic.as_ref());
                            error!("Run {} panicked: {}", run_id, message);
                            Err(Error::Internal(format!("panic during execution: {}", message)))
                        }),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        };

        let (status, summary) = match outcome {
            Ok(()) => match state.steps.iter().find(|s| s.status == StepStatus::Failed) {
                None => (RunStatus::Completed, None),
                Some(first) => (
                    RunStatus::Failed,
                    Some(format!(
                        "{} step(s) failed; first: step {}: {}",
                        state.run.failed_steps,
                        first.step_number,
                        first.error.as_deref().unwrap_or("unknown error")
                    )),
                ),
            },
            Err(Error::Cancelled) => (RunStatus::Cancelled, Some(Error::Cancelled.to_string())),
            Err(e) => (RunStatus::Failed, Some(e.to_string())),
        };

        Ok(self
            .finish(case, state, status, summary, Some(sandbox_id), started)
            .await)
    }

    /// Release, settle unfinished steps, write the terminal status and rescore
    async fn finish(
        &self,
        case: &TestCase,
        mut state: RunState,
        status: RunStatus,
        summary: Option<String>,
        sandbox_id: Option<String>,
        started: Instant,
    ) -> TestResult {
        let run_id = state.run.id.clone();
        if let Err(e) = self.pool.release(&run_id).await {
            error!("Release for run {} failed: {}", run_id, e);
        }

        for i in 0..state.steps.len() {
            let step = &mut state.steps[i];
            match step.status {
                StepStatus::Pending => step.finish(StepStatus::Skipped, None),
                StepStatus::Running if status == RunStatus::Cancelled => {
                    step.finish(StepStatus::Skipped, Some("interrupted by cancellation".into()))
                }
                StepStatus::Running => step.finish(StepStatus::Failed, summary.clone()),
                _ => continue,
            }
            state.run.tally(&state.steps[i]);
            if let Err(e) = self.store.save_step(&state.steps[i]) {
                warn!("Failed to persist step {} of run {}: {}", i + 1, run_id, e);
            }
        }

        state.run.error_summary = summary;
        if let Err(e) = state.run.transition(status) {
            error!("Run {} cannot end as {}: {}", run_id, status, e);
        }
        if let Err(e) = self.store.update_run(&state.run) {
            error!("Failed to persist terminal status of run {}: {}", run_id, e);
        }

        if let Err(e) = self.aggregator.on_terminal(&case.id) {
            warn!("Reliability update for {} failed: {}", case.id, e);
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "Run {} {} in {}ms ({} completed, {} adapted, {} failed, {} skipped)",
            run_id,
            state.run.status,
            duration_ms,
            state.run.completed_steps,
            state.run.adapted_steps,
            state.run.failed_steps,
            state.run.skipped_steps
        );

        TestResult {
            run: state.run,
            steps: state.steps,
            sandbox_id,
            duration_ms,
        }
    }

    /// Execute steps in order until done, aborted or cancelled
    async fn run_steps(&self, ctx: &RunContext<'_>, state: &mut RunState) -> Result<()> {
        for index in 0..state.steps.len() {
            if ctx.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(Error::Cancelled),
                result = self.run_step(ctx, state, index) => result?,
            }

            let step = &state.steps[index];
            state.run.tally(step);
            self.store.save_step(step)?;
            self.store.update_run(&state.run)?;

            if step.status == StepStatus::Failed && ctx.config.failure_policy == FailurePolicy::Abort
            {
                return Err(Error::RecoveryFailed {
                    step_number: step.step_number,
                    reason: step.error.clone().unwrap_or_default(),
                });
            }
        }
        Ok(())
    }

    /// Resolve one step to success, adapted or failed
    async fn run_step(&self, ctx: &RunContext<'_>, state: &mut RunState, index: usize) -> Result<()> {
        let planned = resolve(ctx.case, &state.steps[index].action);
        {
            let step = &mut state.steps[index];
            step.status = StepStatus::Running;
            step.started_at = Some(now());
            self.store.save_step(step)?;
        }
        debug!(
            "Run {} step {}: {}",
            state.run.id, state.steps[index].step_number, planned
        );

        let snapshot = match self.capturer.capture(&ctx.container_id).await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!("Snapshot before step {} failed: {}", index + 1, e);
                None
            }
        };
        state.steps[index].page_before = snapshot.clone();

        let actions = match &snapshot {
            Some(snapshot) => match self.plan(ctx, state, index, &planned, snapshot).await? {
                Some(actions) => actions,
                None => return Ok(()),
            },
            None => vec![planned.clone()],
        };

        let mut executed = Vec::with_capacity(actions.len());
        for action in &actions {
            match self.perform(ctx, state, index, action).await? {
                Some(done) => executed.extend(done),
                None => return Ok(()),
            }
        }

        let adapted = executed != [planned];
        state.history.extend(executed.iter().cloned());
        let step = &mut state.steps[index];
        if adapted {
            step.executed = executed;
        }
        step.page_after = self.capturer.capture(&ctx.container_id).await.ok();
        step.finish(
            if adapted {
                StepStatus::Adapted
            } else {
                StepStatus::Success
            },
            None,
        );
        Ok(())
    }

    /// Validate the planned action and adapt it if needed.
    ///
    /// `None` means the step has been failed and nothing should run.
    async fn plan(
        &self,
        ctx: &RunContext<'_>,
        state: &mut RunState,
        index: usize,
        planned: &StepAction,
        snapshot: &PageSnapshot,
    ) -> Result<Option<Vec<StepAction>>> {
        let validation = match self.advisor.validate(planned, snapshot).await {
            Ok(v) => v,
            Err(e) => {
                warn!("Validation of {} unavailable, executing as planned: {}", planned, e);
                return Ok(Some(vec![planned.clone()]));
            }
        };
        if validation.is_valid && validation.confidence >= ctx.config.validation_confidence_threshold
        {
            return Ok(Some(vec![planned.clone()]));
        }

        let budget = ctx.config.max_adaptations;
        let used = state.run.adaptation_count;
        if used >= budget {
            return Err(Error::AdaptationBudgetExhausted { used, budget });
        }

        info!(
            "Step {} of run {} needs adaptation: {}",
            state.steps[index].step_number,
            state.run.id,
            validation.reason()
        );
        let request = AdaptationRequest {
            objective: if ctx.case.objective.is_empty() {
                ctx.case.name.clone()
            } else {
                ctx.case.objective.clone()
            },
            planned_step: planned.clone(),
            page_snapshot: snapshot.clone(),
            completed_steps: state.history.clone(),
        };

        let proposed = match self.advisor.adapt(&request).await {
            Ok(proposed) if !proposed.is_empty() => proposed,
            Ok(_) => {
                state.fail_step(index, format!("no adaptation for {}: {}", planned, validation.reason()));
                return Ok(None);
            }
            Err(e) => {
                state.fail_step(index, format!("adaptation of {} failed: {}", planned, e));
                return Ok(None);
            }
        };

        let used = used + proposed.len() as u32;
        if used > budget {
            return Err(Error::AdaptationBudgetExhausted { used, budget });
        }
        state.run.adaptation_count = used;

        Ok(Some(
            proposed
                .into_iter()
                .map(|p| {
                    state.steps[index].record_adaptation(adaptation_for(planned, &p, &validation));
                    resolve(ctx.case, &p.action)
                })
                .collect(),
        ))
    }

    /// Execute one action with retry, falling back to recovery.
    ///
    /// Returns the actions that actually ran, or `None` once the step has
    /// been failed.
    async fn perform(
        &self,
        ctx: &RunContext<'_>,
        state: &mut RunState,
        index: usize,
        action: &StepAction,
    ) -> Result<Option<Vec<StepAction>>> {
        let runtime = self.runtime.as_ref();
        let container_id = ctx.container_id.as_str();
        let timeout: Duration = ctx.config.step_timeout();
        let label = format!("step {} ({})", state.steps[index].step_number, action);

        let failure = match retry(&ctx.backoff, &ctx.cancel, &label, move |_| {
            run_action(runtime, container_id, action, timeout)
        })
        .await?
        {
            Ok(result) => {
                state.note_success(action, Some(&result));
                return Ok(Some(vec![action.clone()]));
            }
            Err(failure) => failure,
        };

        let recovery = Recovery {
            runtime,
            capturer: self.capturer.as_ref(),
            config: &ctx.config.recovery,
            container_id,
            step_timeout: timeout,
            cancel: &ctx.cancel,
        };
        let outcome = recovery
            .recover(action, &failure, state.last_url.as_deref())
            .await?;
        for attempt in outcome.attempts {
            state.steps[index].record_recovery(attempt);
        }

        match outcome.executed {
            Some(done) => {
                for a in &done {
                    state.note_success(a, None);
                }
                Ok(Some(done))
            }
            None => {
                state.fail_step(index, format!("{}: {}", action, failure.message));
                Ok(None)
            }
        }
    }
}

fn adaptation_for(
    planned: &StepAction,
    proposed: &crate::capability::AdaptedStep,
    validation: &Validation,
) -> Adaptation {
    Adaptation::new(
        planned.clone(),
        proposed.action.clone(),
        proposed.confidence.unwrap_or(validation.confidence),
        proposed
            .reason
            .clone()
            .unwrap_or_else(|| validation.reason()),
    )
}
