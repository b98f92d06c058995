//! Workflow orchestration and lifecycle management

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use uuid::Uuid;

use crate::effects::{
    AttemptContext, CancellationSignal, CircuitBreakerConfig, CircuitBreakerRegistry,
    EffectConfig, EffectOperation, EffectOutcome, EffectRunner,
};
use crate::error::{EffectError, EffectFailure, ErrorKind, WorkflowError};
use crate::models::workflow::{
    ExecutionMode, NodeKind, RecoveryStrategy, StepReport, StepStatus, WorkflowResult,
    WorkflowStatus,
};
use crate::models::EngineConfiguration;
use crate::services::{default_sink, Observation, SharedSink};
use crate::workflow::definition::Workflow;
use crate::workflow::persistence::{Checkpoint, CheckpointStore, CompletedStep};
use crate::workflow::step::{StepAction, StepContext};

/// Runs a step action through the effect runner
struct StepOperation<'a> {
    action: &'a dyn StepAction,
    ctx: &'a StepContext,
}

#[async_trait]
impl EffectOperation for StepOperation<'_> {
    fn name(&self) -> &str {
        &self.ctx.step_id
    }

    async fn run(&self, attempt: &mut AttemptContext) -> Result<Value, EffectFailure> {
        self.action.run(self.ctx, attempt).await
    }
}

struct StepRun {
    outcome: Result<EffectOutcome, EffectError>,
    duration: Duration,
}

enum Readiness {
    Run,
    Wait,
    Settled,
}

/// Mutable bookkeeping for one execution
struct Execution<'w> {
    workflow: &'w Workflow,
    execution_id: Uuid,
    reports: Vec<StepReport>,
    outputs: HashMap<String, Value>,
    completion_order: Vec<usize>,
    /// No new steps start once set
    halted: bool,
}

impl<'w> Execution<'w> {
    fn new(workflow: &'w Workflow, execution_id: Uuid) -> Self {
        let reports = workflow
            .steps()
            .iter()
            .map(|step| {
                let mut report = StepReport::pending(&step.id);
                if !step.enabled {
                    report.status = StepStatus::Disabled;
                }
                report
            })
            .collect();

        Self {
            workflow,
            execution_id,
            reports,
            outputs: HashMap::new(),
            completion_order: Vec::new(),
            halted: false,
        }
    }

    fn restore(&mut self, position: usize, output: Value) {
        let step_id = self.workflow.steps()[position].id.clone();
        let report = &mut self.reports[position];
        report.status = StepStatus::Completed;
        report.output = Some(output.clone());
        self.outputs.insert(step_id, output);
        self.completion_order.push(position);
    }

    fn any(&self, status: StepStatus) -> bool {
        self.reports.iter().any(|r| r.status == status)
    }

    fn inputs_for(&self, position: usize) -> HashMap<String, Value> {
        self.workflow
            .dependencies_of(position)
            .iter()
            .filter_map(|&dep| {
                let id = &self.workflow.steps()[dep].id;
                self.outputs.get(id).map(|v| (id.clone(), v.clone()))
            })
            .collect()
    }

    fn step_context(&self, position: usize) -> StepContext {
        let step = &self.workflow.steps()[position];
        StepContext {
            workflow: self.workflow.name().to_string(),
            execution_id: self.execution_id,
            step_id: step.id.clone(),
            kind: step.kind,
            inputs: self.inputs_for(position),
        }
    }

    fn checkpoint(&self) -> Checkpoint {
        let mut checkpoint = Checkpoint::new(self.execution_id, self.workflow.name());
        checkpoint.completed = self
            .completion_order
            .iter()
            .filter_map(|&i| {
                let id = &self.workflow.steps()[i].id;
                self.outputs.get(id).map(|output| CompletedStep {
                    step_id: id.clone(),
                    output: output.clone(),
                })
            })
            .collect();
        checkpoint
    }

    /// Failed steps and the steps skipped because of them go back to pending
    fn reset_failed(&mut self) {
        for report in &mut self.reports {
            if matches!(report.status, StepStatus::Failed | StepStatus::Skipped) {
                report.status = StepStatus::Pending;
                report.error = None;
                report.error_kind = None;
            }
        }
    }
}

/// Workflow orchestrator managing step scheduling, recovery and checkpoints
pub struct WorkflowOrchestrator {
    runner: EffectRunner,
    effect_defaults: EffectConfig,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    parallelism_cap: Option<usize>,
    /// Cancellation handles of running executions
    active: Arc<DashMap<Uuid, CancellationSignal>>,
    sink: SharedSink,
}

impl WorkflowOrchestrator {
    pub fn new(runner: EffectRunner) -> Self {
        Self {
            runner,
            effect_defaults: EffectConfig::default(),
            checkpoints: None,
            parallelism_cap: None,
            active: Arc::new(DashMap::new()),
            sink: default_sink(),
        }
    }

    /// Wire breakers, runner and orchestrator from engine defaults, sharing one sink
    pub fn from_configuration(config: &EngineConfiguration, sink: SharedSink) -> Self {
        let breakers = Arc::new(
            CircuitBreakerRegistry::new(CircuitBreakerConfig::from(config)).with_sink(sink.clone()),
        );
        let runner = EffectRunner::new(breakers).with_sink(sink.clone());
        Self::new(runner)
            .with_effect_defaults(EffectConfig::from(config))
            .with_parallelism_cap(config.max_parallel_steps)
            .with_sink(sink)
    }

    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    /// Delay and timeout settings used for every step; retries come from the workflow
    pub fn with_effect_defaults(mut self, config: EffectConfig) -> Self {
        self.effect_defaults = config;
        self
    }

    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Upper bound applied on top of each workflow's max_parallel_steps
    pub fn with_parallelism_cap(mut self, cap: usize) -> Self {
        self.parallelism_cap = Some(cap.max(1));
        self
    }

    pub fn runner(&self) -> &EffectRunner {
        &self.runner
    }

    /// Get count of active executions
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn active_executions(&self) -> Vec<Uuid> {
        self.active.iter().map(|entry| *entry.key()).collect()
    }

    /// Cancel a running execution; false if it is not running
    pub fn cancel(&self, execution_id: Uuid) -> bool {
        match self.active.get(&execution_id) {
            Some(signal) => {
                signal.cancel();
                tracing::info!(execution_id = %execution_id, "Cancellation requested");
                true
            }
            None => false,
        }
    }

    pub async fn execute(&self, workflow: &Workflow, mode: ExecutionMode) -> WorkflowResult {
        self.execute_with_cancel(workflow, mode, &CancellationSignal::new())
            .await
    }

    pub async fn execute_with_cancel(
        &self,
        workflow: &Workflow,
        mode: ExecutionMode,
        cancel: &CancellationSignal,
    ) -> WorkflowResult {
        let execution = Execution::new(workflow, Uuid::new_v4());
        self.drive(execution, mode, cancel).await
    }

    /// Continue an execution, treating the checkpoint's steps as completed
    pub async fn resume(
        &self,
        workflow: &Workflow,
        mode: ExecutionMode,
        checkpoint: &Checkpoint,
    ) -> Result<WorkflowResult, WorkflowError> {
        if checkpoint.workflow_name != workflow.name() {
            return Err(WorkflowError::CheckpointMismatch {
                expected: workflow.name().to_string(),
                found: checkpoint.workflow_name.clone(),
            });
        }

        let mut execution = Execution::new(workflow, checkpoint.execution_id);
        for completed in &checkpoint.completed {
            match workflow.position(&completed.step_id) {
                Some(position) if workflow.steps()[position].enabled => {
                    execution.restore(position, completed.output.clone());
                }
                _ => tracing::warn!(
                    workflow = %workflow.name(),
                    step_id = %completed.step_id,
                    "Checkpointed step not runnable in this workflow, ignoring"
                ),
            }
        }

        tracing::info!(
            workflow = %workflow.name(),
            execution_id = %checkpoint.execution_id,
            restored = execution.completion_order.len(),
            "Resuming workflow from checkpoint"
        );
        Ok(self
            .drive(execution, mode, &CancellationSignal::new())
            .await)
    }

    /// Resume from the checkpoint stored for `execution_id`
    pub async fn resume_from_store(
        &self,
        workflow: &Workflow,
        mode: ExecutionMode,
        execution_id: Uuid,
    ) -> Result<WorkflowResult, WorkflowError> {
        let store = self
            .checkpoints
            .as_ref()
            .ok_or(WorkflowError::NoCheckpointStore)?;
        let checkpoint = store
            .load(execution_id)?
            .ok_or(WorkflowError::CheckpointNotFound { execution_id })?;
        self.resume(workflow, mode, &checkpoint).await
    }

    async fn drive(
        &self,
        mut execution: Execution<'_>,
        mode: ExecutionMode,
        cancel: &CancellationSignal,
    ) -> WorkflowResult {
        let workflow = execution.workflow;
        let execution_id = execution.execution_id;
        let strategy = workflow.rules().failure_recovery_strategy;
        let started_at = Utc::now();
        let deadline = workflow.timeout().map(|t| Instant::now() + t);

        self.active.insert(execution_id, cancel.clone());
        tracing::info!(
            workflow = %workflow.name(),
            execution_id = %execution_id,
            mode = ?mode,
            steps = workflow.len(),
            "Workflow execution started"
        );

        let stop = CancellationSignal::new();
        self.run_guarded(&mut execution, mode, cancel, &stop, deadline)
            .await;

        if strategy == RecoveryStrategy::RetryFailed
            && !stop.is_cancelled()
            && execution.any(StepStatus::Failed)
        {
            tracing::info!(workflow = %workflow.name(), "Retrying failed steps");
            execution.reset_failed();
            self.run_guarded(&mut execution, mode, cancel, &stop, deadline)
                .await;
        }

        let status = if stop.is_cancelled() {
            if cancel.is_cancelled() {
                WorkflowStatus::Cancelled
            } else {
                WorkflowStatus::TimedOut
            }
        } else if execution.any(StepStatus::Failed) {
            WorkflowStatus::Failed
        } else {
            WorkflowStatus::Completed
        };

        for report in &mut execution.reports {
            if report.status == StepStatus::Pending {
                report.status = if stop.is_cancelled() {
                    StepStatus::Cancelled
                } else {
                    StepStatus::Skipped
                };
            }
        }

        let compensate = match strategy {
            RecoveryStrategy::Continue => false,
            RecoveryStrategy::RetryFailed => status == WorkflowStatus::Failed,
            RecoveryStrategy::CompensateAll => status != WorkflowStatus::Completed,
        };
        let (compensated, compensation_failures) = if compensate {
            self.compensate(&mut execution).await
        } else {
            (Vec::new(), Vec::new())
        };

        if status == WorkflowStatus::Completed && workflow.rules().enable_checkpoints {
            if let Some(store) = &self.checkpoints {
                if let Err(e) = store.delete(execution_id) {
                    tracing::warn!(execution_id = %execution_id, error = %e, "Failed to clear checkpoint");
                }
            }
        }

        self.active.remove(&execution_id);
        tracing::info!(
            workflow = %workflow.name(),
            execution_id = %execution_id,
            status = ?status,
            compensated = compensated.len(),
            "Workflow execution finished"
        );

        WorkflowResult {
            execution_id,
            workflow_name: workflow.name().to_string(),
            status,
            steps: execution.reports,
            compensated,
            compensation_failures,
            started_at,
            completed_at: Utc::now(),
        }
    }

    /// Schedule steps while watching for cancellation and the deadline.
    ///
    /// Either one trips `stop`; scheduling then winds down on its own so that
    /// in-flight steps are still recorded.
    async fn run_guarded(
        &self,
        execution: &mut Execution<'_>,
        mode: ExecutionMode,
        cancel: &CancellationSignal,
        stop: &CancellationSignal,
        deadline: Option<Instant>,
    ) {
        let workflow = execution.workflow;
        let watcher = async move {
            let expiry = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = expiry => {
                    tracing::warn!(workflow = %workflow.name(), "Workflow timed out");
                }
            }
            stop.cancel();
            std::future::pending::<()>().await
        };

        tokio::select! {
            _ = self.schedule(execution, mode, stop) => {}
            _ = watcher => {}
        }
    }

    async fn schedule(&self, execution: &mut Execution<'_>, mode: ExecutionMode, stop: &CancellationSignal) {
        match mode {
            ExecutionMode::Sequential => self.run_sequential(execution, stop).await,
            ExecutionMode::Parallel => self.run_layers(execution, stop).await,
            ExecutionMode::DependencyOrdered => self.run_ready(execution, stop).await,
        }
    }

    fn max_parallel(&self, workflow: &Workflow) -> usize {
        let configured = workflow.rules().max_parallel_steps.max(1);
        match self.parallelism_cap {
            Some(cap) => configured.min(cap),
            None => configured,
        }
    }

    async fn run_sequential(&self, execution: &mut Execution<'_>, stop: &CancellationSignal) {
        let workflow = execution.workflow;
        for position in workflow.order_positions() {
            if !matches!(self.readiness(execution, position, stop), Readiness::Run) {
                continue;
            }
            let ctx = execution.step_context(position);
            let (position, run) = self.run_step(workflow, position, ctx, stop, None).await;
            self.record(execution, position, run);
        }
    }

    /// Whole layers at a time; a layer finishes before the next starts
    async fn run_layers(&self, execution: &mut Execution<'_>, stop: &CancellationSignal) {
        let workflow = execution.workflow;
        let semaphore = Semaphore::new(self.max_parallel(workflow));

        for layer in workflow.layer_positions() {
            let mut in_flight = FuturesUnordered::new();
            for &position in layer {
                if matches!(self.readiness(execution, position, stop), Readiness::Run) {
                    let ctx = execution.step_context(position);
                    in_flight.push(self.run_step(workflow, position, ctx, stop, Some(&semaphore)));
                }
            }
            while let Some((position, run)) = in_flight.next().await {
                self.record(execution, position, run);
            }
        }
    }

    /// Each step starts as soon as its own dependencies are satisfied
    async fn run_ready(&self, execution: &mut Execution<'_>, stop: &CancellationSignal) {
        let workflow = execution.workflow;
        let semaphore = Semaphore::new(self.max_parallel(workflow));
        let mut launched = vec![false; workflow.len()];
        let mut in_flight = FuturesUnordered::new();

        loop {
            for position in workflow.order_positions() {
                if launched[position] {
                    continue;
                }
                if let Readiness::Run = self.readiness(execution, position, stop) {
                    launched[position] = true;
                    let ctx = execution.step_context(position);
                    in_flight.push(self.run_step(workflow, position, ctx, stop, Some(&semaphore)));
                }
            }

            match in_flight.next().await {
                Some((position, run)) => self.record(execution, position, run),
                None => break,
            }
        }
    }

    /// Decide whether a pending step can run now, settling it if it never will
    fn readiness(&self, execution: &mut Execution<'_>, position: usize, stop: &CancellationSignal) -> Readiness {
        if execution.reports[position].status != StepStatus::Pending {
            return Readiness::Settled;
        }
        let workflow = execution.workflow;
        let step_id = &workflow.steps()[position].id;

        if stop.is_cancelled() {
            let report = &mut execution.reports[position];
            report.status = StepStatus::Cancelled;
            report.error_kind = Some(ErrorKind::Cancelled);
            return Readiness::Settled;
        }

        let blocked_by = if execution.halted {
            Some("workflow halted after a failure".to_string())
        } else {
            let mut waiting = false;
            let mut blocked = None;
            for &dep in workflow.dependencies_of(position) {
                match execution.reports[dep].status {
                    StepStatus::Completed | StepStatus::Disabled => {}
                    StepStatus::Pending => waiting = true,
                    _ => {
                        blocked = Some(format!(
                            "dependency '{}' did not complete",
                            workflow.steps()[dep].id
                        ));
                        break;
                    }
                }
            }
            if blocked.is_none() && waiting {
                return Readiness::Wait;
            }
            blocked
        };

        match blocked_by {
            Some(reason) => {
                self.sink.record(Observation::StepSkipped {
                    workflow: workflow.name().to_string(),
                    step_id: step_id.clone(),
                    reason: reason.clone(),
                });
                let report = &mut execution.reports[position];
                report.status = StepStatus::Skipped;
                report.error = Some(reason);
                Readiness::Settled
            }
            None => Readiness::Run,
        }
    }

    async fn run_step(
        &self,
        workflow: &Workflow,
        position: usize,
        ctx: StepContext,
        stop: &CancellationSignal,
        semaphore: Option<&Semaphore>,
    ) -> (usize, StepRun) {
        let _permit = match semaphore {
            Some(semaphore) => semaphore.acquire().await.ok(),
            None => None,
        };
        let step = &workflow.steps()[position];
        let started = Instant::now();

        let Some(action) = workflow.action(position) else {
            let outcome = Err(EffectError::Fatal {
                operation: step.id.clone(),
                attempts: 0,
                last_error: "no action bound to step".to_string(),
                history: Vec::new(),
                compensation: None,
            });
            return (
                position,
                StepRun {
                    outcome,
                    duration: Duration::ZERO,
                },
            );
        };

        self.sink.record(Observation::StepStarted {
            workflow: workflow.name().to_string(),
            step_id: step.id.clone(),
        });

        let mut config = self.effect_defaults.clone();
        config.max_retries = step
            .max_retries
            .unwrap_or(workflow.metadata().max_retries);
        config.transactional = step.kind == NodeKind::Effect;

        let operation = StepOperation {
            action: action.as_ref(),
            ctx: &ctx,
        };
        let outcome = self
            .runner
            .execute_with_cancel(&operation, &config, stop)
            .await;

        (
            position,
            StepRun {
                outcome,
                duration: started.elapsed(),
            },
        )
    }

    fn record(&self, execution: &mut Execution<'_>, position: usize, run: StepRun) {
        let workflow = execution.workflow;
        let step_id = workflow.steps()[position].id.clone();
        let report = &mut execution.reports[position];
        report.duration_ms = Some(run.duration.as_millis() as u64);

        match run.outcome {
            Ok(outcome) => {
                report.status = StepStatus::Completed;
                report.attempts += outcome.attempts;
                report.output = Some(outcome.value.clone());
                report.error = None;
                report.error_kind = None;
                execution.outputs.insert(step_id.clone(), outcome.value);
                execution.completion_order.push(position);

                self.sink.record(Observation::StepCompleted {
                    workflow: workflow.name().to_string(),
                    step_id,
                    attempts: outcome.attempts,
                });
                self.save_checkpoint(execution);
            }
            Err(error) => {
                report.attempts += error.attempts();
                report.error = Some(error.to_string());
                report.error_kind = Some(error.kind());

                if error.kind() == ErrorKind::Cancelled {
                    report.status = StepStatus::Cancelled;
                    tracing::info!(workflow = %workflow.name(), step_id = %step_id, "Step cancelled");
                } else {
                    report.status = StepStatus::Failed;
                    self.sink.record(Observation::StepFailed {
                        workflow: workflow.name().to_string(),
                        step_id,
                        error: error.to_string(),
                    });
                    if workflow.rules().failure_recovery_strategy == RecoveryStrategy::CompensateAll {
                        execution.halted = true;
                    }
                }
            }
        }
    }

    fn save_checkpoint(&self, execution: &Execution<'_>) {
        let workflow = execution.workflow;
        if !workflow.rules().enable_checkpoints {
            return;
        }
        let Some(store) = &self.checkpoints else {
            return;
        };

        let checkpoint = execution.checkpoint();
        match store.save(&checkpoint) {
            Ok(()) => self.sink.record(Observation::CheckpointSaved {
                workflow: workflow.name().to_string(),
                execution_id: execution.execution_id,
                completed_steps: checkpoint.completed.len(),
            }),
            Err(e) => tracing::error!(
                workflow = %workflow.name(),
                execution_id = %execution.execution_id,
                error = %e,
                "Failed to save checkpoint"
            ),
        }
    }

    /// Undo completed steps newest-first.
    /// Returns compensated step ids and "step: error" strings for failures.
    async fn compensate(&self, execution: &mut Execution<'_>) -> (Vec<String>, Vec<String>) {
        let workflow = execution.workflow;
        let mut compensated = Vec::new();
        let mut failures = Vec::new();

        for position in execution.completion_order.clone().into_iter().rev() {
            if execution.reports[position].status != StepStatus::Completed {
                continue;
            }
            let Some(action) = workflow.action(position) else {
                continue;
            };
            let ctx = execution.step_context(position);
            let output = execution
                .outputs
                .get(&ctx.step_id)
                .cloned()
                .unwrap_or(Value::Null);

            let result = action.compensate(&ctx, &output).await;
            self.sink.record(Observation::StepCompensated {
                workflow: workflow.name().to_string(),
                step_id: ctx.step_id.clone(),
                success: result.is_ok(),
            });
            match result {
                Ok(()) => {
                    execution.reports[position].status = StepStatus::Compensated;
                    compensated.push(ctx.step_id);
                }
                Err(e) => {
                    tracing::error!(
                        workflow = %workflow.name(),
                        step_id = %ctx.step_id,
                        error = %e,
                        "Step compensation failed"
                    );
                    failures.push(format!("{}: {:#}", ctx.step_id, e));
                }
            }
        }

        (compensated, failures)
    }
}

impl Default for WorkflowOrchestrator {
    fn default() -> Self {
        Self::new(EffectRunner::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::Compensation;
    use crate::models::workflow::{CoordinationRules, WorkflowContract, WorkflowMetadata, WorkflowStep};
    use crate::services::RecordingSink;
    use crate::workflow::persistence::InMemoryCheckpointStore;
    use crate::workflow::step::{step_fn, StepRegistry};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    fn contract(name: &str, steps: Vec<WorkflowStep>, strategy: RecoveryStrategy) -> WorkflowContract {
        WorkflowContract {
            workflow_metadata: WorkflowMetadata {
                name: name.to_string(),
                description: None,
                execution_mode: ExecutionMode::Sequential,
                timeout_ms: None,
                max_retries: 0,
            },
            steps,
            coordination_rules: CoordinationRules {
                failure_recovery_strategy: strategy,
                ..CoordinationRules::default()
            },
        }
    }

    /// Step that logs its id, returns it, and logs "undo <id>" when compensated
    fn logged(registry: StepRegistry, id: &str, log: &Log) -> StepRegistry {
        let run_log = log.clone();
        let undo_log = log.clone();
        registry.with_step(
            id,
            step_fn(move |ctx: StepContext| {
                let log = run_log.clone();
                async move {
                    log.lock().unwrap().push(ctx.step_id.clone());
                    Ok::<_, EffectFailure>(json!(ctx.step_id))
                }
            })
            .with_compensation(move |ctx: StepContext, _output: Value| {
                let log = undo_log.clone();
                async move {
                    log.lock().unwrap().push(format!("undo {}", ctx.step_id));
                    Ok(())
                }
            }),
        )
    }

    fn failing(registry: StepRegistry, id: &str) -> StepRegistry {
        registry.with_step(
            id,
            step_fn(|_ctx: StepContext| async { Err::<Value, _>(EffectFailure::fatal("boom")) }),
        )
    }

    fn orchestrator() -> WorkflowOrchestrator {
        WorkflowOrchestrator::new(EffectRunner::default())
            .with_effect_defaults(EffectConfig::default().with_delays(Duration::from_millis(1), Duration::from_millis(10)))
    }

    #[tokio::test]
    async fn test_sequential_passes_dependency_outputs() {
        let registry = StepRegistry::new()
            .with_step("extract", step_fn(|_ctx: StepContext| async { Ok::<_, EffectFailure>(json!(21)) }))
            .with_step(
                "double",
                step_fn(|ctx: StepContext| async move {
                    let n = ctx.input("extract").and_then(Value::as_i64).unwrap_or(0);
                    Ok::<_, EffectFailure>(json!(n * 2))
                }),
            );
        let workflow = Workflow::build(
            contract(
                "etl",
                vec![WorkflowStep::new("double").depends_on(["extract"]), WorkflowStep::new("extract")],
                RecoveryStrategy::Continue,
            ),
            &registry,
        )
        .unwrap();

        let result = orchestrator().execute(&workflow, ExecutionMode::Sequential).await;
        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(result.step("double").unwrap().output, Some(json!(42)));
        assert_eq!(result.step("extract").unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn test_continue_skips_only_dependents_of_failure() {
        let log = Log::default();
        let registry = failing(logged(logged(StepRegistry::new(), "after", &log), "other", &log), "broken");
        let workflow = Workflow::build(
            contract(
                "partial",
                vec![
                    WorkflowStep::new("broken"),
                    WorkflowStep::new("after").depends_on(["broken"]),
                    WorkflowStep::new("other"),
                ],
                RecoveryStrategy::Continue,
            ),
            &registry,
        )
        .unwrap();

        let result = orchestrator().execute(&workflow, ExecutionMode::Sequential).await;
        assert_eq!(result.status, WorkflowStatus::Failed);
        assert_eq!(result.step("broken").unwrap().status, StepStatus::Failed);
        assert_eq!(result.step("broken").unwrap().error_kind, Some(ErrorKind::FatalFailure));
        assert_eq!(result.step("after").unwrap().status, StepStatus::Skipped);
        assert_eq!(result.step("other").unwrap().status, StepStatus::Completed);
        assert!(result.compensated.is_empty());
        assert_eq!(*log.lock().unwrap(), vec!["other"]);
    }

    #[tokio::test]
    async fn test_disabled_dependency_counts_as_satisfied() {
        let log = Log::default();
        let registry = logged(StepRegistry::new(), "b", &log);
        let workflow = Workflow::build(
            contract(
                "optional",
                vec![WorkflowStep::new("a").disabled(), WorkflowStep::new("b").depends_on(["a"])],
                RecoveryStrategy::Continue,
            ),
            &registry,
        )
        .unwrap();

        let result = orchestrator().execute(&workflow, ExecutionMode::Sequential).await;
        assert!(result.is_success());
        assert_eq!(result.step("a").unwrap().status, StepStatus::Disabled);
        assert_eq!(result.step("b").unwrap().status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn test_compensate_all_undoes_in_reverse_completion_order() {
        let log = Log::default();
        let registry = failing(logged(logged(StepRegistry::new(), "a", &log), "b", &log), "c");
        let workflow = Workflow::build(
            contract(
                "saga",
                vec![
                    WorkflowStep::new("a"),
                    WorkflowStep::new("b").depends_on(["a"]),
                    WorkflowStep::new("c").depends_on(["b"]),
                ],
                RecoveryStrategy::CompensateAll,
            ),
            &registry,
        )
        .unwrap();

        let result = orchestrator().execute(&workflow, ExecutionMode::Sequential).await;
        assert_eq!(result.status, WorkflowStatus::Failed);
        assert_eq!(result.compensated, vec!["b", "a"]);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "undo b", "undo a"]);
        assert_eq!(result.steps_with_status(StepStatus::Compensated), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_retry_failed_reruns_failed_steps_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let registry = StepRegistry::new().with_step(
            "flaky",
            step_fn(move |_ctx: StepContext| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(EffectFailure::fatal("first round fails"))
                    } else {
                        Ok(json!("ok"))
                    }
                }
            }),
        );
        let workflow = Workflow::build(
            contract("recover", vec![WorkflowStep::new("flaky")], RecoveryStrategy::RetryFailed),
            &registry,
        )
        .unwrap();

        let result = orchestrator().execute(&workflow, ExecutionMode::Sequential).await;
        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(result.step("flaky").unwrap().attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_respects_max_parallel_steps() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let ids = ["s1", "s2", "s3", "s4", "s5"];

        let registry = ids.iter().fold(StepRegistry::new(), |registry, id| {
            let running = running.clone();
            let peak = peak.clone();
            registry.with_step(
                *id,
                step_fn(move |_ctx: StepContext| {
                    let running = running.clone();
                    let peak = peak.clone();
                    async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, EffectFailure>(Value::Null)
                    }
                }),
            )
        });
        let mut c = contract(
            "fanout",
            ids.iter().map(|id| WorkflowStep::new(*id)).collect(),
            RecoveryStrategy::Continue,
        );
        c.coordination_rules.max_parallel_steps = 2;
        let workflow = Workflow::build(c, &registry).unwrap();

        let result = orchestrator().execute(&workflow, ExecutionMode::Parallel).await;
        assert!(result.is_success());
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dependency_ordered_starts_without_layer_barrier() {
        let log = Log::default();
        let timed = |delay_ms: u64, log: &Log| {
            let log = log.clone();
            step_fn(move |ctx: StepContext| {
                let log = log.clone();
                async move {
                    log.lock().unwrap().push(format!("start {}", ctx.step_id));
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    log.lock().unwrap().push(format!("end {}", ctx.step_id));
                    Ok::<_, EffectFailure>(Value::Null)
                }
            })
        };
        let registry = StepRegistry::new()
            .with_step("slow", timed(100, &log))
            .with_step("fast", timed(1, &log))
            .with_step("next", timed(1, &log));
        let workflow = Workflow::build(
            contract(
                "eager",
                vec![
                    WorkflowStep::new("slow"),
                    WorkflowStep::new("fast"),
                    WorkflowStep::new("next").depends_on(["fast"]),
                ],
                RecoveryStrategy::Continue,
            ),
            &registry,
        )
        .unwrap();

        let result = orchestrator()
            .execute(&workflow, ExecutionMode::DependencyOrdered)
            .await;
        assert!(result.is_success());

        let log = log.lock().unwrap();
        let at = |entry: &str| log.iter().position(|e| e == entry).unwrap();
        assert!(at("start next") < at("end slow"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancels_running_steps() {
        let registry = StepRegistry::new()
            .with_step(
                "hang",
                step_fn(|_ctx: StepContext| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok::<_, EffectFailure>(Value::Null)
                }),
            )
            .with_step("later", step_fn(|_ctx: StepContext| async { Ok::<_, EffectFailure>(Value::Null) }));
        let mut c = contract(
            "slow",
            vec![WorkflowStep::new("hang"), WorkflowStep::new("later").depends_on(["hang"])],
            RecoveryStrategy::Continue,
        );
        c.workflow_metadata.timeout_ms = Some(50);
        let workflow = Workflow::build(c, &registry).unwrap();

        let result = orchestrator().execute(&workflow, ExecutionMode::Sequential).await;
        assert_eq!(result.status, WorkflowStatus::TimedOut);
        assert_eq!(result.step("hang").unwrap().status, StepStatus::Cancelled);
        assert_eq!(result.step("later").unwrap().status, StepStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_by_execution_id() {
        let registry = StepRegistry::new().with_step(
            "wait",
            step_fn(|_ctx: StepContext| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, EffectFailure>(Value::Null)
            }),
        );
        let workflow = Workflow::build(
            contract("cancellable", vec![WorkflowStep::new("wait")], RecoveryStrategy::Continue),
            &registry,
        )
        .unwrap();
        let orchestrator = orchestrator();

        let canceller = async {
            loop {
                if let Some(id) = orchestrator.active_executions().first() {
                    assert!(orchestrator.cancel(*id));
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        };
        let (result, ()) = tokio::join!(
            orchestrator.execute(&workflow, ExecutionMode::Sequential),
            canceller
        );

        assert_eq!(result.status, WorkflowStatus::Cancelled);
        assert_eq!(result.step("wait").unwrap().error_kind, Some(ErrorKind::Cancelled));
        assert_eq!(orchestrator.active_count(), 0);
        assert!(!orchestrator.cancel(result.execution_id));
    }

    #[tokio::test]
    async fn test_resume_skips_checkpointed_steps() {
        let log = Log::default();
        let ready = Arc::new(AtomicBool::new(false));
        let gate = ready.clone();
        let registry = logged(StepRegistry::new(), "first", &log).with_step(
            "second",
            step_fn(move |ctx: StepContext| {
                let ok = gate.load(Ordering::SeqCst);
                async move {
                    if ok {
                        Ok(ctx.input("first").cloned().unwrap_or(Value::Null))
                    } else {
                        Err(EffectFailure::fatal("not yet"))
                    }
                }
            }),
        );
        let mut c = contract(
            "resumable",
            vec![WorkflowStep::new("first"), WorkflowStep::new("second").depends_on(["first"])],
            RecoveryStrategy::Continue,
        );
        c.coordination_rules.enable_checkpoints = true;
        let workflow = Workflow::build(c, &registry).unwrap();

        let store = Arc::new(InMemoryCheckpointStore::new());
        let sink = Arc::new(RecordingSink::new());
        let orchestrator = orchestrator()
            .with_checkpoint_store(store.clone())
            .with_sink(sink.clone());

        let failed = orchestrator.execute(&workflow, ExecutionMode::Sequential).await;
        assert_eq!(failed.status, WorkflowStatus::Failed);
        let checkpoint = store.load(failed.execution_id).unwrap().unwrap();
        assert!(checkpoint.is_completed("first"));
        assert_eq!(sink.count(|o| matches!(o, Observation::CheckpointSaved { .. })), 1);

        ready.store(true, Ordering::SeqCst);
        let resumed = orchestrator
            .resume_from_store(&workflow, ExecutionMode::Sequential, failed.execution_id)
            .await
            .unwrap();

        assert_eq!(resumed.status, WorkflowStatus::Completed);
        assert_eq!(resumed.execution_id, failed.execution_id);
        assert_eq!(resumed.step("second").unwrap().output, Some(json!("first")));
        assert_eq!(*log.lock().unwrap(), vec!["first"]);
        assert!(store.load(failed.execution_id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resume_rejects_foreign_checkpoint() {
        let registry = StepRegistry::new().with_step("a", step_fn(|_ctx: StepContext| async { Ok::<_, EffectFailure>(Value::Null) }));
        let workflow = Workflow::build(contract("mine", vec![WorkflowStep::new("a")], RecoveryStrategy::Continue), &registry).unwrap();

        let err = orchestrator()
            .resume(&workflow, ExecutionMode::Sequential, &Checkpoint::new(Uuid::new_v4(), "theirs"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::CheckpointMismatch { .. }));

        let err = orchestrator()
            .resume_from_store(&workflow, ExecutionMode::Sequential, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::NoCheckpointStore));
    }

    /// Reserves a slot, registers its release, then waits far longer than the test runs
    struct Reservation {
        log: Log,
    }

    #[async_trait]
    impl StepAction for Reservation {
        async fn run(&self, ctx: &StepContext, attempt: &mut AttemptContext) -> Result<Value, EffectFailure> {
            let log = self.log.clone();
            let step = ctx.step_id.clone();
            self.log.lock().unwrap().push(format!("reserve {}", step));
            attempt.register(
                "reserve",
                json!({"step": step}),
                Compensation::sync(move || {
                    log.lock().unwrap().push(format!("release {}", step));
                    Ok(())
                }),
            )?;
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Value::Null)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_parallel_layer_rolls_back_running_effect() {
        let log = Log::default();
        let registry = logged(StepRegistry::new(), "quick", &log)
            .with_step("reserve", Reservation { log: log.clone() })
            .with_step("after", step_fn(|_ctx: StepContext| async { Ok::<_, EffectFailure>(Value::Null) }));
        let workflow = Workflow::build(
            contract(
                "booking",
                vec![
                    WorkflowStep::new("reserve").kind(NodeKind::Effect),
                    WorkflowStep::new("quick"),
                    WorkflowStep::new("after").depends_on(["reserve", "quick"]),
                ],
                RecoveryStrategy::Continue,
            ),
            &registry,
        )
        .unwrap();
        let orchestrator = orchestrator();

        let canceller = async {
            loop {
                let reserved = log.lock().unwrap().iter().any(|e| e == "reserve reserve");
                if let (true, Some(id)) = (reserved, orchestrator.active_executions().first()) {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    assert!(orchestrator.cancel(*id));
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        };
        let (result, ()) = tokio::join!(
            orchestrator.execute(&workflow, ExecutionMode::Parallel),
            canceller
        );

        assert_eq!(result.status, WorkflowStatus::Cancelled);
        let reserve = result.step("reserve").unwrap();
        assert_eq!(reserve.status, StepStatus::Cancelled);
        assert_eq!(reserve.error_kind, Some(ErrorKind::Cancelled));
        assert_eq!(result.step("quick").unwrap().status, StepStatus::Completed);
        assert_eq!(result.step("after").unwrap().status, StepStatus::Cancelled);

        let log = log.lock().unwrap();
        assert!(log.contains(&"release reserve".to_string()));
        assert!(!log.contains(&"undo quick".to_string()));
    }
}
