//! Workflow execution engine.
//!
//! `ExecutionEngine` is the central state machine:
//! 1. Creates a `Pending` execution record and moves it to `Running`.
//! 2. Evaluates the workflow's top-level conditions; if they don't hold the
//!    run completes without touching any action.
//! 3. Runs enabled actions in declaration order via `ActionExecutor`,
//!    recording one step per action and retrying per the action's
//!    `RetryConfig`.
//! 4. Applies the workflow's error-handling policy to failed actions.
//! 5. Lands the record in `Completed`, `Failed`, or `Cancelled`, stamps the
//!    timing, and publishes a completion event.
//!
//! Failures never escape a run; callers observe them on the record.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use actions::{ActionConfig, ActionContext, ActionExecutor};
use store::{MemoryTable, StoreError};

use crate::bus::{Event, EventBus};
use crate::clock::Clock;
use crate::conditions::ConditionEvaluator;
use crate::config::EngineConfig;
use crate::models::{
    ErrorHandling, ExecutionStatus, ExecutionStep, LogLevel, TriggeredBy, WorkflowDefinition,
    WorkflowExecution,
};
use crate::{EngineError, EngineResult};

/// Runs workflow executions and owns the execution history.
pub struct ExecutionEngine {
    workflows: Arc<MemoryTable<WorkflowDefinition>>,
    executions: Arc<MemoryTable<WorkflowExecution>>,
    conditions: Arc<ConditionEvaluator>,
    actions: Arc<ActionExecutor>,
    bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    /// Cancellation handles for executions that haven't finished yet.
    in_flight: Mutex<HashMap<Uuid, CancellationToken>>,
    /// Bumped every time an execution reaches a terminal state.
    completed: watch::Sender<u64>,
}

impl ExecutionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        workflows: Arc<MemoryTable<WorkflowDefinition>>,
        executions: Arc<MemoryTable<WorkflowExecution>>,
        conditions: Arc<ConditionEvaluator>,
        actions: Arc<ActionExecutor>,
        bus: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        let (completed, _) = watch::channel(0);
        Self {
            workflows,
            executions,
            conditions,
            actions,
            bus,
            clock,
            config,
            in_flight: Mutex::new(HashMap::new()),
            completed,
        }
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    /// Start a manual execution and return its id immediately.
    ///
    /// # Errors
    /// - [`EngineError::WorkflowNotFound`] for an unknown workflow.
    /// - [`EngineError::ExecutionLimitReached`] when `max_executions` is hit.
    pub async fn execute_manually(self: &Arc<Self>, workflow_id: Uuid, payload: Value) -> EngineResult<Uuid> {
        let workflow = self
            .workflows
            .get(workflow_id)
            .await
            .ok_or(EngineError::WorkflowNotFound(workflow_id))?;

        self.launch(workflow, TriggeredBy::manual(payload)).await
    }

    /// Handle a scheduler fire. Unknown or inactive workflows, unknown
    /// triggers, and exhausted execution limits are skipped silently.
    pub async fn on_trigger_fired(self: &Arc<Self>, workflow_id: Uuid, trigger_id: &str, payload: Value) -> Option<Uuid> {
        let workflow = self.workflows.get(workflow_id).await?;
        if !workflow.is_active() {
            debug!(%workflow_id, trigger_id, "ignoring fire for inactive workflow");
            return None;
        }
        let trigger_type = workflow.trigger(trigger_id)?.kind.trigger_type();

        let triggered_by = TriggeredBy {
            trigger_type,
            trigger_id: Some(trigger_id.to_owned()),
            payload,
        };
        match self.launch(workflow, triggered_by).await {
            Ok(id) => Some(id),
            Err(EngineError::ExecutionLimitReached { max, .. }) => {
                warn!(%workflow_id, max, "execution limit reached; skipping scheduled run");
                None
            }
            Err(e) => {
                error!(%workflow_id, error = %e, "failed to record scheduled execution");
                None
            }
        }
    }

    /// Insert the `Pending` record and run the execution on its own task.
    ///
    /// With `max_executions` set, the limit check and the insert are one
    /// atomic step on the execution table.
    async fn launch(self: &Arc<Self>, workflow: WorkflowDefinition, triggered_by: TriggeredBy) -> EngineResult<Uuid> {
        let execution = WorkflowExecution::pending(workflow.id, triggered_by, self.clock.now());
        let execution_id = execution.id;
        let cancel = CancellationToken::new();

        match workflow.settings.max_executions {
            Some(max) => {
                let workflow_id = workflow.id;
                let limit = usize::try_from(max).unwrap_or(usize::MAX);
                self.executions
                    .insert_capped(execution.clone(), |e| e.workflow_id == workflow_id, limit)
                    .await
                    .map_err(|e| match e {
                        StoreError::LimitReached(_) => EngineError::ExecutionLimitReached { workflow_id, max },
                        other => other.into(),
                    })?;
            }
            None => {
                self.executions.insert(execution.clone()).await?;
            }
        }
        self.in_flight().insert(execution_id, cancel.clone());

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.run(workflow, execution, cancel).await;
        });

        Ok(execution_id)
    }

    // -----------------------------------------------------------------------
    // The run itself
    // -----------------------------------------------------------------------

    /// Drive one execution from `Pending` to a terminal state.
    #[instrument(skip_all, fields(workflow_id = %workflow.id, execution_id = %execution.id))]
    pub async fn run(
        &self,
        workflow: WorkflowDefinition,
        execution: WorkflowExecution,
        cancel: CancellationToken,
    ) -> WorkflowExecution {
        let mut rec = Recorder {
            exec: execution,
            logging: workflow.settings.logging_enabled,
            clock: self.clock.as_ref(),
            store: self.executions.as_ref(),
        };

        rec.exec.status = ExecutionStatus::Running;
        rec.log(
            LogLevel::Info,
            format!("Execution of '{}' started", workflow.name),
            Some(json!({ "trigger_type": rec.exec.triggered_by.trigger_type })),
        );
        rec.persist().await;
        info!("execution started");

        let deadline = workflow
            .settings
            .execution_timeout_ms
            .and_then(|ms| Instant::now().checked_add(Duration::from_millis(ms)));

        let outcome = self.drive(&workflow, &mut rec, &cancel, deadline).await;
        let now = self.clock.now();

        match outcome {
            Ok(result) => {
                rec.exec.result = Some(result);
                rec.log(LogLevel::Info, "Execution completed", None);
                rec.exec.finish(ExecutionStatus::Completed, now);
                info!("execution completed");
            }
            Err(EngineError::ExecutionCancelled) => {
                rec.exec.error = Some(EngineError::ExecutionCancelled.to_string());
                rec.log(LogLevel::Warn, "Execution cancelled", None);
                rec.exec.finish(ExecutionStatus::Cancelled, now);
                warn!("execution cancelled");
            }
            Err(e) => {
                let message = e.to_string();
                rec.log(LogLevel::Error, format!("Execution failed: {message}"), None);
                rec.exec.error = Some(message);
                rec.exec.finish(ExecutionStatus::Failed, now);
                error!(error = %e, "execution failed");
            }
        }

        rec.persist().await;
        self.in_flight().remove(&rec.exec.id);
        self.publish_completion(&rec.exec);
        self.completed.send_modify(|n| *n += 1);

        rec.exec
    }

    /// Conditions, then actions. `Ok` carries the execution result.
    async fn drive(
        &self,
        workflow: &WorkflowDefinition,
        rec: &mut Recorder<'_>,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> EngineResult<Value> {
        let payload = rec.exec.triggered_by.payload.clone();
        let entity_id = payload.get("entity_id").and_then(Value::as_str).map(str::to_owned);

        if cancel.is_cancelled() {
            return Err(EngineError::ExecutionCancelled);
        }

        // ------------------------------------------------------------------
        // Workflow-level gate.
        // ------------------------------------------------------------------
        if !workflow.conditions.is_empty() {
            let holds = self
                .conditions
                .evaluate(&workflow.conditions, entity_id.as_deref())
                .await?;
            if !holds {
                rec.log(LogLevel::Info, "Workflow conditions not met; skipping actions", None);
                return Ok(json!({ "skipped": true, "reason": "conditions_not_met" }));
            }
            rec.log(LogLevel::Debug, "Workflow conditions met", None);
        }

        // ------------------------------------------------------------------
        // Actions, in declaration order.
        // ------------------------------------------------------------------
        let ctx = ActionContext {
            workflow_id: workflow.id,
            execution_id: rec.exec.id,
            payload,
            cancel: cancel.clone(),
        };
        let timeout_ms = workflow.settings.execution_timeout_ms.unwrap_or_default();
        let mut outputs = Map::new();
        let mut failed = 0usize;

        for action in workflow.actions.iter().filter(|a| a.enabled) {
            if cancel.is_cancelled() {
                return Err(EngineError::ExecutionCancelled);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(EngineError::ExecutionTimedOut { timeout_ms });
            }

            let step = ExecutionStep::start(&action.id, action.action_type.as_str(), action.config.clone(), self.clock.now());
            rec.exec.steps.push(step);
            let idx = rec.exec.steps.len() - 1;
            rec.log(LogLevel::Debug, format!("Running action '{}'", action.id), None);
            rec.persist().await;

            let result = self.execute_with_retry(action, &ctx, rec, idx, deadline, timeout_ms).await;
            let now = self.clock.now();

            match result {
                Ok(output) => {
                    rec.exec.steps[idx].complete(output.clone(), now);
                    rec.log(LogLevel::Info, format!("Action '{}' completed", action.id), None);
                    outputs.insert(action.id.clone(), output);
                }
                Err(err) => {
                    let attempts = rec.exec.steps[idx].attempts;
                    rec.exec.steps[idx].fail(err.to_string(), now);
                    rec.log(
                        LogLevel::Error,
                        format!("Action '{}' failed: {err}", action.id),
                        Some(json!({ "action_id": action.id, "attempts": attempts })),
                    );

                    let aborts_run = matches!(
                        err,
                        EngineError::ExecutionCancelled | EngineError::ExecutionTimedOut { .. }
                    );
                    match workflow.settings.error_handling {
                        ErrorHandling::Continue if !aborts_run => {
                            failed += 1;
                            warn!(action_id = %action.id, error = %err, "action failed; continuing");
                        }
                        _ => {
                            rec.persist().await;
                            return Err(err);
                        }
                    }
                }
            }
            rec.persist().await;
        }

        Ok(json!({ "actions": outputs, "failed_actions": failed }))
    }

    /// Invoke one action, retrying retryable failures per its `RetryConfig`.
    async fn execute_with_retry(
        &self,
        action: &ActionConfig,
        ctx: &ActionContext,
        rec: &mut Recorder<'_>,
        step_idx: usize,
        deadline: Option<Instant>,
        timeout_ms: u64,
    ) -> EngineResult<Value> {
        let max_retries = action.retry.as_ref().map_or(0, |r| r.max_retries);
        let mut retries = 0u32;

        loop {
            rec.exec.steps[step_idx].attempts += 1;

            let attempt = self.actions.execute(action, ctx);
            let result = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, attempt)
                    .await
                    .map_err(|_| EngineError::ExecutionTimedOut { timeout_ms })?,
                None => attempt.await,
            };

            let err = match result {
                Ok(output) => return Ok(output),
                Err(err) => err,
            };

            let Some(retry) = action.retry.as_ref().filter(|_| err.is_retryable() && retries < max_retries) else {
                return Err(EngineError::from_action(&action.id, err));
            };

            retries += 1;
            let delay = retry.delay_for(retries);
            warn!(
                "action '{}' retryable error (retry {}/{}), retrying in {:?}: {}",
                action.id, retries, max_retries, delay, err
            );
            rec.log(
                LogLevel::Warn,
                format!("Action '{}' failed, retrying ({retries}/{max_retries}): {err}", action.id),
                Some(json!({ "delay_ms": delay.as_millis() as u64 })),
            );

            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(EngineError::ExecutionCancelled),
                _ = sleep_until_or_deadline(delay, deadline) => {}
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(EngineError::ExecutionTimedOut { timeout_ms });
            }
        }
    }

    fn publish_completion(&self, exec: &WorkflowExecution) {
        if !self.config.publish_completion_events {
            return;
        }
        let event = Event::new(
            format!("workflow.execution.{}", exec.status),
            self.config.module_id.clone(),
            self.clock.now(),
        )
        .with_entity(exec.id.to_string())
        .with_data(json!({
            "workflow_id": exec.workflow_id,
            "status": exec.status,
            "duration_ms": exec.duration_ms,
            "error": exec.error,
        }));
        self.bus.publish(event);
    }

    // -----------------------------------------------------------------------
    // Queries & control
    // -----------------------------------------------------------------------

    pub async fn get_execution(&self, execution_id: Uuid) -> Option<WorkflowExecution> {
        self.executions.get(execution_id).await
    }

    /// Most recent first, at most `limit` records. Runs that started at the
    /// same instant are ordered newest-inserted first.
    pub async fn executions_for(&self, workflow_id: Uuid, limit: usize) -> Vec<WorkflowExecution> {
        let mut history = self.executions.filter(|e| e.workflow_id == workflow_id).await;
        history.reverse();
        history.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        history.truncate(limit);
        history
    }

    /// Request cooperative cancellation.
    ///
    /// Returns `Ok(false)` if the execution had already finished.
    pub async fn cancel_execution(&self, execution_id: Uuid) -> EngineResult<bool> {
        if let Some(token) = self.in_flight().get(&execution_id) {
            token.cancel();
            info!(%execution_id, "cancellation requested");
            return Ok(true);
        }
        if self.executions.contains(execution_id).await {
            Ok(false)
        } else {
            Err(EngineError::ExecutionNotFound(execution_id))
        }
    }

    /// Resolve once the execution reaches a terminal state.
    pub async fn wait_for_execution(&self, execution_id: Uuid) -> EngineResult<WorkflowExecution> {
        let mut completed = self.completed.subscribe();
        loop {
            let exec = self
                .executions
                .get(execution_id)
                .await
                .ok_or(EngineError::ExecutionNotFound(execution_id))?;
            if exec.status.is_terminal() || completed.changed().await.is_err() {
                return Ok(exec);
            }
        }
    }

    /// Number of executions not yet in a terminal state.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight().len()
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<Uuid, CancellationToken>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Sleep for `delay`, but never past `deadline`. A delay too long for the
/// clock sleeps until the deadline, or until the caller gives up.
async fn sleep_until_or_deadline(delay: Duration, deadline: Option<Instant>) {
    let wake = match (Instant::now().checked_add(delay), deadline) {
        (Some(wake), Some(deadline)) => wake.min(deadline),
        (Some(wake), None) => wake,
        (None, Some(deadline)) => deadline,
        (None, None) => return std::future::pending().await,
    };
    tokio::time::sleep_until(wake).await;
}

// ---------------------------------------------------------------------------
// Recorder
// ---------------------------------------------------------------------------

/// The in-progress execution plus where its snapshots go.
struct Recorder<'a> {
    exec: WorkflowExecution,
    logging: bool,
    clock: &'a dyn Clock,
    store: &'a MemoryTable<WorkflowExecution>,
}

impl Recorder<'_> {
    /// Append a log entry; with logging disabled only warn/error are kept.
    fn log(&mut self, level: LogLevel, message: impl Into<String>, data: Option<Value>) {
        if !self.logging && level < LogLevel::Warn {
            return;
        }
        let now = self.clock.now();
        self.exec.log(level, message, data, now);
    }

    /// Write the current snapshot unless the stored copy is already terminal.
    async fn persist(&self) {
        let snapshot = self.exec.clone();
        let result = self
            .store
            .update(snapshot.id, |stored| {
                if !stored.status.is_terminal() {
                    *stored = snapshot;
                }
            })
            .await;
        if let Err(e) = result {
            warn!(execution_id = %self.exec.id, error = %e, "could not persist execution snapshot");
        }
    }
}
