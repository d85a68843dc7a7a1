//! `WorkflowAutomation`: the public face of the engine.
//!
//! Wires the registry, scheduler, execution engine, and reminder monitor
//! together over shared stores, and owns the background tasks that run while
//! the engine is started:
//! - the dispatcher, turning scheduler fires into executions;
//! - the reminder monitor loop.
//!
//! `stop` cancels both plus every armed trigger. Executions already running
//! are left to finish.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use actions::{ActionCapabilities, ActionExecutor};
use store::MemoryTable;

use crate::bus::EventBus;
use crate::clock::{Clock, SystemClock};
use crate::conditions::ConditionEvaluator;
use crate::config::EngineConfig;
use crate::executor::ExecutionEngine;
use crate::models::{
    ExecutionStatus, NewSmartReminder, NewWorkflow, SmartReminderConfig, WorkflowDefinition,
    WorkflowExecution, WorkflowPatch, WorkflowStatistics, WorkflowTemplate,
};
use crate::provider::DataProvider;
use crate::registry::WorkflowRegistry;
use crate::reminder::ReminderMonitor;
use crate::scheduler::{FireRequest, TriggerScheduler};
use crate::EngineResult;

type FireReceiver = mpsc::UnboundedReceiver<FireRequest>;

/// Background tasks alive between `start` and `stop`.
struct Background {
    cancel: CancellationToken,
    dispatcher: JoinHandle<FireReceiver>,
    reminders: JoinHandle<()>,
}

enum Lifecycle {
    Stopped(FireReceiver),
    Running(Background),
    /// Only observable if a previous `stop` lost the receiver.
    Broken,
}

pub struct WorkflowAutomation {
    config: EngineConfig,
    registry: Arc<WorkflowRegistry>,
    engine: Arc<ExecutionEngine>,
    scheduler: Arc<TriggerScheduler>,
    monitor: Arc<ReminderMonitor>,
    executions: Arc<MemoryTable<WorkflowExecution>>,
    lifecycle: Mutex<Lifecycle>,
    builtins: OnceCell<()>,
}

impl WorkflowAutomation {
    /// An engine over the host's capabilities, data, and event bus, timed by
    /// the system clock.
    pub fn new(
        capabilities: Arc<dyn ActionCapabilities>,
        provider: Arc<dyn DataProvider>,
        bus: Arc<dyn EventBus>,
        config: EngineConfig,
    ) -> Self {
        Self::from_parts(
            ActionExecutor::new(capabilities),
            provider,
            bus,
            Arc::new(SystemClock::new()),
            config,
        )
    }

    /// Full control over the action executor (e.g. custom handlers) and clock.
    pub fn from_parts(
        actions: ActionExecutor,
        provider: Arc<dyn DataProvider>,
        bus: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        let actions = Arc::new(actions);
        let conditions = Arc::new(ConditionEvaluator::new(Arc::clone(&provider)));
        let workflows = Arc::new(MemoryTable::new("workflows"));
        let executions = Arc::new(MemoryTable::new("executions"));
        let reminders = Arc::new(MemoryTable::new("reminders"));
        let (fire_tx, fire_rx) = mpsc::unbounded_channel();

        let scheduler = Arc::new(TriggerScheduler::new(
            Arc::clone(&bus),
            Arc::clone(&conditions),
            Arc::clone(&clock),
            config.condition_poll_interval(),
            fire_tx,
        ));
        let registry = Arc::new(WorkflowRegistry::new(
            Arc::clone(&workflows),
            Arc::clone(&reminders),
            Arc::clone(&scheduler),
            Arc::clone(&clock),
        ));
        let engine = Arc::new(ExecutionEngine::new(
            workflows,
            Arc::clone(&executions),
            Arc::clone(&conditions),
            Arc::clone(&actions),
            bus,
            Arc::clone(&clock),
            config.clone(),
        ));
        let monitor = Arc::new(ReminderMonitor::new(reminders, conditions, provider, actions, clock));

        Self {
            config,
            registry,
            engine,
            scheduler,
            monitor,
            executions,
            lifecycle: Mutex::new(Lifecycle::Stopped(fire_rx)),
            builtins: OnceCell::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Arm every active workflow and start the background tasks.
    /// Calling it while running does nothing.
    #[instrument(skip(self))]
    pub async fn start(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let mut fires = match std::mem::replace(&mut *lifecycle, Lifecycle::Broken) {
            Lifecycle::Stopped(fires) => fires,
            other => {
                *lifecycle = other;
                return;
            }
        };

        self.ensure_builtin_templates().await;

        // Fires queued before the last stop are stale.
        while fires.try_recv().is_ok() {}

        self.scheduler.start();
        let active_workflows = self.registry.arm_active().await;

        let cancel = CancellationToken::new();
        let dispatcher = tokio::spawn(dispatch(
            Arc::clone(&self.engine),
            Arc::clone(&self.scheduler),
            fires,
            cancel.clone(),
        ));
        let reminders = self
            .monitor
            .spawn(self.config.reminder_check_interval(), cancel.child_token());

        *lifecycle = Lifecycle::Running(Background { cancel, dispatcher, reminders });
        info!(active_workflows, "workflow automation started");
    }

    /// Disarm every trigger and stop the background tasks. Running
    /// executions are not cancelled. Calling it while stopped does nothing.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let background = match std::mem::replace(&mut *lifecycle, Lifecycle::Broken) {
            Lifecycle::Running(background) => background,
            other => {
                *lifecycle = other;
                return;
            }
        };

        self.scheduler.stop();
        background.cancel.cancel();
        let _ = background.reminders.await;

        match background.dispatcher.await {
            Ok(fires) => *lifecycle = Lifecycle::Stopped(fires),
            Err(e) => tracing::error!(error = %e, "dispatcher task failed; engine cannot restart"),
        }
        info!("workflow automation stopped");
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock().await, Lifecycle::Running(_))
    }

    async fn ensure_builtin_templates(&self) {
        if !self.config.load_builtin_templates {
            return;
        }
        self.builtins
            .get_or_init(|| self.registry.load_builtin_templates())
            .await;
    }

    // -----------------------------------------------------------------------
    // Workflows
    // -----------------------------------------------------------------------

    pub async fn create_workflow(&self, draft: NewWorkflow) -> EngineResult<Uuid> {
        Ok(self.registry.create(draft).await?.id)
    }

    pub async fn update_workflow(&self, workflow_id: Uuid, patch: WorkflowPatch) -> EngineResult<WorkflowDefinition> {
        self.registry.update(workflow_id, patch).await
    }

    pub async fn delete_workflow(&self, workflow_id: Uuid) -> EngineResult<()> {
        self.registry.delete(workflow_id).await.map(drop)
    }

    pub async fn get_workflow(&self, workflow_id: Uuid) -> Option<WorkflowDefinition> {
        self.registry.get(workflow_id).await
    }

    pub async fn get_all_workflows(&self) -> Vec<WorkflowDefinition> {
        self.registry.list().await
    }

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Start a manual run and return its execution id right away.
    /// Failures during the run are recorded on the execution, not returned.
    pub async fn execute_workflow(&self, workflow_id: Uuid, payload: Option<Value>) -> EngineResult<Uuid> {
        let payload = payload.unwrap_or_else(|| json!({}));
        self.engine.execute_manually(workflow_id, payload).await
    }

    pub async fn get_execution(&self, execution_id: Uuid) -> Option<WorkflowExecution> {
        self.engine.get_execution(execution_id).await
    }

    /// Newest first.
    pub async fn get_workflow_executions(&self, workflow_id: Uuid, limit: usize) -> Vec<WorkflowExecution> {
        self.engine.executions_for(workflow_id, limit).await
    }

    pub async fn cancel_execution(&self, execution_id: Uuid) -> EngineResult<bool> {
        self.engine.cancel_execution(execution_id).await
    }

    pub async fn wait_for_execution(&self, execution_id: Uuid) -> EngineResult<WorkflowExecution> {
        self.engine.wait_for_execution(execution_id).await
    }

    // -----------------------------------------------------------------------
    // Templates
    // -----------------------------------------------------------------------

    pub async fn create_workflow_from_template(
        &self,
        template_id: Uuid,
        name: &str,
        variables: HashMap<String, Value>,
    ) -> EngineResult<Uuid> {
        self.ensure_builtin_templates().await;
        let workflow = self.registry.create_from_template(template_id, name, &variables).await?;
        Ok(workflow.id)
    }

    pub async fn get_workflow_templates(&self, category: Option<&str>) -> Vec<WorkflowTemplate> {
        self.ensure_builtin_templates().await;
        self.registry.templates(category).await
    }

    pub async fn create_workflow_template(&self, template: WorkflowTemplate) -> EngineResult<Uuid> {
        self.registry.create_template(template).await
    }

    pub async fn delete_workflow_template(&self, template_id: Uuid) -> EngineResult<()> {
        self.ensure_builtin_templates().await;
        self.registry.delete_template(template_id).await
    }

    // -----------------------------------------------------------------------
    // Smart reminders
    // -----------------------------------------------------------------------

    pub async fn create_smart_reminder(&self, draft: NewSmartReminder) -> EngineResult<Uuid> {
        Ok(self.registry.create_reminder(draft).await?.id)
    }

    pub async fn get_smart_reminders(&self) -> Vec<SmartReminderConfig> {
        self.registry.reminders().await
    }

    pub async fn delete_smart_reminder(&self, reminder_id: Uuid) -> EngineResult<()> {
        self.registry.delete_reminder(reminder_id).await
    }

    pub async fn set_smart_reminder_enabled(&self, reminder_id: Uuid, enabled: bool) -> EngineResult<()> {
        self.registry.set_reminder_enabled(reminder_id, enabled).await.map(drop)
    }

    /// Sweep the reminders now instead of waiting for the next tick.
    pub async fn check_reminders(&self) -> usize {
        self.monitor.check_reminders().await
    }

    // -----------------------------------------------------------------------
    // Statistics
    // -----------------------------------------------------------------------

    pub async fn get_workflow_statistics(&self) -> WorkflowStatistics {
        let workflows = self.registry.list().await;
        let executions = self.executions.list().await;

        let durations: Vec<u64> = executions
            .iter()
            .filter(|e| e.status.is_terminal())
            .filter_map(|e| e.duration_ms)
            .collect();
        let average_execution_time_ms = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<u64>() as f64 / durations.len() as f64
        };

        WorkflowStatistics {
            total_workflows: workflows.len(),
            active_workflows: workflows.iter().filter(|w| w.is_active()).count(),
            total_executions: executions.len(),
            successful_executions: executions.iter().filter(|e| e.status == ExecutionStatus::Completed).count(),
            failed_executions: executions.iter().filter(|e| e.status == ExecutionStatus::Failed).count(),
            average_execution_time_ms,
        }
    }
}

/// Forward scheduler fires to the engine until cancelled, then hand the
/// receiver back so the engine can be restarted.
async fn dispatch(
    engine: Arc<ExecutionEngine>,
    scheduler: Arc<TriggerScheduler>,
    mut fires: FireReceiver,
    cancel: CancellationToken,
) -> FireReceiver {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            fire = fires.recv() => {
                let Some(fire) = fire else { break };
                if !scheduler.is_running() {
                    debug!(workflow_id = %fire.workflow_id, "dropping fire received after stop");
                    continue;
                }
                engine.on_trigger_fired(fire.workflow_id, &fire.trigger_id, fire.payload).await;
            }
        }
    }
    fires
}
