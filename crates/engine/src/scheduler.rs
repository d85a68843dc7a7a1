//! Trigger scheduling.
//!
//! Arms the triggers of active workflows and turns their firings into
//! [`FireRequest`]s on a channel. The scheduler never runs executions
//! itself; whoever owns the receiving end does.
//!
//! | Trigger                | Armed as                                       |
//! |------------------------|------------------------------------------------|
//! | time / interval        | task ticking every period, first tick after one |
//! | time / once            | task sleeping until `at`; skipped if past, removed once fired |
//! | time / cron            | not armed (warn)                                |
//! | event                  | bus subscription with exact-match filters       |
//! | condition              | task polling the conditions                     |
//! | manual                 | not armed                                       |

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{Event, EventBus, SubscriptionHandle};
use crate::clock::Clock;
use crate::conditions::ConditionEvaluator;
use crate::models::{TimeSchedule, TriggerConfig, TriggerKind, WorkflowCondition, WorkflowDefinition};

/// A trigger fired for a workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct FireRequest {
    pub workflow_id: Uuid,
    pub trigger_id: String,
    pub payload: Value,
}

/// Something to tear down on disarm.
enum Armed {
    Task(CancellationToken),
    Subscription(SubscriptionHandle),
}

pub struct TriggerScheduler {
    bus: Arc<dyn EventBus>,
    conditions: Arc<ConditionEvaluator>,
    clock: Arc<dyn Clock>,
    default_poll: Duration,
    fires: mpsc::UnboundedSender<FireRequest>,
    running: AtomicBool,
    /// Parent of every task token; replaced on each `start`.
    root: Mutex<CancellationToken>,
    armed: Arc<Mutex<ArmedMap>>,
}

type ArmedMap = HashMap<Uuid, HashMap<String, Armed>>;

impl TriggerScheduler {
    pub fn new(
        bus: Arc<dyn EventBus>,
        conditions: Arc<ConditionEvaluator>,
        clock: Arc<dyn Clock>,
        default_poll: Duration,
        fires: mpsc::UnboundedSender<FireRequest>,
    ) -> Self {
        Self {
            bus,
            conditions,
            clock,
            default_poll,
            fires,
            running: AtomicBool::new(false),
            root: Mutex::new(CancellationToken::new()),
            armed: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        *lock(&self.root) = CancellationToken::new();
        info!("trigger scheduler started");
    }

    /// Disarm everything. No fire is emitted once this returns.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        lock(&self.root).cancel();
        let armed: Vec<_> = lock(&self.armed).drain().collect();
        for (_, triggers) in armed {
            self.release(triggers);
        }
        info!("trigger scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Arm every enabled trigger of `workflow`, replacing anything already
    /// armed for it. Does nothing while stopped or for inactive workflows.
    pub fn arm(&self, workflow: &WorkflowDefinition) {
        self.disarm(workflow.id);
        if !self.is_running() || !workflow.is_active() {
            return;
        }

        let root = lock(&self.root).clone();
        let mut armed = HashMap::new();
        for trigger in workflow.triggers.iter().filter(|t| t.enabled) {
            if let Some(handle) = self.arm_trigger(workflow.id, trigger, &root) {
                armed.insert(trigger.id.clone(), handle);
            }
        }

        // A one-shot due immediately may already have fired.
        armed.retain(|_, a| !matches!(a, Armed::Task(t) if t.is_cancelled()));

        debug!(workflow_id = %workflow.id, armed = armed.len(), "workflow armed");
        if !armed.is_empty() {
            lock(&self.armed).insert(workflow.id, armed);
        }
    }

    /// Tear down every trigger armed for `workflow_id`. Idempotent.
    pub fn disarm(&self, workflow_id: Uuid) {
        let removed = lock(&self.armed).remove(&workflow_id);
        if let Some(triggers) = removed {
            debug!(%workflow_id, "workflow disarmed");
            self.release(triggers);
        }
    }

    /// Armed triggers across all workflows.
    pub fn armed_count(&self) -> usize {
        lock(&self.armed).values().map(HashMap::len).sum()
    }

    fn release(&self, triggers: HashMap<String, Armed>) {
        for armed in triggers.into_values() {
            match armed {
                Armed::Task(token) => token.cancel(),
                Armed::Subscription(handle) => self.bus.unsubscribe(handle),
            }
        }
    }

    fn arm_trigger(&self, workflow_id: Uuid, trigger: &TriggerConfig, root: &CancellationToken) -> Option<Armed> {
        let trigger_id = trigger.id.clone();
        match &trigger.kind {
            TriggerKind::TimeBased { schedule: TimeSchedule::Interval { seconds } } => {
                let period = Duration::from_secs(*seconds);
                let first = deadline_after(workflow_id, &trigger.id, period)?;
                Some(self.spawn_interval(workflow_id, trigger_id, first, period, root.child_token()))
            }
            TriggerKind::TimeBased { schedule: TimeSchedule::Once { at } } => {
                let Ok(delay) = (*at - self.clock.now()).to_std() else {
                    warn!(%workflow_id, trigger_id = %trigger.id, %at, "one-shot trigger is in the past; not armed");
                    return None;
                };
                let at = deadline_after(workflow_id, &trigger.id, delay)?;
                Some(self.spawn_once(workflow_id, trigger_id, at, root.child_token()))
            }
            TriggerKind::TimeBased { schedule: TimeSchedule::Cron { expression } } => {
                warn!(%workflow_id, trigger_id = %trigger.id, %expression, "cron schedules are not supported; trigger not armed");
                None
            }
            TriggerKind::EventBased { event_type, filters } => {
                Some(self.subscribe(workflow_id, trigger_id, event_type, filters.clone()))
            }
            TriggerKind::ConditionBased { conditions, poll_interval_secs } => {
                let period = poll_interval_secs.map_or(self.default_poll, Duration::from_secs);
                let first = deadline_after(workflow_id, &trigger.id, period)?;
                Some(self.spawn_poller(workflow_id, trigger_id, conditions.clone(), first, period, root.child_token()))
            }
            TriggerKind::Manual => None,
        }
    }

    fn spawn_interval(
        &self,
        workflow_id: Uuid,
        trigger_id: String,
        first: Instant,
        period: Duration,
        cancel: CancellationToken,
    ) -> Armed {
        let fires = self.fires.clone();
        let clock = Arc::clone(&self.clock);
        let token = cancel.clone();

        tokio::spawn(async move {
            let mut ticker = interval_at(first, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let payload = json!({ "scheduled_at": clock.now() });
                        if !send(&fires, &cancel, workflow_id, &trigger_id, payload) {
                            break;
                        }
                    }
                }
            }
        });

        Armed::Task(token)
    }

    fn spawn_once(&self, workflow_id: Uuid, trigger_id: String, at: Instant, cancel: CancellationToken) -> Armed {
        let fires = self.fires.clone();
        let clock = Arc::clone(&self.clock);
        let armed = Arc::clone(&self.armed);
        let token = cancel.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep_until(at) => {
                    let payload = json!({ "scheduled_at": clock.now() });
                    send(&fires, &cancel, workflow_id, &trigger_id, payload);
                    cancel.cancel();
                    forget_fired(&armed, workflow_id, &trigger_id);
                }
            }
        });

        Armed::Task(token)
    }

    fn spawn_poller(
        &self,
        workflow_id: Uuid,
        trigger_id: String,
        conditions: Vec<WorkflowCondition>,
        first: Instant,
        period: Duration,
        cancel: CancellationToken,
    ) -> Armed {
        let fires = self.fires.clone();
        let evaluator = Arc::clone(&self.conditions);
        let clock = Arc::clone(&self.clock);
        let token = cancel.clone();

        tokio::spawn(async move {
            let mut ticker = interval_at(first, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match evaluator.evaluate(&conditions, None).await {
                            Ok(true) => {
                                let payload = json!({ "evaluated_at": clock.now() });
                                if !send(&fires, &cancel, workflow_id, &trigger_id, payload) {
                                    break;
                                }
                            }
                            Ok(false) => {}
                            Err(e) => warn!(%workflow_id, %trigger_id, error = %e, "condition poll failed"),
                        }
                    }
                }
            }
        });

        Armed::Task(token)
    }

    fn subscribe(&self, workflow_id: Uuid, trigger_id: String, event_type: &str, filters: Map<String, Value>) -> Armed {
        let fires = self.fires.clone();
        let handler = Arc::new(move |event: &Event| {
            if !matches_filters(event, &filters) {
                return;
            }
            let payload = serde_json::to_value(event).unwrap_or(Value::Null);
            let request = FireRequest { workflow_id, trigger_id: trigger_id.clone(), payload };
            if fires.send(request).is_err() {
                debug!(%workflow_id, "fire channel closed; event dropped");
            }
        });
        Armed::Subscription(self.bus.subscribe(event_type, handler))
    }
}

/// Every filter key must be present on the event with an equal value.
pub fn matches_filters(event: &Event, filters: &Map<String, Value>) -> bool {
    filters.iter().all(|(key, expected)| event.field(key).as_ref() == Some(expected))
}

/// Emit a fire unless the task was cancelled. `false` once the channel is gone.
fn send(
    fires: &mpsc::UnboundedSender<FireRequest>,
    cancel: &CancellationToken,
    workflow_id: Uuid,
    trigger_id: &str,
    payload: Value,
) -> bool {
    if cancel.is_cancelled() {
        return true;
    }
    debug!(%workflow_id, trigger_id, "trigger fired");
    fires
        .send(FireRequest { workflow_id, trigger_id: trigger_id.to_owned(), payload })
        .is_ok()
}

/// `now + wait` on the tokio clock, or `None` (logged) when that overflows.
fn deadline_after(workflow_id: Uuid, trigger_id: &str, wait: Duration) -> Option<Instant> {
    let deadline = Instant::now().checked_add(wait);
    if deadline.is_none() {
        warn!(%workflow_id, trigger_id, ?wait, "trigger period out of range; not armed");
    }
    deadline
}

/// Drop a fired one-shot's entry, unless it has been re-armed since.
fn forget_fired(armed: &Mutex<ArmedMap>, workflow_id: Uuid, trigger_id: &str) {
    let mut armed = lock(armed);
    let Some(triggers) = armed.get_mut(&workflow_id) else {
        return;
    };
    if matches!(triggers.get(trigger_id), Some(Armed::Task(t)) if t.is_cancelled()) {
        triggers.remove(trigger_id);
    }
    if triggers.is_empty() {
        armed.remove(&workflow_id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
