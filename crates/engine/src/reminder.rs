//! Smart reminder monitor.
//!
//! A periodic sweep over enabled reminders. Each one is gated by its
//! conditions and, if it names a `due_field`, by `due - advance_minutes`.
//! Notifications go out through the `SEND_NOTIFICATION` action, so no
//! execution records are created.
//!
//! Per-reminder progress (first/last notification, repeats, escalation) is
//! kept in memory and reset whenever the conditions stop holding.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use actions::{ActionConfig, ActionContext, ActionExecutor, ActionType};
use store::MemoryTable;

use crate::clock::Clock;
use crate::conditions::ConditionEvaluator;
use crate::models::SmartReminderConfig;
use crate::provider::DataProvider;
use crate::{EngineError, EngineResult};

#[derive(Debug, Clone, Default)]
struct ReminderState {
    first_sent: Option<DateTime<Utc>>,
    last_sent: Option<DateTime<Utc>>,
    repeats: u32,
    escalated: bool,
}

pub struct ReminderMonitor {
    reminders: Arc<MemoryTable<SmartReminderConfig>>,
    conditions: Arc<ConditionEvaluator>,
    provider: Arc<dyn DataProvider>,
    actions: Arc<ActionExecutor>,
    clock: Arc<dyn Clock>,
    state: Mutex<HashMap<Uuid, ReminderState>>,
    /// Held for a whole sweep; the timer loop and manual checks never overlap.
    sweep: tokio::sync::Mutex<()>,
}

impl ReminderMonitor {
    pub fn new(
        reminders: Arc<MemoryTable<SmartReminderConfig>>,
        conditions: Arc<ConditionEvaluator>,
        provider: Arc<dyn DataProvider>,
        actions: Arc<ActionExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            reminders,
            conditions,
            provider,
            actions,
            clock,
            state: Mutex::new(HashMap::new()),
            sweep: tokio::sync::Mutex::new(()),
        }
    }

    /// Run [`check_reminders`](Self::check_reminders) every `period` until
    /// `cancel` fires.
    pub fn spawn(self: &Arc<Self>, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        let Some(first) = Instant::now().checked_add(period) else {
            warn!(?period, "reminder check period out of range; monitor idle");
            return tokio::spawn(async move { cancel.cancelled().await });
        };

        tokio::spawn(async move {
            let mut ticker = interval_at(first, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_secs = period.as_secs(), "reminder monitor started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("reminder monitor shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        monitor.check_reminders().await;
                    }
                }
            }
        })
    }

    /// One sweep over all enabled reminders. Returns notifications sent.
    pub async fn check_reminders(&self) -> usize {
        let _sweep = self.sweep.lock().await;
        let reminders = self.reminders.filter(|r| r.enabled).await;
        let mut sent = 0;

        for reminder in &reminders {
            match self.check(reminder).await {
                Ok(n) => sent += n,
                Err(e) => warn!(reminder_id = %reminder.id, error = %e, "reminder check failed"),
            }
        }

        // Forget progress for reminders that were deleted or disabled.
        self.state().retain(|id, _| reminders.iter().any(|r| r.id == *id));

        if sent > 0 {
            debug!(sent, "reminder sweep finished");
        }
        sent
    }

    async fn check(&self, reminder: &SmartReminderConfig) -> EngineResult<usize> {
        let now = self.clock.now();
        let entity_id = reminder.entity_id.as_deref();

        if !self.conditions.evaluate(&reminder.conditions, entity_id).await? {
            self.state().remove(&reminder.id);
            return Ok(0);
        }
        if !self.is_due(reminder, now).await? {
            return Ok(0);
        }

        let mut state = self.state().get(&reminder.id).cloned().unwrap_or_default();
        let settings = &reminder.settings;
        let mut sent = 0;

        match state.last_sent {
            None => {
                self.notify(reminder, &reminder.notification.recipients, false).await?;
                state.first_sent = Some(now);
                state.last_sent = Some(now);
                sent += 1;
            }
            Some(last) => {
                let repeat_due = settings
                    .repeat_interval_minutes
                    .is_some_and(|every| now - last >= minutes(every));
                if repeat_due && state.repeats < settings.max_repeats {
                    self.notify(reminder, &reminder.notification.recipients, false).await?;
                    state.repeats += 1;
                    state.last_sent = Some(now);
                    sent += 1;
                }
            }
        }

        self.state().insert(reminder.id, state.clone());

        if let (Some(escalation), Some(first)) = (&settings.escalation, state.first_sent) {
            if !state.escalated && now - first >= minutes(escalation.after_minutes) {
                self.notify(reminder, &escalation.recipients, true).await?;
                state.escalated = true;
                sent += 1;
            }
        }

        self.state().insert(reminder.id, state);
        Ok(sent)
    }

    /// Without a `due_field` a reminder is due as soon as its conditions
    /// hold; with one, from `due - advance_minutes` on. A missing or
    /// unparseable due date is never due.
    async fn is_due(&self, reminder: &SmartReminderConfig, now: DateTime<Utc>) -> EngineResult<bool> {
        let Some(field) = &reminder.settings.due_field else {
            return Ok(true);
        };

        let value = self
            .provider
            .get_field_value(Some(&reminder.entity_type), reminder.entity_id.as_deref(), field)
            .await
            .map_err(|source| EngineError::ConditionEvaluation { field: field.clone(), source })?;

        let Some(due) = value.as_str().and_then(|s| DateTime::parse_from_rfc3339(s).ok()) else {
            debug!(reminder_id = %reminder.id, %field, "no usable due date");
            return Ok(false);
        };
        Ok(now >= due.with_timezone(&Utc) - minutes(reminder.settings.advance_minutes))
    }

    async fn notify(&self, reminder: &SmartReminderConfig, recipients: &[String], escalated: bool) -> EngineResult<Value> {
        let spec = &reminder.notification;
        let (title, priority) = if escalated {
            (format!("[Escalated] {}", spec.title), Some("high".to_owned()))
        } else {
            (spec.title.clone(), spec.priority.clone())
        };

        let action = ActionConfig::new(
            format!("reminder-{}", reminder.id),
            ActionType::SendNotification,
            json!({
                "title": title,
                "message": spec.message,
                "recipients": recipients,
                "priority": priority,
            }),
        );
        let ctx = ActionContext::new(
            reminder.id,
            Uuid::new_v4(),
            json!({ "entity_id": reminder.entity_id, "reminder_id": reminder.id }),
        );

        let output = self
            .actions
            .execute(&action, &ctx)
            .await
            .map_err(|e| EngineError::from_action(&action.id, e))?;
        info!(reminder_id = %reminder.id, escalated, "reminder sent");
        Ok(output)
    }

    fn state(&self) -> MutexGuard<'_, HashMap<Uuid, ReminderState>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn minutes(n: u64) -> chrono::Duration {
    i64::try_from(n)
        .ok()
        .and_then(chrono::Duration::try_minutes)
        .unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actions::mock::MockCapabilities;
    use actions::spec::NotificationSpec;

    use crate::models::{ConditionOperator, Escalation, NewSmartReminder, ReminderSettings, WorkflowCondition};
    use crate::provider::StaticDataProvider;

    /// A clock the test moves by hand.
    struct ManualClock(Mutex<DateTime<Utc>>);

    impl ManualClock {
        fn advance_minutes(&self, n: i64) {
            *self.0.lock().unwrap() += chrono::Duration::minutes(n);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    struct Fixture {
        monitor: ReminderMonitor,
        reminders: Arc<MemoryTable<SmartReminderConfig>>,
        provider: Arc<StaticDataProvider>,
        caps: MockCapabilities,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let reminders = Arc::new(MemoryTable::new("reminders"));
        let provider = Arc::new(StaticDataProvider::new());
        let caps = MockCapabilities::new();
        let clock = Arc::new(ManualClock(Mutex::new(Utc::now())));
        let monitor = ReminderMonitor::new(
            reminders.clone(),
            Arc::new(ConditionEvaluator::new(provider.clone())),
            provider.clone(),
            Arc::new(ActionExecutor::new(Arc::new(caps.clone()))),
            clock.clone(),
        );
        Fixture { monitor, reminders, provider, caps, clock }
    }

    fn overdue_reminder(settings: ReminderSettings) -> SmartReminderConfig {
        NewSmartReminder {
            name: "Overdue task".into(),
            entity_type: "task".into(),
            entity_id: Some("t-1".into()),
            conditions: vec![
                WorkflowCondition::new("status", ConditionOperator::NotEquals, json!("done")).on("task"),
            ],
            settings,
            notification: NotificationSpec {
                title: "Task overdue".into(),
                message: "t-1 is overdue".into(),
                recipients: vec!["owner".into()],
                priority: None,
            },
            enabled: true,
        }
        .into_config(Utc::now())
    }

    #[tokio::test]
    async fn notifies_once_without_repeat() {
        let f = fixture();
        f.reminders.insert(overdue_reminder(ReminderSettings::default())).await.unwrap();

        assert_eq!(f.monitor.check_reminders().await, 1);
        assert_eq!(f.monitor.check_reminders().await, 0);
        assert_eq!(f.caps.calls_to("send_notification"), 1);
    }

    #[tokio::test]
    async fn repeats_are_bounded() {
        let f = fixture();
        let settings = ReminderSettings {
            repeat_interval_minutes: Some(10),
            max_repeats: 2,
            ..ReminderSettings::default()
        };
        f.reminders.insert(overdue_reminder(settings)).await.unwrap();

        assert_eq!(f.monitor.check_reminders().await, 1);
        f.clock.advance_minutes(5);
        assert_eq!(f.monitor.check_reminders().await, 0, "repeat interval not reached");

        for _ in 0..4 {
            f.clock.advance_minutes(10);
            f.monitor.check_reminders().await;
        }
        assert_eq!(f.caps.calls_to("send_notification"), 3);
    }

    #[tokio::test]
    async fn advance_time_gates_the_first_notification() {
        let f = fixture();
        let due = f.clock.now() + chrono::Duration::minutes(60);
        f.provider.set(Some("task"), Some("t-1"), "due_date", json!(due.to_rfc3339()));
        let settings = ReminderSettings {
            due_field: Some("due_date".into()),
            advance_minutes: 15,
            ..ReminderSettings::default()
        };
        f.reminders.insert(overdue_reminder(settings)).await.unwrap();

        assert_eq!(f.monitor.check_reminders().await, 0);
        f.clock.advance_minutes(44);
        assert_eq!(f.monitor.check_reminders().await, 0);
        f.clock.advance_minutes(1);
        assert_eq!(f.monitor.check_reminders().await, 1);
    }

    #[tokio::test]
    async fn escalation_adds_recipients_once() {
        let f = fixture();
        let settings = ReminderSettings {
            escalation: Some(Escalation { after_minutes: 30, recipients: vec!["manager".into()] }),
            ..ReminderSettings::default()
        };
        f.reminders.insert(overdue_reminder(settings)).await.unwrap();

        f.monitor.check_reminders().await;
        f.clock.advance_minutes(30);
        assert_eq!(f.monitor.check_reminders().await, 1);
        f.clock.advance_minutes(30);
        assert_eq!(f.monitor.check_reminders().await, 0);

        let calls = f.caps.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].spec["recipients"], json!(["manager"]));
        assert_eq!(calls[1].spec["priority"], "high");
    }

    #[tokio::test]
    async fn resolved_condition_resets_progress() {
        let f = fixture();
        f.reminders.insert(overdue_reminder(ReminderSettings::default())).await.unwrap();

        f.monitor.check_reminders().await;
        f.provider.set(Some("task"), Some("t-1"), "status", json!("done"));
        assert_eq!(f.monitor.check_reminders().await, 0);

        f.provider.set(Some("task"), Some("t-1"), "status", json!("open"));
        assert_eq!(f.monitor.check_reminders().await, 1);
        assert_eq!(f.caps.calls_to("send_notification"), 2);
    }

    #[tokio::test]
    async fn overlapping_sweeps_notify_once() {
        let f = fixture();
        f.reminders.insert(overdue_reminder(ReminderSettings::default())).await.unwrap();

        let (a, b) = tokio::join!(f.monitor.check_reminders(), f.monitor.check_reminders());
        assert_eq!(a + b, 1);
        assert_eq!(f.caps.calls_to("send_notification"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_range_period_idles_until_cancelled() {
        let f = fixture();
        f.reminders.insert(overdue_reminder(ReminderSettings::default())).await.unwrap();
        let monitor = Arc::new(f.monitor);
        let cancel = CancellationToken::new();

        let handle = monitor.spawn(Duration::MAX, cancel.clone());
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(f.caps.calls().is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn disabled_reminders_are_skipped() {
        let f = fixture();
        let mut reminder = overdue_reminder(ReminderSettings::default());
        reminder.enabled = false;
        f.reminders.insert(reminder).await.unwrap();

        assert_eq!(f.monitor.check_reminders().await, 0);
        assert!(f.caps.calls().is_empty());
    }
}
