//! Smart reminders: condition-gated notifications with repeat and escalation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use actions::spec::NotificationSpec;

use super::WorkflowCondition;

/// Extra recipients notified once a reminder has gone unresolved for
/// `after_minutes` since its first notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escalation {
    pub after_minutes: u64,
    pub recipients: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReminderSettings {
    /// Entity field holding an RFC 3339 due date. Without one the reminder
    /// fires as soon as its conditions hold.
    pub due_field: Option<String>,
    /// How long before the due date the first notification goes out.
    pub advance_minutes: u64,
    /// Re-notify at this period while the conditions keep holding.
    pub repeat_interval_minutes: Option<u64>,
    /// Repeats allowed after the first notification.
    pub max_repeats: u32,
    pub escalation: Option<Escalation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmartReminderConfig {
    pub id: Uuid,
    pub name: String,
    pub entity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub conditions: Vec<WorkflowCondition>,
    #[serde(default)]
    pub settings: ReminderSettings,
    pub notification: NotificationSpec,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl store::Record for SmartReminderConfig {
    fn id(&self) -> Uuid {
        self.id
    }
}

/// Caller-supplied fields for a new smart reminder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSmartReminder {
    pub name: String,
    pub entity_type: String,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub conditions: Vec<WorkflowCondition>,
    #[serde(default)]
    pub settings: ReminderSettings,
    pub notification: NotificationSpec,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl NewSmartReminder {
    pub fn into_config(self, now: DateTime<Utc>) -> SmartReminderConfig {
        SmartReminderConfig {
            id: Uuid::new_v4(),
            name: self.name,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            conditions: self.conditions,
            settings: self.settings,
            notification: self.notification,
            enabled: self.enabled,
            created_at: now,
        }
    }
}
