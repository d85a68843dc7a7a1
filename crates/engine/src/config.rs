//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::validate::MAX_PERIOD_SECS;

/// Tuning knobs for the automation engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Poll period for condition-based triggers that don't declare their own.
    pub condition_poll_interval_secs: u64,
    /// How often the reminder monitor checks smart reminders.
    pub reminder_check_interval_secs: u64,
    /// Publish `workflow.execution.*` events when executions finish.
    pub publish_completion_events: bool,
    /// `module_id` stamped on events the engine publishes.
    pub module_id: String,
    /// Seed the template store with the built-in templates.
    pub load_builtin_templates: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            condition_poll_interval_secs: 60,
            reminder_check_interval_secs: 60,
            publish_completion_events: true,
            module_id: "workflow-automation".to_string(),
            load_builtin_templates: true,
        }
    }
}

impl EngineConfig {
    /// Parse a JSON document; missing keys fall back to the defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn condition_poll_interval(&self) -> Duration {
        Duration::from_secs(self.condition_poll_interval_secs.clamp(1, MAX_PERIOD_SECS))
    }

    pub fn reminder_check_interval(&self) -> Duration {
        Duration::from_secs(self.reminder_check_interval_secs.clamp(1, MAX_PERIOD_SECS))
    }
}
