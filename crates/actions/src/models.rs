//! Action configuration models.
//!
//! An [`ActionConfig`] is one step of a workflow: a kind, a free-form JSON
//! payload interpreted by that kind's handler, and an optional retry policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// ActionType
// ---------------------------------------------------------------------------

/// The kind of side effect an action performs.
///
/// Serialised as its `SCREAMING_SNAKE_CASE` name. Names that don't match a
/// built-in kind deserialise into [`ActionType::Custom`] instead of failing,
/// so an unsupported type is reported when the action runs, not when the
/// workflow is loaded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ActionType {
    CreateTask,
    CreateNote,
    UpdateEntity,
    SendNotification,
    SendEmail,
    TagEntity,
    MoveEntity,
    ArchiveEntity,
    ExecuteScript,
    /// Anything else; dispatchable only if a handler was registered for it.
    Custom(String),
}

impl ActionType {
    /// Every built-in kind, in declaration order.
    pub const BUILT_IN: [ActionType; 9] = [
        Self::CreateTask,
        Self::CreateNote,
        Self::UpdateEntity,
        Self::SendNotification,
        Self::SendEmail,
        Self::TagEntity,
        Self::MoveEntity,
        Self::ArchiveEntity,
        Self::ExecuteScript,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Self::CreateTask       => "CREATE_TASK",
            Self::CreateNote       => "CREATE_NOTE",
            Self::UpdateEntity     => "UPDATE_ENTITY",
            Self::SendNotification => "SEND_NOTIFICATION",
            Self::SendEmail        => "SEND_EMAIL",
            Self::TagEntity        => "TAG_ENTITY",
            Self::MoveEntity       => "MOVE_ENTITY",
            Self::ArchiveEntity    => "ARCHIVE_ENTITY",
            Self::ExecuteScript    => "EXECUTE_SCRIPT",
            Self::Custom(name)     => name,
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for ActionType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "CREATE_TASK"       => Self::CreateTask,
            "CREATE_NOTE"       => Self::CreateNote,
            "UPDATE_ENTITY"     => Self::UpdateEntity,
            "SEND_NOTIFICATION" => Self::SendNotification,
            "SEND_EMAIL"        => Self::SendEmail,
            "TAG_ENTITY"        => Self::TagEntity,
            "MOVE_ENTITY"       => Self::MoveEntity,
            "ARCHIVE_ENTITY"    => Self::ArchiveEntity,
            "EXECUTE_SCRIPT"    => Self::ExecuteScript,
            _                   => Self::Custom(s),
        }
    }
}

impl From<&str> for ActionType {
    fn from(s: &str) -> Self {
        Self::from(s.to_owned())
    }
}

impl From<ActionType> for String {
    fn from(t: ActionType) -> Self {
        match t {
            ActionType::Custom(name) => name,
            other => other.as_str().to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// RetryConfig
// ---------------------------------------------------------------------------

/// Per-action retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Re-invocations allowed after the first failed attempt.
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default)]
    pub delay_ms: u64,
    /// Factor applied to the delay after each retry.
    #[serde(default = "default_backoff")]
    pub backoff_multiplier: f64,
}

fn default_backoff() -> f64 {
    2.0
}

impl RetryConfig {
    /// Delay to wait before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let millis = self.delay_ms as f64 * self.backoff_multiplier.max(1.0).powi(exponent);
        Duration::from_millis(millis.min(u64::MAX as f64) as u64)
    }
}

// ---------------------------------------------------------------------------
// ActionConfig
// ---------------------------------------------------------------------------

/// A single action declared by a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionConfig {
    /// Unique identifier within the owning workflow.
    pub id: String,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    /// Kind-specific payload, decoded by the handler.
    #[serde(default)]
    pub config: Value,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
}

fn enabled_by_default() -> bool {
    true
}

impl ActionConfig {
    /// An enabled action with no retry policy.
    pub fn new(id: impl Into<String>, action_type: impl Into<ActionType>, config: Value) -> Self {
        Self {
            id: id.into(),
            action_type: action_type.into(),
            config,
            enabled: true,
            retry: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn known_names_map_to_built_in_kinds() {
        for kind in ActionType::BUILT_IN {
            assert_eq!(ActionType::from(kind.as_str()), kind);
        }
    }

    #[test]
    fn unknown_name_becomes_custom_instead_of_failing() {
        let action: ActionConfig = serde_json::from_value(json!({
            "id": "a1",
            "type": "TELEPORT_ENTITY",
        }))
        .expect("unknown types still deserialise");

        assert_eq!(action.action_type, ActionType::Custom("TELEPORT_ENTITY".into()));
        assert!(action.enabled);
        assert_eq!(action.config, Value::Null);
        assert_eq!(serde_json::to_value(&action).unwrap()["type"], "TELEPORT_ENTITY");
    }

    #[test]
    fn retry_delay_grows_by_multiplier() {
        let retry = RetryConfig { max_retries: 3, delay_ms: 100, backoff_multiplier: 2.0 };
        assert_eq!(retry.delay_for(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn retry_multiplier_below_one_does_not_shrink_delay() {
        let retry = RetryConfig { max_retries: 2, delay_ms: 50, backoff_multiplier: 0.5 };
        assert_eq!(retry.delay_for(2), Duration::from_millis(50));
    }
}
