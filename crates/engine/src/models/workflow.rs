//! Workflow definitions: triggers, conditions, settings.
//!
//! These types are the source of truth for what a workflow looks like in
//! memory and on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use actions::ActionConfig;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a workflow. Only `Active` workflows have armed triggers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Draft,
    Active,
    Inactive,
    Paused,
    Error,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Draft    => write!(f, "draft"),
            Self::Active   => write!(f, "active"),
            Self::Inactive => write!(f, "inactive"),
            Self::Paused   => write!(f, "paused"),
            Self::Error    => write!(f, "error"),
        }
    }
}

// ---------------------------------------------------------------------------
// Triggers
// ---------------------------------------------------------------------------

/// The stimulus category that started an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    TimeBased,
    EventBased,
    ConditionBased,
    Manual,
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TimeBased      => write!(f, "time_based"),
            Self::EventBased     => write!(f, "event_based"),
            Self::ConditionBased => write!(f, "condition_based"),
            Self::Manual         => write!(f, "manual"),
        }
    }
}

/// When a time-based trigger fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimeSchedule {
    /// Every `seconds`, starting one period after arming.
    Interval { seconds: u64 },
    /// Once at `at`; never fires if `at` has already passed when armed.
    Once { at: DateTime<Utc> },
    /// Accepted for compatibility but never armed: cron expressions are
    /// not evaluated.
    Cron { expression: String },
}

/// Type-specific trigger configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerKind {
    TimeBased {
        schedule: TimeSchedule,
    },
    /// Fires for every bus event named `event_type` whose fields match all
    /// `filters` exactly.
    EventBased {
        event_type: String,
        #[serde(default)]
        filters: Map<String, Value>,
    },
    /// Polls `conditions` and fires on every poll where they hold. There is
    /// no edge detection: a condition that stays true fires on each poll.
    ConditionBased {
        conditions: Vec<WorkflowCondition>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        poll_interval_secs: Option<u64>,
    },
    Manual,
}

impl TriggerKind {
    pub fn trigger_type(&self) -> TriggerType {
        match self {
            Self::TimeBased { .. }      => TriggerType::TimeBased,
            Self::EventBased { .. }     => TriggerType::EventBased,
            Self::ConditionBased { .. } => TriggerType::ConditionBased,
            Self::Manual                => TriggerType::Manual,
        }
    }
}

/// A trigger declared by a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Unique identifier within the owning workflow.
    pub id: String,
    #[serde(flatten)]
    pub kind: TriggerKind,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl TriggerConfig {
    pub fn new(id: impl Into<String>, kind: TriggerKind) -> Self {
        Self { id: id.into(), kind, enabled: true }
    }

    pub fn interval(id: impl Into<String>, seconds: u64) -> Self {
        Self::new(id, TriggerKind::TimeBased { schedule: TimeSchedule::Interval { seconds } })
    }

    pub fn once(id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self::new(id, TriggerKind::TimeBased { schedule: TimeSchedule::Once { at } })
    }

    pub fn event(id: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self::new(
            id,
            TriggerKind::EventBased { event_type: event_type.into(), filters: Map::new() },
        )
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    GreaterThan,
    LessThan,
    IsEmpty,
    IsNotEmpty,
    StartsWith,
    EndsWith,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalOperator {
    #[default]
    And,
    Or,
}

/// One field test.
///
/// `logical_operator` decides how the *next* condition in the list combines
/// with the running result; see [`crate::conditions::ConditionEvaluator`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowCondition {
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logical_operator: Option<LogicalOperator>,
}

impl WorkflowCondition {
    pub fn new(field: impl Into<String>, operator: ConditionOperator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
            entity_type: None,
            logical_operator: None,
        }
    }

    pub fn on(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self
    }

    /// Combine the following condition with AND.
    pub fn and(mut self) -> Self {
        self.logical_operator = Some(LogicalOperator::And);
        self
    }

    /// Combine the following condition with OR.
    pub fn or(mut self) -> Self {
        self.logical_operator = Some(LogicalOperator::Or);
        self
    }
}

// ---------------------------------------------------------------------------
// Settings & metadata
// ---------------------------------------------------------------------------

/// What happens to the remaining actions when one fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorHandling {
    /// Abort and fail the execution.
    #[default]
    Stop,
    /// Record the failure and carry on.
    Continue,
    /// Retry actions that carry a `RetryConfig`; fail like `Stop` once
    /// retries are exhausted.
    Retry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowSettings {
    pub error_handling: ErrorHandling,
    /// When false, only warn/error entries are written to execution logs.
    pub logging_enabled: bool,
    /// Deadline for a whole execution, in milliseconds.
    pub execution_timeout_ms: Option<u64>,
    /// Cap on the number of execution records for this workflow.
    pub max_executions: Option<u64>,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            error_handling: ErrorHandling::Stop,
            logging_enabled: true,
            execution_timeout_ms: None,
            max_executions: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMetadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Set when the workflow was instantiated from a template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<Uuid>,
}

// ---------------------------------------------------------------------------
// WorkflowDefinition
// ---------------------------------------------------------------------------

/// A complete workflow, as owned by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub version: u32,
    pub status: WorkflowStatus,
    pub triggers: Vec<TriggerConfig>,
    pub actions: Vec<ActionConfig>,
    /// Top-level gate; empty means "always run".
    #[serde(default)]
    pub conditions: Vec<WorkflowCondition>,
    #[serde(default)]
    pub settings: WorkflowSettings,
    pub metadata: WorkflowMetadata,
}

impl WorkflowDefinition {
    pub fn is_active(&self) -> bool {
        self.status == WorkflowStatus::Active
    }

    pub fn trigger(&self, trigger_id: &str) -> Option<&TriggerConfig> {
        self.triggers.iter().find(|t| t.id == trigger_id)
    }
}

impl store::Record for WorkflowDefinition {
    fn id(&self) -> Uuid {
        self.id
    }
}

// ---------------------------------------------------------------------------
// Create / update inputs
// ---------------------------------------------------------------------------

/// Caller-supplied fields for a new workflow; the registry assigns the id,
/// version, and timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewWorkflow {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: WorkflowStatus,
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
    #[serde(default)]
    pub actions: Vec<ActionConfig>,
    #[serde(default)]
    pub conditions: Vec<WorkflowCondition>,
    #[serde(default)]
    pub settings: WorkflowSettings,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl NewWorkflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            status: WorkflowStatus::Draft,
            triggers: Vec::new(),
            actions: Vec::new(),
            conditions: Vec::new(),
            settings: WorkflowSettings::default(),
            tags: Vec::new(),
            category: None,
        }
    }

    pub fn active(mut self) -> Self {
        self.status = WorkflowStatus::Active;
        self
    }

    pub fn with_trigger(mut self, trigger: TriggerConfig) -> Self {
        self.triggers.push(trigger);
        self
    }

    pub fn with_action(mut self, action: ActionConfig) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_condition(mut self, condition: WorkflowCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_settings(mut self, settings: WorkflowSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_error_handling(mut self, error_handling: ErrorHandling) -> Self {
        self.settings.error_handling = error_handling;
        self
    }

    pub fn into_definition(self, now: DateTime<Utc>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: Uuid::new_v4(),
            name: self.name,
            description: self.description,
            version: 1,
            status: self.status,
            triggers: self.triggers,
            actions: self.actions,
            conditions: self.conditions,
            settings: self.settings,
            metadata: WorkflowMetadata {
                created_at: now,
                updated_at: now,
                tags: self.tags,
                category: self.category,
                template_id: None,
            },
        }
    }
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub status: Option<WorkflowStatus>,
    pub triggers: Option<Vec<TriggerConfig>>,
    pub actions: Option<Vec<ActionConfig>>,
    pub conditions: Option<Vec<WorkflowCondition>>,
    pub settings: Option<WorkflowSettings>,
    pub tags: Option<Vec<String>>,
    pub category: Option<String>,
}

impl WorkflowPatch {
    pub fn status(status: WorkflowStatus) -> Self {
        Self { status: Some(status), ..Self::default() }
    }

    /// Apply the patch, bumping `version` and `updated_at`.
    pub fn apply(self, wf: &mut WorkflowDefinition, now: DateTime<Utc>) {
        if let Some(name) = self.name {
            wf.name = name;
        }
        if let Some(description) = self.description {
            wf.description = description;
        }
        if let Some(status) = self.status {
            wf.status = status;
        }
        if let Some(triggers) = self.triggers {
            wf.triggers = triggers;
        }
        if let Some(actions) = self.actions {
            wf.actions = actions;
        }
        if let Some(conditions) = self.conditions {
            wf.conditions = conditions;
        }
        if let Some(settings) = self.settings {
            wf.settings = settings;
        }
        if let Some(tags) = self.tags {
            wf.metadata.tags = tags;
        }
        if let Some(category) = self.category {
            wf.metadata.category = Some(category);
        }
        wf.version += 1;
        wf.metadata.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn trigger_config_flattens_kind_into_wire_object() {
        let trigger = TriggerConfig::interval("every-minute", 60);
        let wire = serde_json::to_value(&trigger).unwrap();

        assert_eq!(
            wire,
            json!({
                "id": "every-minute",
                "type": "time_based",
                "schedule": { "type": "interval", "seconds": 60 },
                "enabled": true,
            })
        );
        let back: TriggerConfig = serde_json::from_value(wire).unwrap();
        assert_eq!(back, trigger);
    }

    #[test]
    fn event_trigger_defaults_filters_and_enabled() {
        let trigger: TriggerConfig = serde_json::from_value(json!({
            "id": "on-note",
            "type": "event_based",
            "event_type": "note.created",
        }))
        .unwrap();

        assert!(trigger.enabled);
        assert_eq!(trigger.kind.trigger_type(), TriggerType::EventBased);
        assert!(matches!(trigger.kind, TriggerKind::EventBased { ref filters, .. } if filters.is_empty()));
    }

    #[test]
    fn new_workflow_parses_from_minimal_json() {
        let draft: NewWorkflow = serde_json::from_value(json!({ "name": "bare" })).unwrap();
        assert_eq!(draft.status, WorkflowStatus::Draft);
        assert!(draft.settings.logging_enabled);
        assert_eq!(draft.settings.error_handling, ErrorHandling::Stop);
    }

    #[test]
    fn patch_bumps_version_and_leaves_unset_fields() {
        let now = Utc::now();
        let mut wf = NewWorkflow::new("original").into_definition(now);
        let later = now + chrono::Duration::seconds(5);

        WorkflowPatch::status(WorkflowStatus::Active).apply(&mut wf, later);

        assert_eq!(wf.version, 2);
        assert_eq!(wf.name, "original");
        assert_eq!(wf.status, WorkflowStatus::Active);
        assert_eq!(wf.metadata.updated_at, later);
        assert_eq!(wf.metadata.created_at, now);
    }
}
