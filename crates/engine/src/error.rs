//! Engine-level error types.

use thiserror::Error;
use uuid::Uuid;

/// Errors produced by the automation engine.
///
/// Registry and template calls return these directly to the caller. Failures
/// that happen *during* an execution are recorded on the execution record
/// instead (as its `error` and an `error` log entry); `EngineError` is only
/// the vehicle for their message.
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Lookup errors ------

    #[error("workflow {0} not found")]
    WorkflowNotFound(Uuid),

    #[error("template {0} not found")]
    TemplateNotFound(Uuid),

    #[error("smart reminder {0} not found")]
    ReminderNotFound(Uuid),

    #[error("execution {0} not found")]
    ExecutionNotFound(Uuid),

    // ------ Validation errors ------

    /// A trigger's schedule can never fire as written.
    #[error("trigger '{trigger_id}' has an invalid schedule: {reason}")]
    InvalidTriggerSchedule {
        trigger_id: String,
        reason: String,
    },

    /// Structural problem with a workflow definition (duplicate ids, …).
    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(String),

    // ------ Template errors ------

    #[error("template {template_id} requires variable '{name}'")]
    MissingTemplateVariable {
        template_id: Uuid,
        name: String,
    },

    /// The substituted skeleton no longer parses as a workflow.
    #[error("template {template_id} produced an invalid workflow: {source}")]
    TemplateInstantiation {
        template_id: Uuid,
        #[source]
        source: serde_json::Error,
    },

    #[error("built-in template {0} cannot be modified")]
    BuiltInTemplate(Uuid),

    // ------ Execution errors ------

    #[error("invalid action type: '{0}'")]
    InvalidActionType(String),

    /// An action failed (after any retries).
    #[error("action '{action_id}' failed: {source}")]
    ActionExecution {
        action_id: String,
        #[source]
        source: actions::ActionError,
    },

    /// The data provider could not supply a field value.
    #[error("condition evaluation failed for field '{field}': {source}")]
    ConditionEvaluation {
        field: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("workflow {workflow_id} reached its limit of {max} executions")]
    ExecutionLimitReached {
        workflow_id: Uuid,
        max: u64,
    },

    #[error("execution exceeded its timeout of {timeout_ms}ms")]
    ExecutionTimedOut {
        timeout_ms: u64,
    },

    #[error("execution was cancelled")]
    ExecutionCancelled,

    // ------ Infrastructure ------

    #[error("store error: {0}")]
    Store(#[from] store::StoreError),
}

impl EngineError {
    /// Wrap an action failure, surfacing an unknown type as its own variant.
    pub fn from_action(action_id: &str, source: actions::ActionError) -> Self {
        match source {
            actions::ActionError::InvalidActionType(t) => Self::InvalidActionType(t),
            source => Self::ActionExecution {
                action_id: action_id.to_owned(),
                source,
            },
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
