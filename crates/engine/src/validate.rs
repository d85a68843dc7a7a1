//! Workflow validation. Run this before a definition enters the registry.
//!
//! Rules enforced:
//! 1. The workflow has a non-blank name.
//! 2. Trigger IDs are unique within the workflow, and so are action IDs.
//! 3. Every trigger can fire as written: interval periods and condition poll
//!    periods lie between one second and [`MAX_PERIOD_SECS`], and condition
//!    triggers declare conditions.
//!
//! One-shot schedules in the past and cron expressions pass validation; the
//! scheduler declines to arm them.

use std::collections::HashSet;

use crate::models::{TimeSchedule, TriggerConfig, TriggerKind, WorkflowDefinition};
use crate::EngineError;

/// Longest interval or poll period a trigger may declare: one leap year.
pub const MAX_PERIOD_SECS: u64 = 366 * 24 * 60 * 60;

/// Validate a workflow definition.
///
/// # Errors
/// - [`EngineError::InvalidDefinition`] for naming and ID problems.
/// - [`EngineError::InvalidTriggerSchedule`] for triggers that can never fire.
pub fn validate_workflow(workflow: &WorkflowDefinition) -> Result<(), EngineError> {
    // -----------------------------------------------------------------------
    // 1. Name
    // -----------------------------------------------------------------------
    if workflow.name.trim().is_empty() {
        return Err(EngineError::InvalidDefinition("workflow name is empty".into()));
    }

    // -----------------------------------------------------------------------
    // 2. Unique IDs
    // -----------------------------------------------------------------------
    let mut seen: HashSet<&str> = HashSet::new();
    for trigger in &workflow.triggers {
        if !seen.insert(trigger.id.as_str()) {
            return Err(EngineError::InvalidDefinition(format!(
                "duplicate trigger id '{}'",
                trigger.id
            )));
        }
    }

    seen.clear();
    for action in &workflow.actions {
        if !seen.insert(action.id.as_str()) {
            return Err(EngineError::InvalidDefinition(format!(
                "duplicate action id '{}'",
                action.id
            )));
        }
    }

    // -----------------------------------------------------------------------
    // 3. Trigger schedules
    // -----------------------------------------------------------------------
    workflow.triggers.iter().try_for_each(validate_trigger)
}

fn validate_trigger(trigger: &TriggerConfig) -> Result<(), EngineError> {
    let invalid = |reason: &str| EngineError::InvalidTriggerSchedule {
        trigger_id: trigger.id.clone(),
        reason: reason.to_owned(),
    };

    match &trigger.kind {
        TriggerKind::TimeBased { schedule: TimeSchedule::Interval { seconds: 0 } } => {
            Err(invalid("interval must be at least one second"))
        }
        TriggerKind::TimeBased { schedule: TimeSchedule::Interval { seconds } } if *seconds > MAX_PERIOD_SECS => {
            Err(invalid("interval is longer than a year"))
        }
        TriggerKind::TimeBased { schedule: TimeSchedule::Cron { expression } } if expression.trim().is_empty() => {
            Err(invalid("cron expression is empty"))
        }
        TriggerKind::EventBased { event_type, .. } if event_type.trim().is_empty() => {
            Err(invalid("event type is empty"))
        }
        TriggerKind::ConditionBased { conditions, .. } if conditions.is_empty() => {
            Err(invalid("condition trigger declares no conditions"))
        }
        TriggerKind::ConditionBased { poll_interval_secs: Some(0), .. } => {
            Err(invalid("poll interval must be at least one second"))
        }
        TriggerKind::ConditionBased { poll_interval_secs: Some(secs), .. } if *secs > MAX_PERIOD_SECS => {
            Err(invalid("poll interval is longer than a year"))
        }
        _ => Ok(()),
    }
}
