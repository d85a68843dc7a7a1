//! Core domain models for the automation engine.

pub mod execution;
pub mod reminder;
pub mod template;
pub mod workflow;

pub use execution::{
    ExecutionLog, ExecutionStatus, ExecutionStep, LogLevel, StepStatus, TriggeredBy,
    WorkflowExecution, WorkflowStatistics,
};
pub use reminder::{Escalation, NewSmartReminder, ReminderSettings, SmartReminderConfig};
pub use template::{TemplateVariable, VariableType, WorkflowTemplate};
pub use workflow::{
    ConditionOperator, ErrorHandling, LogicalOperator, NewWorkflow, TimeSchedule, TriggerConfig,
    TriggerKind, TriggerType, WorkflowCondition, WorkflowDefinition, WorkflowMetadata,
    WorkflowPatch, WorkflowSettings, WorkflowStatus,
};
