//! Execution records: one per workflow run, with ordered steps and logs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::TriggerType;

/// Possible statuses for a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal executions are never modified again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending   => write!(f, "pending"),
            Self::Running   => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed    => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What started an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggeredBy {
    pub trigger_type: TriggerType,
    /// `None` for manual runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

impl TriggeredBy {
    pub fn manual(payload: Value) -> Self {
        Self { trigger_type: TriggerType::Manual, trigger_id: None, payload }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
}

/// One attempted action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub id: Uuid,
    pub action_id: String,
    pub action_type: String,
    pub status: StepStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    /// Invocations made, including retries.
    pub attempts: u32,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
}

impl ExecutionStep {
    pub fn start(action_id: &str, action_type: &str, input: Value, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            action_id: action_id.to_owned(),
            action_type: action_type.to_owned(),
            status: StepStatus::Running,
            start_time: now,
            end_time: None,
            duration_ms: None,
            attempts: 0,
            input,
            output: None,
            error: None,
        }
    }

    pub fn complete(&mut self, output: Value, now: DateTime<Utc>) {
        self.status = StepStatus::Completed;
        self.output = Some(output);
        self.stamp_end(now);
    }

    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.status = StepStatus::Failed;
        self.error = Some(error.into());
        self.stamp_end(now);
    }

    fn stamp_end(&mut self, now: DateTime<Utc>) {
        self.end_time = Some(now);
        self.duration_ms = Some(elapsed_ms(self.start_time, now));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// One run of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub status: ExecutionStatus,
    pub triggered_by: TriggeredBy,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub steps: Vec<ExecutionStep>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub logs: Vec<ExecutionLog>,
}

impl WorkflowExecution {
    /// A fresh `Pending` execution.
    pub fn pending(workflow_id: Uuid, triggered_by: TriggeredBy, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            status: ExecutionStatus::Pending,
            triggered_by,
            start_time: now,
            end_time: None,
            duration_ms: None,
            steps: Vec::new(),
            result: None,
            error: None,
            logs: Vec::new(),
        }
    }

    pub fn log(&mut self, level: LogLevel, message: impl Into<String>, data: Option<Value>, now: DateTime<Utc>) {
        self.logs.push(ExecutionLog {
            timestamp: now,
            level,
            message: message.into(),
            data,
        });
    }

    /// Move to a terminal status and stamp end time and duration.
    pub fn finish(&mut self, status: ExecutionStatus, now: DateTime<Utc>) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.end_time = Some(now);
        self.duration_ms = Some(elapsed_ms(self.start_time, now));
    }

    pub fn logs_at(&self, level: LogLevel) -> impl Iterator<Item = &ExecutionLog> {
        self.logs.iter().filter(move |l| l.level == level)
    }
}

impl store::Record for WorkflowExecution {
    fn id(&self) -> Uuid {
        self.id
    }
}

fn elapsed_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    (end - start).num_milliseconds().max(0) as u64
}

/// Aggregate counters across the registry and the execution store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStatistics {
    pub total_workflows: usize,
    pub active_workflows: usize,
    pub total_executions: usize,
    pub successful_executions: usize,
    pub failed_executions: usize,
    /// Mean duration of terminal executions, in milliseconds.
    pub average_execution_time_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn only_completed_failed_cancelled_are_terminal() {
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
    }

    #[test]
    fn finish_stamps_duration() {
        let start = Utc::now();
        let mut exec = WorkflowExecution::pending(Uuid::new_v4(), TriggeredBy::manual(json!({})), start);
        exec.finish(ExecutionStatus::Completed, start + Duration::milliseconds(250));

        assert_eq!(exec.duration_ms, Some(250));
        assert_eq!(exec.end_time, Some(start + Duration::milliseconds(250)));
    }

    #[test]
    fn step_failure_records_error_and_duration() {
        let start = Utc::now();
        let mut step = ExecutionStep::start("a1", "SEND_EMAIL", json!({}), start);
        step.fail("smtp down", start + Duration::milliseconds(10));

        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(step.error.as_deref(), Some("smtp down"));
        assert_eq!(step.duration_ms, Some(10));
        assert!(step.output.is_none());
    }
}
