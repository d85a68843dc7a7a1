//! The contracts between the engine, action handlers, and the host app.

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::spec::{
    ArchiveEntitySpec, CreateNoteSpec, CreateTaskSpec, EmailSpec, MoveEntitySpec,
    NotificationSpec, ScriptSpec, TagEntitySpec, UpdateEntitySpec,
};
use crate::ActionError;

/// Shared context passed to every handler during an execution.
///
/// Defined here (in the actions crate) so both the engine and individual
/// handlers can import it without a circular dependency.
#[derive(Debug, Clone)]
pub struct ActionContext {
    /// ID of the parent workflow.
    pub workflow_id: Uuid,
    /// ID of the current execution run.
    pub execution_id: Uuid,
    /// Payload supplied by whatever triggered the execution.
    pub payload: Value,
    /// Cancelled when the execution is cancelled; long-running handlers
    /// should observe it.
    pub cancel: CancellationToken,
}

impl ActionContext {
    pub fn new(workflow_id: Uuid, execution_id: Uuid, payload: Value) -> Self {
        Self {
            workflow_id,
            execution_id,
            payload,
            cancel: CancellationToken::new(),
        }
    }

    /// `entity_id` carried by the trigger payload, if any.
    pub fn entity_id(&self) -> Option<&str> {
        self.payload.get("entity_id").and_then(Value::as_str)
    }
}

/// The core handler trait.
///
/// The built-in kinds are served by adapters over [`ActionCapabilities`];
/// embedders may register their own handlers for custom kinds.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Perform the action described by `config` and return a JSON result.
    async fn execute(&self, config: &Value, ctx: &ActionContext) -> Result<Value, ActionError>;
}

/// The host application's mutation API, one method per built-in action kind.
///
/// Implementations must tolerate being called again for the same spec when
/// an action carries a retry policy.
#[async_trait]
pub trait ActionCapabilities: Send + Sync {
    async fn create_task(&self, spec: CreateTaskSpec) -> anyhow::Result<Value>;
    async fn create_note(&self, spec: CreateNoteSpec) -> anyhow::Result<Value>;
    async fn update_entity(&self, spec: UpdateEntitySpec) -> anyhow::Result<Value>;
    async fn send_notification(&self, spec: NotificationSpec) -> anyhow::Result<Value>;
    async fn send_email(&self, spec: EmailSpec) -> anyhow::Result<Value>;
    async fn tag_entity(&self, spec: TagEntitySpec) -> anyhow::Result<Value>;
    async fn move_entity(&self, spec: MoveEntitySpec) -> anyhow::Result<Value>;
    async fn archive_entity(&self, spec: ArchiveEntitySpec) -> anyhow::Result<Value>;
    async fn execute_script(&self, spec: ScriptSpec) -> anyhow::Result<Value>;
}
