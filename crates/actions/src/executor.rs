//! Action dispatch.
//!
//! [`ActionExecutor`] maps an [`ActionType`] to an [`ActionHandler`] and runs
//! a single attempt. Retries and step bookkeeping belong to the engine.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::spec::TargetsEntity;
use crate::traits::{ActionCapabilities, ActionContext, ActionHandler};
use crate::{ActionConfig, ActionError, ActionType};

/// Maps action types to handler implementations.
pub type HandlerRegistry = HashMap<ActionType, Arc<dyn ActionHandler>>;

/// Dispatches an [`ActionConfig`] to the handler registered for its type.
pub struct ActionExecutor {
    handlers: HandlerRegistry,
}

impl ActionExecutor {
    /// An executor with no handlers; every dispatch fails with
    /// [`ActionError::InvalidActionType`] until handlers are registered.
    pub fn empty() -> Self {
        Self { handlers: HashMap::new() }
    }

    /// An executor serving every built-in kind through `capabilities`.
    pub fn new(capabilities: Arc<dyn ActionCapabilities>) -> Self {
        let mut executor = Self::empty();
        for kind in ActionType::BUILT_IN {
            let handler = CapabilityHandler {
                kind: kind.clone(),
                api: Arc::clone(&capabilities),
            };
            executor.register(kind, Arc::new(handler));
        }
        executor
    }

    /// Register (or replace) the handler for `kind`.
    pub fn register(&mut self, kind: ActionType, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(kind, handler);
    }

    pub fn supports(&self, kind: &ActionType) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Run one attempt of `action`.
    ///
    /// # Errors
    /// - [`ActionError::InvalidActionType`] if no handler is registered.
    /// - Whatever the handler returns otherwise.
    #[instrument(skip(self, action, ctx), fields(action_id = %action.id, action_type = %action.action_type))]
    pub async fn execute(&self, action: &ActionConfig, ctx: &ActionContext) -> Result<Value, ActionError> {
        let handler = self
            .handlers
            .get(&action.action_type)
            .ok_or_else(|| ActionError::InvalidActionType(action.action_type.to_string()))?;

        debug!("dispatching action");
        handler.execute(&action.config, ctx).await
    }
}

// ---------------------------------------------------------------------------
// Built-in adapter
// ---------------------------------------------------------------------------

/// Adapter from a built-in action kind to the matching capability method.
struct CapabilityHandler {
    kind: ActionType,
    api: Arc<dyn ActionCapabilities>,
}

impl CapabilityHandler {
    fn decode<T: DeserializeOwned>(&self, config: &Value) -> Result<T, ActionError> {
        serde_json::from_value(config.clone()).map_err(|e| ActionError::InvalidConfig {
            action_type: self.kind.to_string(),
            message: e.to_string(),
        })
    }

    fn decode_targeted<T>(&self, config: &Value, ctx: &ActionContext) -> Result<T, ActionError>
    where
        T: DeserializeOwned + TargetsEntity,
    {
        let mut spec: T = self.decode(config)?;
        let entity_id = spec.entity_id_mut();
        if entity_id.is_none() {
            *entity_id = ctx.entity_id().map(str::to_owned);
        }
        if entity_id.is_none() {
            return Err(ActionError::InvalidConfig {
                action_type: self.kind.to_string(),
                message: "no entity_id in config or trigger payload".into(),
            });
        }
        Ok(spec)
    }

    fn failed(&self, source: anyhow::Error) -> ActionError {
        ActionError::Execution {
            action_type: self.kind.to_string(),
            source,
        }
    }
}

#[async_trait]
impl ActionHandler for CapabilityHandler {
    async fn execute(&self, config: &Value, ctx: &ActionContext) -> Result<Value, ActionError> {
        let result = match &self.kind {
            ActionType::CreateTask       => self.api.create_task(self.decode(config)?).await,
            ActionType::CreateNote       => self.api.create_note(self.decode(config)?).await,
            ActionType::UpdateEntity     => self.api.update_entity(self.decode_targeted(config, ctx)?).await,
            ActionType::SendNotification => self.api.send_notification(self.decode(config)?).await,
            ActionType::SendEmail        => self.api.send_email(self.decode(config)?).await,
            ActionType::TagEntity        => self.api.tag_entity(self.decode_targeted(config, ctx)?).await,
            ActionType::MoveEntity       => self.api.move_entity(self.decode_targeted(config, ctx)?).await,
            ActionType::ArchiveEntity    => self.api.archive_entity(self.decode_targeted(config, ctx)?).await,
            ActionType::ExecuteScript    => self.api.execute_script(self.decode(config)?).await,
            ActionType::Custom(name)     => return Err(ActionError::InvalidActionType(name.clone())),
        };
        result.map_err(|e| self.failed(e))
    }
}
