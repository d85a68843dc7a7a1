//! Typed payloads handed to [`crate::ActionCapabilities`].
//!
//! Each built-in action kind decodes its JSON `config` into one of these
//! before calling out to the host application.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTaskSpec {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    /// RFC 3339 timestamp or a relative expression understood by the host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateNoteSpec {
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateEntitySpec {
    pub entity_type: String,
    #[serde(default)]
    pub entity_id: Option<String>,
    pub updates: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationSpec {
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub recipients: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailSpec {
    pub to: Vec<String>,
    pub subject: String,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagEntitySpec {
    pub entity_type: String,
    #[serde(default)]
    pub entity_id: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveEntitySpec {
    pub entity_type: String,
    #[serde(default)]
    pub entity_id: Option<String>,
    pub destination: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveEntitySpec {
    pub entity_type: String,
    #[serde(default)]
    pub entity_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptSpec {
    pub script: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub args: Value,
}

/// Specs that address an existing entity.
///
/// When the action's config omits `entity_id`, the handler fills it from the
/// triggering payload before the capability is called.
pub(crate) trait TargetsEntity {
    fn entity_id_mut(&mut self) -> &mut Option<String>;
}

macro_rules! targets_entity {
    ($($spec:ty),* $(,)?) => {
        $(impl TargetsEntity for $spec {
            fn entity_id_mut(&mut self) -> &mut Option<String> {
                &mut self.entity_id
            }
        })*
    };
}

targets_entity!(UpdateEntitySpec, TagEntitySpec, MoveEntitySpec, ArchiveEntitySpec);
