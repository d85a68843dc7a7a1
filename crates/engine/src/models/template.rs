//! Workflow templates: parameterised blueprints with `{{name}}` placeholders.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    String,
    Number,
    Boolean,
    Array,
    Object,
}

/// A variable the template expects callers to supply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateVariable {
    pub name: String,
    #[serde(rename = "type")]
    pub var_type: VariableType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl TemplateVariable {
    pub fn required(name: impl Into<String>, var_type: VariableType) -> Self {
        Self {
            name: name.into(),
            var_type,
            required: true,
            default: None,
            description: None,
        }
    }

    pub fn optional(name: impl Into<String>, var_type: VariableType, default: Value) -> Self {
        Self {
            name: name.into(),
            var_type,
            required: false,
            default: Some(default),
            description: None,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Skeleton of a [`super::NewWorkflow`]; string leaves may hold
    /// `{{name}}` placeholders, so it stays untyped until instantiation.
    pub definition: Value,
    #[serde(default)]
    pub variables: Vec<TemplateVariable>,
    #[serde(default)]
    pub is_built_in: bool,
}

impl WorkflowTemplate {
    /// A user-defined template with a fresh id.
    pub fn new(name: impl Into<String>, category: impl Into<String>, definition: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: String::new(),
            category: category.into(),
            tags: Vec::new(),
            definition,
            variables: Vec::new(),
            is_built_in: false,
        }
    }

    pub fn with_variable(mut self, variable: TemplateVariable) -> Self {
        self.variables.push(variable);
        self
    }

    pub fn variable(&self, name: &str) -> Option<&TemplateVariable> {
        self.variables.iter().find(|v| v.name == name)
    }
}

impl store::Record for WorkflowTemplate {
    fn id(&self) -> Uuid {
        self.id
    }
}
