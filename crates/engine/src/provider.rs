//! Entity data lookup used by condition evaluation.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;

/// Supplies live field values for condition evaluation.
///
/// `entity_type` and `entity_id` are `None` when the condition or trigger
/// context doesn't name them; implementations decide what that means
/// (e.g. a global or aggregate field).
#[async_trait]
pub trait DataProvider: Send + Sync {
    async fn get_field_value(
        &self,
        entity_type: Option<&str>,
        entity_id: Option<&str>,
        field: &str,
    ) -> anyhow::Result<Value>;
}

type FieldKey = (Option<String>, Option<String>, String);

/// In-memory provider: a settable map of field values.
///
/// Unknown fields read as `Value::Null`.
#[derive(Debug, Default)]
pub struct StaticDataProvider {
    fields: RwLock<HashMap<FieldKey, Value>>,
}

impl StaticDataProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field scoped to an entity.
    pub fn set(&self, entity_type: Option<&str>, entity_id: Option<&str>, field: &str, value: Value) {
        if let Ok(mut fields) = self.fields.write() {
            fields.insert(
                (
                    entity_type.map(str::to_owned),
                    entity_id.map(str::to_owned),
                    field.to_owned(),
                ),
                value,
            );
        }
    }

    /// Set an unscoped field.
    pub fn set_global(&self, field: &str, value: Value) {
        self.set(None, None, field, value);
    }
}

#[async_trait]
impl DataProvider for StaticDataProvider {
    async fn get_field_value(
        &self,
        entity_type: Option<&str>,
        entity_id: Option<&str>,
        field: &str,
    ) -> anyhow::Result<Value> {
        let fields = self
            .fields
            .read()
            .map_err(|_| anyhow::anyhow!("field map lock poisoned"))?;
        let key = (
            entity_type.map(str::to_owned),
            entity_id.map(str::to_owned),
            field.to_owned(),
        );
        Ok(fields.get(&key).cloned().unwrap_or(Value::Null))
    }
}
