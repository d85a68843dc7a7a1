//! Template instantiation.
//!
//! Substitution walks the skeleton's JSON tree rather than its serialised
//! text, so values can never break the document's structure:
//! - a string leaf that is exactly `{{name}}` is replaced by the variable's
//!   value, coerced to its declared type (`"60"` declared `number` → `60`);
//! - placeholders embedded in longer strings are replaced by the value's
//!   text form;
//! - placeholders with no matching variable are left verbatim.
//!
//! Declared variables that are required, not supplied, and without a default
//! fail fast with [`EngineError::MissingTemplateVariable`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::models::{
    NewWorkflow, TemplateVariable, VariableType, WorkflowDefinition, WorkflowTemplate,
};
use crate::{EngineError, EngineResult};

/// Tag added to every workflow created from a template.
pub const FROM_TEMPLATE_TAG: &str = "from-template";

pub struct TemplateEngine;

impl TemplateEngine {
    /// Build a workflow definition named `name` from `template`.
    ///
    /// # Errors
    /// - [`EngineError::MissingTemplateVariable`] for an unsatisfied required variable.
    /// - [`EngineError::TemplateInstantiation`] if the result isn't a valid workflow.
    #[instrument(skip(template, variables, now), fields(template_id = %template.id))]
    pub fn instantiate(
        template: &WorkflowTemplate,
        name: &str,
        variables: &HashMap<String, Value>,
        now: DateTime<Utc>,
    ) -> EngineResult<WorkflowDefinition> {
        let resolved = resolve_variables(template, variables)?;

        let mut skeleton = template.definition.clone();
        substitute(&mut skeleton, &resolved);
        if let Value::Object(map) = &mut skeleton {
            map.insert("name".into(), Value::String(name.to_owned()));
        }

        let draft: NewWorkflow = serde_json::from_value(skeleton).map_err(|source| {
            EngineError::TemplateInstantiation {
                template_id: template.id,
                source,
            }
        })?;

        let mut definition = draft.into_definition(now);
        let metadata = &mut definition.metadata;
        metadata.template_id = Some(template.id);
        metadata.tags.push(FROM_TEMPLATE_TAG.to_owned());
        metadata.tags.push(template.id.to_string());
        if metadata.category.is_none() {
            metadata.category = Some(template.category.clone());
        }

        debug!(workflow_id = %definition.id, "instantiated template");
        Ok(definition)
    }
}

/// Supplied values, typed per declaration, plus defaults for omitted ones.
fn resolve_variables(
    template: &WorkflowTemplate,
    supplied: &HashMap<String, Value>,
) -> EngineResult<HashMap<String, Value>> {
    let mut resolved: HashMap<String, Value> = supplied.clone();

    for var in &template.variables {
        match supplied.get(&var.name) {
            Some(value) => {
                resolved.insert(var.name.clone(), coerce(var, value));
            }
            None => match &var.default {
                Some(default) => {
                    resolved.insert(var.name.clone(), default.clone());
                }
                None if var.required => {
                    return Err(EngineError::MissingTemplateVariable {
                        template_id: template.id,
                        name: var.name.clone(),
                    });
                }
                None => {}
            },
        }
    }

    Ok(resolved)
}

/// Convert string input to the declared type where it parses; otherwise
/// keep the value as supplied.
fn coerce(var: &TemplateVariable, value: &Value) -> Value {
    match (var.var_type, value) {
        (VariableType::Number, Value::String(s)) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                Value::from(i)
            } else if let Some(n) = s.parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
                Value::Number(n)
            } else {
                value.clone()
            }
        }
        (VariableType::Boolean, Value::String(s)) => match s.trim() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => value.clone(),
        },
        (VariableType::Array | VariableType::Object, Value::String(s)) => {
            serde_json::from_str(s).unwrap_or_else(|_| value.clone())
        }
        (VariableType::String, Value::Number(_) | Value::Bool(_)) => Value::String(text_of(value)),
        _ => value.clone(),
    }
}

fn substitute(value: &mut Value, vars: &HashMap<String, Value>) {
    match value {
        Value::String(s) => {
            if let Some(rendered) = render_string(s, vars) {
                *value = rendered;
            }
        }
        Value::Array(items) => items.iter_mut().for_each(|item| substitute(item, vars)),
        Value::Object(map) => map.values_mut().for_each(|item| substitute(item, vars)),
        _ => {}
    }
}

/// The replacement for one string leaf, or `None` to keep it unchanged.
fn render_string(s: &str, vars: &HashMap<String, Value>) -> Option<Value> {
    if let Some(value) = whole_placeholder(s).and_then(|name| vars.get(name)) {
        return Some(value.clone());
    }
    if !s.contains("{{") {
        return None;
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        let Some(close) = after_open.find("}}") else {
            out.push_str(&rest[open..]);
            rest = "";
            break;
        };
        let name = after_open[..close].trim();
        match vars.get(name) {
            Some(value) => out.push_str(&text_of(value)),
            None => out.push_str(&rest[open..open + 2 + close + 2]),
        }
        rest = &after_open[close + 2..];
    }
    out.push_str(rest);

    (out != s).then_some(Value::String(out))
}

/// `Some(name)` if `s` is exactly one `{{name}}` placeholder.
fn whole_placeholder(s: &str) -> Option<&str> {
    let inner = s.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    (!inner.contains("{{") && !inner.contains("}}")).then(|| inner.trim())
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Built-in templates
// ---------------------------------------------------------------------------

pub const RECURRING_TASK_TEMPLATE_ID: Uuid = Uuid::from_u128(0x5f0c_1a2b_0000_4000_8000_000000000001);
pub const TAG_NEW_NOTES_TEMPLATE_ID: Uuid = Uuid::from_u128(0x5f0c_1a2b_0000_4000_8000_000000000002);
pub const OVERDUE_ESCALATION_TEMPLATE_ID: Uuid = Uuid::from_u128(0x5f0c_1a2b_0000_4000_8000_000000000003);

/// Templates shipped with the engine.
pub fn builtin_templates() -> Vec<WorkflowTemplate> {
    vec![
        WorkflowTemplate {
            id: RECURRING_TASK_TEMPLATE_ID,
            name: "Recurring task".into(),
            description: "Create the same task on a fixed interval.".into(),
            category: "productivity".into(),
            tags: vec!["tasks".into(), "schedule".into()],
            definition: json!({
                "description": "Creates \"{{taskName}}\" every {{interval}} seconds",
                "triggers": [{
                    "id": "schedule",
                    "type": "time_based",
                    "schedule": { "type": "interval", "seconds": "{{interval}}" }
                }],
                "actions": [{
                    "id": "create-task",
                    "type": "CREATE_TASK",
                    "config": { "title": "{{taskName}}", "priority": "{{priority}}" }
                }],
                "tags": ["recurring"]
            }),
            variables: vec![
                TemplateVariable::required("taskName", VariableType::String).describe("Title of the created task"),
                TemplateVariable::optional("interval", VariableType::Number, json!(86_400))
                    .describe("Seconds between runs"),
                TemplateVariable::optional("priority", VariableType::String, json!("medium")),
            ],
            is_built_in: true,
        },
        WorkflowTemplate {
            id: TAG_NEW_NOTES_TEMPLATE_ID,
            name: "Tag new notes".into(),
            description: "Apply a tag to every newly created note.".into(),
            category: "organization".into(),
            tags: vec!["notes".into(), "tags".into()],
            definition: json!({
                "triggers": [{
                    "id": "note-created",
                    "type": "event_based",
                    "event_type": "note.created"
                }],
                "actions": [{
                    "id": "tag-note",
                    "type": "TAG_ENTITY",
                    "config": { "entity_type": "note", "tags": ["{{tag}}"] }
                }]
            }),
            variables: vec![TemplateVariable::required("tag", VariableType::String)],
            is_built_in: true,
        },
        WorkflowTemplate {
            id: OVERDUE_ESCALATION_TEMPLATE_ID,
            name: "Overdue task escalation".into(),
            description: "Notify someone while any task is overdue.".into(),
            category: "productivity".into(),
            tags: vec!["tasks".into(), "notifications".into()],
            definition: json!({
                "triggers": [{
                    "id": "overdue-poll",
                    "type": "condition_based",
                    "conditions": [{
                        "field": "overdue_count",
                        "operator": "greater_than",
                        "value": 0,
                        "entity_type": "task"
                    }],
                    "poll_interval_secs": "{{pollSeconds}}"
                }],
                "actions": [{
                    "id": "notify",
                    "type": "SEND_NOTIFICATION",
                    "config": {
                        "title": "Overdue tasks",
                        "message": "You have overdue tasks that need attention.",
                        "recipients": ["{{recipient}}"],
                        "priority": "high"
                    }
                }]
            }),
            variables: vec![
                TemplateVariable::required("recipient", VariableType::String),
                TemplateVariable::optional("pollSeconds", VariableType::Number, json!(300)),
            ],
            is_built_in: true,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TimeSchedule, TriggerKind};

    fn vars(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn recurring() -> WorkflowTemplate {
        builtin_templates()
            .into_iter()
            .find(|t| t.id == RECURRING_TASK_TEMPLATE_ID)
            .unwrap()
    }

    #[test]
    fn placeholders_are_replaced_with_typed_values() {
        let wf = TemplateEngine::instantiate(
            &recurring(),
            "Daily standup",
            &vars(&[("taskName", json!("X")), ("interval", json!("60"))]),
            Utc::now(),
        )
        .expect("instantiates");

        let text = serde_json::to_string(&wf).unwrap();
        assert!(!text.contains("{{taskName}}"));
        assert!(!text.contains("{{interval}}"));

        assert_eq!(wf.name, "Daily standup");
        assert_eq!(wf.actions[0].config["title"], "X");
        assert_eq!(wf.actions[0].config["priority"], "medium");
        assert_eq!(wf.description, "Creates \"X\" every 60 seconds");
        assert!(matches!(
            wf.triggers[0].kind,
            TriggerKind::TimeBased { schedule: TimeSchedule::Interval { seconds: 60 } }
        ));
    }

    #[test]
    fn result_is_tagged_with_its_template() {
        let wf = TemplateEngine::instantiate(&recurring(), "t", &vars(&[("taskName", json!("X"))]), Utc::now())
            .unwrap();

        assert!(wf.metadata.tags.contains(&FROM_TEMPLATE_TAG.to_string()));
        assert!(wf.metadata.tags.contains(&RECURRING_TASK_TEMPLATE_ID.to_string()));
        assert!(wf.metadata.tags.contains(&"recurring".to_string()));
        assert_eq!(wf.metadata.template_id, Some(RECURRING_TASK_TEMPLATE_ID));
        assert_eq!(wf.metadata.category.as_deref(), Some("productivity"));
    }

    #[test]
    fn missing_required_variable_fails_fast() {
        let err = TemplateEngine::instantiate(&recurring(), "t", &HashMap::new(), Utc::now()).unwrap_err();
        assert!(matches!(err, EngineError::MissingTemplateVariable { ref name, .. } if name == "taskName"));
    }

    #[test]
    fn undeclared_placeholders_are_left_verbatim() {
        let template = WorkflowTemplate::new(
            "loose",
            "misc",
            json!({
                "description": "Hello {{who}}, from {{sender}}",
                "actions": [{ "id": "a", "type": "CREATE_NOTE", "config": { "title": "{{unknown}}" } }]
            }),
        );

        let wf = TemplateEngine::instantiate(&template, "n", &vars(&[("who", json!("Ada"))]), Utc::now()).unwrap();

        assert_eq!(wf.description, "Hello Ada, from {{sender}}");
        assert_eq!(wf.actions[0].config["title"], "{{unknown}}");
    }

    #[test]
    fn wrongly_typed_substitution_is_an_instantiation_error() {
        let template = WorkflowTemplate::new(
            "bad",
            "misc",
            json!({
                "triggers": [{
                    "id": "t",
                    "type": "time_based",
                    "schedule": { "type": "interval", "seconds": "{{interval}}" }
                }]
            }),
        );

        let err = TemplateEngine::instantiate(&template, "n", &vars(&[("interval", json!("soon"))]), Utc::now())
            .unwrap_err();
        assert!(matches!(err, EngineError::TemplateInstantiation { .. }));
    }

    #[test]
    fn embedded_placeholders_use_text_form() {
        let rendered = render_string("every {{n}}s, {{flag}}", &vars(&[("n", json!(30)), ("flag", json!(true))]));
        assert_eq!(rendered, Some(json!("every 30s, true")));
    }

    #[test]
    fn unterminated_placeholder_is_kept() {
        assert_eq!(render_string("oops {{name", &vars(&[("name", json!("x"))])), None);
    }

    #[test]
    fn builtin_templates_instantiate_with_required_variables() {
        let supplied = vars(&[
            ("taskName", json!("Water plants")),
            ("tag", json!("inbox")),
            ("recipient", json!("me@example.com")),
        ]);
        for template in builtin_templates() {
            assert!(template.is_built_in);
            TemplateEngine::instantiate(&template, &template.name, &supplied, Utc::now())
                .unwrap_or_else(|e| panic!("{} failed: {e}", template.name));
        }
    }
}
