//! Condition evaluation.
//!
//! A condition list is a **left fold**, not an expression tree:
//!
//! ```text
//! result = true; op = AND
//! for c in conditions:
//!     result = op(result, test(c))
//!     op     = c.logical_operator.unwrap_or(op)
//! ```
//!
//! A condition's `logical_operator` governs how the *next* condition is
//! combined, so the first condition's operator never affects its own
//! combination and there is no AND-over-OR precedence. Every condition is
//! evaluated, in order, even when the result is already decided.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, instrument};

use crate::models::{ConditionOperator, LogicalOperator, WorkflowCondition};
use crate::provider::DataProvider;
use crate::{EngineError, EngineResult};

/// Evaluates condition lists against live entity data.
pub struct ConditionEvaluator {
    provider: Arc<dyn DataProvider>,
}

impl ConditionEvaluator {
    pub fn new(provider: Arc<dyn DataProvider>) -> Self {
        Self { provider }
    }

    /// Evaluate `conditions`; `entity_id` scopes the field lookups.
    ///
    /// An empty list is vacuously true.
    ///
    /// # Errors
    /// [`EngineError::ConditionEvaluation`] if the provider fails.
    #[instrument(skip(self, conditions), fields(count = conditions.len()))]
    pub async fn evaluate(&self, conditions: &[WorkflowCondition], entity_id: Option<&str>) -> EngineResult<bool> {
        let mut result = true;
        let mut op = LogicalOperator::And;

        for condition in conditions {
            let actual = self
                .provider
                .get_field_value(condition.entity_type.as_deref(), entity_id, &condition.field)
                .await
                .map_err(|source| EngineError::ConditionEvaluation {
                    field: condition.field.clone(),
                    source,
                })?;

            let holds = check(condition.operator, &actual, &condition.value);
            debug!(field = %condition.field, operator = ?condition.operator, holds, "condition tested");

            result = match op {
                LogicalOperator::And => result && holds,
                LogicalOperator::Or => result || holds,
            };
            if let Some(next) = condition.logical_operator {
                op = next;
            }
        }

        Ok(result)
    }
}

/// Apply `operator` to a field's `actual` value and the condition's `expected`.
pub fn check(operator: ConditionOperator, actual: &Value, expected: &Value) -> bool {
    match operator {
        ConditionOperator::Equals      => loosely_equal(actual, expected),
        ConditionOperator::NotEquals   => !loosely_equal(actual, expected),
        ConditionOperator::Contains    => contains(actual, expected),
        ConditionOperator::NotContains => !contains(actual, expected),
        ConditionOperator::GreaterThan => compare(actual, expected) == Some(std::cmp::Ordering::Greater),
        ConditionOperator::LessThan    => compare(actual, expected) == Some(std::cmp::Ordering::Less),
        ConditionOperator::IsEmpty     => is_empty(actual),
        ConditionOperator::IsNotEmpty  => !is_empty(actual),
        ConditionOperator::StartsWith  => both_str(actual, expected).is_some_and(|(a, e)| a.starts_with(e)),
        ConditionOperator::EndsWith    => both_str(actual, expected).is_some_and(|(a, e)| a.ends_with(e)),
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Scalars compare by their string form, so `"60"` equals `60`.
fn scalar_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn loosely_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x == y;
    }
    match (scalar_text(a), scalar_text(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => scalar_text(needle).is_some_and(|n| s.contains(&n)),
        Value::Array(items) => items.iter().any(|item| loosely_equal(item, needle)),
        Value::Object(map) => needle.as_str().is_some_and(|k| map.contains_key(k)),
        _ => false,
    }
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x.partial_cmp(&y);
    }
    // RFC 3339 timestamps order correctly as strings.
    both_str(a, b).map(|(x, y)| x.cmp(y))
}

fn is_empty(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

fn both_str<'a>(a: &'a Value, b: &'a Value) -> Option<(&'a str, &'a str)> {
    Some((a.as_str()?, b.as_str()?))
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::StaticDataProvider;
    use async_trait::async_trait;
    use serde_json::json;

    /// Fields `t0`, `t1`, … read `true`; `f0`, `f1`, … read `false`.
    fn evaluator() -> ConditionEvaluator {
        let provider = StaticDataProvider::new();
        for i in 0..4 {
            provider.set_global(&format!("t{i}"), json!(true));
            provider.set_global(&format!("f{i}"), json!(false));
        }
        ConditionEvaluator::new(Arc::new(provider))
    }

    fn is_true(field: &str) -> WorkflowCondition {
        WorkflowCondition::new(field, ConditionOperator::Equals, json!(true))
    }

    #[tokio::test]
    async fn empty_list_is_vacuously_true() {
        assert!(evaluator().evaluate(&[], None).await.unwrap());
    }

    #[tokio::test]
    async fn default_combination_is_and() {
        let eval = evaluator();
        assert!(eval.evaluate(&[is_true("t0"), is_true("t1")], None).await.unwrap());
        assert!(!eval.evaluate(&[is_true("t0"), is_true("f0")], None).await.unwrap());
    }

    #[tokio::test]
    async fn operator_applies_to_the_next_condition() {
        // false OR true; the OR sits on the first condition.
        let conditions = [is_true("f0").or(), is_true("t0")];
        assert!(evaluator().evaluate(&conditions, None).await.unwrap());
    }

    #[tokio::test]
    async fn first_conditions_operator_does_not_affect_itself() {
        // A lone false condition stays false even though it carries OR.
        assert!(!evaluator().evaluate(&[is_true("f0").or()], None).await.unwrap());
    }

    #[tokio::test]
    async fn fold_is_left_to_right_without_precedence() {
        // true OR false AND false
        //   fold:              ((true || false) && false) == false
        //   precedence tree:   true || (false && false)   == true
        let conditions = [is_true("t0").or(), is_true("f0").and(), is_true("f1")];
        assert!(!evaluator().evaluate(&conditions, None).await.unwrap());
    }

    #[tokio::test]
    async fn operator_persists_until_changed() {
        // false OR false OR true: the second condition carries no operator,
        // so OR stays in effect for the third.
        let conditions = [is_true("f0").or(), is_true("f1"), is_true("t0")];
        assert!(evaluator().evaluate(&conditions, None).await.unwrap());
    }

    #[tokio::test]
    async fn lookups_are_scoped_by_entity() {
        let provider = StaticDataProvider::new();
        provider.set(Some("task"), Some("t-1"), "status", json!("overdue"));
        let eval = ConditionEvaluator::new(Arc::new(provider));
        let cond = [WorkflowCondition::new("status", ConditionOperator::Equals, json!("overdue")).on("task")];

        assert!(eval.evaluate(&cond, Some("t-1")).await.unwrap());
        assert!(!eval.evaluate(&cond, Some("t-2")).await.unwrap());
    }

    #[tokio::test]
    async fn provider_failure_surfaces_as_condition_error() {
        struct Broken;

        #[async_trait]
        impl DataProvider for Broken {
            async fn get_field_value(&self, _: Option<&str>, _: Option<&str>, _: &str) -> anyhow::Result<Value> {
                anyhow::bail!("index offline")
            }
        }

        let eval = ConditionEvaluator::new(Arc::new(Broken));
        let err = eval.evaluate(&[is_true("anything")], None).await.unwrap_err();
        assert!(matches!(err, EngineError::ConditionEvaluation { ref field, .. } if field == "anything"));
    }

    #[test]
    fn operators_behave_on_json_values() {
        use ConditionOperator::*;

        assert!(check(Equals, &json!(60), &json!("60")));
        assert!(check(NotEquals, &json!("a"), &json!("b")));
        assert!(check(Contains, &json!("weekly review"), &json!("review")));
        assert!(check(Contains, &json!(["urgent", "home"]), &json!("urgent")));
        assert!(check(NotContains, &json!(["home"]), &json!("work")));
        assert!(check(GreaterThan, &json!(5), &json!(3)));
        assert!(check(LessThan, &json!("2024-01-01T00:00:00Z"), &json!("2024-06-01T00:00:00Z")));
        assert!(!check(GreaterThan, &json!(null), &json!(3)));
        assert!(check(IsEmpty, &json!(null), &json!(null)));
        assert!(check(IsEmpty, &json!([]), &json!(null)));
        assert!(check(IsNotEmpty, &json!("x"), &json!(null)));
        assert!(check(StartsWith, &json!("Project: Apollo"), &json!("Project")));
        assert!(check(EndsWith, &json!("notes.md"), &json!(".md")));
    }
}
