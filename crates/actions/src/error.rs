//! Action-level error type.

use thiserror::Error;

/// Errors returned by [`crate::ActionExecutor::execute`] and by individual
/// [`crate::ActionHandler`]s.
///
/// The engine uses [`ActionError::is_retryable`] to decide retry behaviour:
/// - `Execution`:         the capability call failed; retried under a `RetryConfig`.
/// - `InvalidActionType`: no handler is registered; never retried.
/// - `InvalidConfig`:     the payload does not fit the action kind; never retried.
#[derive(Debug, Error)]
pub enum ActionError {
    /// No handler is registered for the action's type.
    #[error("invalid action type: '{0}'")]
    InvalidActionType(String),

    /// The action's `config` could not be turned into the handler's spec.
    #[error("invalid config for {action_type} action: {message}")]
    InvalidConfig {
        action_type: String,
        message: String,
    },

    /// The underlying capability call failed.
    #[error("{action_type} action failed: {source}")]
    Execution {
        action_type: String,
        #[source]
        source: anyhow::Error,
    },
}

impl ActionError {
    /// Whether re-invoking the action could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Execution { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_execution_failures_are_retryable() {
        let exec = ActionError::Execution {
            action_type: "CREATE_TASK".into(),
            source: anyhow::anyhow!("backend unavailable"),
        };
        assert!(exec.is_retryable());
        assert!(!ActionError::InvalidActionType("BOGUS".into()).is_retryable());
        assert!(!ActionError::InvalidConfig {
            action_type: "TAG_ENTITY".into(),
            message: "missing tags".into(),
        }
        .is_retryable());
    }

    #[test]
    fn execution_error_message_includes_cause() {
        let err = ActionError::Execution {
            action_type: "SEND_EMAIL".into(),
            source: anyhow::anyhow!("smtp timeout"),
        };
        assert_eq!(err.to_string(), "SEND_EMAIL action failed: smtp timeout");
    }
}
