//! `MockCapabilities`: a test double for [`ActionCapabilities`].
//!
//! Records every call it receives and returns a canned result, optionally
//! failing a given method a fixed number of times first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use crate::spec::{
    ArchiveEntitySpec, CreateNoteSpec, CreateTaskSpec, EmailSpec, MoveEntitySpec,
    NotificationSpec, ScriptSpec, TagEntitySpec, UpdateEntitySpec,
};
use crate::ActionCapabilities;

/// One recorded capability call.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: String,
    pub spec: Value,
}

/// How a method misbehaves before it starts succeeding.
#[derive(Debug, Clone)]
struct Failure {
    /// `None` fails forever.
    remaining: Option<u32>,
    message: String,
}

/// A mock host API that records every call it receives.
#[derive(Debug, Default, Clone)]
pub struct MockCapabilities {
    calls: Arc<Mutex<Vec<RecordedCall>>>,
    failures: Arc<Mutex<HashMap<String, Failure>>>,
}

impl MockCapabilities {
    /// A mock where every method succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `method` fail on every call.
    pub fn failing(self, method: &str, msg: impl Into<String>) -> Self {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner).insert(
            method.to_owned(),
            Failure { remaining: None, message: msg.into() },
        );
        self
    }

    /// Make `method` fail on its first `times` calls, then succeed.
    pub fn failing_times(self, method: &str, times: u32, msg: impl Into<String>) -> Self {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner).insert(
            method.to_owned(),
            Failure { remaining: Some(times), message: msg.into() },
        );
        self
    }

    /// All calls seen so far, in call order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of calls made to `method`.
    pub fn calls_to(&self, method: &str) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).iter().filter(|c| c.method == method).count()
    }

    fn record<S: Serialize>(&self, method: &str, spec: &S) -> anyhow::Result<Value> {
        let spec = serde_json::to_value(spec)?;
        let seq = {
            let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
            calls.push(RecordedCall { method: method.to_owned(), spec });
            calls.len()
        };

        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(failure) = failures.get_mut(method) {
            match failure.remaining {
                None => anyhow::bail!("{}", failure.message),
                Some(0) => {}
                Some(ref mut n) => {
                    *n -= 1;
                    anyhow::bail!("{}", failure.message);
                }
            }
        }

        Ok(json!({ "method": method, "id": format!("{method}-{seq}") }))
    }
}

#[async_trait]
impl ActionCapabilities for MockCapabilities {
    async fn create_task(&self, spec: CreateTaskSpec) -> anyhow::Result<Value> {
        self.record("create_task", &spec)
    }

    async fn create_note(&self, spec: CreateNoteSpec) -> anyhow::Result<Value> {
        self.record("create_note", &spec)
    }

    async fn update_entity(&self, spec: UpdateEntitySpec) -> anyhow::Result<Value> {
        self.record("update_entity", &spec)
    }

    async fn send_notification(&self, spec: NotificationSpec) -> anyhow::Result<Value> {
        self.record("send_notification", &spec)
    }

    async fn send_email(&self, spec: EmailSpec) -> anyhow::Result<Value> {
        self.record("send_email", &spec)
    }

    async fn tag_entity(&self, spec: TagEntitySpec) -> anyhow::Result<Value> {
        self.record("tag_entity", &spec)
    }

    async fn move_entity(&self, spec: MoveEntitySpec) -> anyhow::Result<Value> {
        self.record("move_entity", &spec)
    }

    async fn archive_entity(&self, spec: ArchiveEntitySpec) -> anyhow::Result<Value> {
        self.record("archive_entity", &spec)
    }

    async fn execute_script(&self, spec: ScriptSpec) -> anyhow::Result<Value> {
        self.record("execute_script", &spec)
    }
}
