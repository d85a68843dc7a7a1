//! Source of truth for workflows, templates, and smart reminders.
//!
//! Each entity kind lives in its own [`MemoryTable`]. Workflow writes keep
//! the scheduler in step: an `Active` workflow is (re)armed after every
//! create/update, anything else is disarmed, and delete disarms before the
//! record goes away.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, instrument};
use uuid::Uuid;

use store::MemoryTable;

use crate::clock::Clock;
use crate::models::{
    NewSmartReminder, NewWorkflow, SmartReminderConfig, WorkflowDefinition, WorkflowPatch,
    WorkflowTemplate,
};
use crate::scheduler::TriggerScheduler;
use crate::template::{builtin_templates, TemplateEngine};
use crate::validate::validate_workflow;
use crate::{EngineError, EngineResult};

pub struct WorkflowRegistry {
    workflows: Arc<MemoryTable<WorkflowDefinition>>,
    templates: MemoryTable<WorkflowTemplate>,
    reminders: Arc<MemoryTable<SmartReminderConfig>>,
    scheduler: Arc<TriggerScheduler>,
    clock: Arc<dyn Clock>,
    /// Serialises workflow writes with the arming that follows them, so the
    /// armed triggers always reflect the last stored status.
    arming: Mutex<()>,
}

impl WorkflowRegistry {
    pub fn new(
        workflows: Arc<MemoryTable<WorkflowDefinition>>,
        reminders: Arc<MemoryTable<SmartReminderConfig>>,
        scheduler: Arc<TriggerScheduler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            workflows,
            templates: MemoryTable::new("templates"),
            reminders,
            scheduler,
            clock,
            arming: Mutex::new(()),
        }
    }

    // -----------------------------------------------------------------------
    // Workflows
    // -----------------------------------------------------------------------

    /// Validate and store a new workflow; arms it if `Active`.
    pub async fn create(&self, draft: NewWorkflow) -> EngineResult<WorkflowDefinition> {
        let definition = draft.into_definition(self.clock.now());
        self.insert(definition).await
    }

    #[instrument(skip_all, fields(workflow_id = %definition.id, name = %definition.name))]
    async fn insert(&self, definition: WorkflowDefinition) -> EngineResult<WorkflowDefinition> {
        validate_workflow(&definition)?;
        let _arming = self.arming.lock().await;
        self.workflows.insert(definition.clone()).await?;
        self.scheduler.arm(&definition);
        info!(status = %definition.status, "workflow created");
        Ok(definition)
    }

    /// Apply `patch`. The stored copy is only replaced if the result validates.
    ///
    /// # Errors
    /// [`EngineError::WorkflowNotFound`] for an unknown id.
    #[instrument(skip(self, patch))]
    pub async fn update(&self, workflow_id: Uuid, patch: WorkflowPatch) -> EngineResult<WorkflowDefinition> {
        let now = self.clock.now();
        let mut rejected = None;
        let _arming = self.arming.lock().await;

        let updated = self
            .workflows
            .update(workflow_id, |stored| {
                let mut next = stored.clone();
                patch.apply(&mut next, now);
                match validate_workflow(&next) {
                    Ok(()) => *stored = next,
                    Err(e) => rejected = Some(e),
                }
            })
            .await
            .map_err(|_| EngineError::WorkflowNotFound(workflow_id))?;

        if let Some(e) = rejected {
            return Err(e);
        }

        self.scheduler.arm(&updated);
        info!(version = updated.version, status = %updated.status, "workflow updated");
        Ok(updated)
    }

    /// Disarm, then remove.
    ///
    /// # Errors
    /// [`EngineError::WorkflowNotFound`] for an unknown id.
    #[instrument(skip(self))]
    pub async fn delete(&self, workflow_id: Uuid) -> EngineResult<WorkflowDefinition> {
        let _arming = self.arming.lock().await;
        self.scheduler.disarm(workflow_id);
        let removed = self
            .workflows
            .remove(workflow_id)
            .await
            .map_err(|_| EngineError::WorkflowNotFound(workflow_id))?;
        info!("workflow deleted");
        Ok(removed)
    }

    /// `None` for an unknown id; lookups never error.
    pub async fn get(&self, workflow_id: Uuid) -> Option<WorkflowDefinition> {
        self.workflows.get(workflow_id).await
    }

    pub async fn list(&self) -> Vec<WorkflowDefinition> {
        self.workflows.list().await
    }

    pub async fn active(&self) -> Vec<WorkflowDefinition> {
        self.workflows.filter(WorkflowDefinition::is_active).await
    }

    /// Arm every active workflow. Returns how many were armed.
    pub async fn arm_active(&self) -> usize {
        let _arming = self.arming.lock().await;
        let active = self.active().await;
        for workflow in &active {
            self.scheduler.arm(workflow);
        }
        active.len()
    }

    // -----------------------------------------------------------------------
    // Templates
    // -----------------------------------------------------------------------

    /// Insert the built-in templates that aren't already present.
    pub async fn load_builtin_templates(&self) {
        for template in builtin_templates() {
            if !self.templates.contains(template.id).await {
                // Contains-then-insert may race another loader; a duplicate is harmless.
                let _ = self.templates.insert(template).await;
            }
        }
    }

    /// Instantiate a template and store the resulting workflow.
    ///
    /// # Errors
    /// [`EngineError::TemplateNotFound`] for an unknown template, plus any
    /// instantiation or validation error.
    pub async fn create_from_template(
        &self,
        template_id: Uuid,
        name: &str,
        variables: &HashMap<String, Value>,
    ) -> EngineResult<WorkflowDefinition> {
        let template = self
            .templates
            .get(template_id)
            .await
            .ok_or(EngineError::TemplateNotFound(template_id))?;
        let definition = TemplateEngine::instantiate(&template, name, variables, self.clock.now())?;
        self.insert(definition).await
    }

    /// Templates, optionally narrowed to one category.
    pub async fn templates(&self, category: Option<&str>) -> Vec<WorkflowTemplate> {
        match category {
            Some(category) => self.templates.filter(|t| t.category == category).await,
            None => self.templates.list().await,
        }
    }

    pub async fn template(&self, template_id: Uuid) -> Option<WorkflowTemplate> {
        self.templates.get(template_id).await
    }

    /// Store a caller-defined template. It is never treated as built-in.
    pub async fn create_template(&self, mut template: WorkflowTemplate) -> EngineResult<Uuid> {
        template.is_built_in = false;
        Ok(self.templates.insert(template).await?)
    }

    /// # Errors
    /// - [`EngineError::TemplateNotFound`] for an unknown id.
    /// - [`EngineError::BuiltInTemplate`] for a built-in template.
    pub async fn delete_template(&self, template_id: Uuid) -> EngineResult<()> {
        let template = self
            .templates
            .get(template_id)
            .await
            .ok_or(EngineError::TemplateNotFound(template_id))?;
        if template.is_built_in {
            return Err(EngineError::BuiltInTemplate(template_id));
        }
        self.templates
            .remove(template_id)
            .await
            .map_err(|_| EngineError::TemplateNotFound(template_id))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Smart reminders
    // -----------------------------------------------------------------------

    pub async fn create_reminder(&self, draft: NewSmartReminder) -> EngineResult<SmartReminderConfig> {
        let reminder = draft.into_config(self.clock.now());
        self.reminders.insert(reminder.clone()).await?;
        info!(reminder_id = %reminder.id, name = %reminder.name, "smart reminder created");
        Ok(reminder)
    }

    pub async fn reminders(&self) -> Vec<SmartReminderConfig> {
        self.reminders.list().await
    }

    pub async fn reminder(&self, reminder_id: Uuid) -> Option<SmartReminderConfig> {
        self.reminders.get(reminder_id).await
    }

    pub async fn delete_reminder(&self, reminder_id: Uuid) -> EngineResult<()> {
        self.reminders
            .remove(reminder_id)
            .await
            .map_err(|_| EngineError::ReminderNotFound(reminder_id))?;
        Ok(())
    }

    pub async fn set_reminder_enabled(&self, reminder_id: Uuid, enabled: bool) -> EngineResult<SmartReminderConfig> {
        self.reminders
            .update(reminder_id, |r| r.enabled = enabled)
            .await
            .map_err(|_| EngineError::ReminderNotFound(reminder_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use actions::spec::NotificationSpec;
    use chrono::Utc;
    use serde_json::json;
    use tokio::sync::mpsc;

    use crate::bus::InMemoryEventBus;
    use crate::clock::FixedClock;
    use crate::conditions::ConditionEvaluator;
    use crate::models::{TriggerConfig, WorkflowStatus};
    use crate::provider::StaticDataProvider;
    use crate::template::{FROM_TEMPLATE_TAG, RECURRING_TASK_TEMPLATE_ID};

    struct Fixture {
        registry: WorkflowRegistry,
        scheduler: Arc<TriggerScheduler>,
        bus: Arc<InMemoryEventBus>,
        _fires: mpsc::UnboundedReceiver<crate::scheduler::FireRequest>,
    }

    fn fixture() -> Fixture {
        let bus = Arc::new(InMemoryEventBus::new());
        let clock: Arc<dyn Clock> = Arc::new(FixedClock(Utc::now()));
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(TriggerScheduler::new(
            bus.clone(),
            Arc::new(ConditionEvaluator::new(Arc::new(StaticDataProvider::new()))),
            clock.clone(),
            Duration::from_secs(60),
            tx,
        ));
        let registry = WorkflowRegistry::new(
            Arc::new(MemoryTable::new("workflows")),
            Arc::new(MemoryTable::new("reminders")),
            scheduler.clone(),
            clock,
        );
        Fixture { registry, scheduler, bus, _fires: rx }
    }

    fn on_note_created(name: &str) -> NewWorkflow {
        NewWorkflow::new(name).with_trigger(TriggerConfig::event("ev", "note.created"))
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let f = fixture();
        let created = f.registry.create(on_note_created("daily")).await.unwrap();

        let fetched = f.registry.get(created.id).await.unwrap();
        assert_eq!(fetched, created);
        assert_eq!(fetched.version, 1);
        assert!(f.registry.get(Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn update_and_delete_unknown_ids_are_not_found() {
        let f = fixture();
        let missing = Uuid::new_v4();

        let err = f.registry.update(missing, WorkflowPatch::default()).await.unwrap_err();
        assert!(matches!(err, EngineError::WorkflowNotFound(id) if id == missing));

        let err = f.registry.delete(missing).await.unwrap_err();
        assert!(matches!(err, EngineError::WorkflowNotFound(id) if id == missing));
    }

    #[tokio::test]
    async fn invalid_create_is_rejected_and_not_stored() {
        let f = fixture();
        let draft = NewWorkflow::new("bad").with_trigger(TriggerConfig::interval("t", 0));

        let err = f.registry.create(draft).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTriggerSchedule { .. }));
        assert!(f.registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn invalid_update_leaves_the_stored_copy_alone() {
        let f = fixture();
        let wf = f.registry.create(on_note_created("wf")).await.unwrap();

        let patch = WorkflowPatch { name: Some(" ".into()), ..WorkflowPatch::default() };
        assert!(f.registry.update(wf.id, patch).await.is_err());
        assert_eq!(f.registry.get(wf.id).await.unwrap(), wf);
    }

    #[tokio::test]
    async fn status_changes_arm_and_disarm_while_running() {
        let f = fixture();
        f.scheduler.start();

        let wf = f.registry.create(on_note_created("wf").active()).await.unwrap();
        assert_eq!(f.bus.subscriber_count("note.created"), 1);

        let paused = f.registry.update(wf.id, WorkflowPatch::status(WorkflowStatus::Paused)).await.unwrap();
        assert_eq!(paused.version, 2);
        assert_eq!(f.bus.subscriber_count("note.created"), 0);

        f.registry.update(wf.id, WorkflowPatch::status(WorkflowStatus::Active)).await.unwrap();
        assert_eq!(f.bus.subscriber_count("note.created"), 1);

        f.registry.delete(wf.id).await.unwrap();
        assert_eq!(f.bus.subscriber_count("note.created"), 0);
        assert_eq!(f.scheduler.armed_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_status_updates_leave_arming_consistent() {
        let f = fixture();
        f.scheduler.start();
        let registry = Arc::new(f.registry);
        let id = registry.create(on_note_created("wf").active()).await.unwrap().id;

        let mut tasks = Vec::new();
        for i in 0..40 {
            let registry = Arc::clone(&registry);
            let status = if i % 2 == 0 { WorkflowStatus::Paused } else { WorkflowStatus::Active };
            tasks.push(tokio::spawn(async move {
                registry.update(id, WorkflowPatch::status(status)).await.unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        let stored = registry.get(id).await.unwrap();
        let expected = usize::from(stored.is_active());
        assert_eq!(f.scheduler.armed_count(), expected);
        assert_eq!(f.bus.subscriber_count("note.created"), expected);
    }

    #[tokio::test]
    async fn arm_active_skips_drafts() {
        let f = fixture();
        f.registry.create(on_note_created("live").active()).await.unwrap();
        f.registry.create(on_note_created("draft")).await.unwrap();

        f.scheduler.start();
        assert_eq!(f.registry.arm_active().await, 1);
        assert_eq!(f.bus.subscriber_count("note.created"), 1);
    }

    #[tokio::test]
    async fn nothing_is_armed_while_stopped() {
        let f = fixture();
        f.registry.create(on_note_created("wf").active()).await.unwrap();
        assert_eq!(f.bus.subscriber_count("note.created"), 0);
    }

    #[tokio::test]
    async fn template_instantiation_stores_a_tagged_workflow() {
        let f = fixture();
        f.registry.load_builtin_templates().await;

        let vars = HashMap::from([
            ("taskName".to_owned(), json!("Water plants")),
            ("interval".to_owned(), json!("60")),
        ]);
        let wf = f
            .registry
            .create_from_template(RECURRING_TASK_TEMPLATE_ID, "Plants", &vars)
            .await
            .unwrap();

        assert_eq!(wf.name, "Plants");
        assert!(wf.metadata.tags.iter().any(|t| t == FROM_TEMPLATE_TAG));
        assert!(f.registry.get(wf.id).await.is_some());

        let err = f
            .registry
            .create_from_template(Uuid::new_v4(), "x", &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::TemplateNotFound(_)));
    }

    #[tokio::test]
    async fn built_in_templates_cannot_be_deleted() {
        let f = fixture();
        f.registry.load_builtin_templates().await;
        f.registry.load_builtin_templates().await;
        assert_eq!(f.registry.templates(None).await.len(), 3);

        let err = f.registry.delete_template(RECURRING_TASK_TEMPLATE_ID).await.unwrap_err();
        assert!(matches!(err, EngineError::BuiltInTemplate(_)));

        let mut custom = WorkflowTemplate::new("Mine", "personal", json!({ "triggers": [], "actions": [] }));
        custom.is_built_in = true;
        let id = f.registry.create_template(custom).await.unwrap();
        assert!(!f.registry.template(id).await.unwrap().is_built_in);
        assert_eq!(f.registry.templates(Some("personal")).await.len(), 1);

        f.registry.delete_template(id).await.unwrap();
        assert!(f.registry.template(id).await.is_none());
    }

    #[tokio::test]
    async fn reminder_crud() {
        let f = fixture();
        let draft = NewSmartReminder {
            name: "Overdue".into(),
            entity_type: "task".into(),
            entity_id: Some("t-1".into()),
            conditions: vec![],
            settings: Default::default(),
            notification: NotificationSpec {
                title: "Task overdue".into(),
                message: "Please look".into(),
                recipients: vec!["me".into()],
                priority: None,
            },
            enabled: true,
        };
        let reminder = f.registry.create_reminder(draft).await.unwrap();
        assert_eq!(f.registry.reminders().await.len(), 1);

        let disabled = f.registry.set_reminder_enabled(reminder.id, false).await.unwrap();
        assert!(!disabled.enabled);

        f.registry.delete_reminder(reminder.id).await.unwrap();
        assert!(f.registry.reminder(reminder.id).await.is_none());
        assert!(matches!(
            f.registry.delete_reminder(reminder.id).await,
            Err(EngineError::ReminderNotFound(_))
        ));
    }
}
