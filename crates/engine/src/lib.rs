//! `engine` crate: workflow models, triggers, conditions, templates, and the
//! execution engine behind [`WorkflowAutomation`].

pub mod automation;
pub mod bus;
pub mod clock;
pub mod conditions;
pub mod config;
pub mod error;
pub mod executor;
pub mod models;
pub mod provider;
pub mod registry;
pub mod reminder;
pub mod scheduler;
pub mod template;
pub mod validate;

pub use automation::WorkflowAutomation;
pub use bus::{Event, EventBus, InMemoryEventBus};
pub use clock::{Clock, SystemClock};
pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use executor::ExecutionEngine;
pub use provider::DataProvider;
pub use validate::validate_workflow;
