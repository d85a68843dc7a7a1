//! `actions` crate: action models, the host capability interface, and
//! dispatch to per-kind handlers.
//!
//! Every action, built-in or custom, runs through an [`ActionHandler`].
//! The built-in kinds are thin adapters over [`ActionCapabilities`], which the
//! host application implements.

pub mod error;
pub mod executor;
pub mod mock;
pub mod models;
pub mod spec;
pub mod traits;

pub use error::ActionError;
pub use executor::ActionExecutor;
pub use models::{ActionConfig, ActionType, RetryConfig};
pub use traits::{ActionCapabilities, ActionContext, ActionHandler};
