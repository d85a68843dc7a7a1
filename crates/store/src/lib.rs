//! `store` crate: pure persistence layer.
//!
//! Provides [`MemoryTable`], a keyed in-memory repository used as the owning
//! store for each entity kind (workflows, executions, templates, reminders).
//! No business logic lives here.

pub mod error;
pub mod table;

pub use error::StoreError;
pub use table::{MemoryTable, Record};
