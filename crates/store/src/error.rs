//! Typed error type for the store crate.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("record {0} not found")]
    NotFound(Uuid),

    #[error("record {0} already exists")]
    Duplicate(Uuid),

    #[error("limit of {0} matching records reached")]
    LimitReached(usize),
}
