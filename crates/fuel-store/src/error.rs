use thiserror::Error;

use fuel_types::TaskStatus;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store corrupted: {0}")]
    Corrupted(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("ambiguous id '{prefix}': matches {}", candidates.join(", "))]
    Ambiguous {
        prefix: String,
        candidates: Vec<String>,
    },

    #[error("invalid field: {0}")]
    InvalidField(String),

    #[error("dependency cycle: {0}")]
    CycleDetected(String),

    #[error("invalid transition: {from:?} -> {to:?} for {id}")]
    InvalidTransition {
        id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
}

impl StoreError {
    /// Validation failures surface to the caller and never mutate state.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            StoreError::NotFound(_)
                | StoreError::Ambiguous { .. }
                | StoreError::InvalidField(_)
                | StoreError::CycleDetected(_)
                | StoreError::InvalidTransition { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
