use thiserror::Error;

/// Faults coming out of a storage backend (sled, an in-memory map, or whatever a caller
/// plugs in). Pure bookkeeping -- LRU maps, round-robin cursors, session bindings, scoring
/// math -- never produces this; only operations that actually touch a store can fail.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<sled::Error> for StoreError {
    fn from(e: sled::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
