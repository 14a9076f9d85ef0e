use thiserror::Error;

/// Durable-store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// A referenced row does not exist
    #[error("store: {0} not found")]
    NotFound(String),

    /// Backend failure (connection, constraint, serialization)
    #[error("store backend: {0}")]
    Backend(String),
}
