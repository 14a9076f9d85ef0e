use thiserror::Error;

/// KV store errors
#[derive(Debug, Error)]
pub enum KvError {
    /// Connection or command error from the backend
    #[error("kv backend: {0}")]
    Backend(String),

    /// A period-scoped counter was touched before being initialized
    /// for the current period (the key exists without a TTL, or not
    /// at all)
    #[error("kv key not initialized for the current period: {key}")]
    KeyNotInitialized {
        /// The offending key
        key: String,
    },

    /// A stored value could not be decoded
    #[error("kv decode: {0}")]
    Decode(String),
}
