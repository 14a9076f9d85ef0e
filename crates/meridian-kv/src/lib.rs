#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

//! Key/value store abstraction for the dispatch core
//!
//! All shared request-time state (sticky bindings, quota windows,
//! batch buffers, exclusions) lives behind the [`Kv`] trait. Two
//! implementations ship: [`RedisKv`] for deployments and [`MemoryKv`]
//! for embedded use and tests. Atomicity is provided per operation:
//! single commands, pipelined `MULTI/EXEC` pairs, or Lua scripts,
//! never cross-key transactions.

mod error;
mod memory;
mod redis_kv;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

pub use error::KvError;
pub use memory::MemoryKv;
pub use redis_kv::RedisKv;

/// Remaining lifetime of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// Key does not exist
    Missing,
    /// Key exists without an expiry
    Persistent,
    /// Key expires after the given duration
    Expires(Duration),
}

/// One atomic increment across the three quota windows
///
/// Limits are checked before any counter moves; a limit of 0 means
/// unlimited. TTLs apply only to keys created by this call, so window
/// expiry stays aligned to the period boundary that was computed when
/// the window first opened.
#[derive(Debug, Clone)]
pub struct WindowConsume {
    pub keys: [String; 3],
    pub amount: i64,
    pub limits: [i64; 3],
    pub ttls: [Duration; 3],
}

/// Result of a [`WindowConsume`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowOutcome {
    /// All three counters were incremented
    Applied { totals: [i64; 3] },
    /// Window `index` would exceed its limit; nothing was changed
    Exceeded { index: usize, used: i64, limit: i64 },
}

/// Conceptual KV surface used by the core
///
/// Values are strings; callers layer `serde_json` on top where a
/// record shape is needed.
#[async_trait]
pub trait Kv: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// `SET` with expiry
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError>;

    /// `SET NX` with expiry; returns whether the key was created
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError>;

    async fn del(&self, key: &str) -> Result<(), KvError>;

    async fn exists(&self, key: &str) -> Result<bool, KvError>;

    async fn ttl(&self, key: &str) -> Result<KeyTtl, KvError>;

    /// Reset the expiry of an existing key; returns false when absent
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError>;

    /// Plain `INCRBY`; creates the key when missing
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, KvError>;

    /// `INCRBY` that refuses to touch keys without a live expiry
    ///
    /// Counters in this store are period-scoped; a key with no TTL was
    /// never initialized for the current period. Returns
    /// [`KvError::KeyNotInitialized`] instead of silently creating an
    /// immortal counter.
    async fn incr_by_if_live(&self, key: &str, delta: i64) -> Result<i64, KvError>;

    /// Atomically subtract up to `amount` from a live counter,
    /// flooring at zero. Returns the amount actually taken; 0 when the
    /// key is missing or has no expiry.
    async fn take_up_to(&self, key: &str, amount: i64) -> Result<i64, KvError>;

    // ---- hashes ----

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64, KvError>;

    async fn hlen(&self, key: &str) -> Result<usize, KvError>;

    /// Atomic `HGETALL` + `DEL` in one `MULTI/EXEC` pipeline
    async fn hgetall_and_del(&self, key: &str) -> Result<HashMap<String, String>, KvError>;

    // ---- sorted sets ----

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), KvError>;

    async fn zrem(&self, key: &str, members: &[String]) -> Result<(), KvError>;

    /// Full range with scores, ascending
    async fn zrange_with_scores(&self, key: &str) -> Result<Vec<(String, f64)>, KvError>;

    async fn zcard(&self, key: &str) -> Result<usize, KvError>;

    /// Remove members with score strictly below `max_score`
    async fn zrem_below(&self, key: &str, max_score: f64) -> Result<usize, KvError>;

    // ---- pipelined pairs ----

    /// `SET` a value and `ZADD` its index member in one transaction
    async fn set_with_zadd(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        index_key: &str,
        member: &str,
        score: f64,
    ) -> Result<(), KvError>;

    /// `DEL` a value and `ZREM` its index member in one transaction
    async fn del_with_zrem(&self, key: &str, index_key: &str, member: &str) -> Result<(), KvError>;

    // ---- scripted window counters ----

    /// Check-and-increment across three window counters atomically
    async fn window_consume(&self, op: &WindowConsume) -> Result<WindowOutcome, KvError>;

    /// Floor-at-zero decrement across three window counters,
    /// preserving TTLs and skipping windows that already expired
    async fn window_refund(&self, keys: &[String; 3], amount: i64) -> Result<(), KvError>;
}
