#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

//! Sticky-session support for the channel dispatcher
//!
//! A session is identified by a stable fingerprint derived from the
//! request body. Bindings map `(group, model, session)` to a channel
//! for a TTL so consecutive turns of one conversation hit the same
//! upstream; a per-channel index supports capacity checks, listing and
//! bulk release. All state lives in the KV.

mod fingerprint;
mod history;
mod registry;

use thiserror::Error;

pub use fingerprint::extract_session_id;
pub use history::{ChannelSwitch, SwitchHistory};
pub use registry::{BindOutcome, BindPolicy, SessionBinding, SessionDetail, StickyRegistry};

/// Sticky-session errors
#[derive(Debug, Error)]
pub enum SessionError {
    /// KV failure underneath a registry operation
    #[error(transparent)]
    Kv(#[from] meridian_kv::KvError),

    /// A stored binding could not be decoded
    #[error("malformed session record: {0}")]
    Decode(String),
}
