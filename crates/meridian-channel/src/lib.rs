#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

//! Channel model, cache, and selection
//!
//! A channel is one upstream provider endpoint. The cache keeps an
//! immutable snapshot of enabled channels indexed by `(group, model)`;
//! the selector composes the cache with the sticky-session registry
//! to pick a channel per request: priority tiers, weighted draws,
//! capacity awareness, and session affinity.

mod cache;
mod channel;
mod error;
mod normalize;
mod select;

pub use cache::ChannelCache;
pub use channel::{Channel, ChannelSettings, ChannelStatus};
pub use error::ChannelError;
pub use normalize::normalize_model_name;
pub use select::{PickRequest, Selection, Selector};
