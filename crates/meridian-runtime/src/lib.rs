#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

//! Runtime assembly for the dispatch core
//!
//! One [`Runtime`] value wires configuration, the durable store, and
//! the KV into the channel cache, selector, sticky registry, ledger,
//! drain, and guards; no global singletons. The relay layer drives
//! it through three entry points per request: [`Runtime::dispatch`],
//! then either [`Runtime::settle`] or [`Runtime::upstream_failed`].

mod error;
mod runtime;

pub use error::RuntimeError;
pub use runtime::{Dispatch, DispatchRequest, FailureDisposition, Runtime};
