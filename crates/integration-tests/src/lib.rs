//! End-to-end tests for the dispatch core
//!
//! All scenarios run against the in-memory KV and store; see the
//! `tests/` directory.
