//! Request execution
//!
//! This module provides:
//! - [`FetchClient`] - the fetch pipeline (dedup, backoff, gate, attempt)
//! - [`ConcurrencyGate`] - bounded admission with high/normal priority
//! - [`DedupIndex`] - sharing of identical in-flight requests
//! - [`ScopedFetcher`] - latest-only, lifetime-bound fetching

mod client;
mod dedup;
mod gate;
mod scoped;

pub use client::{FetchClient, FetchOptions, FetchPayload};
pub use dedup::{DedupIndex, Registration, RequestIdentity, SharedFetch};
pub use gate::{Admission, ConcurrencyGate, GatePermit, GateStats, Priority};
pub use scoped::{ScopeOptions, ScopedFetcher};
