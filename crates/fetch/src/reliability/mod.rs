//! Reliability patterns for coordinated fetches
//!
//! This module provides:
//! - [`BackoffPolicy`] / [`EndpointFailureTracker`] - per-endpoint exponential backoff
//! - [`guarded`] - deadline plus cancellation-token racing for a single attempt

mod backoff;
mod timeout;

pub(crate) use backoff::duration_millis;
pub use backoff::{endpoint_path, BackoffPolicy, EndpointFailureTracker};
pub use timeout::{cancellable_sleep, guarded, Interrupted};
