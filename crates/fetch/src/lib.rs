//! # Request Coordination Core
//!
//! Client-side coordination of network requests and recurring polls.
//!
//! ## Features
//!
//! - **In-flight dedup**: identical concurrent requests share one network operation
//! - **Concurrency gate**: at most `max_concurrent` requests execute, high priority first
//! - **Endpoint backoff**: failing endpoints are delayed exponentially
//! - **Timeouts and cancellation**: per-attempt deadlines composed with caller tokens
//! - **Connection retry**: unreachable hosts are retried with a progressive delay
//! - **Pollers**: recurring callbacks driven by a shared, persisted interval
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Poller  /  ScopedFetcher  /  callers            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ fetch(url, options)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        FetchClient                           │
//! │  DedupIndex → EndpointFailureTracker → ConcurrencyGate       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ guarded(send, timeout, token)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Transport (reqwest)                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use everruns_fetch::prelude::*;
//!
//! let client = FetchClient::new(FetchConfig::from_env())?;
//! let store = Arc::new(IntervalStore::in_memory());
//!
//! let poller = Poller::new(
//!     {
//!         let client = client.clone();
//!         move || {
//!             let client = client.clone();
//!             async move {
//!                 let status = client.fetch("/api/status", FetchOptions::default()).await?;
//!                 println!("{status:?}");
//!                 Ok(())
//!             }
//!         }
//!     },
//!     PollerOptions::new("status").with_interval_store(store.clone()),
//! );
//! poller.start(StartOptions::default())?;
//! ```

pub mod config;
pub mod error;
pub mod executor;
pub mod polling;
pub mod reliability;
pub mod telemetry;
pub mod transport;

pub use config::FetchConfig;
pub use error::{FetchError, FetchErrorKind, FetchResult};
pub use executor::{
    FetchClient, FetchOptions, FetchPayload, GateStats, Priority, ScopeOptions, ScopedFetcher,
};
pub use polling::{IntervalStore, Poller, PollerOptions, StartOptions};
pub use transport::{FetchRequest, FetchResponse, ReqwestTransport, Transport, TransportError};

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::FetchConfig;
    pub use crate::error::{FetchError, FetchErrorKind, FetchResult};
    pub use crate::executor::{
        FetchClient, FetchOptions, FetchPayload, GateStats, Priority, ScopeOptions, ScopedFetcher,
    };
    pub use crate::polling::{
        InMemoryPreferences, IntervalChange, IntervalStore, JsonFilePreferences, Poller,
        PollerError, PollerOptions, PreferenceStore, StartOptions, SubscriptionHandle,
    };
    pub use crate::reliability::BackoffPolicy;
    pub use crate::transport::{FetchRequest, FetchResponse, Transport, TransportError};

    pub use std::sync::Arc;
    pub use std::time::Duration;
    pub use tokio_util::sync::CancellationToken;
}
