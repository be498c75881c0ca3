//! Fetchers bound to a caller's lifetime
//!
//! A [`ScopedFetcher`] issues every call with a child of its lifetime token,
//! so cancelling the lifetime aborts everything the scope started. With
//! `latest_only`, starting a call cancels any call from the same scope that
//! is still pending.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::FetchResult;
use crate::executor::client::{FetchClient, FetchOptions, FetchPayload};

/// Behaviour of a [`ScopedFetcher`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeOptions {
    /// Cancel the previous pending call when a new one starts
    pub latest_only: bool,
}

impl ScopeOptions {
    pub fn latest_only() -> Self {
        Self { latest_only: true }
    }
}

struct ScopeState {
    client: FetchClient,
    lifetime: CancellationToken,
    options: ScopeOptions,
    next_call: AtomicU64,
    pending: Mutex<BTreeMap<u64, CancellationToken>>,
}

/// Removes a call from the pending set however it ends
struct PendingCall<'a> {
    state: &'a ScopeState,
    id: u64,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        self.state.pending.lock().remove(&self.id);
    }
}

/// Per-caller fetch wrapper
///
/// Calls always bypass dedup, so a superseded call is never joined by its
/// replacement. Any cancellation token in the passed options is replaced by
/// the scope's own.
///
/// # Example
///
/// ```ignore
/// let view_lifetime = CancellationToken::new();
/// let search = client.scoped(view_lifetime.clone(), ScopeOptions::latest_only());
///
/// // Typing fast: only the last query's result is delivered.
/// let first = search.fetch("/api/search?q=ab", FetchOptions::default());
/// let second = search.fetch("/api/search?q=abc", FetchOptions::default());
/// let (first, second) = tokio::join!(first, second);
/// assert!(first.unwrap_err().is_aborted());
///
/// // Leaving the view aborts anything still running.
/// view_lifetime.cancel();
/// ```
#[derive(Clone)]
pub struct ScopedFetcher {
    state: Arc<ScopeState>,
}

impl ScopedFetcher {
    pub(crate) fn new(
        client: FetchClient,
        lifetime: CancellationToken,
        options: ScopeOptions,
    ) -> Self {
        Self {
            state: Arc::new(ScopeState {
                client,
                lifetime,
                options,
                next_call: AtomicU64::new(0),
                pending: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// Fetch `url` within this scope
    pub async fn fetch(&self, url: &str, options: FetchOptions) -> FetchResult<FetchPayload> {
        let state = &*self.state;
        let token = state.lifetime.child_token();
        let id = state.next_call.fetch_add(1, Ordering::Relaxed);

        {
            let mut pending = state.pending.lock();
            if state.options.latest_only {
                for (superseded, previous) in std::mem::take(&mut *pending) {
                    debug!(url, call = superseded, "Cancelling superseded call");
                    previous.cancel();
                }
            }
            pending.insert(id, token.clone());
        }
        let _pending = PendingCall { state, id };

        let options = options.skip_dedup(true).with_cancellation(token);
        state.client.fetch(url, options).await
    }

    /// Cancel every call this scope still has running
    pub fn cancel_pending(&self) {
        for (_, token) in std::mem::take(&mut *self.state.pending.lock()) {
            token.cancel();
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.state.pending.lock().is_empty()
    }

    pub fn options(&self) -> ScopeOptions {
        self.state.options
    }

    /// True once the scope's lifetime token has been cancelled
    pub fn is_closed(&self) -> bool {
        self.state.lifetime.is_cancelled()
    }
}

impl std::fmt::Debug for ScopedFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedFetcher")
            .field("options", &self.state.options)
            .field("pending", &self.state.pending.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FetchConfig;
    use crate::transport::{FetchRequest, FetchResponse, Transport, TransportError};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    /// Answers after a fixed delay
    struct SlowTransport(Duration);

    #[async_trait]
    impl Transport for SlowTransport {
        async fn send(&self, request: FetchRequest) -> Result<FetchResponse, TransportError> {
            tokio::time::sleep(self.0).await;
            Ok(FetchResponse::json(&json!({ "url": request.url })))
        }
    }

    fn scoped(options: ScopeOptions) -> (ScopedFetcher, CancellationToken) {
        let client = FetchClient::with_transport(
            FetchConfig::default(),
            Arc::new(SlowTransport(Duration::from_millis(100))),
        );
        let lifetime = CancellationToken::new();
        (client.scoped(lifetime.clone(), options), lifetime)
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_only_aborts_previous() {
        let (fetcher, _lifetime) = scoped(ScopeOptions::latest_only());

        let first = fetcher.fetch("/api/search?q=a", FetchOptions::default());
        let second = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            fetcher.fetch("/api/search?q=ab", FetchOptions::default()).await
        };
        let (first, second) = tokio::join!(first, second);

        assert!(first.unwrap_err().is_aborted());
        assert_eq!(
            second.unwrap().into_json(),
            Some(json!({ "url": "/api/search?q=ab" }))
        );
        assert!(!fetcher.has_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_latest_only_both_complete() {
        let (fetcher, _lifetime) = scoped(ScopeOptions::default());

        let (a, b) = tokio::join!(
            fetcher.fetch("/api/a", FetchOptions::default()),
            fetcher.fetch("/api/b", FetchOptions::default()),
        );
        assert!(a.is_ok());
        assert!(b.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifetime_cancel_aborts_pending() {
        let (fetcher, lifetime) = scoped(ScopeOptions::default());

        let call = fetcher.fetch("/api/a", FetchOptions::default());
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            lifetime.cancel();
        };
        let (result, ()) = tokio::join!(call, cancel);

        assert!(result.unwrap_err().is_aborted());
        assert!(fetcher.is_closed());

        // Calls after the lifetime ends abort immediately
        let late = fetcher.fetch("/api/a", FetchOptions::default()).await;
        assert!(late.unwrap_err().is_aborted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_pending() {
        let (fetcher, _lifetime) = scoped(ScopeOptions::default());

        let call = fetcher.fetch("/api/a", FetchOptions::default());
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(fetcher.has_pending());
            fetcher.cancel_pending();
        };
        let (result, ()) = tokio::join!(call, cancel);

        assert!(result.unwrap_err().is_aborted());
        assert!(!fetcher.has_pending());
    }
}
