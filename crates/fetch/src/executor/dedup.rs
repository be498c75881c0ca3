//! In-flight request deduplication
//!
//! While a request for a given `(method, url)` is running, every other caller
//! asking for the same identity is handed the same shared future instead of
//! starting a new network operation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use reqwest::Method;

use crate::error::FetchResult;
use crate::executor::client::FetchPayload;

/// A running request whose outcome is delivered to every sharer
pub type SharedFetch = Shared<BoxFuture<'static, FetchResult<FetchPayload>>>;

/// Identity two requests must share to be deduplicated
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestIdentity {
    pub method: Method,
    pub url: String,
}

impl RequestIdentity {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
        }
    }
}

impl std::fmt::Display for RequestIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

struct Entry {
    id: u64,
    fetch: SharedFetch,
}

/// Outcome of [`DedupIndex::get_or_register`]
pub enum Registration {
    /// An identical request was already running
    Joined(SharedFetch),
    /// A new entry was registered under `id`
    Registered { id: u64, fetch: SharedFetch },
}

impl Registration {
    pub fn into_fetch(self) -> SharedFetch {
        match self {
            Self::Joined(fetch) | Self::Registered { fetch, .. } => fetch,
        }
    }

    pub fn is_joined(&self) -> bool {
        matches!(self, Self::Joined(_))
    }
}

/// Map of identity to the request currently running for it
///
/// Entries carry a registration id so that a settling request only removes
/// its own entry, never a newer one registered under the same identity.
#[derive(Default)]
pub struct DedupIndex {
    next_id: AtomicU64,
    entries: Mutex<HashMap<RequestIdentity, Entry>>,
}

impl DedupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Running request for `identity`, if any
    pub fn lookup(&self, identity: &RequestIdentity) -> Option<SharedFetch> {
        self.entries
            .lock()
            .get(identity)
            .map(|entry| entry.fetch.clone())
    }

    /// Register `fetch` for `identity`, replacing any previous entry
    ///
    /// Returns the id to pass to [`remove`](Self::remove) on settle.
    pub fn register(&self, identity: RequestIdentity, fetch: SharedFetch) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().insert(identity, Entry { id, fetch });
        id
    }

    /// Join the running request for `identity`, or register the one built by `start`
    ///
    /// Lookup and registration happen under one lock, so two racing callers
    /// can never both start a request. `start` receives the registration id.
    pub fn get_or_register<F>(&self, identity: RequestIdentity, start: F) -> Registration
    where
        F: FnOnce(u64) -> SharedFetch,
    {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(&identity) {
            return Registration::Joined(entry.fetch.clone());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let fetch = start(id);
        entries.insert(
            identity,
            Entry {
                id,
                fetch: fetch.clone(),
            },
        );
        Registration::Registered { id, fetch }
    }

    /// Drop the entry for `identity` if it is still the one registered as `id`
    pub fn remove(&self, identity: &RequestIdentity, id: u64) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(identity) {
            Some(entry) if entry.id == id => {
                entries.remove(identity);
                true
            }
            _ => false,
        }
    }

    /// Number of requests currently in flight
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use futures::FutureExt;
    use serde_json::json;

    fn ready(value: i64) -> SharedFetch {
        async move { Ok(FetchPayload::Json(json!(value))) }
            .boxed()
            .shared()
    }

    fn identity(url: &str) -> RequestIdentity {
        RequestIdentity::new(Method::GET, url)
    }

    #[test]
    fn test_identity_includes_method() {
        let get = RequestIdentity::new(Method::GET, "/api/x");
        let post = RequestIdentity::new(Method::POST, "/api/x");
        assert_ne!(get, post);
        assert_eq!(get.to_string(), "GET /api/x");
    }

    #[tokio::test]
    async fn test_get_or_register_joins_existing() {
        let index = DedupIndex::new();

        let first = index.get_or_register(identity("/api/x"), |_| ready(1));
        assert!(!first.is_joined());

        let second = index.get_or_register(identity("/api/x"), |_| ready(2));
        assert!(second.is_joined());
        assert_eq!(index.len(), 1);

        let a = first.into_fetch().await.unwrap();
        let b = second.into_fetch().await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_shared_error_is_identical() {
        let index = DedupIndex::new();
        let failing: SharedFetch = async {
            Err(FetchError::Aborted {
                endpoint: "/api/x".into(),
            })
        }
        .boxed()
        .shared();
        index.register(identity("/api/x"), failing);

        let a = index.lookup(&identity("/api/x")).unwrap().await;
        let b = index.lookup(&identity("/api/x")).unwrap().await;
        assert_eq!(a, b);
        assert!(a.unwrap_err().is_aborted());
    }

    #[test]
    fn test_remove_only_matching_id() {
        let index = DedupIndex::new();
        let old = index.register(identity("/api/x"), ready(1));
        let new = index.register(identity("/api/x"), ready(2));

        assert!(!index.remove(&identity("/api/x"), old));
        assert_eq!(index.len(), 1);

        assert!(index.remove(&identity("/api/x"), new));
        assert!(index.is_empty());
        assert!(index.lookup(&identity("/api/x")).is_none());
    }
}
