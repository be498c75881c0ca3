// Shared test transport
//
// Scripted replies per request, with a call log, in-flight high-water mark and
// detection of attempts dropped before they finished.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use everruns_fetch::{FetchRequest, FetchResponse, Transport, TransportError};
use parking_lot::Mutex;
use serde_json::json;
use tokio::time::Instant;

/// What the transport does for one call
#[derive(Debug, Clone)]
pub enum Reply {
    /// Respond after a delay
    Respond(Duration, FetchResponse),
    /// Fail after a delay
    Fail(Duration, TransportError),
    /// Never settle
    Hang,
}

impl Reply {
    pub fn json_after(ms: u64, value: serde_json::Value) -> Self {
        Self::Respond(Duration::from_millis(ms), FetchResponse::json(&value))
    }

    pub fn ok_after(ms: u64) -> Self {
        Self::json_after(ms, json!({ "ok": true }))
    }

    pub fn status(status: u16) -> Self {
        Self::Respond(Duration::ZERO, FetchResponse::new(status, ""))
    }

    pub fn refused() -> Self {
        Self::Fail(
            Duration::ZERO,
            TransportError::Connect("connection refused".into()),
        )
    }
}

/// One call seen by the transport
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub url: String,
    pub at: Instant,
}

type Script = dyn Fn(&FetchRequest, usize) -> Reply + Send + Sync;

pub struct MockTransport {
    script: Box<Script>,
    calls: Mutex<Vec<CallRecord>>,
    per_url: Mutex<HashMap<String, usize>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    dropped: AtomicUsize,
}

impl MockTransport {
    /// `script` gets the request and how many times its URL was sent before
    pub fn new<F>(script: F) -> Arc<Self>
    where
        F: Fn(&FetchRequest, usize) -> Reply + Send + Sync + 'static,
    {
        Arc::new(Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
            per_url: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
        })
    }

    /// Same reply for every call
    pub fn always(reply: Reply) -> Arc<Self> {
        Self::new(move |_, _| reply.clone())
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn urls(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.url.clone()).collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Attempts abandoned by the caller before they settled
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }
}

struct InFlight<'a> {
    transport: &'a MockTransport,
    finished: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.transport.in_flight.fetch_sub(1, Ordering::SeqCst);
        if !self.finished {
            self.transport.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: FetchRequest) -> Result<FetchResponse, TransportError> {
        let previous = {
            let mut per_url = self.per_url.lock();
            let count = per_url.entry(request.url.clone()).or_insert(0);
            let previous = *count;
            *count += 1;
            previous
        };
        self.calls.lock().push(CallRecord {
            url: request.url.clone(),
            at: Instant::now(),
        });

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let mut guard = InFlight {
            transport: self,
            finished: false,
        };

        let reply = (self.script)(&request, previous);
        let result = match reply {
            Reply::Respond(delay, response) => {
                tokio::time::sleep(delay).await;
                Ok(response)
            }
            Reply::Fail(delay, error) => {
                tokio::time::sleep(delay).await;
                Err(error)
            }
            Reply::Hang => std::future::pending().await,
        };

        guard.finished = true;
        result
    }
}
