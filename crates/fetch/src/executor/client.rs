//! Fetch executor
//!
//! [`FetchClient`] is the single entry point for network requests. Each call
//! goes through, in order:
//!
//! 1. dedup: join an identical in-flight request if one exists
//! 2. backoff: wait out the endpoint's failure delay
//! 3. gate: take a concurrency slot under the request's priority; the queue
//!    position is taken when the call is made, or once the backoff has passed
//! 4. attempt: race the transport against the deadline and the caller's
//!    cancellation token, retrying connection failures progressively
//!
//! and settles into a [`FetchPayload`] or a [`FetchError`].

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use reqwest::Method;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::FetchConfig;
use crate::error::{FetchError, FetchResult};
use crate::executor::dedup::{DedupIndex, RequestIdentity, SharedFetch};
use crate::executor::gate::{Admission, ConcurrencyGate, GatePermit, GateStats, Priority};
use crate::executor::scoped::{ScopeOptions, ScopedFetcher};
use crate::reliability::{
    cancellable_sleep, endpoint_path, guarded, EndpointFailureTracker, Interrupted,
};
use crate::transport::{FetchRequest, FetchResponse, ReqwestTransport, Transport, TransportError};

/// Result of a successful fetch
#[derive(Debug, Clone, PartialEq)]
pub enum FetchPayload {
    /// Parsed body of a response declaring a JSON content type
    Json(serde_json::Value),
    /// Any other response
    Raw(FetchResponse),
}

impl FetchPayload {
    pub fn is_json(&self) -> bool {
        matches!(self, Self::Json(_))
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Raw(_) => None,
        }
    }

    pub fn into_json(self) -> Option<serde_json::Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Raw(_) => None,
        }
    }

    pub fn as_raw(&self) -> Option<&FetchResponse> {
        match self {
            Self::Raw(response) => Some(response),
            Self::Json(_) => None,
        }
    }
}

/// Per-call options
///
/// # Example
///
/// ```
/// use everruns_fetch::{FetchOptions, Priority};
/// use std::time::Duration;
///
/// let options = FetchOptions::new()
///     .with_priority(Priority::High)
///     .with_timeout(Duration::from_secs(2))
///     .skip_dedup(true);
///
/// assert_eq!(options.priority, Priority::High);
/// assert!(options.retry_on_connection_error);
/// ```
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
    /// Per-attempt deadline; the client default when unset
    pub timeout: Option<Duration>,
    pub priority: Priority,
    /// Always start a new network operation
    pub skip_dedup: bool,
    /// Bypass the concurrency gate
    pub skip_queue: bool,
    pub retry_on_connection_error: bool,
    /// Caller-owned token; cancelling it settles the call as aborted
    pub cancellation: Option<CancellationToken>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            method: Method::GET,
            headers: Vec::new(),
            body: None,
            timeout: None,
            priority: Priority::Normal,
            skip_dedup: false,
            skip_queue: false,
            retry_on_connection_error: true,
            cancellation: None,
        }
    }
}

impl FetchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// JSON body plus content type header
    pub fn with_json(mut self, value: &serde_json::Value) -> Self {
        self.headers
            .push(("content-type".to_string(), "application/json".to_string()));
        self.body = Some(Bytes::from(value.to_string()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn skip_dedup(mut self, skip: bool) -> Self {
        self.skip_dedup = skip;
        self
    }

    pub fn skip_queue(mut self, skip: bool) -> Self {
        self.skip_queue = skip;
        self
    }

    pub fn retry_on_connection_error(mut self, retry: bool) -> Self {
        self.retry_on_connection_error = retry;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// Everything the pipeline needs once options are resolved
struct Call {
    request: FetchRequest,
    endpoint: String,
    timeout: Duration,
    priority: Priority,
    skip_queue: bool,
    retry_on_connection_error: bool,
    cancellation: Option<CancellationToken>,
}

impl Call {
    fn aborted(&self) -> FetchError {
        FetchError::Aborted {
            endpoint: self.endpoint.clone(),
        }
    }
}

struct ClientInner {
    config: FetchConfig,
    transport: Arc<dyn Transport>,
    dedup: DedupIndex,
    gate: Arc<ConcurrencyGate>,
    failures: EndpointFailureTracker,
}

/// Coordinating HTTP client
///
/// Cheap to clone; clones share the dedup index, gate and failure tracker.
///
/// # Example
///
/// ```ignore
/// let client = FetchClient::new(FetchConfig::from_env())?;
///
/// let status = client.fetch("/api/status", FetchOptions::default()).await?;
/// let jobs: Vec<Job> = client
///     .fetch_json("/api/jobs", FetchOptions::new().with_priority(Priority::High))
///     .await?;
/// ```
#[derive(Clone)]
pub struct FetchClient {
    inner: Arc<ClientInner>,
}

impl FetchClient {
    /// Client backed by [`ReqwestTransport`]
    pub fn new(config: FetchConfig) -> Result<Self, FetchError> {
        let transport = ReqwestTransport::new(&config.user_agent, config.base_url.as_deref())
            .map_err(|e| FetchError::Transport {
                endpoint: config.base_url.clone().unwrap_or_default(),
                message: e.to_string(),
            })?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    /// Client backed by an arbitrary transport
    pub fn with_transport(config: FetchConfig, transport: Arc<dyn Transport>) -> Self {
        let gate = ConcurrencyGate::new(config.max_concurrent);
        let failures = EndpointFailureTracker::new(config.backoff.clone());
        Self {
            inner: Arc::new(ClientInner {
                config,
                transport,
                dedup: DedupIndex::new(),
                gate,
                failures,
            }),
        }
    }

    pub fn config(&self) -> &FetchConfig {
        &self.inner.config
    }

    /// Fetch `url`
    ///
    /// Resolves to parsed JSON when the response declares a JSON content
    /// type, otherwise to the raw response.
    #[instrument(
        skip(self, options),
        fields(method = %options.method, priority = %options.priority)
    )]
    pub async fn fetch(&self, url: &str, options: FetchOptions) -> FetchResult<FetchPayload> {
        let identity = RequestIdentity::new(options.method.clone(), url);
        let skip_dedup = options.skip_dedup;
        let call = self.inner.resolve(url, options);

        if skip_dedup {
            let slot = self.inner.reserve(&call);
            return Arc::clone(&self.inner).execute(call, slot).await;
        }

        let inner = Arc::clone(&self.inner);
        let registration = self.inner.dedup.get_or_register(identity.clone(), |id| {
            let slot = inner.reserve(&call);
            spawn_shared(inner, call, slot, identity, id)
        });
        if registration.is_joined() {
            debug!(url, "Joining in-flight request");
        }

        registration.into_fetch().await
    }

    /// Fetch `url` and deserialize the JSON body into `T`
    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        url: &str,
        options: FetchOptions,
    ) -> FetchResult<T> {
        let payload = self.fetch(url, options).await?;
        let decoded = match payload {
            FetchPayload::Json(value) => serde_json::from_value(value),
            FetchPayload::Raw(response) => response.parse_json(),
        };
        decoded.map_err(|e| FetchError::Decode {
            endpoint: endpoint_path(url),
            message: e.to_string(),
        })
    }

    /// Fetcher whose calls are cancelled along with `lifetime`
    pub fn scoped(&self, lifetime: CancellationToken, options: ScopeOptions) -> ScopedFetcher {
        ScopedFetcher::new(self.clone(), lifetime, options)
    }

    pub fn gate_stats(&self) -> GateStats {
        self.inner.gate.stats()
    }

    /// Number of deduplicated requests currently running
    pub fn in_flight(&self) -> usize {
        self.inner.dedup.len()
    }

    /// Consecutive failures recorded for `endpoint` (a URL or path)
    pub fn failure_count(&self, endpoint: &str) -> u32 {
        self.inner.failures.failure_count(&endpoint_path(endpoint))
    }

    /// Backoff the next call to `endpoint` would wait
    pub fn backoff_delay(&self, endpoint: &str) -> Duration {
        self.inner.failures.delay_for(&endpoint_path(endpoint))
    }

    /// Forget all endpoint failures
    pub fn reset_failures(&self) {
        self.inner.failures.reset();
    }
}

impl std::fmt::Debug for FetchClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchClient")
            .field("config", &self.inner.config)
            .field("gate", &self.inner.gate.stats())
            .field("in_flight", &self.inner.dedup.len())
            .finish()
    }
}

/// Run the pipeline on its own task so the shared entry settles even when
/// every caller has gone away
fn spawn_shared(
    inner: Arc<ClientInner>,
    call: Call,
    slot: Slot,
    identity: RequestIdentity,
    id: u64,
) -> SharedFetch {
    let endpoint = call.endpoint.clone();
    let handle = tokio::spawn(async move {
        let result = Arc::clone(&inner).execute(call, slot).await;
        inner.dedup.remove(&identity, id);
        result
    });

    handle
        .map(move |joined| match joined {
            Ok(result) => result,
            Err(e) => Err(FetchError::Transport {
                endpoint,
                message: format!("request task failed: {e}"),
            }),
        })
        .boxed()
        .shared()
}

/// Gate position of a call, decided when the call is made
enum Slot {
    /// `skip_queue`: never touches the gate
    Bypass,
    /// Queued (or admitted) in call order
    Reserved(Admission),
    /// Endpoint is backing off; queue once the delay has passed
    AfterBackoff(Duration),
}

impl ClientInner {
    fn resolve(&self, url: &str, options: FetchOptions) -> Call {
        let request = FetchRequest {
            method: options.method,
            url: url.to_string(),
            headers: options.headers,
            body: options.body,
        };
        Call {
            request,
            endpoint: endpoint_path(url),
            timeout: options.timeout.unwrap_or(self.config.default_timeout),
            priority: options.priority,
            skip_queue: options.skip_queue,
            retry_on_connection_error: options.retry_on_connection_error,
            cancellation: options.cancellation,
        }
    }

    /// Take the call's place in the gate queue now, unless the endpoint is
    /// backing off
    fn reserve(&self, call: &Call) -> Slot {
        let delay = self.failures.delay_for(&call.endpoint);
        if !delay.is_zero() {
            Slot::AfterBackoff(delay)
        } else if call.skip_queue {
            Slot::Bypass
        } else {
            Slot::Reserved(self.gate.admit(call.priority))
        }
    }

    async fn execute(self: Arc<Self>, call: Call, slot: Slot) -> FetchResult<FetchPayload> {
        let admission = match slot {
            Slot::Bypass => None,
            Slot::Reserved(admission) => Some(admission),
            Slot::AfterBackoff(delay) => {
                warn!(
                    endpoint = %call.endpoint,
                    delay_ms = delay.as_millis() as u64,
                    consecutive_failures = self.failures.failure_count(&call.endpoint),
                    "Backing off before request"
                );
                cancellable_sleep(delay, call.cancellation.as_ref())
                    .await
                    .map_err(|_| call.aborted())?;
                (!call.skip_queue).then(|| self.gate.admit(call.priority))
            }
        };

        let _permit = match admission {
            Some(admission) => Some(self.wait_for_slot(&call, admission).await?),
            None => None,
        };

        self.attempt(&call).await
    }

    async fn wait_for_slot(&self, call: &Call, admission: Admission) -> FetchResult<GatePermit> {
        match &call.cancellation {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => Err(call.aborted()),
                permit = admission => Ok(permit),
            },
            None => Ok(admission.await),
        }
    }

    async fn attempt(&self, call: &Call) -> FetchResult<FetchPayload> {
        let cancel = call.cancellation.as_ref();
        let endpoint = call.endpoint.as_str();
        let mut attempt: u32 = 0;

        loop {
            let outcome = guarded(
                self.transport.send(call.request.clone()),
                Some(call.timeout),
                cancel,
            )
            .await;

            let err = match outcome {
                Ok(Ok(response)) => return self.settle(endpoint, response),
                Err(Interrupted::Cancelled) => {
                    debug!(endpoint, "Request aborted by caller");
                    return Err(call.aborted());
                }
                Err(Interrupted::TimedOut) => {
                    self.failures.record_failure(endpoint);
                    warn!(
                        endpoint,
                        timeout_ms = call.timeout.as_millis() as u64,
                        "Request timed out"
                    );
                    return Err(FetchError::Timeout {
                        endpoint: endpoint.to_string(),
                        timeout: call.timeout,
                    });
                }
                Ok(Err(err)) => err,
            };

            match err {
                TransportError::Connect(message) => {
                    if call.retry_on_connection_error
                        && attempt < self.config.max_connection_retries
                    {
                        let wait = self.config.connection_retry_wait(attempt);
                        warn!(
                            endpoint,
                            attempt = attempt + 1,
                            delay_ms = wait.as_millis() as u64,
                            error = %message,
                            "Connection failed, retrying"
                        );
                        cancellable_sleep(wait, cancel)
                            .await
                            .map_err(|_| call.aborted())?;
                        attempt += 1;
                        continue;
                    }

                    self.failures.record_failure(endpoint);
                    return Err(FetchError::Connection {
                        endpoint: endpoint.to_string(),
                        attempts: attempt + 1,
                        message,
                    });
                }
                TransportError::Other(message) => {
                    self.failures.record_failure(endpoint);
                    return Err(FetchError::Transport {
                        endpoint: endpoint.to_string(),
                        message,
                    });
                }
            }
        }
    }

    fn settle(&self, endpoint: &str, response: FetchResponse) -> FetchResult<FetchPayload> {
        if !response.is_success() {
            let failures = self.failures.record_failure(endpoint);
            debug!(
                endpoint,
                status = response.status,
                consecutive_failures = failures,
                "Request failed with HTTP status"
            );
            return Err(FetchError::Http {
                endpoint: endpoint.to_string(),
                status: response.status,
                status_text: response.status_text,
            });
        }

        self.failures.record_success(endpoint);

        if response.is_json() {
            response
                .parse_json()
                .map(FetchPayload::Json)
                .map_err(|e| FetchError::Decode {
                    endpoint: endpoint.to_string(),
                    message: e.to_string(),
                })
        } else {
            Ok(FetchPayload::Raw(response))
        }
    }
}
