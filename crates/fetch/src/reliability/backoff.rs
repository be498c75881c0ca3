//! Per-endpoint failure tracking and backoff
//!
//! Consecutive failures are counted per endpoint path. The wait imposed
//! before the next call to that endpoint is a pure function of the count:
//! `0` with no failures, otherwise `min(initial * 2^(k-1), max)`.

use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use url::Url;

/// Backoff curve for failing endpoints
///
/// # Example
///
/// ```
/// use everruns_fetch::reliability::BackoffPolicy;
/// use std::time::Duration;
///
/// let policy = BackoffPolicy::default();
///
/// assert_eq!(policy.delay_for_failures(0), Duration::ZERO);
/// assert_eq!(policy.delay_for_failures(1), Duration::from_secs(1));
/// assert_eq!(policy.delay_for_failures(3), Duration::from_secs(4));
/// assert_eq!(policy.delay_for_failures(10), Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay after the first failure
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,

    /// Upper bound for the delay
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Create a policy with the default 1s initial / 30s max curve
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the delay after the first failure
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the delay ceiling
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay for an endpoint with `failures` consecutive failures
    pub fn delay_for_failures(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        let initial = self.initial_delay.as_millis() as u64;
        let max = self.max_delay.as_millis() as u64;
        let factor = 1u64.checked_shl(failures - 1).unwrap_or(u64::MAX);

        Duration::from_millis(initial.saturating_mul(factor).min(max))
    }
}

/// Consecutive-failure counters keyed by endpoint path
///
/// Shared by every request the client issues; safe to use from any thread.
#[derive(Debug, Default)]
pub struct EndpointFailureTracker {
    policy: BackoffPolicy,
    failures: DashMap<String, u32>,
}

impl EndpointFailureTracker {
    /// Create a tracker using `policy` for delays
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            failures: DashMap::new(),
        }
    }

    /// Record a failed attempt, returning the new consecutive count
    pub fn record_failure(&self, endpoint: &str) -> u32 {
        let mut count = self.failures.entry(endpoint.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    /// Reset the endpoint after a successful response
    pub fn record_success(&self, endpoint: &str) {
        self.failures.remove(endpoint);
    }

    /// Current consecutive failure count
    pub fn failure_count(&self, endpoint: &str) -> u32 {
        self.failures.get(endpoint).map(|c| *c).unwrap_or(0)
    }

    /// Wait to impose before the next call to `endpoint`
    pub fn delay_for(&self, endpoint: &str) -> Duration {
        self.policy.delay_for_failures(self.failure_count(endpoint))
    }

    /// Forget every endpoint
    pub fn reset(&self) {
        self.failures.clear();
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }
}

/// Path component of a request URL, used as the backoff key
///
/// Absolute URLs keep only their path; relative URLs are resolved against
/// a placeholder origin so query strings and fragments are dropped either way.
pub fn endpoint_path(url: &str) -> String {
    if let Ok(parsed) = Url::parse(url) {
        return parsed.path().to_string();
    }

    Url::parse("http://localhost/")
        .and_then(|base| base.join(url))
        .map(|joined| joined.path().to_string())
        .unwrap_or_else(|_| {
            let end = url.find(['?', '#']).unwrap_or(url.len());
            url[..end].to_string()
        })
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
