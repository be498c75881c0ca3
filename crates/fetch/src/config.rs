// Fetch client configuration
//
// Defaults match the coordination core's documented behaviour; every field
// can be overridden from the environment or through `with_*` builders.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::reliability::{duration_millis, BackoffPolicy};

/// Default cap on simultaneously executing requests
pub const DEFAULT_MAX_CONCURRENT: usize = 4;

/// Default per-attempt deadline
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Default number of connection retries after the first attempt
pub const DEFAULT_MAX_CONNECTION_RETRIES: u32 = 5;

/// Default connection retry step (wait = step * (attempt + 1))
pub const DEFAULT_CONNECTION_RETRY_DELAY: Duration = Duration::from_millis(1_000);

/// Configuration for a [`FetchClient`](crate::FetchClient)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Maximum simultaneously executing requests (at least 1)
    pub max_concurrent: usize,

    /// Deadline applied to each attempt when the caller sets none
    #[serde(with = "duration_millis")]
    pub default_timeout: Duration,

    /// Connection retries allowed after the initial attempt
    pub max_connection_retries: u32,

    /// Progressive connection retry step
    #[serde(with = "duration_millis")]
    pub connection_retry_delay: Duration,

    /// Per-endpoint backoff curve
    pub backoff: BackoffPolicy,

    /// Base URL relative request URLs are resolved against
    pub base_url: Option<String>,

    /// User agent sent by the reqwest transport
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            default_timeout: DEFAULT_TIMEOUT,
            max_connection_retries: DEFAULT_MAX_CONNECTION_RETRIES,
            connection_retry_delay: DEFAULT_CONNECTION_RETRY_DELAY,
            backoff: BackoffPolicy::default(),
            base_url: None,
            user_agent: default_user_agent(),
        }
    }
}

fn default_user_agent() -> String {
    format!("everruns-fetch/{}", env!("CARGO_PKG_VERSION"))
}

impl FetchConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `FETCH_MAX_CONCURRENT`: concurrency cap (default: 4)
    /// - `FETCH_TIMEOUT_MS`: per-attempt deadline (default: 10000)
    /// - `FETCH_MAX_CONNECTION_RETRIES`: connection retries (default: 5)
    /// - `FETCH_CONNECTION_RETRY_DELAY_MS`: retry step (default: 1000)
    /// - `FETCH_BACKOFF_INITIAL_MS`: first backoff delay (default: 1000)
    /// - `FETCH_BACKOFF_MAX_MS`: backoff ceiling (default: 30000)
    /// - `FETCH_BASE_URL`: base for relative URLs (default: none)
    /// - `FETCH_USER_AGENT`: user agent (default: everruns-fetch/<version>)
    ///
    /// Unparsable values fall back to the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parse_u64 = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let millis = |key: &str, default: Duration| {
            parse_u64(key)
                .map(Duration::from_millis)
                .unwrap_or(default)
        };

        let max_concurrent = lookup("FETCH_MAX_CONCURRENT")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(defaults.max_concurrent)
            .max(1);

        let max_connection_retries = lookup("FETCH_MAX_CONNECTION_RETRIES")
            .and_then(|v| v.trim().parse::<u32>().ok())
            .unwrap_or(defaults.max_connection_retries);

        let backoff = BackoffPolicy::new()
            .with_initial_delay(millis(
                "FETCH_BACKOFF_INITIAL_MS",
                defaults.backoff.initial_delay,
            ))
            .with_max_delay(millis("FETCH_BACKOFF_MAX_MS", defaults.backoff.max_delay));

        let base_url = lookup("FETCH_BASE_URL").filter(|v| !v.trim().is_empty());
        let user_agent = lookup("FETCH_USER_AGENT")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.user_agent);

        Self {
            max_concurrent,
            default_timeout: millis("FETCH_TIMEOUT_MS", defaults.default_timeout),
            max_connection_retries,
            connection_retry_delay: millis(
                "FETCH_CONNECTION_RETRY_DELAY_MS",
                defaults.connection_retry_delay,
            ),
            backoff,
            base_url,
            user_agent,
        }
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_max_connection_retries(mut self, retries: u32) -> Self {
        self.max_connection_retries = retries;
        self
    }

    pub fn with_connection_retry_delay(mut self, delay: Duration) -> Self {
        self.connection_retry_delay = delay;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Wait before connection retry number `attempt` (0-based)
    pub fn connection_retry_wait(&self, attempt: u32) -> Duration {
        self.connection_retry_delay
            .saturating_mul(attempt.saturating_add(1))
    }
}
