//! Error taxonomy for coordinated fetches
//!
//! Every failure carries enough structure (kind, endpoint, status or timeout)
//! for a caller to decide whether to surface it.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used throughout the crate
pub type FetchResult<T> = Result<T, FetchError>;

/// Error returned by [`FetchClient::fetch`](crate::FetchClient::fetch)
///
/// The type is `Clone` because a single outcome is delivered to every
/// caller sharing a deduplicated request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// Server answered with a non-2xx status
    #[error("HTTP {status} {status_text} from {endpoint}")]
    Http {
        endpoint: String,
        status: u16,
        status_text: String,
    },

    /// Attempt exceeded its deadline
    #[error("request to {endpoint} timed out after {timeout:?}")]
    Timeout { endpoint: String, timeout: Duration },

    /// Cancelled by the caller or by a scope
    #[error("request to {endpoint} was aborted")]
    Aborted { endpoint: String },

    /// Host unreachable after exhausting connection retries
    #[error("connection to {endpoint} failed after {attempts} attempt(s): {message}")]
    Connection {
        endpoint: String,
        attempts: u32,
        message: String,
    },

    /// Any other transport failure
    #[error("transport error for {endpoint}: {message}")]
    Transport { endpoint: String, message: String },

    /// Response declared JSON but the body did not parse
    #[error("failed to decode response from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },
}

/// Coarse classification of a [`FetchError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    Http,
    Timeout,
    Aborted,
    Connection,
    Transport,
    Decode,
}

impl std::fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::Timeout => write!(f, "timeout"),
            Self::Aborted => write!(f, "aborted"),
            Self::Connection => write!(f, "connection"),
            Self::Transport => write!(f, "transport"),
            Self::Decode => write!(f, "decode"),
        }
    }
}

impl FetchError {
    /// Classify this error
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            Self::Http { .. } => FetchErrorKind::Http,
            Self::Timeout { .. } => FetchErrorKind::Timeout,
            Self::Aborted { .. } => FetchErrorKind::Aborted,
            Self::Connection { .. } => FetchErrorKind::Connection,
            Self::Transport { .. } => FetchErrorKind::Transport,
            Self::Decode { .. } => FetchErrorKind::Decode,
        }
    }

    /// Endpoint path the failed request targeted
    pub fn endpoint(&self) -> &str {
        match self {
            Self::Http { endpoint, .. }
            | Self::Timeout { endpoint, .. }
            | Self::Aborted { endpoint }
            | Self::Connection { endpoint, .. }
            | Self::Transport { endpoint, .. }
            | Self::Decode { endpoint, .. } => endpoint,
        }
    }

    /// HTTP status code, for [`FetchError::Http`]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_display() {
        assert_eq!(FetchErrorKind::Http.to_string(), "http");
        assert_eq!(FetchErrorKind::Aborted.to_string(), "aborted");
        assert_eq!(FetchErrorKind::Connection.to_string(), "connection");
    }

    #[test]
    fn test_accessors() {
        let err = FetchError::Http {
            endpoint: "/api/status".into(),
            status: 503,
            status_text: "Service Unavailable".into(),
        };
        assert_eq!(err.kind(), FetchErrorKind::Http);
        assert_eq!(err.endpoint(), "/api/status");
        assert_eq!(err.status(), Some(503));
        assert!(!err.is_aborted());

        let err = FetchError::Timeout {
            endpoint: "/api/slow".into(),
            timeout: Duration::from_millis(50),
        };
        assert!(err.is_timeout());
        assert_eq!(err.status(), None);
    }

    #[test]
    fn test_messages_name_endpoint() {
        let err = FetchError::Timeout {
            endpoint: "/api/slow".into(),
            timeout: Duration::from_secs(10),
        };
        assert_eq!(err.to_string(), "request to /api/slow timed out after 10s");

        let err = FetchError::Connection {
            endpoint: "/api/x".into(),
            attempts: 6,
            message: "refused".into(),
        };
        assert!(err.to_string().contains("after 6 attempt(s)"));
    }

    #[test]
    fn test_kind_serialization() {
        let json = serde_json::to_string(&FetchErrorKind::Timeout).unwrap();
        assert_eq!(json, "\"timeout\"");
    }
}
