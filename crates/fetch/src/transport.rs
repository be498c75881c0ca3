//! Network transport abstraction
//!
//! The executor only needs "send this request, give me a response or tell me
//! whether the host was unreachable". [`ReqwestTransport`] is the production
//! implementation; tests script their own.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::trace;
use url::Url;

/// A single outgoing request
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

impl FetchRequest {
    /// A GET request for `url`
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// Attach a JSON body and content type
    pub fn with_json(mut self, value: &serde_json::Value) -> Self {
        self.headers.push((
            CONTENT_TYPE.as_str().to_string(),
            "application/json".to_string(),
        ));
        self.body = Some(Bytes::from(value.to_string()));
        self
    }
}

/// A fully buffered response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: u16,
    pub status_text: String,
    /// Header names are lower-cased
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl FetchResponse {
    /// Build a response from parts
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            status_text: canonical_reason(status).to_string(),
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    /// Convenience for a 200 JSON response
    pub fn json(value: &serde_json::Value) -> Self {
        Self::new(200, value.to_string()).with_header("content-type", "application/json")
    }

    /// Add a header (name is lower-cased)
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// True for 2xx statuses
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type").map(String::as_str)
    }

    /// True when the content type declares a JSON body (`application/json`, `*+json`)
    pub fn is_json(&self) -> bool {
        self.content_type()
            .map(|ct| {
                let mime = ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
                mime == "application/json" || mime.ends_with("+json")
            })
            .unwrap_or(false)
    }

    /// Deserialize the body as JSON
    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Body as (lossy) UTF-8 text
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

fn canonical_reason(status: u16) -> &'static str {
    reqwest::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("")
}

/// Transport-level failure
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Host unreachable / connection refused / DNS failure
    #[error("connection failed: {0}")]
    Connect(String),

    /// Anything else (invalid request, body read failure, ...)
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    pub fn is_connect(&self) -> bool {
        matches!(self, Self::Connect(_))
    }
}

/// Performs the actual network operation
///
/// Implementations must be cancel-safe: the executor drops the returned
/// future when an attempt times out or is cancelled.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: FetchRequest) -> Result<FetchResponse, TransportError>;
}

/// [`Transport`] backed by `reqwest`
///
/// Relative URLs are joined onto the configured base URL.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http: reqwest::Client,
    base_url: Option<Url>,
}

impl ReqwestTransport {
    /// Build a transport with the given user agent and optional base URL
    pub fn new(user_agent: &str, base_url: Option<&str>) -> Result<Self, TransportError> {
        let base_url = base_url
            .map(Url::parse)
            .transpose()
            .map_err(|e| TransportError::Other(format!("invalid base URL: {e}")))?;

        let http = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| TransportError::Other(e.to_string()))?;

        Ok(Self { http, base_url })
    }

    /// Wrap an existing client
    pub fn from_client(http: reqwest::Client, base_url: Option<Url>) -> Self {
        Self { http, base_url }
    }

    fn resolve(&self, url: &str) -> Result<Url, TransportError> {
        match Url::parse(url) {
            Ok(absolute) => Ok(absolute),
            Err(url::ParseError::RelativeUrlWithoutBase) => match &self.base_url {
                Some(base) => base
                    .join(url)
                    .map_err(|e| TransportError::Other(format!("invalid URL {url}: {e}"))),
                None => Err(TransportError::Other(format!(
                    "relative URL {url} requires a base URL"
                ))),
            },
            Err(e) => Err(TransportError::Other(format!("invalid URL {url}: {e}"))),
        }
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: FetchRequest) -> Result<FetchResponse, TransportError> {
        let url = self.resolve(&request.url)?;
        trace!(method = %request.method, %url, "Sending request");

        let mut builder = self.http.request(request.method, url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(classify)?;

        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect::<HashMap<_, _>>();
        let body = response.bytes().await.map_err(classify)?;

        Ok(FetchResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or("").to_string(),
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_response_json_detection() {
        let resp = FetchResponse::json(&json!({"ok": true}));
        assert!(resp.is_success());
        assert!(resp.is_json());
        assert_eq!(resp.status_text, "OK");

        let resp = FetchResponse::new(200, "hi").with_header("Content-Type", "text/plain");
        assert!(!resp.is_json());
        assert_eq!(resp.content_type(), Some("text/plain"));
        assert_eq!(resp.text(), "hi");

        let resp = FetchResponse::new(200, "{}")
            .with_header("content-type", "application/problem+json; charset=utf-8");
        assert!(resp.is_json());
    }

    #[test]
    fn test_response_status() {
        let resp = FetchResponse::new(503, "");
        assert!(!resp.is_success());
        assert_eq!(resp.status_text, "Service Unavailable");

        assert_eq!(FetchResponse::new(799, "").status_text, "");
    }

    #[test]
    fn test_parse_json() {
        let resp = FetchResponse::json(&json!({"count": 3}));
        let value: serde_json::Value = resp.parse_json().unwrap();
        assert_eq!(value["count"], 3);
    }

    #[test]
    fn test_request_builders() {
        let req = FetchRequest::get("/api/x").with_json(&json!({"a": 1}));
        assert_eq!(req.method, Method::GET);
        assert_eq!(req.headers[0].0, "content-type");
        assert_eq!(req.body.as_deref(), Some(&b"{\"a\":1}"[..]));
    }

    #[test]
    fn test_resolve_relative_requires_base() {
        let transport = ReqwestTransport::new("test", None).unwrap();
        assert!(matches!(
            transport.resolve("/api/x"),
            Err(TransportError::Other(_))
        ));

        let transport = ReqwestTransport::new("test", Some("http://localhost:9000/")).unwrap();
        assert_eq!(
            transport.resolve("/api/x?y=1").unwrap().as_str(),
            "http://localhost:9000/api/x?y=1"
        );
        assert_eq!(
            transport.resolve("https://other.example/z").unwrap().as_str(),
            "https://other.example/z"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(ReqwestTransport::new("test", Some("not a url")).is_err());
    }
}
