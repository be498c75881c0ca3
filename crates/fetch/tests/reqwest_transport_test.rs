// Integration tests for the reqwest transport against a mock HTTP server
//
// Run with: cargo test -p everruns-fetch --test reqwest_transport_test

use std::time::Duration;

use everruns_fetch::prelude::*;
use everruns_fetch::ReqwestTransport;
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer) -> FetchClient {
    FetchClient::new(FetchConfig::default().with_base_url(server.uri()))
        .expect("client should build")
}

#[test_log::test(tokio::test)]
async fn test_json_get_through_base_url() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/status"))
        .and(query_param("verbose", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"healthy": true})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let payload = client
        .fetch("/api/status?verbose=1", FetchOptions::default())
        .await
        .unwrap();

    assert_eq!(payload, FetchPayload::Json(json!({"healthy": true})));
    assert_eq!(client.failure_count("/api/status"), 0);
}

#[tokio::test]
async fn test_text_response_is_raw() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/metrics"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/plain")
                .set_body_string("requests_total 42"),
        )
        .mount(&server)
        .await;

    let client = client_for(&server);
    let payload = client.fetch("/metrics", FetchOptions::default()).await.unwrap();

    let response = payload.as_raw().expect("raw payload");
    assert_eq!(response.status, 200);
    assert_eq!(response.content_type(), Some("text/plain"));
    assert_eq!(response.text(), "requests_total 42");
}

#[tokio::test]
async fn test_not_found_is_http_error() {
    let server = MockServer::start().await;
    Mock::given(path("/api/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client
        .fetch("/api/missing", FetchOptions::default())
        .await
        .unwrap_err();

    assert_eq!(
        err,
        FetchError::Http {
            endpoint: "/api/missing".into(),
            status: 404,
            status_text: "Not Found".into(),
        }
    );
    assert_eq!(client.failure_count("/api/missing"), 1);
}

#[tokio::test]
async fn test_post_sends_json_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/jobs"))
        .and(header("content-type", "application/json"))
        .and(body_json(json!({"name": "nightly"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 7})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let created: serde_json::Value = client
        .fetch_json(
            "/api/jobs",
            FetchOptions::new()
                .with_method(reqwest::Method::POST)
                .with_json(&json!({"name": "nightly"})),
        )
        .await
        .unwrap();

    assert_eq!(created["id"], 7);
}

#[tokio::test]
async fn test_slow_server_times_out() {
    let server = MockServer::start().await;
    Mock::given(path("/api/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client
        .fetch(
            "/api/slow",
            FetchOptions::new().with_timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    assert_eq!(client.failure_count("/api/slow"), 1);
}

#[test_log::test(tokio::test)]
async fn test_unreachable_host_is_connection_error() {
    // Bind and release a port so nothing is listening on it
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = FetchClient::new(FetchConfig::default()).unwrap();
    let err = client
        .fetch(
            &format!("http://{addr}/api/status"),
            FetchOptions::new().retry_on_connection_error(false),
        )
        .await
        .unwrap_err();

    assert!(
        matches!(err, FetchError::Connection { attempts: 1, .. }),
        "unexpected error: {err:?}"
    );
    assert_eq!(client.failure_count("/api/status"), 1);
}

#[tokio::test]
async fn test_relative_url_without_base_is_transport_error() {
    let transport = ReqwestTransport::new("test-agent", None).unwrap();
    let client = FetchClient::with_transport(FetchConfig::default(), Arc::new(transport));

    let err = client
        .fetch("/api/status", FetchOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FetchErrorKind::Transport);
}

#[tokio::test]
async fn test_user_agent_is_sent() {
    let server = MockServer::start().await;
    Mock::given(path("/api/ping"))
        .and(header("user-agent", "dashboard/2.0"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let client = FetchClient::new(
        FetchConfig::default()
            .with_base_url(server.uri())
            .with_user_agent("dashboard/2.0"),
    )
    .unwrap();

    let payload = client.fetch("/api/ping", FetchOptions::default()).await.unwrap();
    assert_eq!(payload.as_raw().map(|r| r.status), Some(204));
}
