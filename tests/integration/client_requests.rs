//! Backend client tests: login flows, retry behavior, disconnect signaling

use assert_matches::assert_matches;
use serde_json::json;
use tokio::sync::broadcast;
use wiremock::matchers::{body_json_string, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use watchpost::error::{AuthError, BackendError};
use watchpost::{BackendClient, Event};

use crate::helpers::*;

fn client_for(server: &MockServer) -> (BackendClient, broadcast::Receiver<Event>) {
    let (event_tx, event_rx) = broadcast::channel(16);
    let client = BackendClient::new(&test_config(server), event_tx);
    (client, event_rx)
}

fn token_client_for(server: &MockServer, token: &str) -> (BackendClient, broadcast::Receiver<Event>) {
    let config = serde_json::from_value(json!({
        "backend": server.uri(),
        "credentials": { "username": token },
        "request_timeout": 5
    }))
    .unwrap();

    let (event_tx, event_rx) = broadcast::channel(16);
    (BackendClient::new(&config, event_tx), event_rx)
}

#[tokio::test]
async fn password_login_stores_token() {
    let server = mock_backend().await;
    let (client, _rx) = client_for(&server);

    client.login().await.unwrap();

    let session = client.session().await;
    assert!(session.authenticated);
    assert!(session.connected);
    assert_eq!(session.token, "tok-1");
}

#[tokio::test]
async fn rejected_credentials_are_reported() {
    let server = mock_backend().await;

    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let (client, _rx) = client_for(&server);

    assert_matches!(client.login().await, Err(AuthError::Rejected));
    assert!(!client.is_connected().await);
}

#[tokio::test]
async fn malformed_login_response_is_invalid() {
    let server = mock_backend().await;

    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "hello": "world" })))
        .mount(&server)
        .await;

    let (client, _rx) = client_for(&server);

    assert_matches!(client.login().await, Err(AuthError::Invalid(_)));
}

#[tokio::test]
async fn unreachable_backend_is_reported() {
    // Nothing listens on port 9; connection is refused immediately
    let config = serde_json::from_value(json!({
        "backend": "http://127.0.0.1:9",
        "credentials": { "username": "admin", "password": "admin" },
        "request_timeout": 2
    }))
    .unwrap();

    let (event_tx, _rx) = broadcast::channel(16);
    let client = BackendClient::new(&config, event_tx);

    assert_matches!(client.login().await, Err(AuthError::Unreachable(_)));
}

#[tokio::test]
async fn token_login_validates_against_user_endpoint() {
    let server = mock_backend().await;
    let (client, _rx) = token_client_for(&server, "abcdef123456");

    client.login().await.unwrap();

    let session = client.session().await;
    assert_eq!(session.token, "abcdef123456");
    assert!(session.connected);
}

#[tokio::test]
async fn unknown_token_is_rejected() {
    let server = mock_backend().await;

    Mock::given(method("GET"))
        .and(path("/user"))
        .respond_with(ResponseTemplate::new(200).set_body_json(items_page(vec![])))
        .mount(&server)
        .await;

    let (client, _rx) = token_client_for(&server, "stale-token");

    assert_matches!(client.login().await, Err(AuthError::Rejected));
}

#[tokio::test]
async fn transient_get_failure_is_retried_exactly_once() {
    let server = mock_backend().await;

    // First attempt fails, the immediate retry hits the default 200 mock
    Mock::given(method("GET"))
        .and(path("/host"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;

    let (client, mut rx) = client_for(&server);
    client.login().await.unwrap();

    let page = client.get("host", None, &["name"]).await.unwrap();
    assert!(page.items.is_empty());
    assert!(client.is_connected().await);

    // Retry succeeded, so no disconnect episode started
    assert!(rx.try_recv().is_err());

    let host_requests = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/host")
        .count();
    assert_eq!(host_requests, 2, "expected original attempt plus one retry");
}

#[tokio::test]
async fn repeated_transient_failures_emit_one_disconnect() {
    let server = mock_backend().await;

    Mock::given(method("GET"))
        .and(path("/host"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let (client, mut rx) = client_for(&server);
    client.login().await.unwrap();

    // Both the attempt and its retry fail: disconnect episode starts
    assert_matches!(
        client.get("host", None, &[]).await,
        Err(BackendError::Transient(_))
    );
    assert!(!client.is_connected().await);
    assert_matches!(rx.try_recv(), Ok(Event::Disconnected { .. }));

    // Further requests short-circuit and stay silent
    assert_matches!(
        client.get("host", None, &[]).await,
        Err(BackendError::Disconnected)
    );
    assert_matches!(
        client.get("service", None, &[]).await,
        Err(BackendError::Disconnected)
    );
    assert!(rx.try_recv().is_err(), "no duplicate Disconnected events");
}

#[tokio::test]
async fn reconnect_emits_reconnected_event() {
    let server = mock_backend().await;

    Mock::given(method("GET"))
        .and(path("/host"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;

    let (client, mut rx) = client_for(&server);
    client.login().await.unwrap();

    assert!(client.get("host", None, &[]).await.is_err());
    assert_matches!(rx.try_recv(), Ok(Event::Disconnected { .. }));

    client.reconnect().await.unwrap();
    assert!(client.is_connected().await);
    assert_matches!(rx.try_recv(), Ok(Event::Reconnected));

    // Backend is healthy again
    assert!(client.get("host", None, &[]).await.is_ok());
}

#[tokio::test]
async fn get_sends_filter_and_projection() {
    let server = mock_backend().await;

    let (client, _rx) = client_for(&server);
    client.login().await.unwrap();

    let filter = json!({ "_is_template": false });
    client
        .get("host", Some(&filter), &["name", "ls_state"])
        .await
        .unwrap();

    let request = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.url.path() == "/host")
        .expect("host request was sent");

    let query: std::collections::HashMap<_, _> = request.url.query_pairs().collect();
    assert_eq!(query["max_results"], "50");
    assert_eq!(query["where"], r#"{"_is_template":false}"#);

    let projection: serde_json::Value = serde_json::from_str(&query["projection"]).unwrap();
    assert_eq!(projection["name"], 1);
    assert_eq!(projection["ls_state"], 1);
}

#[tokio::test]
async fn post_returns_response_body() {
    let server = mock_backend().await;

    Mock::given(method("POST"))
        .and(path("/actionacknowledge"))
        .respond_with(
            ResponseTemplate::new(201).set_body_json(json!({ "_status": "OK", "_id": "a1" })),
        )
        .mount(&server)
        .await;

    let (client, _rx) = client_for(&server);
    client.login().await.unwrap();

    let body = client
        .post("actionacknowledge", &json!({ "action": "add", "host": "h1" }))
        .await
        .unwrap();

    assert_eq!(body["_status"], "OK");
}

#[tokio::test]
async fn stale_etag_surfaces_as_precondition_failed() {
    let server = mock_backend().await;

    Mock::given(method("PATCH"))
        .and(path("/host/h1"))
        .and(header("If-Match", "stale-etag"))
        .respond_with(ResponseTemplate::new(412))
        .mount(&server)
        .await;

    let (client, mut rx) = client_for(&server);
    client.login().await.unwrap();

    let result = client
        .patch("host", "h1", &json!({ "notes": "x" }), "stale-etag")
        .await;

    assert_matches!(result, Err(BackendError::PreconditionFailed));

    // A stale etag is the caller's problem, not a connectivity episode
    assert!(client.is_connected().await);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn fresh_etag_patch_succeeds() {
    let server = mock_backend().await;

    Mock::given(method("PATCH"))
        .and(path("/host/h1"))
        .and(header("If-Match", "etag-7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "_status": "OK" })))
        .mount(&server)
        .await;

    let (client, _rx) = client_for(&server);
    client.login().await.unwrap();

    let updated = client
        .patch("host", "h1", &json!({ "notes": "x" }), "etag-7")
        .await
        .unwrap();
    assert!(updated);
}

#[tokio::test]
async fn login_sends_credentials_as_json() {
    let server = mock_backend().await;

    Mock::given(method("POST"))
        .and(path("/login"))
        .and(body_json_string(
            r#"{"username":"admin","password":"admin"}"#,
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "token": "tok-9" })))
        .mount(&server)
        .await;

    let (client, _rx) = client_for(&server);
    client.login().await.unwrap();
    assert_eq!(client.session().await.token, "tok-9");
}
