//! Authenticated access to the monitoring backend REST API
//!
//! The client owns the session (token and connectivity flag) and is the only
//! component allowed to change it. It is cheap to clone: the underlying
//! `reqwest::Client` and the session are shared, so the scheduler and the
//! action manager talk through the same session.
//!
//! ## Disconnect contract
//!
//! A transient GET failure is retried exactly once, immediately. A second
//! consecutive failure flips `connected` to false and publishes a single
//! `Disconnected` event for the episode; further requests short-circuit
//! without touching the network until the reconnect loop has logged in
//! again. POST and PATCH disconnect on the first transient failure, matching
//! how the original notifier treats write paths.

use std::sync::Arc;

use reqwest::{Method, StatusCode};
use serde_json::{Value, json};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, error, instrument, trace, warn};

use crate::config::{Config, Credentials};
use crate::engine::messages::Event;
use crate::error::{AuthError, BackendError};

/// One page of an Eve-style collection response
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ItemsPage {
    #[serde(rename = "_items")]
    pub items: Vec<Value>,
    #[serde(rename = "_status", default)]
    pub status: Option<String>,
}

/// Session state, owned exclusively by the client
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub token: String,
    pub authenticated: bool,
    pub connected: bool,
}

#[derive(Clone)]
pub struct BackendClient {
    /// HTTP client (reused across requests for efficiency)
    http: reqwest::Client,

    /// Base URL of the backend, without trailing slash
    base: String,

    /// Last-known credentials, reused by the reconnect loop
    credentials: Credentials,

    session: Arc<RwLock<Session>>,

    /// Connectivity events are published here; snapshot events come from the
    /// engine on the same channel
    event_tx: broadcast::Sender<Event>,
}

impl BackendClient {
    pub fn new(config: &Config, event_tx: broadcast::Sender<Event>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(config.request_timeout())
                .build()
                .expect("Failed to build HTTP client"),
            base: config.backend.trim_end_matches('/').to_string(),
            credentials: config.credentials.clone(),
            session: Arc::new(RwLock::new(Session::default())),
            event_tx,
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.session.read().await.connected
    }

    pub async fn session(&self) -> Session {
        self.session.read().await.clone()
    }

    /// Authenticate with the stored credentials.
    ///
    /// With a password this performs the `POST /login` exchange. Without one
    /// the username is treated as a long-lived token and validated by
    /// fetching the matching user record.
    #[instrument(skip(self))]
    pub async fn login(&self) -> Result<(), AuthError> {
        let token = match &self.credentials.password {
            Some(password) if !password.is_empty() => {
                self.password_login(&self.credentials.username, password)
                    .await?
            }
            _ => {
                self.token_login(&self.credentials.username).await?
            }
        };

        let mut session = self.session.write().await;
        session.token = token;
        session.authenticated = true;
        session.connected = true;
        debug!("authenticated against {}", self.base);

        Ok(())
    }

    /// Re-run `login()` for the reconnect loop; on success a `Reconnected`
    /// event is published.
    #[instrument(skip(self))]
    pub async fn reconnect(&self) -> Result<(), AuthError> {
        self.login().await?;
        debug!("connection to backend restored");
        let _ = self.event_tx.send(Event::Reconnected);
        Ok(())
    }

    async fn password_login(&self, username: &str, password: &str) -> Result<String, AuthError> {
        let url = format!("{}/login", self.base);
        trace!("password login at {url}");

        let response = self
            .http
            .post(&url)
            .json(&json!({ "username": username, "password": password }))
            .send()
            .await
            .map_err(|e| AuthError::Unreachable(e.to_string()))?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::UNPROCESSABLE_ENTITY => {
                return Err(AuthError::Rejected);
            }
            status => return Err(AuthError::Invalid(format!("HTTP {status}"))),
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| AuthError::Invalid(e.to_string()))?;

        body.get("token")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
            .ok_or_else(|| AuthError::Invalid("login response without token".to_string()))
    }

    /// Validate a long-lived token by looking up its user
    async fn token_login(&self, token: &str) -> Result<String, AuthError> {
        let url = format!("{}/user", self.base);
        trace!("token login via user lookup at {url}");

        let response = self
            .http
            .get(&url)
            .basic_auth(token, Some(""))
            .query(&[
                ("where", json!({ "token": token }).to_string()),
                ("projection", json!({ "name": 1 }).to_string()),
            ])
            .send()
            .await
            .map_err(|e| AuthError::Unreachable(e.to_string()))?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => return Err(AuthError::Rejected),
            status => return Err(AuthError::Invalid(format!("HTTP {status}"))),
        }

        let page: ItemsPage = response
            .json()
            .await
            .map_err(|e| AuthError::Invalid(e.to_string()))?;

        if page.items.is_empty() {
            // The backend accepted the request but knows no such token
            return Err(AuthError::Rejected);
        }

        Ok(token.to_string())
    }

    /// GET a collection endpoint with a `where` filter and a projection.
    ///
    /// Transient failures (connection errors, timeouts, HTTP 5xx) are
    /// retried exactly once; a second consecutive failure starts a
    /// disconnect episode.
    #[instrument(skip(self, where_filter, projection))]
    pub async fn get(
        &self,
        endpoint: &str,
        where_filter: Option<&Value>,
        projection: &[&str],
    ) -> Result<ItemsPage, BackendError> {
        self.ensure_connected().await?;

        let url = format!("{}/{}", self.base, endpoint);
        let query = build_query(where_filter, projection);

        match self.get_once(&url, &query).await {
            Ok(page) => Ok(page),
            Err(BackendError::Transient(first)) => {
                warn!("GET {endpoint} failed ({first}), retrying once");
                match self.get_once(&url, &query).await {
                    Ok(page) => Ok(page),
                    Err(BackendError::Transient(second)) => {
                        self.mark_disconnected(&second).await;
                        Err(BackendError::Transient(second))
                    }
                    Err(other) => Err(other),
                }
            }
            Err(other) => Err(other),
        }
    }

    async fn get_once(
        &self,
        url: &str,
        query: &[(&'static str, String)],
    ) -> Result<ItemsPage, BackendError> {
        let token = self.session.read().await.token.clone();

        let response = self
            .http
            .get(url)
            .basic_auth(&token, Some(""))
            .query(query)
            .send()
            .await
            .map_err(|e| BackendError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(BackendError::Transient(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(BackendError::Malformed(format!("HTTP {status}")));
        }

        let page: ItemsPage = response
            .json()
            .await
            .map_err(|e| BackendError::Malformed(e.to_string()))?;

        trace!("GET {url}: {} items", page.items.len());
        Ok(page)
    }

    /// POST to an endpoint. Not retried: a transient failure starts a
    /// disconnect episode immediately and the caller sees the error.
    #[instrument(skip(self, data))]
    pub async fn post(&self, endpoint: &str, data: &Value) -> Result<Value, BackendError> {
        self.ensure_connected().await?;

        let url = format!("{}/{}", self.base, endpoint);
        let token = self.session.read().await.token.clone();

        let result = self
            .http
            .post(&url)
            .basic_auth(&token, Some(""))
            .json(data)
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                let reason = e.to_string();
                self.mark_disconnected(&reason).await;
                return Err(BackendError::Transient(reason));
            }
        };

        let status = response.status();
        if status.is_server_error() {
            let reason = format!("HTTP {status}");
            self.mark_disconnected(&reason).await;
            return Err(BackendError::Transient(reason));
        }
        if !status.is_success() {
            return Err(BackendError::Malformed(format!("HTTP {status}")));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| BackendError::Malformed(e.to_string()))?;

        debug!("POST {endpoint}: {:?}", body.get("_status"));
        Ok(body)
    }

    /// PATCH a single document with optimistic concurrency.
    ///
    /// A stale etag surfaces as `PreconditionFailed`; the caller must
    /// refetch and retry explicitly, this is never retried here.
    #[instrument(skip(self, data, etag))]
    pub async fn patch(
        &self,
        endpoint: &str,
        id: &str,
        data: &Value,
        etag: &str,
    ) -> Result<bool, BackendError> {
        self.ensure_connected().await?;

        let url = format!("{}/{}/{}", self.base, endpoint, id);
        let token = self.session.read().await.token.clone();

        let result = self
            .http
            .request(Method::PATCH, &url)
            .basic_auth(&token, Some(""))
            .header("If-Match", etag)
            .json(data)
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                let reason = e.to_string();
                self.mark_disconnected(&reason).await;
                return Err(BackendError::Transient(reason));
            }
        };

        let status = response.status();
        if status == StatusCode::PRECONDITION_FAILED {
            return Err(BackendError::PreconditionFailed);
        }
        if status.is_server_error() {
            let reason = format!("HTTP {status}");
            self.mark_disconnected(&reason).await;
            return Err(BackendError::Transient(reason));
        }
        if !status.is_success() {
            return Err(BackendError::Malformed(format!("HTTP {status}")));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| BackendError::Malformed(e.to_string()))?;

        Ok(body.get("_status").and_then(Value::as_str) == Some("OK"))
    }

    async fn ensure_connected(&self) -> Result<(), BackendError> {
        if self.session.read().await.connected {
            Ok(())
        } else {
            Err(BackendError::Disconnected)
        }
    }

    /// Flip to disconnected and publish the event, once per episode
    async fn mark_disconnected(&self, reason: &str) {
        let mut session = self.session.write().await;
        if !session.connected {
            // Already in a disconnect episode, suppress duplicate events
            return;
        }
        session.connected = false;

        error!("connection to backend lost: {reason}");
        let _ = self.event_tx.send(Event::Disconnected {
            reason: reason.to_string(),
        });
    }
}

fn build_query(where_filter: Option<&Value>, projection: &[&str]) -> Vec<(&'static str, String)> {
    let mut query = vec![("max_results", "50".to_string())];

    if let Some(filter) = where_filter {
        query.push(("where", filter.to_string()));
    }

    if !projection.is_empty() {
        let mut fields = serde_json::Map::new();
        for field in projection {
            fields.insert((*field).to_string(), json!(1));
        }
        query.push(("projection", Value::Object(fields).to_string()));
    }

    query
}
