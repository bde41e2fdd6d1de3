//! Error types for backend access and decoding

use thiserror::Error;

/// Errors from the login / token validation flow
#[derive(Debug, Error)]
pub enum AuthError {
    /// The backend could not be reached at all
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    /// The backend answered but refused the credentials
    #[error("credentials rejected by backend")]
    Rejected,

    /// The backend answered with something we could not make sense of
    #[error("malformed login response: {0}")]
    Invalid(String),
}

/// Errors from authenticated requests
#[derive(Debug, Error)]
pub enum BackendError {
    /// Connection-level failure or HTTP 5xx. Retried once by the client;
    /// surfacing here means the retry failed too.
    #[error("transient backend failure: {0}")]
    Transient(String),

    /// PATCH with a stale `If-Match` etag. The caller must refetch the
    /// entity and retry with the fresh etag.
    #[error("precondition failed, etag is stale")]
    PreconditionFailed,

    /// The response body did not match the expected shape
    #[error("malformed backend response: {0}")]
    Malformed(String),

    /// The client is in a disconnected episode; no requests are attempted
    /// until the reconnect loop succeeds.
    #[error("backend is disconnected")]
    Disconnected,

    /// Login failed during an explicit (re)connect
    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// Per-record decode failure. Always recovered by skipping the record and
/// logging, never by aborting the batch.
#[derive(Debug, Error)]
#[error("cannot decode {kind} record: {reason}")]
pub struct DecodeError {
    pub kind: &'static str,
    pub reason: String,
}

impl DecodeError {
    pub fn new(kind: &'static str, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}
