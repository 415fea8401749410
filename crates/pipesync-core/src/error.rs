//! Error taxonomy for remote calls and sync operations.
//!
//! Errors are classified by recoverability:
//! - Transient: network failures, 5xx responses, rate limits
//! - Fatal, needs re-authentication: expired or revoked API token
//! - Fatal, user-actionable: failed local preconditions, missing remote
//!   configuration (filters, custom fields)
//!
//! Expected failure modes are always values of these types, never panics.

use std::time::Duration;

use thiserror::Error;

/// Classified outcome of a failed remote API call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiErrorKind {
    #[error("Pipedrive credentials expired or revoked")]
    AuthExpired,

    #[error("Pipedrive rate limit exceeded")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Pipedrive API error {status}: {message}")]
    HttpError { status: u16, message: String },

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

impl ApiErrorKind {
    /// True for failures worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiErrorKind::RateLimited { .. } | ApiErrorKind::NetworkError(_) => true,
            ApiErrorKind::HttpError { status, .. } => *status >= 500,
            ApiErrorKind::AuthExpired | ApiErrorKind::MalformedResponse(_) => false,
        }
    }

    /// Stable category name used for error grouping in sync reports.
    pub fn category(&self) -> &'static str {
        match self {
            ApiErrorKind::AuthExpired => "auth_expired",
            ApiErrorKind::RateLimited { .. } => "rate_limited",
            ApiErrorKind::HttpError { .. } => "http_error",
            ApiErrorKind::NetworkError(_) => "network_error",
            ApiErrorKind::MalformedResponse(_) => "malformed_response",
        }
    }
}

/// Per-call diagnostics recorded by the API client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestDiagnostics {
    /// 1-based number of the attempt that produced the final outcome.
    pub attempt: u32,
    /// How many attempts were answered with HTTP 429.
    pub rate_limited_retries: u32,
    /// Total time spent sleeping between attempts.
    pub waited: Duration,
    /// Wall-clock time for the whole call, retries included.
    pub elapsed: Duration,
}

/// A failed remote call: the classified kind plus how it got there.
#[derive(Debug, Clone, Error)]
#[error("{kind} (after {} attempt(s))", diagnostics.attempt)]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub diagnostics: RequestDiagnostics,
}

/// Failure of a reconciliation, orchestration, or sync operation.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Api(#[from] ApiErrorKind),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The remote write succeeded but the local write did not.
    #[error("Remote and local state diverged: {0}")]
    Inconsistent(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl From<ApiError> for SyncError {
    fn from(err: ApiError) -> Self {
        SyncError::Api(err.kind)
    }
}

impl SyncError {
    /// Stable category name used for error grouping in sync reports.
    pub fn category(&self) -> &'static str {
        match self {
            SyncError::Api(kind) => kind.category(),
            SyncError::Validation(_) => "validation",
            SyncError::Configuration(_) => "configuration",
            SyncError::NotFound(_) => "not_found",
            SyncError::Inconsistent(_) => "inconsistent",
            SyncError::Store(_) => "store",
        }
    }

    /// Whether repeating the whole operation could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Api(kind) => {
                kind.is_transient() || matches!(kind, ApiErrorKind::MalformedResponse(_))
            }
            SyncError::Store(_) => true,
            SyncError::Validation(_)
            | SyncError::Configuration(_)
            | SyncError::NotFound(_)
            | SyncError::Inconsistent(_) => false,
        }
    }

    /// Human-readable remediation hint.
    pub fn retry_suggestion(&self) -> &'static str {
        match self {
            SyncError::Api(ApiErrorKind::AuthExpired) => {
                "Reconnect Pipedrive: the API token is invalid or expired."
            }
            SyncError::Api(ApiErrorKind::RateLimited { .. }) => {
                "Rate limited by Pipedrive, will resume automatically."
            }
            SyncError::Api(ApiErrorKind::NetworkError(_)) => {
                "Check network connectivity to Pipedrive and try again."
            }
            SyncError::Api(ApiErrorKind::HttpError { .. }) => {
                "Pipedrive rejected the request; check the record data and retry."
            }
            SyncError::Api(ApiErrorKind::MalformedResponse(_)) => {
                "Pipedrive returned an unexpected response; retry later."
            }
            SyncError::Validation(_) => "Resolve the listed precondition and try again.",
            SyncError::Configuration(_) => "Fix the Pipedrive account configuration named above.",
            SyncError::NotFound(_) => "Check that the referenced record exists.",
            SyncError::Inconsistent(_) => {
                "The remote record exists but is not linked locally; re-run the sync to relink it."
            }
            SyncError::Store(_) => "Local database error; retry the operation.",
        }
    }
}
