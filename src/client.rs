//! Pipedrive REST API client.
//!
//! A thin wrapper over `reqwest` that authenticates with the account's
//! API token as a query parameter, classifies every failure into an
//! [`ApiErrorKind`], and retries transient ones through
//! [`retry_with_backoff`](crate::retry::retry_with_backoff).
//!
//! # Failure handling
//!
//! | Response | Outcome |
//! |----------|---------|
//! | 2xx with JSON body | success (unless `"success": false`) |
//! | 2xx with empty or non-JSON body | `MalformedResponse`, not retried |
//! | 401 | `AuthExpired`, never retried |
//! | 429 | `RateLimited`, retried after `retry-after` seconds or the default delay |
//! | 5xx, network error | retried with exponential backoff |
//! | other 4xx | `HttpError`, not retried |
//!
//! Every call reports [`RequestDiagnostics`]. The token never appears in
//! logs or error messages.

use std::fmt;
use std::time::{Duration, Instant};

use pipesync_core::error::{ApiError, ApiErrorKind, RequestDiagnostics, SyncError};
use pipesync_core::models::{EntityKind, RemoteCustomField};
use pipesync_core::remote::{
    self, parse_page, RemoteFilter, RemoteOrganization, RemotePerson, RemoteUser,
};
use reqwest::{Method, StatusCode, Url};
use serde_json::Value;

use crate::config::PipedriveConfig;
use crate::retry::{retry_with_backoff, RetryDirective, RetryPolicy};

/// Upper bound for paginated schema and filter listings.
const LIST_LIMIT: u64 = 500;

/// Parsed JSON body of a successful call.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub body: Value,
    pub diagnostics: RequestDiagnostics,
}

impl ApiResponse {
    /// The `data` member, or `null` when absent.
    pub fn data(&self) -> &Value {
        self.body.get("data").unwrap_or(&Value::Null)
    }
}

/// One page of persons from a list endpoint.
#[derive(Debug, Clone)]
pub struct PersonsPage {
    pub records: Vec<RemotePerson>,
    /// Items that could not be normalized (no id), described for reporting.
    pub rejected: Vec<String>,
    /// Raw number of items the page carried.
    pub fetched: usize,
    pub more_items: Option<bool>,
    pub total: Option<u64>,
    pub diagnostics: RequestDiagnostics,
}

#[derive(Clone)]
pub struct PipedriveClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    policy: RetryPolicy,
    rate_limit_handling: bool,
    rate_limit_default_delay: Duration,
    rate_limit_max_wait: Duration,
    detailed_logging: bool,
}

impl fmt::Debug for PipedriveClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipedriveClient")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .field("policy", &self.policy)
            .finish()
    }
}

impl PipedriveClient {
    /// Build a client with an explicit token.
    pub fn new(config: &PipedriveConfig, token: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: token.into(),
            policy: config.retry_policy(),
            rate_limit_handling: config.rate_limit_handling,
            rate_limit_default_delay: Duration::from_millis(config.rate_limit_default_delay_ms),
            rate_limit_max_wait: Duration::from_secs(config.rate_limit_max_wait_secs),
            detailed_logging: config.detailed_logging,
        })
    }

    /// Build a client with the configured (or environment) token.
    pub fn from_config(config: &PipedriveConfig) -> Result<Self, SyncError> {
        let token = config.resolve_token().ok_or_else(|| {
            SyncError::Configuration(format!(
                "no Pipedrive API token: set pipedrive.api_token or {}",
                crate::config::TOKEN_ENV_VAR
            ))
        })?;
        Self::new(config, token).map_err(SyncError::Store)
    }

    /// Same settings, different caller token.
    pub fn with_token(&self, token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            ..self.clone()
        }
    }

    fn url(&self, path: &str, query: &[(&str, String)]) -> Result<Url, ApiErrorKind> {
        let raw = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut url = Url::parse(&raw)
            .map_err(|e| ApiErrorKind::NetworkError(format!("invalid request url: {}", e)))?;
        {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in query {
                pairs.append_pair(k, v);
            }
            pairs.append_pair("api_token", &self.token);
        }
        Ok(url)
    }

    /// Execute one logical call, retrying per policy.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<ApiResponse, ApiError> {
        let started = Instant::now();
        let url = match self.url(path, query) {
            Ok(url) => url,
            Err(kind) => {
                return Err(ApiError {
                    kind,
                    diagnostics: RequestDiagnostics {
                        attempt: 1,
                        ..Default::default()
                    },
                })
            }
        };

        let mut rate_limited = 0u32;
        let rate_limit_handling = self.rate_limit_handling;
        let default_delay = self.rate_limit_default_delay;
        let max_wait = self.rate_limit_max_wait;

        let outcome = retry_with_backoff(
            &self.policy,
            |err: &ApiErrorKind| match err {
                ApiErrorKind::AuthExpired | ApiErrorKind::MalformedResponse(_) => {
                    RetryDirective::Stop
                }
                ApiErrorKind::RateLimited { retry_after_secs } => {
                    rate_limited += 1;
                    if !rate_limit_handling {
                        return RetryDirective::Stop;
                    }
                    let delay = retry_after_secs
                        .map(Duration::from_secs)
                        .unwrap_or(default_delay)
                        .min(max_wait);
                    RetryDirective::After(delay)
                }
                other if other.is_transient() => RetryDirective::Backoff,
                _ => RetryDirective::Stop,
            },
            |attempt| self.attempt(method.clone(), url.clone(), path, body, attempt),
        )
        .await;

        let diagnostics = RequestDiagnostics {
            attempt: outcome.attempts,
            rate_limited_retries: rate_limited,
            waited: outcome.waited,
            elapsed: started.elapsed(),
        };

        match outcome.result {
            Ok(body) => Ok(ApiResponse { body, diagnostics }),
            Err(kind) => {
                tracing::warn!(
                    %method,
                    path,
                    attempts = diagnostics.attempt,
                    error = %kind,
                    "Pipedrive request failed"
                );
                Err(ApiError { kind, diagnostics })
            }
        }
    }

    async fn attempt(
        &self,
        method: Method,
        url: Url,
        path: &str,
        body: Option<&Value>,
        attempt: u32,
    ) -> Result<Value, ApiErrorKind> {
        let started = Instant::now();
        let mut req = self.http.request(method.clone(), url);
        if let Some(body) = body {
            req = req.json(body);
        }

        let response = match req.send().await {
            Ok(response) => response,
            Err(e) => {
                let e = e.without_url();
                if self.detailed_logging {
                    tracing::debug!(%method, path, attempt, error = %e, "request attempt failed");
                }
                return Err(ApiErrorKind::NetworkError(e.to_string()));
            }
        };

        let status = response.status();
        if self.detailed_logging {
            tracing::debug!(
                %method,
                path,
                attempt,
                status = status.as_u16(),
                latency_ms = started.elapsed().as_millis() as u64,
                "request attempt"
            );
        }

        if status == StatusCode::UNAUTHORIZED {
            return Err(ApiErrorKind::AuthExpired);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            return Err(ApiErrorKind::RateLimited { retry_after_secs });
        }

        let text = response
            .text()
            .await
            .map_err(|e| ApiErrorKind::NetworkError(e.without_url().to_string()))?;

        if !status.is_success() {
            return Err(ApiErrorKind::HttpError {
                status: status.as_u16(),
                message: error_message(&text),
            });
        }

        if text.trim().is_empty() {
            return Err(ApiErrorKind::MalformedResponse(format!(
                "empty body with status {}",
                status.as_u16()
            )));
        }
        let json: Value = serde_json::from_str(&text).map_err(|e| {
            ApiErrorKind::MalformedResponse(format!("body is not JSON: {}", e))
        })?;
        if json.get("success").and_then(Value::as_bool) == Some(false) {
            return Err(ApiErrorKind::HttpError {
                status: status.as_u16(),
                message: error_message(&text),
            });
        }
        Ok(json)
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<ApiResponse, ApiError> {
        self.request(Method::GET, path, query, None).await
    }

    // ── users ────────────────────────────────────────────────────────

    /// The user owning the token. Doubles as a connection check.
    pub async fn me(&self) -> Result<RemoteUser, ApiError> {
        let resp = self.get("/users/me", &[]).await?;
        remote::normalize_user(resp.data())
            .ok_or_else(|| malformed("users/me returned no user", &resp))
    }

    pub async fn find_user_by_email(&self, email: &str) -> Result<Option<RemoteUser>, ApiError> {
        let resp = self
            .get(
                "/users/find",
                &[
                    ("term", email.to_string()),
                    ("search_by_email", "1".to_string()),
                ],
            )
            .await?;
        let users: Vec<RemoteUser> = match resp.data() {
            Value::Array(items) => items.iter().filter_map(remote::normalize_user).collect(),
            _ => Vec::new(),
        };
        let wanted = email.trim().to_lowercase();
        let exact = users
            .iter()
            .find(|u| u.email.as_deref().map(str::to_lowercase) == Some(wanted.clone()))
            .cloned();
        Ok(exact.or_else(|| users.into_iter().next()))
    }

    // ── schema ───────────────────────────────────────────────────────

    /// All fields of the person or organization schema.
    async fn list_fields(&self, kind: EntityKind) -> Result<Vec<RemoteCustomField>, ApiError> {
        let mut fields = Vec::new();
        let mut start = 0u64;
        loop {
            let resp = self
                .get(
                    kind.fields_endpoint(),
                    &[("start", start.to_string()), ("limit", LIST_LIMIT.to_string())],
                )
                .await?;
            let page = parse_page(&resp.body);
            let fetched = page.items.len() as u64;
            fields.extend(page.items.iter().filter_map(remote::normalize_field));
            if page.more_items != Some(true) || fetched == 0 {
                break;
            }
            start = page.next_start.unwrap_or(start + fetched);
        }
        Ok(fields)
    }

    pub async fn list_person_fields(&self) -> Result<Vec<RemoteCustomField>, ApiError> {
        self.list_fields(EntityKind::Person).await
    }

    pub async fn list_organization_fields(&self) -> Result<Vec<RemoteCustomField>, ApiError> {
        self.list_fields(EntityKind::Organization).await
    }

    pub async fn list_filters(&self, filter_type: &str) -> Result<Vec<RemoteFilter>, ApiError> {
        let resp = self
            .get("/filters", &[("type", filter_type.to_string())])
            .await?;
        Ok(match resp.data() {
            Value::Array(items) => items.iter().filter_map(remote::normalize_filter).collect(),
            _ => Vec::new(),
        })
    }

    // ── persons ──────────────────────────────────────────────────────

    pub async fn list_persons_page(
        &self,
        filter_id: Option<&str>,
        start: u64,
        limit: u64,
    ) -> Result<PersonsPage, ApiError> {
        let mut query = vec![("start", start.to_string()), ("limit", limit.to_string())];
        if let Some(id) = filter_id {
            query.push(("filter_id", id.to_string()));
        }
        let resp = self.get("/persons", &query).await?;
        let page = parse_page(&resp.body);
        let mut records = Vec::with_capacity(page.items.len());
        let mut rejected = Vec::new();
        for (i, item) in page.items.iter().enumerate() {
            match remote::normalize_person(item) {
                Some(person) => records.push(person),
                None => rejected.push(format!("record #{} has no id", start + i as u64)),
            }
        }
        Ok(PersonsPage {
            fetched: page.items.len(),
            records,
            rejected,
            more_items: page.more_items,
            total: page.total,
            diagnostics: resp.diagnostics,
        })
    }

    /// Fetch one person; a 404 is `Ok(None)`.
    pub async fn get_person(&self, id: &str) -> Result<Option<RemotePerson>, ApiError> {
        match self.get(&format!("/persons/{}", id), &[]).await {
            Ok(resp) => Ok(remote::normalize_person(resp.data())),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn create_person(&self, payload: &Value) -> Result<RemotePerson, ApiError> {
        let resp = self
            .request(Method::POST, "/persons", &[], Some(payload))
            .await?;
        remote::normalize_person(resp.data())
            .ok_or_else(|| malformed("person create returned no id", &resp))
    }

    pub async fn update_person(&self, id: &str, payload: &Value) -> Result<RemotePerson, ApiError> {
        let resp = self
            .request(Method::PUT, &format!("/persons/{}", id), &[], Some(payload))
            .await?;
        remote::normalize_person(resp.data())
            .ok_or_else(|| malformed("person update returned no id", &resp))
    }

    // ── organizations ────────────────────────────────────────────────

    pub async fn search_organizations(
        &self,
        term: &str,
        exact_match: bool,
    ) -> Result<Vec<RemoteOrganization>, ApiError> {
        let resp = self
            .get(
                "/organizations/search",
                &[
                    ("term", term.to_string()),
                    ("fields", "name".to_string()),
                    ("exact_match", exact_match.to_string()),
                ],
            )
            .await?;
        let page = parse_page(&resp.body);
        Ok(page
            .items
            .iter()
            .filter_map(remote::normalize_organization)
            .collect())
    }

    /// Fetch one organization; a 404 is `Ok(None)`.
    pub async fn get_organization(&self, id: &str) -> Result<Option<RemoteOrganization>, ApiError> {
        match self.get(&format!("/organizations/{}", id), &[]).await {
            Ok(resp) => Ok(remote::normalize_organization(resp.data())),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn create_organization(&self, payload: &Value) -> Result<RemoteOrganization, ApiError> {
        let resp = self
            .request(Method::POST, "/organizations", &[], Some(payload))
            .await?;
        remote::normalize_organization(resp.data())
            .ok_or_else(|| malformed("organization create returned no id", &resp))
    }

    pub async fn update_organization(
        &self,
        id: &str,
        payload: &Value,
    ) -> Result<RemoteOrganization, ApiError> {
        let resp = self
            .request(Method::PUT, &format!("/organizations/{}", id), &[], Some(payload))
            .await?;
        remote::normalize_organization(resp.data())
            .ok_or_else(|| malformed("organization update returned no id", &resp))
    }

    // ── activities ───────────────────────────────────────────────────

    /// Create an activity and return its remote id.
    pub async fn create_activity(&self, payload: &Value) -> Result<String, ApiError> {
        let resp = self
            .request(Method::POST, "/activities", &[], Some(payload))
            .await?;
        resp.data()
            .get("id")
            .and_then(remote::id_string)
            .ok_or_else(|| malformed("activity create returned no id", &resp))
    }
}

fn is_not_found(err: &ApiError) -> bool {
    matches!(err.kind, ApiErrorKind::HttpError { status: 404, .. })
}

fn malformed(message: &str, resp: &ApiResponse) -> ApiError {
    ApiError {
        kind: ApiErrorKind::MalformedResponse(message.to_string()),
        diagnostics: resp.diagnostics.clone(),
    }
}

/// Best-effort message from an error body: the JSON `error` member, or
/// the raw text cut to a readable length.
fn error_message(text: &str) -> String {
    if let Ok(json) = serde_json::from_str::<Value>(text) {
        if let Some(msg) = json.get("error").and_then(Value::as_str) {
            return msg.to_string();
        }
    }
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return "no response body".to_string();
    }
    trimmed.chars().take(200).collect()
}
