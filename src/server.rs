//! HTTP server for the CRM UI.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/sync` | Start a bulk sync, returns `{ "syncId" }` at once |
//! | `GET`  | `/sync` | Ids of syncs still running |
//! | `GET`  | `/sync/{id}` | Latest progress snapshot |
//! | `GET`  | `/sync/{id}/events` | Server-sent progress events |
//! | `POST` | `/sync/{id}/cancel` | Request cancellation |
//! | `POST`/`GET` | `/contacts` | Create (warm contacts are promoted) / list contacts |
//! | `GET`  | `/contacts/{id}` | One contact |
//! | `GET`  | `/contacts/{id}/activities` | A contact's activities |
//! | `POST` | `/contacts/{id}/warmness` | Set the warmness score (may promote) |
//! | `POST` | `/contacts/{id}/promote` | Warm-lead promotion |
//! | `POST` | `/contacts/{id}/deactivate` | Deactivate |
//! | `POST` | `/contacts/{id}/reactivate` | Reactivate |
//! | `POST` | `/activities` | Log an activity |
//! | `GET`  | `/activities/{id}` | One activity |
//! | `POST` | `/activities/{id}/replicate` | Replicate an activity |
//! | `POST`/`GET` | `/campaigns` | Create / list campaigns |
//! | `GET`  | `/campaigns/{id}` | One campaign |
//! | `POST` | `/campaigns/{id}/contacts` | Add a contact to a campaign |
//! | `POST` | `/users` | Register a local user |
//! | `GET`  | `/users/{id}` | One user |
//!
//! The acting user is named by the `x-user-id` header.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "validation", "message": "...", "suggestion": "..." } }
//! ```
//!
//! | Code | Status |
//! |------|--------|
//! | `bad_request` | 400 |
//! | `validation` | 422 |
//! | `not_found` | 404 |
//! | `configuration` | 412 |
//! | `remote_auth_expired` | 401 |
//! | `rate_limited` | 429 |
//! | `remote_error` | 502 |
//! | `inconsistent`, `internal` | 500 |

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, OptionalFromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream};
use pipesync_core::error::{ApiErrorKind, SyncError};
use pipesync_core::progress::{SyncProgressEvent, SyncType};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::app::App;
use crate::config::Config;
use crate::hub;
use crate::lifecycle::LifecycleRequest;
use crate::services::{NewActivity, NewCampaign, NewContact, NewUser};
use crate::sqlite_store::SqliteStore;

/// Header naming the acting user.
pub const USER_HEADER: &str = "x-user-id";

/// Open the configured database and serve until the process ends.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let store = SqliteStore::open(config).await?;
    let app = Arc::new(App::new(config.clone(), Arc::new(store))?);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(bind = %bind_addr, "pipesync server listening");
    axum::serve(listener, router(app)).await?;
    Ok(())
}

/// All routes over a shared [`App`].
pub fn router(app: Arc<App>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/sync", post(handle_start_sync).get(handle_running_syncs))
        .route("/sync/{id}", get(handle_sync_state))
        .route("/sync/{id}/events", get(handle_sync_events))
        .route("/sync/{id}/cancel", post(handle_cancel_sync))
        .route("/contacts", post(handle_create_contact).get(handle_list_contacts))
        .route("/contacts/{id}", get(handle_get_contact))
        .route("/contacts/{id}/activities", get(handle_contact_activities))
        .route("/contacts/{id}/warmness", post(handle_update_warmness))
        .route("/contacts/{id}/promote", post(handle_promote))
        .route("/contacts/{id}/deactivate", post(handle_deactivate))
        .route("/contacts/{id}/reactivate", post(handle_reactivate))
        .route("/activities", post(handle_log_activity))
        .route("/activities/{id}", get(handle_get_activity))
        .route("/activities/{id}/replicate", post(handle_replicate))
        .route("/campaigns", post(handle_create_campaign).get(handle_list_campaigns))
        .route("/campaigns/{id}", get(handle_get_campaign))
        .route("/campaigns/{id}/contacts", post(handle_add_campaign_contact))
        .route("/users", post(handle_create_user))
        .route("/users/{id}", get(handle_get_user))
        .layer(cors)
        .with_state(app)
}

type AppState = State<Arc<App>>;

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    suggestion: Option<String>,
}

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: String,
    message: String,
    suggestion: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
                suggestion: self.suggestion,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
        suggestion: None,
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
        suggestion: None,
    }
}

impl From<SyncError> for AppError {
    fn from(err: SyncError) -> Self {
        let (status, code) = match &err {
            SyncError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "validation"),
            SyncError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            SyncError::Configuration(_) => (StatusCode::PRECONDITION_FAILED, "configuration"),
            SyncError::Api(ApiErrorKind::AuthExpired) => {
                (StatusCode::UNAUTHORIZED, "remote_auth_expired")
            }
            SyncError::Api(ApiErrorKind::RateLimited { .. }) => {
                (StatusCode::TOO_MANY_REQUESTS, "rate_limited")
            }
            SyncError::Api(_) => (StatusCode::BAD_GATEWAY, "remote_error"),
            SyncError::Inconsistent(_) => (StatusCode::INTERNAL_SERVER_ERROR, "inconsistent"),
            SyncError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        if status.is_server_error() {
            tracing::error!(error = %err, code, "request failed");
        }
        AppError {
            status,
            code: code.to_string(),
            message: err.to_string(),
            suggestion: Some(err.retry_suggestion().to_string()),
        }
    }
}

/// The `x-user-id` header.
pub struct ActingUser(pub String);

fn acting_user(parts: &Parts) -> Option<ActingUser> {
    parts
        .headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| ActingUser(v.to_string()))
}

impl<S: Send + Sync> FromRequestParts<S> for ActingUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        acting_user(parts).ok_or_else(|| bad_request(format!("missing {} header", USER_HEADER)))
    }
}

impl<S: Send + Sync> OptionalFromRequestParts<S> for ActingUser {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> Result<Option<Self>, Self::Rejection> {
        Ok(acting_user(parts))
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Bulk sync ============

#[derive(Deserialize)]
struct StartSyncRequest {
    #[serde(rename = "type", default)]
    sync_type: Option<SyncType>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartSyncResponse {
    sync_id: String,
}

async fn handle_start_sync(
    State(app): AppState,
    Json(req): Json<StartSyncRequest>,
) -> (StatusCode, Json<StartSyncResponse>) {
    let sync_id = app.hub.start(req.sync_type.unwrap_or(SyncType::Full));
    (StatusCode::ACCEPTED, Json(StartSyncResponse { sync_id }))
}

async fn handle_running_syncs(State(app): AppState) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "running": app.hub.running() }))
}

async fn handle_sync_state(
    State(app): AppState,
    Path(id): Path<String>,
) -> Result<Json<SyncProgressEvent>, AppError> {
    app.hub
        .latest(&id)
        .map(Json)
        .ok_or_else(|| not_found(format!("unknown sync: {}", id)))
}

fn sse_event(event: &SyncProgressEvent) -> Event {
    Event::default()
        .event(event.event_name())
        .json_data(event.state())
        .unwrap_or_else(|_| Event::default().event(event.event_name()))
}

/// Current snapshot first, then every later one up to the terminal event.
async fn handle_sync_events(
    State(app): AppState,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let (first, rx) = app
        .hub
        .subscribe(&id)
        .ok_or_else(|| not_found(format!("unknown sync: {}", id)))?;

    let events = stream::unfold(
        (Some(first), rx, false),
        |(pending, mut rx, finished)| async move {
            if finished {
                return None;
            }
            let event = match pending {
                Some(event) => event,
                None => hub::next_event(&mut rx).await?,
            };
            let terminal = event.is_terminal();
            Some((Ok::<_, Infallible>(sse_event(&event)), (None, rx, terminal)))
        },
    );
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn handle_cancel_sync(
    State(app): AppState,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    if app.hub.cancel(&id) {
        Ok((
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "syncId": id, "cancelRequested": true })),
        ))
    } else {
        Err(not_found(format!("unknown sync: {}", id)))
    }
}

// ============ Contacts ============

async fn handle_create_contact(
    State(app): AppState,
    user: Option<ActingUser>,
    Json(input): Json<NewContact>,
) -> Result<impl IntoResponse, AppError> {
    let user_id = user.map(|ActingUser(id)| id);
    let created = app.contacts.create(input, user_id.as_deref()).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

#[derive(Deserialize)]
struct ListParams {
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    50
}

async fn handle_list_contacts(
    State(app): AppState,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, AppError> {
    let contacts = app.contacts.list(params.limit, params.offset).await?;
    Ok(Json(serde_json::json!({ "contacts": contacts })))
}

async fn handle_get_contact(
    State(app): AppState,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(app.contacts.get(&id).await?))
}

async fn handle_contact_activities(
    State(app): AppState,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    app.contacts.get(&id).await?;
    let activities = app.activities.list_for_contact(&id).await?;
    Ok(Json(serde_json::json!({ "activities": activities })))
}

#[derive(Deserialize)]
struct WarmnessRequest {
    score: i64,
}

async fn handle_update_warmness(
    State(app): AppState,
    Path(id): Path<String>,
    ActingUser(user_id): ActingUser,
    Json(req): Json<WarmnessRequest>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(app.contacts.update_warmness(&id, req.score, &user_id).await?))
}

async fn handle_promote(
    State(app): AppState,
    Path(id): Path<String>,
    ActingUser(user_id): ActingUser,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(app.promoter.promote(&id, &user_id).await?))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct LifecycleBody {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    sync_remote: Option<bool>,
}

impl LifecycleBody {
    fn into_request(self, actor_id: String) -> LifecycleRequest {
        LifecycleRequest {
            actor_id,
            reason: self.reason,
            sync_remote: self.sync_remote.unwrap_or(true),
        }
    }
}

async fn handle_deactivate(
    State(app): AppState,
    Path(id): Path<String>,
    ActingUser(user_id): ActingUser,
    body: Option<Json<LifecycleBody>>,
) -> Result<impl IntoResponse, AppError> {
    let request = body.map(|Json(b)| b).unwrap_or_default().into_request(user_id);
    Ok(Json(app.lifecycle.deactivate(&id, &request).await?))
}

async fn handle_reactivate(
    State(app): AppState,
    Path(id): Path<String>,
    ActingUser(user_id): ActingUser,
    body: Option<Json<LifecycleBody>>,
) -> Result<impl IntoResponse, AppError> {
    let request = body.map(|Json(b)| b).unwrap_or_default().into_request(user_id);
    Ok(Json(app.lifecycle.reactivate(&id, &request).await?))
}

// ============ Activities ============

async fn handle_log_activity(
    State(app): AppState,
    ActingUser(user_id): ActingUser,
    Json(input): Json<NewActivity>,
) -> Result<impl IntoResponse, AppError> {
    let logged = app.activities.log(&user_id, input).await?;
    Ok((StatusCode::CREATED, Json(logged)))
}

async fn handle_get_activity(
    State(app): AppState,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(app.activities.get(&id).await?))
}

async fn handle_replicate(
    State(app): AppState,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(app.replicator.replicate(&id).await?))
}

// ============ Campaigns ============

async fn handle_create_campaign(
    State(app): AppState,
    Json(input): Json<NewCampaign>,
) -> Result<impl IntoResponse, AppError> {
    let campaign = app.campaigns.create(input).await?;
    Ok((StatusCode::CREATED, Json(campaign)))
}

async fn handle_list_campaigns(State(app): AppState) -> Result<impl IntoResponse, AppError> {
    let campaigns = app.campaigns.list().await?;
    Ok(Json(serde_json::json!({ "campaigns": campaigns })))
}

async fn handle_get_campaign(
    State(app): AppState,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(app.campaigns.get(&id).await?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CampaignContactRequest {
    contact_id: String,
}

async fn handle_add_campaign_contact(
    State(app): AppState,
    Path(id): Path<String>,
    Json(req): Json<CampaignContactRequest>,
) -> Result<impl IntoResponse, AppError> {
    app.campaigns.add_contact(&id, &req.contact_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ Users ============

async fn handle_create_user(
    State(app): AppState,
    Json(input): Json<NewUser>,
) -> Result<impl IntoResponse, AppError> {
    let user = app.users.create(input).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

async fn handle_get_user(
    State(app): AppState,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(app.users.get(&id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_errors_map_to_documented_statuses() {
        let cases = [
            (SyncError::Validation("x".into()), 422, "validation"),
            (SyncError::NotFound("x".into()), 404, "not_found"),
            (SyncError::Configuration("x".into()), 412, "configuration"),
            (SyncError::Api(ApiErrorKind::AuthExpired), 401, "remote_auth_expired"),
            (
                SyncError::Api(ApiErrorKind::RateLimited { retry_after_secs: None }),
                429,
                "rate_limited",
            ),
            (
                SyncError::Api(ApiErrorKind::NetworkError("down".into())),
                502,
                "remote_error",
            ),
            (SyncError::Inconsistent("x".into()), 500, "inconsistent"),
        ];
        for (err, status, code) in cases {
            let app_err = AppError::from(err);
            assert_eq!(app_err.status.as_u16(), status);
            assert_eq!(app_err.code, code);
            assert!(app_err.suggestion.is_some());
        }
    }
}
