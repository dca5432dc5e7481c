//! HTTP surface: a single route dispatched on the `action` query parameter.
//!
//! Handlers compose the subsystems and own the translation from the error
//! taxonomy to status codes. Raw backend errors never reach a response
//! body. Every response carries a no-cache directive and varies on the
//! credential header.
//!
//! | Method | action  | Behavior                                   |
//! |--------|---------|--------------------------------------------|
//! | GET    | (none)  | read current document (admin/public view)  |
//! | GET    | auth    | report the caller's role and permissions   |
//! | POST   | login   | credential check (rate limited)            |
//! | POST   | (none)  | write document with optional optimistic lock |
//! | POST   | backup  | create a manual snapshot                   |
//! | GET    | backup  | fetch one backup by key                    |
//! | GET    | backups | list history entries                       |
//! | POST   | restore | restore a backup, creating a rollback point |
//! | DELETE | backup  | delete one backup by key                   |

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::auth::{
    credentials_match, derive_identity, AuthOutcome, ClientHints, RateLimiter,
};
use crate::document::{SyncDocument, WriteRequest};
use crate::history::{BackupError, BackupManager};
use crate::record::{RecordError, RecordStore};
use crate::sanitize;
use crate::storage::StorageError;

/// Shared application state handed to every handler.
pub struct AppState {
    pub records: Arc<RecordStore>,
    pub backups: Arc<BackupManager>,
    pub limiter: Arc<RateLimiter>,
    pub admin_token: String,
}

pub type SharedState = Arc<AppState>;

/// Builds the router. One path, method-routed, action-dispatched.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route(
            "/",
            get(handle_get).post(handle_post).delete(handle_delete),
        )
        .layer(axum::middleware::map_response(set_common_headers))
        .with_state(state)
}

async fn set_common_headers(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(header::VARY, HeaderValue::from_static("authorization"));
    response
}

#[derive(Debug, Deserialize)]
struct ActionQuery {
    action: Option<String>,
    key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestoreRequest {
    key: String,
    #[serde(default)]
    device_id: Option<String>,
}

/// Handler-layer error, already mapped to a status code and envelope.
enum ApiError {
    Validation(String),
    Unauthorized { remaining: Option<u32> },
    NotFound(String),
    Conflict { latest: Box<SyncDocument> },
    PayloadTooLarge { size: usize, limit: usize },
    Locked { locked_until: i64, retry_after_secs: u64 },
    Internal,
}

type ApiResult = Result<Response, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Validation(message) => (
                StatusCode::BAD_REQUEST,
                Json(json!({"success": false, "error": message})),
            )
                .into_response(),
            ApiError::Unauthorized { remaining } => {
                let mut body = json!({"success": false, "error": "missing or incorrect credential"});
                if let Some(remaining) = remaining {
                    body["remainingAttempts"] = json!(remaining);
                }
                (StatusCode::UNAUTHORIZED, Json(body)).into_response()
            }
            ApiError::NotFound(message) => (
                StatusCode::NOT_FOUND,
                Json(json!({"success": false, "error": message})),
            )
                .into_response(),
            ApiError::Conflict { latest } => (
                StatusCode::CONFLICT,
                Json(json!({
                    "success": false,
                    "error": "version conflict",
                    "data": *latest,
                })),
            )
                .into_response(),
            ApiError::PayloadTooLarge { size, limit } => (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(json!({
                    "success": false,
                    "error": format!("payload of {size} bytes exceeds the {limit}-byte limit"),
                })),
            )
                .into_response(),
            ApiError::Locked {
                locked_until,
                retry_after_secs,
            } => {
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(json!({
                        "success": false,
                        "error": "too many failed attempts",
                        "lockedUntil": locked_until,
                        "retryAfterSeconds": retry_after_secs,
                    })),
                )
                    .into_response();
                if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
                response
            }
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"success": false, "error": "internal storage failure"})),
            )
                .into_response(),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        warn!(error = %e, "storage failure reached the handler layer");
        ApiError::Internal
    }
}

impl From<RecordError> for ApiError {
    fn from(e: RecordError) -> Self {
        match e {
            RecordError::Conflict { latest } => ApiError::Conflict { latest },
            RecordError::PayloadTooLarge { size, limit } => {
                ApiError::PayloadTooLarge { size, limit }
            }
            RecordError::Storage(e) => e.into(),
            RecordError::Codec(e) => {
                warn!(error = %e, "stored document failed to decode");
                ApiError::Internal
            }
        }
    }
}

impl From<BackupError> for ApiError {
    fn from(e: BackupError) -> Self {
        match e {
            BackupError::InvalidKey(key) => ApiError::Validation(format!("invalid backup key: {key}")),
            BackupError::NotFound(key) => ApiError::NotFound(format!("backup not found: {key}")),
            BackupError::ActiveEntry => ApiError::Validation(
                "the history entry for the current version cannot be deleted".to_string(),
            ),
            BackupError::PayloadTooLarge { size, limit } => {
                ApiError::PayloadTooLarge { size, limit }
            }
            BackupError::Storage(e) => e.into(),
            BackupError::Codec(e) => {
                warn!(error = %e, "backup payload failed to decode");
                ApiError::Internal
            }
            BackupError::Record(e) => e.into(),
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)?
        .to_str()
        .ok()
        .map(|value| value.to_string())
        .filter(|value| !value.trim().is_empty())
}

fn client_hints(headers: &HeaderMap) -> ClientHints {
    ClientHints {
        client_ip: header_str(headers, "x-client-ip"),
        forwarded_ip: header_str(headers, "x-forwarded-for")
            .and_then(|chain| chain.split(',').next().map(|ip| ip.trim().to_string()))
            .filter(|ip| !ip.is_empty()),
        user_agent: header_str(headers, "user-agent"),
        accept_language: header_str(headers, "accept-language"),
        accept_encoding: header_str(headers, "accept-encoding"),
        client_hints_ua: header_str(headers, "sec-ch-ua"),
    }
}

/// Role check for read paths: validates the credential without touching the
/// rate limiter, so stale readers cannot lock an identity out.
fn is_admin(state: &AppState, headers: &HeaderMap) -> bool {
    bearer_token(headers)
        .map(|token| credentials_match(token, &state.admin_token))
        .unwrap_or(false)
}

/// Rate-limited credential gate for mutating and privileged operations.
async fn require_admin(
    state: &AppState,
    headers: &HeaderMap,
    force_clear: bool,
) -> Result<(), ApiError> {
    let token = bearer_token(headers).ok_or(ApiError::Unauthorized { remaining: None })?;
    let identity = derive_identity(&client_hints(headers));
    match state
        .limiter
        .check_and_record(&identity, token, &state.admin_token, force_clear)
        .await?
    {
        AuthOutcome::Allowed => Ok(()),
        AuthOutcome::WrongCredential { remaining } => Err(ApiError::Unauthorized {
            remaining: Some(remaining),
        }),
        AuthOutcome::LockedOut {
            locked_until,
            retry_after_secs,
        } => Err(ApiError::Locked {
            locked_until,
            retry_after_secs,
        }),
    }
}

fn ok(body: Value) -> Response {
    (StatusCode::OK, Json(body)).into_response()
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::Validation(format!("malformed body: {e}")))
}

async fn handle_get(
    State(state): State<SharedState>,
    Query(query): Query<ActionQuery>,
    headers: HeaderMap,
) -> ApiResult {
    match query.action.as_deref() {
        None => read_document(&state, &headers).await,
        Some("auth") => auth_status(&state, &headers).await,
        Some("backup") => {
            require_admin(&state, &headers, false).await?;
            let key = query
                .key
                .ok_or_else(|| ApiError::Validation("missing key parameter".to_string()))?;
            let doc = state.backups.get(&key).await?;
            Ok(ok(json!({
                "success": true,
                "key": key,
                "data": sanitize::admin_view(&doc),
            })))
        }
        Some("backups") => {
            require_admin(&state, &headers, false).await?;
            let items = state.backups.list().await?;
            Ok(ok(json!({"success": true, "backups": items})))
        }
        Some(other) => Err(ApiError::Validation(format!("unknown action: {other}"))),
    }
}

async fn read_document(state: &AppState, headers: &HeaderMap) -> ApiResult {
    let current = state.records.read_current().await?;
    let admin = is_admin(state, headers);
    let data = current.map(|(doc, _)| {
        if admin {
            sanitize::admin_view(&doc)
        } else {
            sanitize::public_view(&doc)
        }
    });
    Ok(ok(json!({"success": true, "data": data})))
}

async fn auth_status(state: &AppState, headers: &HeaderMap) -> ApiResult {
    if bearer_token(headers).is_none() {
        return Ok(ok(json!({
            "success": true,
            "role": "public",
            "permissions": {"read": true, "write": false},
        })));
    }
    // Designated force-clear endpoint.
    require_admin(state, headers, true).await?;
    Ok(ok(json!({
        "success": true,
        "role": "admin",
        "permissions": {"read": true, "write": true},
    })))
}

async fn handle_post(
    State(state): State<SharedState>,
    Query(query): Query<ActionQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult {
    match query.action.as_deref() {
        Some("login") => {
            // The other designated force-clear endpoint.
            require_admin(&state, &headers, true).await?;
            Ok(ok(json!({"success": true, "role": "admin"})))
        }
        None => {
            require_admin(&state, &headers, false).await?;
            write_document(&state, &body).await
        }
        Some("backup") => {
            require_admin(&state, &headers, false).await?;
            let (current, _) = state
                .records
                .read_current()
                .await?
                .ok_or_else(|| ApiError::Validation("no document to snapshot".to_string()))?;
            let key = state.backups.create_snapshot(&current).await?;
            Ok(ok(json!({"success": true, "key": key})))
        }
        Some("restore") => {
            require_admin(&state, &headers, false).await?;
            let request: RestoreRequest = parse_body(&body)?;
            let device_id = request.device_id.as_deref().unwrap_or("unknown");
            let (restored, rollback_key) =
                state.backups.restore(&request.key, device_id).await?;
            Ok(ok(json!({
                "success": true,
                "data": sanitize::admin_view(&restored),
                "rollbackKey": rollback_key,
            })))
        }
        Some(other) => Err(ApiError::Validation(format!("unknown action: {other}"))),
    }
}

async fn write_document(state: &AppState, body: &Bytes) -> ApiResult {
    let request: WriteRequest = parse_body(body)?;
    let kind = request.document.meta.sync_kind;

    let written = state
        .records
        .write(request.document, request.expected_version)
        .await?;

    // History recording degrades gracefully: a failure here leaves the key
    // out of the response but never fails the accepted write.
    let history_key = match state
        .backups
        .create_history_entry(&written, kind, false)
        .await
    {
        Ok(key) => key,
        Err(e) => {
            warn!(error = %e, "failed to record history entry for accepted write");
            None
        }
    };

    Ok(ok(json!({
        "success": true,
        "data": sanitize::admin_view(&written),
        "historyKey": history_key,
    })))
}

async fn handle_delete(
    State(state): State<SharedState>,
    Query(query): Query<ActionQuery>,
    headers: HeaderMap,
) -> ApiResult {
    match query.action.as_deref() {
        Some("backup") => {
            require_admin(&state, &headers, false).await?;
            let key = query
                .key
                .ok_or_else(|| ApiError::Validation("missing key parameter".to_string()))?;
            state.backups.delete(&key).await?;
            Ok(ok(json!({"success": true})))
        }
        _ => Err(ApiError::Validation(
            "delete supports only action=backup".to_string(),
        )),
    }
}
