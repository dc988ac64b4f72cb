//! Health, status and operator API
//!
//! - GET  /health                      - Liveness
//! - GET  /status                      - Event counts per state, uptime
//! - GET  /metrics                     - Prometheus metrics
//! - GET  /events/{key}                - One event with its attempts and audit trail
//! - GET  /dead-letters                - Open dead letters
//! - POST /dead-letters/{key}/retry    - Re-queue (admin token)
//! - POST /dead-letters/{key}/discard  - Discard (admin token)

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use eyre::eyre;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::admin::{self, AdminError, OperatorRequest};
use crate::db::{AuditEntry, BridgeEvent, EventStore, RelayAttempt, StateCounts};
use crate::metrics;
use crate::types::{EventState, IdempotencyKey};

const DEFAULT_LIST_LIMIT: i64 = 100;
const MAX_LIST_LIMIT: i64 = 1000;

/// Shared state for the HTTP server
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EventStore>,
    /// Operator actions are refused when unset
    pub admin_token: Option<String>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(store: Arc<dyn EventStore>, admin_token: Option<String>) -> Self {
        Self {
            store,
            admin_token,
            started_at: Instant::now(),
        }
    }
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub events: StateCounts,
}

#[derive(Serialize)]
pub struct EventDetail {
    pub event: BridgeEvent,
    pub attempts: Vec<RelayAttempt>,
    pub audit: Vec<AuditEntry>,
}

#[derive(Debug, Deserialize)]
pub struct DeadLetterQuery {
    pub limit: Option<i64>,
    #[serde(default)]
    pub include_discarded: bool,
}

/// Body of an operator action
#[derive(Debug, Deserialize)]
pub struct OperatorBody {
    pub actor: String,
    pub reason: Option<String>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

fn internal_error(context: &str, e: eyre::Report) -> Response {
    error!(error = %e, "{}", context);
    metrics::record_error("api", "store");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, context)
}

fn parse_key(raw: &str) -> Result<IdempotencyKey, Response> {
    raw.parse()
        .map_err(|e: crate::types::ParseError| error_response(StatusCode::BAD_REQUEST, e.to_string()))
}

/// Liveness probe (always returns OK if server is running)
async fn health() -> &'static str {
    "OK"
}

async fn status(State(state): State<AppState>) -> Response {
    match state.store.count_by_state().await {
        Ok(counts) => {
            metrics::set_state_counts(&counts);
            Json(StatusResponse {
                status: "ok".to_string(),
                uptime_seconds: state.started_at.elapsed().as_secs(),
                events: counts,
            })
            .into_response()
        }
        Err(e) => internal_error("Failed to count events", e),
    }
}

/// Prometheus metrics endpoint
async fn prometheus_metrics() -> Response {
    match metrics::encode() {
        Ok((content_type, buffer)) => {
            ([(header::CONTENT_TYPE, content_type)], buffer).into_response()
        }
        Err(_) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics"),
    }
}

async fn event_detail(State(state): State<AppState>, Path(raw_key): Path<String>) -> Response {
    let key = match parse_key(&raw_key) {
        Ok(key) => key,
        Err(resp) => return resp,
    };

    let event = match state.store.get_event(&key).await {
        Ok(Some(event)) => event,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, format!("event {} not found", key)),
        Err(e) => return internal_error("Failed to load event", e),
    };
    let attempts = match state.store.list_attempts(&key).await {
        Ok(attempts) => attempts,
        Err(e) => return internal_error("Failed to load attempts", e),
    };
    let audit = match state.store.list_audit(&key).await {
        Ok(audit) => audit,
        Err(e) => return internal_error("Failed to load audit trail", e),
    };

    Json(EventDetail {
        event,
        attempts,
        audit,
    })
    .into_response()
}

async fn dead_letters(
    State(state): State<AppState>,
    Query(query): Query<DeadLetterQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    match state
        .store
        .list_by_state(EventState::DeadLettered, None, limit)
        .await
    {
        Ok(events) => {
            let events: Vec<BridgeEvent> = events
                .into_iter()
                .filter(|e| query.include_discarded || e.discarded_at.is_none())
                .collect();
            Json(events).into_response()
        }
        Err(e) => internal_error("Failed to list dead letters", e),
    }
}

/// Check the `Authorization: Bearer <token>` header against the admin token
fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(error_response(
            StatusCode::FORBIDDEN,
            "operator actions are disabled (API_ADMIN_TOKEN not set)",
        ));
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match presented {
        Some(token) if token == expected => Ok(()),
        _ => {
            warn!("Rejected operator request with missing or invalid token");
            Err(error_response(StatusCode::UNAUTHORIZED, "invalid admin token"))
        }
    }
}

fn admin_response(result: Result<BridgeEvent, AdminError>) -> Response {
    match result {
        Ok(event) => Json(event).into_response(),
        Err(e @ AdminError::NotFound(_)) => error_response(StatusCode::NOT_FOUND, e.to_string()),
        Err(e @ AdminError::NotDeadLettered { .. }) => {
            error_response(StatusCode::CONFLICT, e.to_string())
        }
        Err(e @ AdminError::MissingActor) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
        Err(AdminError::Store(e)) => internal_error("Operator action failed", e),
    }
}

async fn retry_dead_letter(
    State(state): State<AppState>,
    Path(raw_key): Path<String>,
    headers: HeaderMap,
    Json(body): Json<OperatorBody>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    let key = match parse_key(&raw_key) {
        Ok(key) => key,
        Err(resp) => return resp,
    };
    let request = OperatorRequest::new(body.actor, body.reason);
    admin_response(admin::retry_dead_letter(state.store.as_ref(), &key, &request).await)
}

async fn discard_dead_letter(
    State(state): State<AppState>,
    Path(raw_key): Path<String>,
    headers: HeaderMap,
    Json(body): Json<OperatorBody>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    let key = match parse_key(&raw_key) {
        Ok(key) => key,
        Err(resp) => return resp,
    };
    let request = OperatorRequest::new(body.actor, body.reason);
    admin_response(admin::discard_dead_letter(state.store.as_ref(), &key, &request).await)
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/metrics", get(prometheus_metrics))
        .route("/events/{key}", get(event_detail))
        .route("/dead-letters", get(dead_letters))
        .route("/dead-letters/{key}/retry", post(retry_dead_letter))
        .route("/dead-letters/{key}/discard", post(discard_dead_letter))
        .with_state(state)
}

/// Start the API server
pub async fn start_api_server(bind_address: &str, port: u16, state: AppState) -> eyre::Result<()> {
    let operator_actions = state.admin_token.is_some();
    let addr: SocketAddr = format!("{}:{}", bind_address, port)
        .parse()
        .map_err(|e| eyre!("Invalid bind address {}:{}: {}", bind_address, port, e))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, operator_actions, "API server started");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryEventStore;
    use axum::http::HeaderValue;

    fn state(token: Option<&str>) -> AppState {
        AppState::new(Arc::new(MemoryEventStore::new()), token.map(str::to_string))
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );
        headers
    }

    #[test]
    fn test_authorize() {
        let open = state(None);
        assert_eq!(
            authorize(&open, &bearer("x")).unwrap_err().status(),
            StatusCode::FORBIDDEN
        );

        let locked = state(Some("s3cret"));
        assert!(authorize(&locked, &bearer("s3cret")).is_ok());
        assert_eq!(
            authorize(&locked, &bearer("wrong")).unwrap_err().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            authorize(&locked, &HeaderMap::new()).unwrap_err().status(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[tokio::test]
    async fn test_status_zero_fills_states() {
        let resp = status(State(state(None))).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_event_is_404_and_bad_key_is_400() {
        let resp = event_detail(State(state(None)), Path("chainA:0xabc:7".to_string())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = event_detail(State(state(None)), Path("nonsense".to_string())).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_retry_requires_token() {
        let body = || {
            Json(OperatorBody {
                actor: "alice".to_string(),
                reason: None,
            })
        };
        let resp = retry_dead_letter(
            State(state(None)),
            Path("chainA:0xabc:2".to_string()),
            bearer("anything"),
            body(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = retry_dead_letter(
            State(state(Some("t"))),
            Path("chainA:0xabc:2".to_string()),
            bearer("t"),
            body(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
