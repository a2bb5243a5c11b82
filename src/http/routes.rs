//! REST endpoints.
//!
//! All bodies are JSON. Non-public endpoints expect the shared API key in
//! the `x-api-key` header, compared constant-time. Errors translate to a
//! structured `{error, details}` body with the usual status codes: 400
//! malformed, 401 unauthorized, 404 unknown session, 503 dependency
//! unavailable, 500 internal.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::warn;
use uuid::Uuid;

use crate::agent::Agent;
use crate::audio::AudioError;
use crate::broker::BrokerError;
use crate::platform::PowerAction;

use super::stream;

pub fn build_router(agent: Arc<Agent>) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/sessions/desktop", post(create_desktop_session))
        .route("/api/v1/sessions/desktop/:id/end", post(end_desktop_session))
        .route("/api/v1/power", post(power))
        .route("/api/v1/audio/state", get(audio_state))
        .route("/api/v1/audio/device", post(audio_device))
        .route("/api/v1/audio/session", post(audio_session))
        .route("/ws/desktop", get(stream::desktop_stream))
        .with_state(agent)
        .layer(TraceLayer::new_for_http())
}

/// Structured error response body.
pub struct ApiError {
    status: StatusCode,
    error: &'static str,
    details: String,
}

impl ApiError {
    fn new(status: StatusCode, error: &'static str, details: impl Into<String>) -> Self {
        Self {
            status,
            error,
            details: details.into(),
        }
    }

    fn unauthorized(details: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", details)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.error,
            "details": self.details,
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<BrokerError> for ApiError {
    fn from(error: BrokerError) -> Self {
        match error {
            BrokerError::CallerNotAllowed => ApiError::unauthorized("caller is not allowed"),
            BrokerError::SessionLimit => ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "session_limit",
                "maximum concurrent sessions reached",
            ),
            BrokerError::UnknownToken | BrokerError::ExpiredToken => {
                ApiError::unauthorized(error.to_string())
            }
            BrokerError::UnknownSession => ApiError::new(
                StatusCode::NOT_FOUND,
                "unknown_session",
                "no such desktop session",
            ),
        }
    }
}

impl From<AudioError> for ApiError {
    fn from(error: AudioError) -> Self {
        match error {
            AudioError::Unavailable => ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "audio_unavailable",
                error.to_string(),
            ),
            AudioError::UnknownDevice(_) | AudioError::UnknownSession(_) => {
                ApiError::new(StatusCode::BAD_REQUEST, "bad_request", error.to_string())
            }
        }
    }
}

/// Constant-time API key check against the `x-api-key` header.
fn authorize(agent: &Agent, headers: &HeaderMap) -> Result<(), ApiError> {
    let provided = headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");

    let expected = agent.settings.api_key.as_bytes();
    if expected.is_empty() {
        return Err(ApiError::unauthorized("api key not configured"));
    }

    ring::constant_time::verify_slices_are_equal(provided.as_bytes(), expected)
        .map_err(|_| ApiError::unauthorized("invalid api key"))
}

fn rfc3339(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RemoteDesktopHealth {
    running: bool,
    state: String,
    degraded: bool,
    last_frame_at: Option<u64>,
    frames_published: u64,
    subscribers: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    agent_id: String,
    uptime_seconds: u64,
    remote_desktop: RemoteDesktopHealth,
    active_sessions: usize,
}

async fn health(
    State(agent): State<Arc<Agent>>,
    headers: HeaderMap,
) -> Result<Json<HealthResponse>, ApiError> {
    if agent.settings.require_auth_for_health {
        authorize(&agent, &headers)?;
    }

    let capture = agent.engine.status();
    Ok(Json(HealthResponse {
        agent_id: agent.agent_id.clone(),
        uptime_seconds: agent.uptime().as_secs(),
        remote_desktop: RemoteDesktopHealth {
            running: capture.running,
            state: agent.session.current().mode.as_str().to_string(),
            degraded: capture.degraded,
            last_frame_at: capture.last_frame_at,
            frames_published: capture.frames_published,
            subscribers: capture.subscribers,
        },
        active_sessions: agent.broker.active_session_count(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest {
    caller_id: String,
    ttl_seconds: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionResponse {
    session_id: String,
    stream_url: String,
    expires_at: String,
}

async fn create_desktop_session(
    State(agent): State<Arc<Agent>>,
    headers: HeaderMap,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Json<CreateSessionResponse>, ApiError> {
    authorize(&agent, &headers)?;

    let (session, token) = agent
        .broker
        .start_session(&request.caller_id, Duration::from_secs(request.ttl_seconds))?;

    let scheme = if agent.settings.tls.configured() {
        "wss"
    } else {
        "ws"
    };
    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| format!("127.0.0.1:{}", agent.settings.listen_port));

    Ok(Json(CreateSessionResponse {
        session_id: session.id.to_string(),
        stream_url: format!(
            "{scheme}://{host}/ws/desktop?sess={}&token={}",
            session.id, token.token
        ),
        expires_at: rfc3339(session.expires_at),
    }))
}

async fn end_desktop_session(
    State(agent): State<Arc<Agent>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&agent, &headers)?;

    if agent.broker.get_session(id).is_none() {
        return Err(BrokerError::UnknownSession.into());
    }
    agent.broker.end_session(id);
    Ok(Json(json!({ "ended": true })))
}

#[derive(Debug, Deserialize)]
struct PowerRequest {
    action: PowerAction,
}

async fn power(
    State(agent): State<Arc<Agent>>,
    headers: HeaderMap,
    Json(request): Json<PowerRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&agent, &headers)?;

    agent.power.request(request.action).map_err(|e| {
        warn!("power action failed: {}", e);
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "power_failed",
            e.to_string(),
        )
    })?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn audio_state(
    State(agent): State<Arc<Agent>>,
    headers: HeaderMap,
) -> Result<Json<crate::audio::AudioState>, ApiError> {
    authorize(&agent, &headers)?;
    Ok(Json(agent.audio.state()?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AudioDeviceRequest {
    device_id: String,
}

async fn audio_device(
    State(agent): State<Arc<Agent>>,
    headers: HeaderMap,
    Json(request): Json<AudioDeviceRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&agent, &headers)?;
    agent.audio.set_default_device(&request.device_id)?;
    Ok(Json(json!({ "status": "ok" })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AudioSessionRequest {
    session_key: String,
    device_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AudioSessionResponse {
    status: &'static str,
    applied_to: crate::audio::SessionTarget,
}

async fn audio_session(
    State(agent): State<Arc<Agent>>,
    headers: HeaderMap,
    Json(request): Json<AudioSessionRequest>,
) -> Result<Json<AudioSessionResponse>, ApiError> {
    authorize(&agent, &headers)?;
    let outcome = agent
        .audio
        .set_session_route(&request.session_key, &request.device_id)?;
    Ok(Json(AudioSessionResponse {
        status: "ok",
        applied_to: outcome.applied_to,
    }))
}
