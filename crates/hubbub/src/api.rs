//! HTTP surface for sessions.
//!
//! | Method | Path                           |          |
//! |--------|--------------------------------|----------|
//! | POST   | `/api/session`                 | create   |
//! | POST   | `/api/session/{id}/reset`      | reset    |
//! | GET    | `/api/session/{id}/events`     | SSE      |
//! | POST   | `/api/session/{id}/message`    | `{text}` |
//! | DELETE | `/api/session/{id}`            | delete   |
//! | GET    | `/health`                      |          |

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::OwnedMutexGuard;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::events::{Event, Level};
use crate::session::{EventReceiver, EventStream, SessionError, SessionInfo, SessionManager};

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self {
            sessions,
            start_time: Instant::now(),
        }
    }
}

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Upstream(String),
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotFound(_) => ApiError::NotFound("Session not found".to_string()),
            SessionError::Discovery(e) => ApiError::Upstream(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::Upstream(m) => (StatusCode::BAD_GATEWAY, m),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub fn router(state: AppState, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/api/session", post(create_session))
        .route("/api/session/{id}", delete(delete_session))
        .route("/api/session/{id}/reset", post(reset_session))
        .route("/api/session/{id}/events", get(stream_events))
        .route("/api/session/{id}/message", post(post_message))
        .route("/health", get(health))
        .with_state(state)
        .layer(cors(allowed_origins))
        .layer(TraceLayer::new_for_http())
}

fn cors(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.sessions.len(),
    }))
}

async fn create_session(State(state): State<AppState>) -> Result<Json<SessionInfo>, ApiError> {
    Ok(Json(state.sessions.create().await?))
}

async fn reset_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.sessions.reset(&id)?;
    Ok(Json(json!({ "ok": true })))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.sessions.remove(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct MessageBody {
    #[serde(default)]
    text: Option<String>,
}

async fn post_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<MessageBody>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    if !state.sessions.contains(&id) {
        return Err(ApiError::NotFound("Session not found".to_string()));
    }

    let text = body
        .ok()
        .and_then(|Json(body)| body.text)
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("Missing 'text'".to_string()))?;

    state.sessions.post_message(&id, &text)?;
    Ok(StatusCode::ACCEPTED)
}

enum Reader {
    Waiting(EventStream),
    Attached(OwnedMutexGuard<EventReceiver>),
}

#[tracing::instrument(skip_all, fields(session_id = %id))]
async fn stream_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let queue = state.sessions.events(&id)?;
    tracing::info!("observer connected");

    let greeting = stream::once(async { Event::status(Level::Info, "connected") });
    let queued = stream::unfold(Reader::Waiting(queue), |reader| async move {
        let mut guard = match reader {
            Reader::Waiting(queue) => queue.attach().await,
            Reader::Attached(guard) => guard,
        };
        let event = guard.recv().await?;
        Some((event, Reader::Attached(guard)))
    });

    let stream = greeting
        .chain(queued)
        .map(|event| Ok(SseEvent::default().data(event.to_json())));

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    ))
}
