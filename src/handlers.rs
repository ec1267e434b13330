//! Thin HTTP handlers translating wire requests into relay operations

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{sse::Event as WireEvent, IntoResponse, Json, Sse},
    routing::{get, post},
    Router,
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tokio_stream::StreamExt;

use chart_relay::{
    ChartAction, ChartState, Event, Frame, KvStore, RelayHealth, RelayService, SessionKey,
};

#[derive(Clone)]
pub struct AppState<S: KvStore> {
    pub relay: RelayService<S>,
}

pub fn router<S: KvStore>(relay: RelayService<S>) -> Router {
    Router::new()
        .route("/health", get(health::<S>))
        .route("/webhook", post(publish_message::<S>))
        .route("/charts", post(publish_chart::<S>))
        .route("/charts/snapshot", get(snapshot::<S>))
        .route("/events", get(connect::<S>))
        .route("/session/clear", post(clear_session::<S>))
        .with_state(AppState { relay })
}

#[derive(Deserialize)]
struct WebhookRequest {
    content: String,
    session: Option<String>,
}

#[derive(Deserialize)]
struct ChartRequest {
    action: ChartAction,
    chart_id: String,
    config: Option<serde_json::Value>,
    session: Option<String>,
}

#[derive(Serialize)]
struct PublishResponse {
    event: Event,
}

async fn publish_message<S: KvStore>(
    State(state): State<AppState<S>>,
    Json(req): Json<WebhookRequest>,
) -> axum::response::Response {
    let session = SessionKey::from_option(req.session);
    match state.relay.publish_message(req.content, session) {
        Ok(event) => Json(PublishResponse { event }).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

async fn publish_chart<S: KvStore>(
    State(state): State<AppState<S>>,
    Json(req): Json<ChartRequest>,
) -> axum::response::Response {
    let session = SessionKey::from_option(req.session);
    match state
        .relay
        .publish_chart(req.action, req.chart_id, req.config, session)
    {
        Ok(event) => Json(PublishResponse { event }).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

#[derive(Deserialize)]
struct SessionQuery {
    session: Option<String>,
    /// `transport=poll` selects KV polling instead of in-process fan-out
    transport: Option<String>,
}

async fn connect<S: KvStore>(
    State(state): State<AppState<S>>,
    Query(query): Query<SessionQuery>,
) -> Sse<impl Stream<Item = Result<WireEvent, Infallible>>> {
    let session = SessionKey::from_option(query.session);
    let stream = if query.transport.as_deref() == Some("poll") {
        state.relay.connect_polling(session, None).await
    } else {
        state.relay.connect(session).await
    };

    // Client disconnect drops the stream, which deregisters the session
    Sse::new(stream.map(|frame| Ok(frame_to_wire(frame))))
}

fn frame_to_wire(frame: Frame) -> WireEvent {
    match &frame {
        // Heartbeats go out as SSE comment lines
        Frame::Heartbeat { ts_ms } => WireEvent::default().comment(format!("heartbeat {}", ts_ms)),
        Frame::Connected { .. } => WireEvent::default()
            .event("connected")
            .data(serde_json::to_string(&frame).unwrap_or_default()),
        Frame::Event { event, .. } => WireEvent::default()
            .event("message")
            .id(event.id.clone())
            .data(serde_json::to_string(&frame).unwrap_or_default()),
    }
}

#[derive(Serialize)]
struct SnapshotResponse {
    charts: Vec<ChartState>,
}

async fn snapshot<S: KvStore>(
    State(state): State<AppState<S>>,
    Query(query): Query<SessionQuery>,
) -> Json<SnapshotResponse> {
    let session = SessionKey::from_option(query.session);
    Json(SnapshotResponse {
        charts: state.relay.snapshot(&session).await,
    })
}

#[derive(Deserialize)]
struct ClearRequest {
    session: Option<String>,
    /// Also drop the stored logs for this partition
    #[serde(default)]
    durable: bool,
}

#[derive(Serialize)]
struct ClearResponse {
    removed: usize,
}

async fn clear_session<S: KvStore>(
    State(state): State<AppState<S>>,
    Json(req): Json<ClearRequest>,
) -> Json<ClearResponse> {
    let session = SessionKey::from_option(req.session);
    let removed = state.relay.clear_session(&session);
    if req.durable {
        if let Err(e) = state.relay.clear_durable(&session).await {
            tracing::warn!(error = %e, "Durable clear failed");
        }
    }
    Json(ClearResponse { removed })
}

async fn health<S: KvStore>(State(state): State<AppState<S>>) -> Json<RelayHealth> {
    Json(state.relay.health())
}
