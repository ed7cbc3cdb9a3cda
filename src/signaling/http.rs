//! Public API surface: axum routes mounting the WebRTC
//! offer/answer endpoint, the WebSocket/telephone bridges, input/output
//! hooks, health and metrics.
//!
//! One `Router` assembled from `.route(...)` calls over `State<Arc<...>>`
//! extractors, served via `axum::serve` over a bound `TcpListener`. No
//! static-asset or embedded-UI serving — there is no web UI to mount.

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use futures::stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;

use crate::config::Config;
use crate::handler::Handler;
use crate::metrics::Metrics;
use crate::session::SessionManager;

use super::telephone;
use super::webrtc::{self as rtc, PeerConnectionFactory};
use super::websocket::{self, ConnectionOptions, TurnTakingFactory};

pub struct AppState {
    pub config: Config,
    pub session_manager: Arc<SessionManager>,
    pub peer_connection_factory: PeerConnectionFactory,
    pub metrics: Arc<Metrics>,
    pub handler_factory: Box<dyn Fn() -> Box<dyn Handler> + Send + Sync>,
    /// `None` routes `/websocket/offer` and `/telephone/*` through the raw
    /// `handler_factory` contract; `Some` switches them onto the
    /// `VadGate`/`StopwordDetector`/`TurnTakingEngine` pipeline instead.
    pub turn_taking: Option<Arc<TurnTakingFactory>>,
    pub started_at: std::time::Instant,
}

#[derive(Debug, Deserialize)]
pub struct OfferRequest {
    pub sdp: String,
    #[serde(rename = "type")]
    pub sdp_type: String,
    pub webrtc_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum OfferResponse {
    Ok {
        sdp: String,
        #[serde(rename = "type")]
        sdp_type: String,
        webrtc_id: String,
    },
    Failed {
        status: &'static str,
        meta: serde_json::Value,
    },
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/webrtc/offer", post(webrtc_offer))
        .route("/websocket/offer", get(websocket_offer))
        .route("/telephone/{*path}", get(telephone_bridge))
        .route("/input", post(set_input))
        .route("/output/{session_id}", get(fetch_output))
        .route("/turn", get(turn_config))
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .with_state(state)
}

async fn webrtc_offer(State(state): State<Arc<AppState>>, Json(req): Json<OfferRequest>) -> impl IntoResponse {
    let session_config = &state.config.session;

    let peer_connection = match state
        .peer_connection_factory
        .create(session_config.modality, session_config.mode)
        .await
    {
        Ok(pc) => pc,
        Err(e) => {
            return (
                StatusCode::OK,
                Json(OfferResponse::Failed {
                    status: "failed",
                    meta: json!({"error": "negotiation_failed", "detail": e.to_string()}),
                }),
            )
        }
    };

    let session = match state
        .session_manager
        .create_session(
            req.webrtc_id.clone(),
            (state.handler_factory)(),
            state.config.queue.inbound_queue_capacity,
            false,
        )
        .await
    {
        Ok(s) => s,
        Err(e) => {
            state.metrics.admission_rejections_total.inc();
            let limit = state.config.session.concurrency_limit.unwrap_or(0);
            return (
                StatusCode::OK,
                Json(OfferResponse::Failed {
                    status: "failed",
                    meta: json!({"error": e.to_string(), "limit": limit}),
                }),
            );
        }
    };
    state.metrics.sessions_created_total.inc();
    state.metrics.active_sessions.inc();

    if session_config.modality != crate::config::Modality::Video {
        let outbound_track = state.peer_connection_factory.create_outbound_audio_track();
        if let Err(e) = rtc::attach_outbound_track(&peer_connection, session_config.mode, outbound_track.clone()).await {
            state.session_manager.remove_session(&session.id).await;
            state.metrics.active_sessions.dec();
            return (
                StatusCode::OK,
                Json(OfferResponse::Failed {
                    status: "failed",
                    meta: json!({"error": e.to_string()}),
                }),
            );
        }
        rtc::attach_audio_bridge(
            &peer_connection,
            outbound_track,
            session.clone(),
            state.session_manager.clone(),
            connection_options(&state, false),
        );
    }

    let negotiation_timeout = std::time::Duration::from_secs(session_config.negotiation_timeout_secs);
    let answer_sdp = match rtc::answer_offer(&peer_connection, &req.sdp, negotiation_timeout).await {
        Ok(sdp) => sdp,
        Err(e) => {
            state.session_manager.remove_session(&session.id).await;
            state.metrics.active_sessions.dec();
            return (
                StatusCode::OK,
                Json(OfferResponse::Failed {
                    status: "failed",
                    meta: json!({"error": e.to_string()}),
                }),
            );
        }
    };
    session.set_state(crate::session::SessionState::Connected).await;

    (
        StatusCode::OK,
        Json(OfferResponse::Ok {
            sdp: answer_sdp,
            sdp_type: "answer".to_string(),
            webrtc_id: session.id.clone(),
        }),
    )
}

async fn websocket_offer(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let session_manager = state.session_manager.clone();
    let inbound_capacity = state.config.queue.inbound_queue_capacity;
    let factory = clone_handler_factory(&state);
    let options = connection_options(&state, false);
    ws.on_upgrade(move |socket| async move {
        websocket::handle_connection(socket, session_manager, factory, inbound_capacity, options).await;
    })
}

async fn telephone_bridge(State(state): State<Arc<AppState>>, Path(_path): Path<String>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let session_manager = state.session_manager.clone();
    let inbound_capacity = state.config.queue.inbound_queue_capacity;
    let factory = clone_handler_factory(&state);
    let options = connection_options(&state, true);
    ws.on_upgrade(move |socket| async move {
        telephone::handle_connection(socket, session_manager, factory, inbound_capacity, options).await;
    })
}

fn connection_options(state: &Arc<AppState>, phone_mode: bool) -> ConnectionOptions {
    ConnectionOptions {
        phone_mode,
        turn_taking: state.turn_taking.clone(),
        vad: state.config.vad.clone(),
        stopword: state.config.stopword.clone(),
    }
}

/// Handler factories aren't `Clone`, so each connection gets its own closure
/// that calls through the shared `Arc<AppState>` factory.
fn clone_handler_factory(state: &Arc<AppState>) -> impl Fn() -> Box<dyn Handler> + Send + 'static {
    let state = state.clone();
    move || (state.handler_factory)()
}

#[derive(Debug, Deserialize)]
struct InputRequest {
    webrtc_id: String,
    #[serde(flatten)]
    rest: serde_json::Map<String, serde_json::Value>,
}

async fn set_input(State(state): State<Arc<AppState>>, Json(req): Json<InputRequest>) -> impl IntoResponse {
    let values: Vec<serde_json::Value> = req.rest.into_values().collect();
    match state.session_manager.set_input(&req.webrtc_id, values).await {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::NOT_FOUND,
    }
}

/// SSE stream of `AdditionalOutputs` for a session: drains whatever is
/// already queued, then waits on the session's output-push notification for
/// more, ending once the session is removed from the registry.
async fn fetch_output(State(state): State<Arc<AppState>>, Path(session_id): Path<String>) -> impl IntoResponse {
    match state.session_manager.output_stream_handle(&session_id).await {
        Ok((session, rx)) => {
            let stream = stream::unfold((session, rx), next_output_event);
            Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
        }
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn next_output_event(
    (session, mut rx): (Arc<crate::session::Session>, broadcast::Receiver<()>),
) -> Option<(Result<Event, std::convert::Infallible>, (Arc<crate::session::Session>, broadcast::Receiver<()>))> {
    loop {
        if let Some(output) = session.fetch_latest_output().await {
            let event = Event::default().json_data(output.0).unwrap_or_else(|_| Event::default().data("null"));
            return Some((Ok(event), (session, rx)));
        }
        if session.state().await == crate::session::SessionState::Closed {
            return None;
        }
        match rx.recv().await {
            Ok(()) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

async fn turn_config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let servers = rtc::build_ice_servers(&state.config.rtc);
    Json(json!({"ice_servers": servers}))
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let uptime = state.started_at.elapsed().as_secs_f64();
    Json(json!({
        "status": "healthy",
        "uptime_seconds": uptime,
        "active_sessions": state.metrics.active_sessions.get(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn metrics_endpoint(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.metrics.render()
}
