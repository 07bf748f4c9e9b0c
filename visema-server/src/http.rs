// HTTP surface: render session control, MJPEG streams and WebRTC signalling

use crate::error::ApiError;
use crate::session::{SessionInfo, SessionManager};
use crate::transports::multipart::{self, MultipartTransport};
use crate::transports::webrtc::{PeerConnector, SdpType, SessionDescription, WebRtcTransport};
use crate::transports::{spawn_stream, DrawLoopOptions};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use visema_core::{DialogueReply, Error, FrameGeometry, RenderConfig, Timeline, Viseme};

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub config: Arc<RenderConfig>,
    pub connector: Option<Arc<dyn PeerConnector>>,
}

/// Session parameters shared by `/render/start` and `/webrtc/offer`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderParams {
    #[serde(default, alias = "avatarReference")]
    pub avatar_key: String,
    #[serde(default, alias = "timeline")]
    pub visemes: Option<Vec<Viseme>>,
    /// Dialogue service reply, used for its timeline when `visemes` is absent
    #[serde(default)]
    pub reply: Option<DialogueReply>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub fps: Option<i64>,
}

impl RenderParams {
    fn take_timeline(&mut self) -> visema_core::Result<Timeline> {
        match (self.visemes.take(), self.reply.take()) {
            (Some(events), _) => Timeline::new(events),
            (None, Some(reply)) => reply.into_timeline(),
            (None, None) => Ok(Timeline::empty()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderStartResponse {
    pub stream_url: String,
    pub stream_handle: String,
    pub session_id: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

#[derive(Debug, Deserialize)]
pub struct WebRtcOfferRequest {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: SdpType,
    #[serde(flatten)]
    pub params: RenderParams,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebRtcAnswerResponse {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub session_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub sessions: usize,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/render/start", post(start_handler))
        .route("/render/:id", get(info_handler).delete(stop_handler))
        .route("/render/:id/stop", post(stop_handler))
        .route("/stream/:id", get(stream_handler))
        .route("/webrtc/offer", post(webrtc_offer_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn root_handler() -> &'static str {
    "ok"
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        sessions: state.manager.len(),
    })
}

/// Apply configured defaults for omitted values, then create the session.
async fn start_session(
    state: &AppState,
    mut params: RenderParams,
    even: bool,
) -> Result<(String, FrameGeometry), ApiError> {
    let timeline = params.take_timeline()?;
    let defaults = state.config.default_geometry();
    let mut geometry = FrameGeometry::clamped(
        params.width.unwrap_or(i64::from(defaults.width)),
        params.height.unwrap_or(i64::from(defaults.height)),
        params.fps.unwrap_or(i64::from(defaults.fps)),
    )?;
    if even {
        geometry = geometry.even();
    }

    let id = state
        .manager
        .start_session(
            &params.avatar_key,
            timeline,
            i64::from(geometry.width),
            i64::from(geometry.height),
            i64::from(geometry.fps),
        )
        .await?;
    Ok((id.to_string(), geometry))
}

async fn start_handler(
    State(state): State<AppState>,
    payload: Result<Json<RenderParams>, JsonRejection>,
) -> Result<Json<RenderStartResponse>, ApiError> {
    let Json(params) = payload?;
    let (id, geometry) = start_session(&state, params, false).await?;

    Ok(Json(RenderStartResponse {
        stream_url: format!("/stream/{}", id),
        stream_handle: id.clone(),
        session_id: id,
        width: geometry.width,
        height: geometry.height,
        fps: geometry.fps,
    }))
}

async fn info_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionInfo>, ApiError> {
    Ok(Json(state.manager.session_info(&id)?))
}

async fn stop_handler(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    state.manager.stop_session(&id);
    StatusCode::NO_CONTENT
}

async fn stream_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let guard = state.manager.attach(&id)?;
    let (transport, body) =
        MultipartTransport::channel(state.config.stream_buffer_frames, state.config.jpeg_quality);
    spawn_stream(guard, transport, DrawLoopOptions::from_config(&state.config));
    info!(session_id = %id, "multipart stream attached");

    let mut response = body.into_body().into_response();
    let headers = response.headers_mut();
    let content_type = HeaderValue::from_str(&multipart::content_type())
        .map_err(|e| Error::Internal(e.to_string()))?;
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    Ok(response)
}

async fn webrtc_offer_handler(
    State(state): State<AppState>,
    payload: Result<Json<WebRtcOfferRequest>, JsonRejection>,
) -> Result<Json<WebRtcAnswerResponse>, ApiError> {
    let connector = state
        .connector
        .clone()
        .ok_or_else(|| Error::NotConfigured("WebRTC is not enabled on this server".to_string()))?;
    let Json(request) = payload?;
    let offer = SessionDescription {
        kind: request.kind,
        sdp: request.sdp,
    };
    offer.validate_offer()?;

    let (id, geometry) = start_session(&state, request.params, true).await?;
    let guard = state.manager.attach(&id)?;

    // dropping the guard on failure removes the half-made session
    let (transport, answer) = match WebRtcTransport::connect(connector.as_ref(), offer, geometry).await {
        Ok(connected) => connected,
        Err(e) => {
            warn!(session_id = %id, error = %e, "WebRTC negotiation failed");
            drop(guard);
            return Err(e.into());
        }
    };
    spawn_stream(guard, transport, DrawLoopOptions::from_config(&state.config));
    info!(session_id = %id, connector = connector.name(), "WebRTC stream attached");

    Ok(Json(WebRtcAnswerResponse {
        sdp: answer.sdp,
        kind: answer.kind,
        session_id: id,
    }))
}
