//! Stream delivery and control endpoints
//!
//! Mounted under `/proxy/ts`:
//! - `GET /stream/{channel_id}` streams MPEG-TS to the client
//! - `POST /change_stream/{channel_id}` switches the upstream URL
//! - `POST|DELETE /stop/{channel_id}` stops a channel on every worker
//! - `POST /stop_client/{channel_id}` disconnects one client

use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::{ConnectInfo, Path, Request, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use tsrelay_livestream::ChannelRole;

use crate::http::{AppError, AppResult, AppState};

const CLIENT_ID_LEN: usize = 12;

pub fn create_proxy_router() -> Router<AppState> {
    Router::new()
        .route("/stream/{channel_id}", get(stream))
        .route("/change_stream/{channel_id}", post(change_stream))
        .route("/stop/{channel_id}", post(stop_channel).delete(stop_channel))
        .route("/stop_client/{channel_id}", post(stop_client))
}

/// Client address: first `X-Forwarded-For` hop, then `X-Real-IP`, then the
/// socket peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    forwarded
        .or(real_ip)
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

async fn stream(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    request: Request,
) -> AppResult<Response> {
    let coordinator = &state.coordinator;
    let config = &coordinator.context().config;
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let ip = client_ip(request.headers(), peer);
    let user_agent = request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    match coordinator.start_channel(&channel_id).await? {
        ChannelRole::Redirect(url) => {
            info!(channel_id = %channel_id, url = %url, "Redirecting client to upstream");
            return Ok((StatusCode::FOUND, [(header::LOCATION, url)]).into_response());
        }
        ChannelRole::Owner => {
            let limit = config.connection_timeout() * (config.max_retries + 1);
            if !coordinator.wait_for_connection(&channel_id, limit).await? {
                // Do not leave a channel behind that never connected
                if let Err(e) = coordinator.request_channel_stop(&channel_id).await {
                    warn!(channel_id = %channel_id, error = %e, "Failed to stop unconnected channel");
                }
                return Err(AppError::gateway_timeout(format!(
                    "Timed out connecting upstream for channel {channel_id}"
                )));
            }
        }
        ChannelRole::Relay => {}
    }

    let client_id = nanoid::nanoid!(CLIENT_ID_LEN);
    let rx = coordinator
        .attach_client(&channel_id, &client_id, &ip, &user_agent)
        .await?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "video/mp2t")
        .header(header::CACHE_CONTROL, "no-cache")
        .header("x-client-id", client_id)
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .map_err(|e| AppError::internal_server_error(e.to_string()))
}

#[derive(Debug, Deserialize)]
pub struct ChangeStreamRequest {
    #[serde(default)]
    pub url: String,
    pub user_agent: Option<String>,
    pub stream_id: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ChangeStreamResponse {
    pub message: String,
    pub channel_id: String,
    pub url: String,
    pub owner: bool,
    pub worker_id: String,
}

async fn change_stream(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    Json(req): Json<ChangeStreamRequest>,
) -> AppResult<Json<ChangeStreamResponse>> {
    let coordinator = &state.coordinator;
    let outcome = coordinator
        .request_stream_switch(&channel_id, &req.url, req.user_agent.as_deref(), req.stream_id)
        .await?;

    let message = if outcome.owner {
        "Stream URL updated"
    } else {
        "Stream URL change requested"
    };
    Ok(Json(ChangeStreamResponse {
        message: message.to_string(),
        channel_id,
        url: req.url,
        owner: outcome.owner,
        worker_id: coordinator.worker_id().to_string(),
    }))
}

#[derive(Debug, Serialize)]
pub struct StopChannelResponse {
    pub message: String,
    pub channel_id: String,
    pub previous_state: String,
}

async fn stop_channel(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
) -> AppResult<Json<StopChannelResponse>> {
    let previous = state.coordinator.request_channel_stop(&channel_id).await?;
    Ok(Json(StopChannelResponse {
        message: "Channel stop requested".to_string(),
        channel_id,
        previous_state: previous.to_string(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct StopClientRequest {
    #[serde(default)]
    pub client_id: String,
}

#[derive(Debug, Serialize)]
pub struct StopClientResponse {
    pub message: String,
    pub channel_id: String,
    pub client_id: String,
    pub locally_processed: bool,
}

async fn stop_client(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    Json(req): Json<StopClientRequest>,
) -> AppResult<Json<StopClientResponse>> {
    if req.client_id.trim().is_empty() {
        return Err(AppError::bad_request("client_id is required"));
    }
    let local = state
        .coordinator
        .request_client_stop(&channel_id, &req.client_id)
        .await?;
    Ok(Json(StopClientResponse {
        message: "Client stop requested".to_string(),
        channel_id,
        client_id: req.client_id,
        locally_processed: local,
    }))
}
