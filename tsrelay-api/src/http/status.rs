//! Channel diagnostics endpoints

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use tsrelay_livestream::status::{self, ChannelDetail, StatusReport};

use crate::http::{AppResult, AppState};

pub fn create_status_router() -> Router<AppState> {
    Router::new()
        .route("/status", get(all_channels))
        .route("/status/", get(all_channels))
        .route("/status/{channel_id}", get(channel))
}

async fn all_channels(State(state): State<AppState>) -> AppResult<Json<StatusReport>> {
    Ok(Json(status::channel_summaries(&state.coordinator).await?))
}

async fn channel(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
) -> AppResult<Json<ChannelDetail>> {
    Ok(Json(status::channel_detail(&state.coordinator, &channel_id).await?))
}
