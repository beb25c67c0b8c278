//! 运维接口：统计、房间详情、强制完成/取消、按主体作废令牌

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tracing::info;

use super::error::ApiError;
use super::{AppState, bearer_token};
use crate::domain::model::RoomRecord;
use crate::domain::value_object::RoomId;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/stats", get(stats))
        .route("/rooms/{room_id}", get(room_detail))
        .route("/rooms/{room_id}/complete", post(complete_room))
        .route("/rooms/{room_id}/cancel", post(cancel_room))
        .route("/tokens/subject/{user_id}", delete(invalidate_subject))
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    match &state.admin_token {
        None => Ok(()),
        Some(expected) if bearer_token(headers) == Some(expected.as_ref()) => Ok(()),
        Some(_) => Err(ApiError::unauthorized("admin token required")),
    }
}

fn parse_room(raw: String) -> Result<RoomId, ApiError> {
    RoomId::parse(raw).map_err(|_| ApiError::room_not_found())
}

async fn stats(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Value>, ApiError> {
    require_admin(&state, &headers)?;
    let rooms = state.registry.active_rooms().await?;
    let mut sessions = 0u64;
    for room_id in &rooms {
        sessions += state.registry.session_count(room_id).await;
    }
    let distribution = state.registry.instance_distribution().await?;
    let created_today = state.rooms.rooms_created_today().await?;

    Ok(Json(json!({
        "instanceId": state.registry.instance_id(),
        "rooms": rooms.len(),
        "sessions": sessions,
        "localSessions": state.registry.connections().len(),
        "roomsCreatedToday": created_today.len(),
        "instances": distribution,
    })))
}

async fn room_detail(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state, &headers)?;
    let room_id = parse_room(room_id)?;
    let room = state.rooms.require_room(&room_id).await?;
    let sessions = state.registry.get_active_sessions_in_room(&room_id).await?;
    Ok(Json(json!({ "room": room, "sessions": sessions })))
}

async fn complete_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<RoomRecord>, ApiError> {
    require_admin(&state, &headers)?;
    let room = state.rooms.complete_room(&parse_room(room_id)?).await?;
    info!(room_id = %room.room_id, "room completed by operator");
    Ok(Json(room))
}

async fn cancel_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<RoomRecord>, ApiError> {
    require_admin(&state, &headers)?;
    let room = state.rooms.cancel_room(&parse_room(room_id)?).await?;
    info!(room_id = %room.room_id, "room cancelled by operator");
    Ok(Json(room))
}

async fn invalidate_subject(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state, &headers)?;
    let removed = state.tokens.invalidate_all(&user_id).await?;
    info!(user_id = %user_id, removed, "subject tokens invalidated");
    Ok(Json(json!({ "removed": removed })))
}
