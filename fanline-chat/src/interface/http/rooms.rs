//! 房间创建 / 加入 / 登出

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::error::ApiError;
use super::{AppState, bearer_token};
use crate::application::services::{AuthorizationCommand, AuthorizationGrant};
use crate::domain::model::{CallerClaims, RoomConditions, RoomStatus, RoomType};
use crate::domain::repository::CredentialError;
use crate::domain::value_object::RoomId;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomBody {
    pub room_type: RoomType,
    #[serde(default)]
    pub game_id: String,
    #[serde(default)]
    pub conditions: RoomConditions,
    /// 比赛开始时间，比赛房间据此计算存活时长
    #[serde(default)]
    pub game_starts_at: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomGrantResponse {
    pub room_id: RoomId,
    pub room_type: RoomType,
    pub status: RoomStatus,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub websocket_path: String,
    pub nickname: String,
}

impl From<AuthorizationGrant> for RoomGrantResponse {
    fn from(grant: AuthorizationGrant) -> Self {
        Self {
            websocket_path: format!("/ws/chat?roomId={}", grant.room.room_id),
            room_id: grant.room.room_id,
            room_type: grant.room.room_type,
            status: grant.room.status,
            token: grant.token.token,
            expires_at: grant.token.info.expires_at,
            nickname: grant.subject.nickname,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LogoutBody {
    pub token: String,
}

fn caller(state: &AppState, headers: &HeaderMap) -> Result<CallerClaims, ApiError> {
    let credential = bearer_token(headers).ok_or(CredentialError::Missing)?;
    Ok(state.credentials.validate(credential)?)
}

pub async fn create_room(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateRoomBody>,
) -> Result<(StatusCode, Json<RoomGrantResponse>), ApiError> {
    let caller = caller(&state, &headers)?;
    let grant = state
        .authorization
        .authorize(
            caller,
            AuthorizationCommand::Create {
                room_type: body.room_type,
                game_id: body.game_id,
                conditions: body.conditions,
                event_time: body.game_starts_at,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(grant.into())))
}

pub async fn join_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<RoomGrantResponse>, ApiError> {
    let caller = caller(&state, &headers)?;
    let room_id = RoomId::parse(room_id).map_err(|_| ApiError::room_not_found())?;
    let grant = state
        .authorization
        .authorize(caller, AuthorizationCommand::Join { room_id })
        .await?;
    Ok(Json(grant.into()))
}

/// 作废会话令牌
pub async fn logout(
    State(state): State<AppState>,
    Json(body): Json<LogoutBody>,
) -> Result<Json<Value>, ApiError> {
    let invalidated = state.tokens.invalidate(body.token.trim()).await?;
    Ok(Json(json!({ "invalidated": invalidated })))
}
