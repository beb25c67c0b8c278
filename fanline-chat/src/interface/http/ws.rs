//! 实时聊天连接
//!
//! 握手校验在升级之前完成，被拒绝的请求直接得到 JSON 错误；升级后的拒绝（注册时满员）
//! 以 4000 段关闭码断开。每个连接一个任务，同时驱动上行帧与注册表投递的下行帧。

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use fanline_core::metrics::CHAT_METRICS;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::error::ApiError;
use super::{AppState, bearer_token};
use crate::application::error::ChatError;
use crate::application::services::{AdmittedSession, HandshakeRequest};
use crate::domain::model::{
    CallerClaims, ChatFrame, ClientFrame, IdentitySnapshot, SessionInfo, close_code,
};
use crate::domain::value_object::{RoomId, SessionId};
use crate::infrastructure::connection::OutboundFrame;

/// 单条聊天消息的最大字符数
const MAX_MESSAGE_CHARS: usize = 1_000;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSocketQuery {
    pub token: Option<String>,
    pub room_id: Option<String>,
    pub user_id: Option<String>,
    pub nickname: Option<String>,
    pub team_id: Option<i64>,
}

impl ChatSocketQuery {
    fn into_handshake(self, headers: &HeaderMap) -> HandshakeRequest {
        let token = self
            .token
            .or_else(|| bearer_token(headers).map(str::to_string));
        let nickname = self.nickname;
        let team_id = self.team_id;
        let direct_claims = self.user_id.map(|user_id| CallerClaims {
            nickname: nickname.unwrap_or_else(|| user_id.clone()),
            user_id,
            team_id,
            gender: None,
            age: None,
        });
        HandshakeRequest {
            token,
            room_id: self.room_id,
            direct_claims,
        }
    }
}

pub async fn chat_socket(
    State(state): State<AppState>,
    Query(query): Query<ChatSocketQuery>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let admitted = match state.handshake.admit(query.into_handshake(&headers)).await {
        Ok(admitted) => admitted,
        Err(rejection) => return ApiError::from(rejection).into_response(),
    };
    match upgrade {
        Ok(upgrade) => upgrade
            .on_upgrade(move |socket| run_session(state, admitted, socket))
            .into_response(),
        Err(rejection) => rejection.into_response(),
    }
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    if let Err(err) = socket.send(Message::Close(Some(frame))).await {
        debug!(error = %err, "close frame not delivered");
    }
}

async fn run_session(state: AppState, admitted: AdmittedSession, mut socket: WebSocket) {
    let AdmittedSession { subject, room, .. } = admitted;
    let room_id = room.room_id.clone();
    let session_id = SessionId::generate();
    let (sender, mut outbound) = mpsc::channel(state.outbound_buffer);

    let info = SessionInfo::new(
        session_id.clone(),
        room_id.clone(),
        state.registry.instance_id().clone(),
        subject.user_id.clone(),
        subject.nickname.clone(),
    );
    match state
        .registry
        .register(&room_id, sender, info, room.capacity())
        .await
    {
        Ok(()) => {}
        Err(ChatError::RoomFull { .. }) => {
            CHAT_METRICS
                .handshake_rejections_total
                .with_label_values(&["ROOM_FULL"])
                .inc();
            close_with(&mut socket, close_code::ROOM_FULL, "room is full").await;
            return;
        }
        Err(err) => {
            warn!(room_id = %room_id, error = %err, "session registration failed");
            close_with(&mut socket, close_code::UNAVAILABLE, "service unavailable").await;
            return;
        }
    }
    sync_room(&state, &room_id).await;
    state
        .registry
        .broadcast_to_room(
            &room_id,
            ChatFrame::system(room_id.clone(), format!("{} joined", subject.nickname)),
            None,
        )
        .await;

    let mut closed_by_server = false;
    loop {
        tokio::select! {
            next = outbound.recv() => match next {
                Some(OutboundFrame::Frame(frame)) => {
                    let payload = match serde_json::to_string(&frame) {
                        Ok(payload) => payload,
                        Err(err) => {
                            warn!(session_id = %session_id, error = %err, "failed to encode frame");
                            continue;
                        }
                    };
                    if socket.send(Message::Text(payload.into())).await.is_err() {
                        break;
                    }
                }
                Some(OutboundFrame::Close { code, reason }) => {
                    close_with(&mut socket, code, &reason).await;
                    closed_by_server = true;
                    break;
                }
                None => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    handle_client_frame(&state, &session_id, &room_id, &subject, text.as_str()).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(session_id = %session_id, error = %err, "socket read failed");
                    break;
                }
            },
        }
    }

    if let Err(err) = state.registry.unregister(&room_id, &session_id).await {
        warn!(session_id = %session_id, error = %err, "session unregister failed");
    }
    if !closed_by_server {
        state
            .registry
            .broadcast_to_room(
                &room_id,
                ChatFrame::system(room_id.clone(), format!("{} left", subject.nickname)),
                None,
            )
            .await;
        sync_room(&state, &room_id).await;
    }
    info!(session_id = %session_id, room_id = %room_id, "session ended");
}

async fn sync_room(state: &AppState, room_id: &RoomId) {
    if let Err(err) = state.rooms.sync_participants(room_id).await {
        warn!(room_id = %room_id, error = %err, "participant count not updated");
    }
}

async fn handle_client_frame(
    state: &AppState,
    session_id: &SessionId,
    room_id: &RoomId,
    subject: &IdentitySnapshot,
    raw: &str,
) {
    let frame = match serde_json::from_str::<ClientFrame>(raw) {
        Ok(frame) => frame,
        Err(err) => {
            debug!(session_id = %session_id, error = %err, "ignoring malformed client frame");
            return;
        }
    };

    // 任何合法的上行帧都算作存活信号
    match state.registry.heartbeat(session_id).await {
        Ok(true) => {}
        Ok(false) => debug!(session_id = %session_id, "heartbeat for unknown session"),
        Err(err) => {
            CHAT_METRICS.record_store_error("heartbeat");
            warn!(session_id = %session_id, error = %err, "heartbeat not recorded");
        }
    }

    match frame {
        ClientFrame::Heartbeat => {}
        ClientFrame::Message { content } => {
            let content = content.trim();
            if content.is_empty() || content.chars().count() > MAX_MESSAGE_CHARS {
                debug!(session_id = %session_id, "ignoring empty or oversized message");
                return;
            }
            let message = ChatFrame::Message {
                room_id: room_id.clone(),
                user_id: subject.user_id.clone(),
                nickname: subject.nickname.clone(),
                content: content.to_string(),
                sent_at: Utc::now(),
            };
            state.registry.broadcast_to_room(room_id, message, None).await;
            if let Err(err) = state.traffic.increment(room_id).await {
                CHAT_METRICS.record_store_error("traffic_increment");
                warn!(room_id = %room_id, error = %err, "traffic counter not updated");
            }
        }
    }
}
