//! HTTP / WebSocket 接入层

pub mod admin;
pub mod error;
pub mod rooms;
pub mod ws;

use std::sync::Arc;

use axum::extract::State;
use axum::{Json, Router};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::application::services::{
    AuthorizationService, HandshakeService, RoomService, SessionRegistry, SessionTokenService,
    TrafficMonitor,
};
use crate::domain::repository::CredentialValidator;

pub use error::ApiError;

/// 路由共享状态
#[derive(Clone)]
pub struct AppState {
    pub authorization: Arc<AuthorizationService>,
    pub handshake: Arc<HandshakeService>,
    pub registry: Arc<SessionRegistry>,
    pub rooms: Arc<RoomService>,
    pub tokens: Arc<SessionTokenService>,
    pub traffic: Arc<TrafficMonitor>,
    pub credentials: Arc<dyn CredentialValidator>,
    /// 未配置时管理接口不校验
    pub admin_token: Option<Arc<str>>,
    /// 单个连接的下行缓冲帧数
    pub outbound_buffer: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/api/chat/rooms", post(rooms::create_room))
        .route("/api/chat/rooms/{room_id}/join", post(rooms::join_room))
        .route("/api/chat/logout", post(rooms::logout))
        .route("/ws/chat", get(ws::chat_socket))
        .nest("/admin/chat", admin::routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// 取出 `Authorization: Bearer ...` 中的凭证
pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "instanceId": state.registry.instance_id(),
            "localSessions": state.registry.connections().len(),
        })),
    )
}

async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        fanline_core::metrics::gather_metrics(),
    )
}
