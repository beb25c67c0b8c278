//! 会话令牌签发与校验
//!
//! 令牌是 32 字节随机数的十六进制串，服务端以 `token:{token}` 保存身份快照与房间声明，
//! 有效当且仅当未过期且存储中仍有记录。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngCore;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::model::{IdentitySnapshot, RoomType, SessionToken, SessionTokenInfo};
use crate::domain::value_object::RoomId;
use crate::infrastructure::store::{KeySpace, SharedStore, StoreError};

const TOKEN_BYTES: usize = 32;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("session token is invalid or expired")]
    Invalid,
    #[error("session token ttl must be positive")]
    InvalidTtl,
    #[error("token store unavailable: {0}")]
    Unavailable(#[from] StoreError),
}

pub struct SessionTokenService {
    store: Arc<dyn SharedStore>,
    keys: KeySpace,
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl SessionTokenService {
    pub fn new(store: Arc<dyn SharedStore>, keys: KeySpace) -> Self {
        Self { store, keys }
    }

    pub async fn issue(
        &self,
        subject: IdentitySnapshot,
        room_id: RoomId,
        room_type: RoomType,
        ttl: Duration,
    ) -> Result<SessionToken, TokenError> {
        if ttl.is_zero() {
            return Err(TokenError::InvalidTtl);
        }
        let lifetime = chrono::Duration::from_std(ttl).map_err(|_| TokenError::InvalidTtl)?;
        let issued_at = Utc::now();
        let info = SessionTokenInfo {
            subject,
            room_id,
            room_type,
            issued_at,
            expires_at: issued_at + lifetime,
        };

        let token = generate_token();
        let payload = serde_json::to_string(&info).map_err(StoreError::from)?;
        self.store
            .set_ex(&self.keys.token(&token), &payload, ttl)
            .await?;

        debug!(
            user_id = %info.subject.user_id,
            room_id = %info.room_id,
            expires_at = %info.expires_at,
            "session token issued"
        );
        Ok(SessionToken { token, info })
    }

    pub async fn validate(&self, token: &str) -> Result<SessionTokenInfo, TokenError> {
        self.validate_at(token, Utc::now()).await
    }

    /// 过期的令牌当场删除，不等待存储 TTL 回收
    pub async fn validate_at(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<SessionTokenInfo, TokenError> {
        if token.is_empty() || !token.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(TokenError::Invalid);
        }

        let key = self.keys.token(token);
        let Some(payload) = self.store.get(&key).await? else {
            return Err(TokenError::Invalid);
        };

        let info: SessionTokenInfo = match serde_json::from_str(&payload) {
            Ok(info) => info,
            Err(err) => {
                warn!(error = %err, "corrupt session token entry removed");
                self.store.del(&key).await?;
                return Err(TokenError::Invalid);
            }
        };

        if info.is_expired_at(now) {
            self.store.del(&key).await?;
            debug!(user_id = %info.subject.user_id, "expired session token removed");
            return Err(TokenError::Invalid);
        }

        Ok(info)
    }

    /// 立即作废（登出）；返回令牌是否存在
    pub async fn invalidate(&self, token: &str) -> Result<bool, TokenError> {
        Ok(self.store.del(&self.keys.token(token)).await?)
    }

    /// 作废某个主体的全部令牌
    ///
    /// 需要扫描全部未过期令牌，只用于低频的管理操作。
    pub async fn invalidate_all(&self, subject_id: &str) -> Result<usize, TokenError> {
        let keys = self.store.scan_match(&self.keys.token_pattern()).await?;
        let mut removed = 0;

        for key in keys {
            let Some(payload) = self.store.get(&key).await? else {
                continue;
            };
            let belongs = serde_json::from_str::<SessionTokenInfo>(&payload)
                .map(|info| info.subject.user_id == subject_id)
                .unwrap_or(false);
            if belongs && self.store.del(&key).await? {
                removed += 1;
            }
        }

        info!(subject_id, removed, "session tokens invalidated for subject");
        Ok(removed)
    }
}
