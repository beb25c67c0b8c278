//! 用户凭证校验
//!
//! 凭证签发不在本服务范围内，这里只校验 HS256 JWT 并把声明映射为调用方身份。

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::model::{CallerClaims, Gender};
use crate::domain::repository::{CredentialError, CredentialValidator};

/// 用户凭证中的声明
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserCredentialClaims {
    pub sub: String,
    pub nickname: String,
    #[serde(default)]
    pub team_id: Option<i64>,
    #[serde(default)]
    pub gender: Option<Gender>,
    #[serde(default)]
    pub age: Option<u32>,
    pub exp: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

pub struct JwtCredentialValidator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtCredentialValidator {
    pub fn new(secret: &str, issuer: Option<&str>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        if let Some(issuer) = issuer {
            validation.set_issuer(&[issuer]);
        }
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

impl CredentialValidator for JwtCredentialValidator {
    fn validate(&self, credential: &str) -> Result<CallerClaims, CredentialError> {
        if credential.trim().is_empty() {
            return Err(CredentialError::Missing);
        }
        let data = decode::<UserCredentialClaims>(credential, &self.key, &self.validation)
            .map_err(|err| {
                debug!(error = %err, "user credential rejected");
                CredentialError::Rejected(err.to_string())
            })?;
        let claims = data.claims;
        Ok(CallerClaims {
            user_id: claims.sub,
            team_id: claims.team_id,
            gender: claims.gender,
            age: claims.age,
            nickname: claims.nickname,
        })
    }
}
