//! 标识符值对象
//!
//! 会话、房间、实例与关联 ID 的强类型封装。所有 ID 都会作为共享存储键的一段，
//! 因此不允许包含 `:` 或空白字符。

use serde::{Deserialize, Serialize};
use std::fmt;

const MAX_ID_LEN: usize = 128;

fn validate_identifier(label: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{} cannot be empty", label));
    }
    if value.len() > MAX_ID_LEN {
        return Err(format!("{} exceeds {} characters", label, MAX_ID_LEN));
    }
    if value.chars().any(|c| c == ':' || c.is_whitespace()) {
        return Err(format!("{} contains reserved characters: {}", label, value));
    }
    Ok(())
}

macro_rules! string_identifier {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// 生成新的随机 ID（UUID v4）
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            /// 从字符串创建（带验证）
            pub fn parse(value: impl Into<String>) -> Result<Self, String> {
                let value = value.into();
                validate_identifier($label, &value)?;
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = String;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_identifier!(
    /// 会话 ID（一条实时连接）
    SessionId,
    "SessionId"
);

string_identifier!(
    /// 房间 ID
    RoomId,
    "RoomId"
);

string_identifier!(
    /// 聊天服务实例 ID
    InstanceId,
    "InstanceId"
);

string_identifier!(
    /// 关联 ID：请求方生成，在整个集群范围内唯一，是请求与回复之间唯一的关联
    CorrelationId,
    "CorrelationId"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(CorrelationId::generate(), CorrelationId::generate());
        assert_ne!(SessionId::generate(), SessionId::generate());
    }

    #[test]
    fn parse_rejects_reserved_characters() {
        assert!(RoomId::parse("").is_err());
        assert!(RoomId::parse("room:1").is_err());
        assert!(RoomId::parse("room 1").is_err());
        assert!(RoomId::parse("x".repeat(MAX_ID_LEN + 1)).is_err());
        assert_eq!(CorrelationId::parse("abc-1").unwrap().as_str(), "abc-1");
    }

    #[test]
    fn deserialization_validates() {
        let ok: SessionId = serde_json::from_str("\"s-1\"").unwrap();
        assert_eq!(ok.as_str(), "s-1");
        assert!(serde_json::from_str::<SessionId>("\"bad:id\"").is_err());
        assert_eq!(serde_json::to_string(&ok).unwrap(), "\"s-1\"");
    }
}
