//! 共享状态存储适配器
//!
//! 所有协调状态（会话、房间、令牌、流量计数、实例存活）的唯一持久化介质。
//! 生产环境使用 Redis，测试与单机开发使用进程内实现。

pub mod keys;
pub mod memory;
pub mod redis_store;
#[cfg(test)]
pub(crate) mod unavailable;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use keys::KeySpace;
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
#[cfg(test)]
pub(crate) use unavailable::UnavailableStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store rejected command: {0}")]
    Command(String),
    #[error("store payload serialization failed: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// 有界集合添加的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundedAdd {
    Added,
    AlreadyMember,
    Full,
}

impl BoundedAdd {
    pub fn is_admitted(&self) -> bool {
        !matches!(self, BoundedAdd::Full)
    }
}

/// 共享存储操作集合；每个操作在存储端单独原子
#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;
    /// 键不存在时写入，返回是否写入成功
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;
    async fn del(&self, key: &str) -> StoreResult<bool>;
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;
    async fn exists(&self, key: &str) -> StoreResult<bool>;

    async fn hset_multiple(&self, key: &str, fields: &[(String, String)]) -> StoreResult<()>;
    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool>;
    /// 集合未满（成员数 < capacity）时添加成员并刷新 TTL，整个判断在存储端原子执行
    async fn sadd_bounded(
        &self,
        key: &str,
        member: &str,
        capacity: u32,
        ttl: Duration,
    ) -> StoreResult<BoundedAdd>;
    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool>;
    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>>;
    async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool>;
    async fn scard(&self, key: &str) -> StoreResult<u64>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()>;
    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool>;
    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<Vec<String>>;

    /// 计数器加一；返回新值，并为计数器设置 TTL
    async fn incr_ex(&self, key: &str, ttl: Duration) -> StoreResult<i64>;
    async fn mget(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>>;
    /// 非阻塞地枚举匹配模式（仅支持 `*` 通配）的键
    async fn scan_match(&self, pattern: &str) -> StoreResult<Vec<String>>;
}

/// 存储 TTL 以秒为单位，不足一秒按一秒计
pub(crate) fn ttl_secs(ttl: Duration) -> u64 {
    let secs = ttl.as_secs();
    if ttl.subsec_nanos() > 0 { secs + 1 } else { secs.max(1) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_rounds_up() {
        assert_eq!(ttl_secs(Duration::from_millis(1500)), 2);
        assert_eq!(ttl_secs(Duration::from_secs(0)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(60)), 60);
    }
}
