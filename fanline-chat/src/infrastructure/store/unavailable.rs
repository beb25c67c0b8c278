//! 始终不可用的存储，用于验证各组件在存储故障时的降级行为

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use super::{BoundedAdd, SharedStore, StoreError, StoreResult};

#[derive(Debug, Default)]
pub struct UnavailableStore;

fn refused<T>() -> StoreResult<T> {
    Err(StoreError::Unavailable("connection refused".to_string()))
}

#[async_trait]
impl SharedStore for UnavailableStore {
    async fn get(&self, _key: &str) -> StoreResult<Option<String>> {
        refused()
    }

    async fn set_ex(&self, _key: &str, _value: &str, _ttl: Duration) -> StoreResult<()> {
        refused()
    }

    async fn set_nx_ex(&self, _key: &str, _value: &str, _ttl: Duration) -> StoreResult<bool> {
        refused()
    }

    async fn del(&self, _key: &str) -> StoreResult<bool> {
        refused()
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> StoreResult<bool> {
        refused()
    }

    async fn exists(&self, _key: &str) -> StoreResult<bool> {
        refused()
    }

    async fn hset_multiple(&self, _key: &str, _fields: &[(String, String)]) -> StoreResult<()> {
        refused()
    }

    async fn hgetall(&self, _key: &str) -> StoreResult<HashMap<String, String>> {
        refused()
    }

    async fn sadd(&self, _key: &str, _member: &str) -> StoreResult<bool> {
        refused()
    }

    async fn sadd_bounded(
        &self,
        _key: &str,
        _member: &str,
        _capacity: u32,
        _ttl: Duration,
    ) -> StoreResult<BoundedAdd> {
        refused()
    }

    async fn srem(&self, _key: &str, _member: &str) -> StoreResult<bool> {
        refused()
    }

    async fn smembers(&self, _key: &str) -> StoreResult<Vec<String>> {
        refused()
    }

    async fn sismember(&self, _key: &str, _member: &str) -> StoreResult<bool> {
        refused()
    }

    async fn scard(&self, _key: &str) -> StoreResult<u64> {
        refused()
    }

    async fn zadd(&self, _key: &str, _member: &str, _score: f64) -> StoreResult<()> {
        refused()
    }

    async fn zrem(&self, _key: &str, _member: &str) -> StoreResult<bool> {
        refused()
    }

    async fn zrange_by_score(&self, _key: &str, _min: f64, _max: f64) -> StoreResult<Vec<String>> {
        refused()
    }

    async fn incr_ex(&self, _key: &str, _ttl: Duration) -> StoreResult<i64> {
        refused()
    }

    async fn mget(&self, _keys: &[String]) -> StoreResult<Vec<Option<String>>> {
        refused()
    }

    async fn scan_match(&self, _pattern: &str) -> StoreResult<Vec<String>> {
        refused()
    }
}
