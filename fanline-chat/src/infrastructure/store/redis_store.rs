use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{AsyncCommands, RedisError, Script};
use tracing::info;

use super::{BoundedAdd, SharedStore, StoreError, StoreResult, ttl_secs};

const SCAN_BATCH_SIZE: usize = 200;

/// 成员已存在返回 2，添加成功返回 1，已满返回 0
const BOUNDED_ADD_SCRIPT: &str = r#"
if redis.call('SISMEMBER', KEYS[1], ARGV[1]) == 1 then
  redis.call('EXPIRE', KEYS[1], ARGV[3])
  return 2
end
if redis.call('SCARD', KEYS[1]) >= tonumber(ARGV[2]) then
  return 0
end
redis.call('SADD', KEYS[1], ARGV[1])
redis.call('EXPIRE', KEYS[1], ARGV[3])
return 1
"#;

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        if err.kind() == redis::ErrorKind::TypeError || err.kind() == redis::ErrorKind::ResponseError
        {
            StoreError::Command(err.to_string())
        } else {
            StoreError::Unavailable(err.to_string())
        }
    }
}

/// Redis 共享存储
///
/// 持有一个自动重连的 `ConnectionManager`，每次调用克隆一份（共享同一条多路复用连接）。
pub struct RedisStore {
    conn: ConnectionManager,
    bounded_add: Script,
}

impl RedisStore {
    pub async fn connect(url: &str, response_timeout: Duration) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let config = ConnectionManagerConfig::new().set_response_timeout(response_timeout);
        let conn = ConnectionManager::new_with_config(client, config).await?;
        info!(url = %url, "redis shared store connected");
        Ok(Self {
            conn,
            bounded_add: Script::new(BOUNDED_ADD_SCRIPT),
        })
    }

    fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.connection();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.connection();
        let _: () = conn.set_ex(key, value, ttl_secs(ttl)).await?;
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.connection();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.connection();
        let removed: usize = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.connection();
        let applied: bool = conn.expire(key, ttl_secs(ttl) as i64).await?;
        Ok(applied)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.connection();
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn hset_multiple(&self, key: &str, fields: &[(String, String)]) -> StoreResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection();
        let _: () = conn.hset_multiple(key, fields).await?;
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.connection();
        let fields: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(fields)
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.connection();
        let added: usize = conn.sadd(key, member).await?;
        Ok(added > 0)
    }

    async fn sadd_bounded(
        &self,
        key: &str,
        member: &str,
        capacity: u32,
        ttl: Duration,
    ) -> StoreResult<BoundedAdd> {
        let mut conn = self.connection();
        let outcome: i64 = self
            .bounded_add
            .key(key)
            .arg(member)
            .arg(capacity)
            .arg(ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(match outcome {
            2 => BoundedAdd::AlreadyMember,
            1 => BoundedAdd::Added,
            _ => BoundedAdd::Full,
        })
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.connection();
        let removed: usize = conn.srem(key, member).await?;
        Ok(removed > 0)
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.connection();
        let members: Vec<String> = conn.smembers(key).await?;
        Ok(members)
    }

    async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.connection();
        let is_member: bool = conn.sismember(key, member).await?;
        Ok(is_member)
    }

    async fn scard(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.connection();
        let count: u64 = conn.scard(key).await?;
        Ok(count)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        let mut conn = self.connection();
        let _: usize = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.connection();
        let removed: usize = conn.zrem(key, member).await?;
        Ok(removed > 0)
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<Vec<String>> {
        let mut conn = self.connection();
        let members: Vec<String> = conn.zrangebyscore(key, min, max).await?;
        Ok(members)
    }

    async fn incr_ex(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
        let mut conn = self.connection();
        let (count, _): (i64, bool) = redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(key)
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn mget(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection();
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await?;
        Ok(values)
    }

    async fn scan_match(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.connection();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH_SIZE)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        // SCAN 可能返回重复键
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}
