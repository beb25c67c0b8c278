//! 进程内共享存储，语义与 Redis 实现保持一致（TTL、集合、有序集合、计数器）。
//!
//! 过期时间基于 `tokio::time::Instant`，测试中可以通过暂停时钟推进时间。

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{BoundedAdd, SharedStore, StoreError, StoreResult};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
    ZSet(HashMap<String, f64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Command(format!(
        "WRONGTYPE operation against key {} holding the wrong kind of value",
        key
    ))
}

/// 只支持 `*` 通配
fn glob_match(pattern: &str, candidate: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == candidate;
    }

    let mut rest = candidate;
    let last = parts.len() - 1;
    for (idx, part) in parts.iter().enumerate() {
        if idx == 0 {
            match rest.strip_prefix(part) {
                Some(stripped) => rest = stripped,
                None => return false,
            }
        } else if idx == last {
            return rest.ends_with(part);
        } else if let Some(pos) = rest.find(part) {
            rest = &rest[pos + part.len()..];
        } else {
            return false;
        }
    }
    true
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 取出未过期的条目；顺带清理已过期的键
    fn live_entry<'a>(
        entries: &'a mut HashMap<String, Entry>,
        key: &str,
        now: Instant,
    ) -> Option<&'a mut Entry> {
        if entries.get(key).is_some_and(|entry| !entry.is_live(now)) {
            entries.remove(key);
        }
        entries.get_mut(key)
    }

    fn set_entry<'a>(
        entries: &'a mut HashMap<String, Entry>,
        key: &str,
        now: Instant,
    ) -> StoreResult<&'a mut HashSet<String>> {
        if Self::live_entry(entries, key, now).is_none() {
            entries.insert(key.to_string(), Entry::new(Value::Set(HashSet::new())));
        }
        match entries.get_mut(key).map(|entry| &mut entry.value) {
            Some(Value::Set(set)) => Ok(set),
            _ => Err(wrong_type(key)),
        }
    }

    /// 集合为空时删除键（与 Redis 行为一致）
    fn drop_if_empty(entries: &mut HashMap<String, Entry>, key: &str) {
        let empty = match entries.get(key).map(|entry| &entry.value) {
            Some(Value::Set(set)) => set.is_empty(),
            Some(Value::ZSet(zset)) => zset.is_empty(),
            Some(Value::Hash(hash)) => hash.is_empty(),
            _ => false,
        };
        if empty {
            entries.remove(key);
        }
    }

    /// 当前存活的键数量
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock().values().filter(|entry| entry.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut entries = self.lock();
        match Self::live_entry(&mut entries, key, Instant::now()).map(|entry| &entry.value) {
            None => Ok(None),
            Some(Value::Str(value)) => Ok(Some(value.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let now = Instant::now();
        self.lock().insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(now + ttl),
            },
        );
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let now = Instant::now();
        let mut entries = self.lock();
        if Self::live_entry(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        let now = Instant::now();
        let mut entries = self.lock();
        Ok(entries.remove(key).is_some_and(|entry| entry.is_live(now)))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let now = Instant::now();
        let mut entries = self.lock();
        match Self::live_entry(&mut entries, key, now) {
            Some(entry) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut entries = self.lock();
        Ok(Self::live_entry(&mut entries, key, Instant::now()).is_some())
    }

    async fn hset_multiple(&self, key: &str, fields: &[(String, String)]) -> StoreResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let now = Instant::now();
        let mut entries = self.lock();
        if Self::live_entry(&mut entries, key, now).is_none() {
            entries.insert(key.to_string(), Entry::new(Value::Hash(HashMap::new())));
        }
        match entries.get_mut(key).map(|entry| &mut entry.value) {
            Some(Value::Hash(hash)) => {
                for (field, value) in fields {
                    hash.insert(field.clone(), value.clone());
                }
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut entries = self.lock();
        match Self::live_entry(&mut entries, key, Instant::now()).map(|entry| &entry.value) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(hash)) => Ok(hash.clone()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut entries = self.lock();
        let set = Self::set_entry(&mut entries, key, Instant::now())?;
        Ok(set.insert(member.to_string()))
    }

    async fn sadd_bounded(
        &self,
        key: &str,
        member: &str,
        capacity: u32,
        ttl: Duration,
    ) -> StoreResult<BoundedAdd> {
        let now = Instant::now();
        let mut entries = self.lock();
        let set = Self::set_entry(&mut entries, key, now)?;
        let outcome = if set.contains(member) {
            BoundedAdd::AlreadyMember
        } else if set.len() as u64 >= u64::from(capacity) {
            BoundedAdd::Full
        } else {
            set.insert(member.to_string());
            BoundedAdd::Added
        };

        if outcome.is_admitted() {
            if let Some(entry) = entries.get_mut(key) {
                entry.expires_at = Some(now + ttl);
            }
        } else {
            Self::drop_if_empty(&mut entries, key);
        }
        Ok(outcome)
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut entries = self.lock();
        let removed = match Self::live_entry(&mut entries, key, Instant::now())
            .map(|entry| &mut entry.value)
        {
            None => false,
            Some(Value::Set(set)) => set.remove(member),
            Some(_) => return Err(wrong_type(key)),
        };
        Self::drop_if_empty(&mut entries, key);
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut entries = self.lock();
        match Self::live_entry(&mut entries, key, Instant::now()).map(|entry| &entry.value) {
            None => Ok(Vec::new()),
            Some(Value::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut entries = self.lock();
        match Self::live_entry(&mut entries, key, Instant::now()).map(|entry| &entry.value) {
            None => Ok(false),
            Some(Value::Set(set)) => Ok(set.contains(member)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn scard(&self, key: &str) -> StoreResult<u64> {
        let mut entries = self.lock();
        match Self::live_entry(&mut entries, key, Instant::now()).map(|entry| &entry.value) {
            None => Ok(0),
            Some(Value::Set(set)) => Ok(set.len() as u64),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        let now = Instant::now();
        let mut entries = self.lock();
        if Self::live_entry(&mut entries, key, now).is_none() {
            entries.insert(key.to_string(), Entry::new(Value::ZSet(HashMap::new())));
        }
        match entries.get_mut(key).map(|entry| &mut entry.value) {
            Some(Value::ZSet(zset)) => {
                zset.insert(member.to_string(), score);
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut entries = self.lock();
        let removed = match Self::live_entry(&mut entries, key, Instant::now())
            .map(|entry| &mut entry.value)
        {
            None => false,
            Some(Value::ZSet(zset)) => zset.remove(member).is_some(),
            Some(_) => return Err(wrong_type(key)),
        };
        Self::drop_if_empty(&mut entries, key);
        Ok(removed)
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<Vec<String>> {
        let mut entries = self.lock();
        match Self::live_entry(&mut entries, key, Instant::now()).map(|entry| &entry.value) {
            None => Ok(Vec::new()),
            Some(Value::ZSet(zset)) => {
                let mut members: Vec<(&String, f64)> = zset
                    .iter()
                    .filter(|(_, score)| **score >= min && **score <= max)
                    .map(|(member, score)| (member, *score))
                    .collect();
                members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
                Ok(members.into_iter().map(|(member, _)| member.clone()).collect())
            }
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn incr_ex(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
        let now = Instant::now();
        let mut entries = self.lock();
        let current = match Self::live_entry(&mut entries, key, now).map(|entry| &entry.value) {
            None => 0,
            Some(Value::Str(raw)) => raw.parse::<i64>().map_err(|_| {
                StoreError::Command(format!("value at {} is not an integer", key))
            })?,
            Some(_) => return Err(wrong_type(key)),
        };
        let next = current + 1;
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(next.to_string()),
                expires_at: Some(now + ttl),
            },
        );
        Ok(next)
    }

    async fn mget(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>> {
        let now = Instant::now();
        let mut entries = self.lock();
        Ok(keys
            .iter()
            .map(|key| match Self::live_entry(&mut entries, key, now) {
                Some(Entry {
                    value: Value::Str(value),
                    ..
                }) => Some(value.clone()),
                _ => None,
            })
            .collect())
    }

    async fn scan_match(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let now = Instant::now();
        let entries = self.lock();
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(key, entry)| entry.is_live(now) && glob_match(pattern, key))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
