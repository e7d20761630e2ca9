//! Provides an in memory implementation of [`Store`].
//!
//! Currently this is provided for testing purposes and not designed for use in a production system.
//!
//! It is not optimized instead is designed to be a correct implementation for use in a test setup.
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{Op, Store, StoreError};

#[derive(Default)]
struct Data {
    hashes: HashMap<String, HashMap<String, String>>,
    zsets: HashMap<String, HashMap<String, i64>>,
    lists: HashMap<String, VecDeque<String>>,
}

impl Data {
    fn sorted_members(&self, key: &str) -> Vec<(String, i64)> {
        let mut members = self
            .zsets
            .get(key)
            .map(|zset| {
                zset.iter()
                    .map(|(member, score)| (member.clone(), *score))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        members.sort_by(|(a, a_score), (b, b_score)| a_score.cmp(b_score).then(a.cmp(b)));
        members
    }

    fn hset(&mut self, key: String, field: String, value: String) -> bool {
        self.hashes
            .entry(key)
            .or_default()
            .insert(field, value)
            .is_none()
    }

    fn hdel(&mut self, key: &str, field: &str) -> bool {
        let removed = self
            .hashes
            .get_mut(key)
            .and_then(|hash| hash.remove(field))
            .is_some();
        if self.hashes.get(key).is_some_and(HashMap::is_empty) {
            self.hashes.remove(key);
        }
        removed
    }

    fn zrem(&mut self, key: &str, member: &str) -> bool {
        let removed = self
            .zsets
            .get_mut(key)
            .and_then(|zset| zset.remove(member))
            .is_some();
        if self.zsets.get(key).is_some_and(HashMap::is_empty) {
            self.zsets.remove(key);
        }
        removed
    }

    fn lrem(&mut self, key: &str, value: &str) -> usize {
        let Some(list) = self.lists.get_mut(key) else {
            return 0;
        };
        let before = list.len();
        list.retain(|item| item != value);
        let removed = before - list.len();
        if list.is_empty() {
            self.lists.remove(key);
        }
        removed
    }

    fn rpush(&mut self, key: String, value: String) -> usize {
        let list = self.lists.entry(key).or_default();
        list.push_back(value);
        list.len()
    }

    fn lpop_first(&mut self, keys: &[String]) -> Option<(String, String)> {
        for key in keys {
            if let Some(list) = self.lists.get_mut(key) {
                if let Some(value) = list.pop_front() {
                    if list.is_empty() {
                        self.lists.remove(key);
                    }
                    return Some((key.clone(), value));
                }
            }
        }
        None
    }
}

/// An in memory implementation of [`Store`].
///
/// It is provided as a correct (but not optimized) implementation primarily for use in testing
/// circumstances. Clones share the same data, which makes it possible to simulate several runner
/// processes talking to one store.
///
/// **This is not designed for use in a production systems.**
#[derive(Clone, Default)]
pub struct InMemoryStore {
    data: Arc<RwLock<Data>>,
    pushed: Arc<Notify>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryStore {
    /// Creates a new instance of [`InMemoryStore`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails with [`StoreError::Unavailable`] until the store is
    /// made available again via [`InMemoryStore::set_available`].
    pub fn unavailable(self) -> Self {
        self.set_available(false);
        self
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::Relaxed);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::Relaxed) {
            Err(StoreError::Unavailable("in memory store switched off".to_owned()))
        } else {
            Ok(())
        }
    }

    fn read<T>(&self, f: impl FnOnce(&Data) -> T) -> Result<T, StoreError> {
        self.check_available()?;
        let data = self.data.read().map_err(|_| StoreError::BadState)?;
        Ok(f(&data))
    }

    fn write<T>(&self, f: impl FnOnce(&mut Data) -> T) -> Result<T, StoreError> {
        self.check_available()?;
        let mut data = self.data.write().map_err(|_| StoreError::BadState)?;
        Ok(f(&mut data))
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.read(|_| ())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        self.read(|data| data.hashes.get(key).and_then(|hash| hash.get(field)).cloned())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<bool, StoreError> {
        self.write(|data| data.hset(key.to_owned(), field.to_owned(), value.to_owned()))
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        self.write(|data| data.hdel(key, field))
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        self.read(|data| {
            let hash = data.hashes.get(key);
            fields
                .iter()
                .map(|field| hash.and_then(|hash| hash.get(field)).cloned())
                .collect()
        })
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.read(|data| data.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hkeys(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.read(|data| {
            data.hashes
                .get(key)
                .map(|hash| hash.keys().cloned().collect())
                .unwrap_or_default()
        })
    }

    async fn hlen(&self, key: &str) -> Result<usize, StoreError> {
        self.read(|data| data.hashes.get(key).map(HashMap::len).unwrap_or_default())
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<bool, StoreError> {
        self.write(|data| {
            data.zsets
                .entry(key.to_owned())
                .or_default()
                .insert(member.to_owned(), score)
                .is_none()
        })
    }

    async fn zadd_if_score_free(
        &self,
        key: &str,
        member: &str,
        score: i64,
    ) -> Result<bool, StoreError> {
        self.write(|data| {
            let zset = data.zsets.entry(key.to_owned()).or_default();
            if zset.values().any(|occupied| *occupied == score) {
                false
            } else {
                zset.insert(member.to_owned(), score);
                true
            }
        })
    }

    async fn zrange(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.read(|data| {
            data.sorted_members(key)
                .into_iter()
                .map(|(member, _)| member)
                .collect()
        })
    }

    async fn zrank(&self, key: &str, member: &str) -> Result<Option<usize>, StoreError> {
        self.read(|data| {
            data.sorted_members(key)
                .iter()
                .position(|(candidate, _)| candidate == member)
        })
    }

    async fn zcard(&self, key: &str) -> Result<usize, StoreError> {
        self.read(|data| data.zsets.get(key).map(HashMap::len).unwrap_or_default())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.write(|data| data.zrem(key, member))
    }

    async fn take_by_score(&self, key: &str, max_score: i64) -> Result<Vec<String>, StoreError> {
        self.write(|data| {
            let due = data
                .sorted_members(key)
                .into_iter()
                .take_while(|(_, score)| *score <= max_score)
                .map(|(member, _)| member)
                .collect::<Vec<_>>();
            due.iter().for_each(|member| {
                data.zrem(key, member);
            });
            due
        })
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        let length = self.write(|data| data.rpush(key.to_owned(), value.to_owned()))?;
        self.pushed.notify_waiters();
        Ok(length)
    }

    async fn lrange(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.read(|data| {
            data.lists
                .get(key)
                .map(|list| list.iter().cloned().collect())
                .unwrap_or_default()
        })
    }

    async fn llen(&self, key: &str) -> Result<usize, StoreError> {
        self.read(|data| data.lists.get(key).map(VecDeque::len).unwrap_or_default())
    }

    async fn lrem(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        self.write(|data| data.lrem(key, value))
    }

    async fn blpop(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>, StoreError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before looking so a push in between is not missed.
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(popped) = self.write(|data| data.lpop_first(keys))? {
                return Ok(Some(popped));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn exec(&self, ops: Vec<Op>) -> Result<(), StoreError> {
        let pushed = self.write(|data| {
            let mut pushed = false;
            for op in ops {
                match op {
                    Op::HSet { key, field, value } => {
                        data.hset(key, field, value);
                    }
                    Op::HDel { key, field } => {
                        data.hdel(&key, &field);
                    }
                    Op::ZRem { key, member } => {
                        data.zrem(&key, &member);
                    }
                    Op::LRem { key, value } => {
                        data.lrem(&key, &value);
                    }
                    Op::RPush { key, value } => {
                        data.rpush(key, value);
                        pushed = true;
                    }
                }
            }
            pushed
        })?;
        if pushed {
            self.pushed.notify_waiters();
        }
        Ok(())
    }

    async fn purge(&self) -> Result<(), StoreError> {
        self.write(|data| *data = Data::default())
    }
}
