//! The storage seam of the queue.
//!
//! A [`Store`] provides the small set of key-value primitives the [`crate::messenger::Messenger`]
//! builds the broker protocol on: hashes, sorted sets with integer scores, lists, an atomic
//! blocking pop across several lists, and atomic multi-command transactions.
//!
//! Two implementations exist: [`memory::InMemoryStore`] in this crate, designed for testing, and
//! the Redis store in the `asyncworker-redis` crate.
//!
//! Implementors should run the shared [`test_suite`] against their store.
use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

pub mod memory;
#[doc(hidden)]
pub mod testing;

/// A single write that can take part in an atomic [`Store::exec`] transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// Set `field` of the hash at `key`.
    HSet {
        key: String,
        field: String,
        value: String,
    },
    /// Delete `field` of the hash at `key`.
    HDel { key: String, field: String },
    /// Remove `member` from the sorted set at `key`.
    ZRem { key: String, member: String },
    /// Remove every occurrence of `value` from the list at `key`.
    LRem { key: String, value: String },
    /// Append `value` to the list at `key`.
    RPush { key: String, value: String },
}

impl Op {
    pub fn hset(key: impl Into<String>, field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::HSet {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn hdel(key: impl Into<String>, field: impl Into<String>) -> Self {
        Self::HDel {
            key: key.into(),
            field: field.into(),
        }
    }

    pub fn zrem(key: impl Into<String>, member: impl Into<String>) -> Self {
        Self::ZRem {
            key: key.into(),
            member: member.into(),
        }
    }

    pub fn lrem(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::LRem {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn rpush(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::RPush {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// The shared key-value store backing the queue.
///
/// Scores of sorted sets are whole seconds since the unix epoch.
#[async_trait]
pub trait Store: Send + Sync {
    /// Liveness probe.
    async fn ping(&self) -> Result<(), StoreError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;
    /// Returns `true` when `field` did not exist before.
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<bool, StoreError>;
    /// Returns `true` when `field` existed.
    async fn hdel(&self, key: &str, field: &str) -> Result<bool, StoreError>;
    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>, StoreError>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;
    async fn hkeys(&self, key: &str) -> Result<Vec<String>, StoreError>;
    async fn hlen(&self, key: &str) -> Result<usize, StoreError>;

    /// Adds `member` at `score`, moving it when already present. Returns `true` when the member
    /// is new.
    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<bool, StoreError>;
    /// Adds `member` at exactly `score` unless another member already occupies that score.
    ///
    /// The check and the insert happen atomically. Returns `true` when the member was added.
    async fn zadd_if_score_free(
        &self,
        key: &str,
        member: &str,
        score: i64,
    ) -> Result<bool, StoreError>;
    /// All members ordered by ascending score.
    async fn zrange(&self, key: &str) -> Result<Vec<String>, StoreError>;
    async fn zrank(&self, key: &str, member: &str) -> Result<Option<usize>, StoreError>;
    async fn zcard(&self, key: &str) -> Result<usize, StoreError>;
    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError>;
    /// Reads every member with a score `<= max_score` and removes that same range in one
    /// transaction.
    async fn take_by_score(&self, key: &str, max_score: i64) -> Result<Vec<String>, StoreError>;

    /// Returns the length of the list after the push.
    async fn rpush(&self, key: &str, value: &str) -> Result<usize, StoreError>;
    async fn lrange(&self, key: &str) -> Result<Vec<String>, StoreError>;
    async fn llen(&self, key: &str) -> Result<usize, StoreError>;
    /// Removes every occurrence of `value`, returning how many were removed.
    async fn lrem(&self, key: &str, value: &str) -> Result<usize, StoreError>;

    /// Pops the head of the first non-empty list of `keys`, checked in order, waiting up to
    /// `timeout` for an element to arrive.
    ///
    /// Returns the key the element was popped from along with the element. Exactly one blocked
    /// caller receives any given pushed element.
    async fn blpop(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>, StoreError>;

    /// Applies all `ops` atomically.
    async fn exec(&self, ops: Vec<Op>) -> Result<(), StoreError>;

    /// Removes every key held by this store.
    async fn purge(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Error encoding or decoding data")]
    EncodeDecode(#[from] serde_json::Error),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Store in bad state")]
    BadState,
}
