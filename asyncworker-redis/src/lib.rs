//! A Redis [`Store`] for asyncworker.
//!
//! Every key is prefixed with a namespace, so several queues can share one Redis database.
//!
//! ```no_run
//! use asyncworker::prelude::*;
//! use asyncworker_redis::RedisStore;
//!
//! # async fn run() -> Result<(), asyncworker::Error> {
//! let store = RedisStore::connect("redis://127.0.0.1", "asyncworker").await?;
//! let messenger = Messenger::new(store, &Config::default());
//! messenger.dispatch_job(&Job::new("send_newsletter", "normal")).await?;
//! # Ok(())
//! # }
//! ```
use std::{collections::HashMap, sync::OnceLock, time::Duration};

use async_trait::async_trait;
use asyncworker::store::{Op, Store, StoreError};
use redis::{aio::ConnectionManager, AsyncCommands, Client, Pipeline, RedisError, Script};

// Checks for an occupied score and inserts in one step.
const ZADD_IF_SCORE_FREE: &str = r"
if #redis.call('ZRANGEBYSCORE', KEYS[1], ARGV[2], ARGV[2], 'LIMIT', 0, 1) > 0 then
    return 0
end
redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
return 1
";

fn zadd_if_score_free_script() -> &'static Script {
    static SCRIPT: OnceLock<Script> = OnceLock::new();
    SCRIPT.get_or_init(|| Script::new(ZADD_IF_SCORE_FREE))
}

#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
    namespace: NameSpace,
}

fn map_err(error: RedisError) -> StoreError {
    if error.is_io_error()
        || error.is_connection_dropped()
        || error.is_connection_refusal()
        || error.is_timeout()
    {
        StoreError::Unavailable(error.to_string())
    } else {
        tracing::error!(?error, "Unexpected response from redis");
        StoreError::BadState
    }
}

impl RedisStore {
    pub async fn connect(redis_url: &str, namespace: impl ToString) -> Result<Self, StoreError> {
        let client = Client::open(redis_url).map_err(map_err)?;

        Ok(Self {
            conn: ConnectionManager::new(client.clone())
                .await
                .map_err(map_err)?,
            client,
            namespace: NameSpace(namespace.to_string()),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace.0
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[derive(Clone)]
struct NameSpace(String);

impl NameSpace {
    fn key(&self, key: &str) -> String {
        format!("{}:{key}", self.0)
    }

    fn strip<'a>(&self, key: &'a str) -> &'a str {
        key.strip_prefix(&self.0)
            .and_then(|key| key.strip_prefix(':'))
            .unwrap_or(key)
    }

    fn pattern(&self) -> String {
        format!("{}:*", self.0)
    }
}

fn add_op(pipe: &mut Pipeline, namespace: &NameSpace, op: Op) {
    match op {
        Op::HSet { key, field, value } => pipe.hset(namespace.key(&key), field, value),
        Op::HDel { key, field } => pipe.hdel(namespace.key(&key), field),
        Op::ZRem { key, member } => pipe.zrem(namespace.key(&key), member),
        Op::LRem { key, value } => pipe.lrem(namespace.key(&key), 0, value),
        Op::RPush { key, value } => pipe.rpush(namespace.key(&key), value),
    }
    .ignore();
}

#[async_trait]
impl Store for RedisStore {
    async fn ping(&self) -> Result<(), StoreError> {
        redis::cmd("PING")
            .query_async::<_, String>(&mut self.conn())
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        self.conn()
            .hget(self.namespace.key(key), field)
            .await
            .map_err(map_err)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<bool, StoreError> {
        let added: usize = self
            .conn()
            .hset(self.namespace.key(key), field, value)
            .await
            .map_err(map_err)?;
        Ok(added > 0)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let removed: usize = self
            .conn()
            .hdel(self.namespace.key(key), field)
            .await
            .map_err(map_err)?;
        Ok(removed > 0)
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        if fields.is_empty() {
            return Ok(vec![]);
        }
        redis::cmd("HMGET")
            .arg(self.namespace.key(key))
            .arg(fields)
            .query_async(&mut self.conn())
            .await
            .map_err(map_err)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.conn()
            .hgetall(self.namespace.key(key))
            .await
            .map_err(map_err)
    }

    async fn hkeys(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.conn()
            .hkeys(self.namespace.key(key))
            .await
            .map_err(map_err)
    }

    async fn hlen(&self, key: &str) -> Result<usize, StoreError> {
        self.conn()
            .hlen(self.namespace.key(key))
            .await
            .map_err(map_err)
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<bool, StoreError> {
        let added: usize = self
            .conn()
            .zadd(self.namespace.key(key), member, score)
            .await
            .map_err(map_err)?;
        Ok(added > 0)
    }

    async fn zadd_if_score_free(
        &self,
        key: &str,
        member: &str,
        score: i64,
    ) -> Result<bool, StoreError> {
        let added: i64 = zadd_if_score_free_script()
            .key(self.namespace.key(key))
            .arg(member)
            .arg(score)
            .invoke_async(&mut self.conn())
            .await
            .map_err(map_err)?;
        Ok(added == 1)
    }

    async fn zrange(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.conn()
            .zrange(self.namespace.key(key), 0, -1)
            .await
            .map_err(map_err)
    }

    async fn zrank(&self, key: &str, member: &str) -> Result<Option<usize>, StoreError> {
        self.conn()
            .zrank(self.namespace.key(key), member)
            .await
            .map_err(map_err)
    }

    async fn zcard(&self, key: &str) -> Result<usize, StoreError> {
        self.conn()
            .zcard(self.namespace.key(key))
            .await
            .map_err(map_err)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let removed: usize = self
            .conn()
            .zrem(self.namespace.key(key), member)
            .await
            .map_err(map_err)?;
        Ok(removed > 0)
    }

    async fn take_by_score(&self, key: &str, max_score: i64) -> Result<Vec<String>, StoreError> {
        let key = self.namespace.key(key);
        let (due, _removed): (Vec<String>, usize) = redis::pipe()
            .atomic()
            .zrangebyscore(&key, "-inf", max_score)
            .zrembyscore(&key, "-inf", max_score)
            .query_async(&mut self.conn())
            .await
            .map_err(map_err)?;
        Ok(due)
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        self.conn()
            .rpush(self.namespace.key(key), value)
            .await
            .map_err(map_err)
    }

    async fn lrange(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.conn()
            .lrange(self.namespace.key(key), 0, -1)
            .await
            .map_err(map_err)
    }

    async fn llen(&self, key: &str) -> Result<usize, StoreError> {
        self.conn()
            .llen(self.namespace.key(key))
            .await
            .map_err(map_err)
    }

    async fn lrem(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        self.conn()
            .lrem(self.namespace.key(key), 0, value)
            .await
            .map_err(map_err)
    }

    // A blocked BLPOP holds its connection, so it gets one of its own instead of stalling every
    // other command on the shared connection.
    async fn blpop(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>, StoreError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_err)?;
        let keys = keys
            .iter()
            .map(|key| self.namespace.key(key))
            .collect::<Vec<_>>();

        let popped: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(&keys)
            .arg(timeout.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;

        Ok(popped.map(|(key, value)| (self.namespace.strip(&key).to_owned(), value)))
    }

    async fn exec(&self, ops: Vec<Op>) -> Result<(), StoreError> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        ops.into_iter()
            .for_each(|op| add_op(&mut pipe, &self.namespace, op));
        pipe.query_async::<_, ()>(&mut self.conn())
            .await
            .map_err(map_err)
    }

    async fn purge(&self) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let keys: Vec<String> = conn.keys(self.namespace.pattern()).await.map_err(map_err)?;
        if keys.is_empty() {
            return Ok(());
        }
        conn.del::<_, ()>(keys).await.map_err(map_err)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use asyncworker::{prelude::*, test_suite};
    use chrono::TimeDelta;

    const DEFAULT_URL: &str = "redis://127.0.0.1";

    static NEXT_NAMESPACE: AtomicUsize = AtomicUsize::new(0);

    // Tests run concurrently, so each gets a namespace of its own.
    async fn store() -> RedisStore {
        let namespace = format!(
            "asyncworker:test:{}:{}",
            std::process::id(),
            NEXT_NAMESPACE.fetch_add(1, Ordering::Relaxed)
        );
        RedisStore::connect(DEFAULT_URL, namespace).await.unwrap()
    }

    test_suite!(
        attrs: [tokio::test, ignore = "requires a running redis server"],
        store: store().await
    );

    #[test]
    fn namespaced_keys() {
        let namespace = NameSpace("asyncworker".to_owned());

        assert_eq!(namespace.key("jobs"), "asyncworker:jobs");
        assert_eq!(namespace.strip("asyncworker:queue.high"), "queue.high");
        assert_eq!(namespace.strip("other:queue.high"), "other:queue.high");
        assert_eq!(namespace.pattern(), "asyncworker:*");
    }

    #[tokio::test]
    #[ignore = "requires a running redis server"]
    async fn namespaces_are_isolated() {
        let first = store().await;
        let second = store().await;

        first.hset("jobs", "1", "{}").await.unwrap();
        second.purge().await.unwrap();

        assert_eq!(first.hlen("jobs").await.unwrap(), 1);
        assert_eq!(second.hlen("jobs").await.unwrap(), 0);
        first.purge().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a running redis server"]
    async fn messenger_on_redis() {
        let messenger = Messenger::new(store().await, &Config::default());
        let job = Job::new("report", "high");
        let delayed = Job::builder("report", "low")
            .delay_for(TimeDelta::hours(1))
            .build();

        messenger.dispatch_job(&job).await.unwrap();
        messenger.dispatch_job(&delayed).await.unwrap();
        assert_eq!(messenger.count_jobs().await.unwrap(), 2);
        assert_eq!(messenger.count_jobs_delayed().await.unwrap(), 1);

        let popped = messenger
            .pop_job_id(&"main".into(), Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped.queue, "queue.high");
        assert_eq!(popped.job_id, job.id);

        assert!(messenger.expedite_job(&delayed).await.unwrap());
        assert_eq!(messenger.count_jobs_delayed().await.unwrap(), 0);
        assert_eq!(messenger.count_jobs_queued(None, None).await.unwrap(), 1);

        messenger.purge().await.unwrap();
    }
}
