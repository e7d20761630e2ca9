//! Test suite for ensuring a correct implementation of a store.
use std::time::Duration;

use super::*;

/// Create test suite for an asyncworker store.
///
/// For store implementors, it is useful to include this as part of your test suites.
///
/// # Example
///
/// ```
/// use asyncworker::test_suite;
/// use asyncworker::store::memory::InMemoryStore;
/// test_suite!(for: InMemoryStore::new());
/// ```
///
/// Stores that need an external service can pass their own test attributes, for example to skip
/// the suite unless explicitly requested:
///
/// ```ignore
/// use asyncworker::test_suite;
/// test_suite!(
///     attrs: [tokio::test, ignore = "requires a running redis server"],
///     store: RedisStore::connect(URL, "asyncworker:test").await.unwrap()
/// );
/// ```
///
/// Each test purges the store before running.
#[macro_export]
macro_rules! test_suite {
    (for: $store:expr) => {
        $crate::test_suite!(attrs: [tokio::test], store: $store);
    };
    (attrs: [$($attr:meta),+], store: $store:expr) => {
        $crate::test_suite!(@test [$($attr),+] $store, hash_set_get_delete);
        $crate::test_suite!(@test [$($attr),+] $store, hash_multi_get_and_enumerate);
        $crate::test_suite!(@test [$($attr),+] $store, sorted_set_insert_allows_shared_scores);
        $crate::test_suite!(@test [$($attr),+] $store, sorted_set_insert_if_score_free);
        $crate::test_suite!(@test [$($attr),+] $store, sorted_set_rank_and_range);
        $crate::test_suite!(@test [$($attr),+] $store, take_by_score);
        $crate::test_suite!(@test [$($attr),+] $store, list_push_range_remove);
        $crate::test_suite!(@test [$($attr),+] $store, blpop_respects_key_order);
        $crate::test_suite!(@test [$($attr),+] $store, blpop_times_out);
        $crate::test_suite!(@test [$($attr),+] $store, blpop_wakes_on_push);
        $crate::test_suite!(@test [$($attr),+] $store, blpop_only_one_receiver);
        $crate::test_suite!(@test [$($attr),+] $store, exec_applies_all_ops);
        $crate::test_suite!(@test [$($attr),+] $store, purge);
    };
    (@test [$($attr:meta),+] $store:expr, $name:ident) => {
        $(#[$attr])+
        async fn $name() {
            let store = $store;
            $crate::store::testing::purged(&store).await;
            $crate::store::testing::$name(store).await;
        }
    };
}

pub use crate::test_suite;

#[doc(hidden)]
pub async fn purged(store: &impl Store) {
    store.purge().await.unwrap();
}

#[doc(hidden)]
pub async fn hash_set_get_delete(store: impl Store) {
    assert!(store.hset("hash", "field", "one").await.unwrap());
    assert!(!store.hset("hash", "field", "two").await.unwrap());
    assert_eq!(
        store.hget("hash", "field").await.unwrap().as_deref(),
        Some("two")
    );
    assert_eq!(store.hlen("hash").await.unwrap(), 1);

    assert!(store.hdel("hash", "field").await.unwrap());
    assert!(!store.hdel("hash", "field").await.unwrap());
    assert_eq!(store.hget("hash", "field").await.unwrap(), None);
    assert_eq!(store.hlen("hash").await.unwrap(), 0);
}

#[doc(hidden)]
pub async fn hash_multi_get_and_enumerate(store: impl Store) {
    store.hset("hash", "a", "1").await.unwrap();
    store.hset("hash", "b", "2").await.unwrap();

    let values = store
        .hmget("hash", &["a".to_owned(), "missing".to_owned(), "b".to_owned()])
        .await
        .unwrap();
    assert_eq!(
        values,
        vec![Some("1".to_owned()), None, Some("2".to_owned())]
    );
    assert!(store.hmget("hash", &[]).await.unwrap().is_empty());

    let all = store.hgetall("hash").await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all.get("b").map(String::as_str), Some("2"));

    let mut keys = store.hkeys("hash").await.unwrap();
    keys.sort();
    assert_eq!(keys, vec!["a".to_owned(), "b".to_owned()]);
}

#[doc(hidden)]
pub async fn sorted_set_insert_allows_shared_scores(store: impl Store) {
    assert!(store.zadd("zset", "a", 100).await.unwrap());
    assert!(store.zadd("zset", "b", 100).await.unwrap());
    assert!(!store.zadd("zset", "a", 50).await.unwrap());

    assert_eq!(
        store.zrange("zset").await.unwrap(),
        vec!["a".to_owned(), "b".to_owned()]
    );
    assert_eq!(store.zcard("zset").await.unwrap(), 2);
}

#[doc(hidden)]
pub async fn sorted_set_insert_if_score_free(store: impl Store) {
    assert!(store.zadd_if_score_free("zset", "a", 100).await.unwrap());
    assert!(!store.zadd_if_score_free("zset", "b", 100).await.unwrap());
    assert!(store.zadd_if_score_free("zset", "b", 101).await.unwrap());

    assert_eq!(store.zcard("zset").await.unwrap(), 2);
    assert_eq!(store.zrank("zset", "b").await.unwrap(), Some(1));
}

#[doc(hidden)]
pub async fn sorted_set_rank_and_range(store: impl Store) {
    store.zadd_if_score_free("zset", "late", 300).await.unwrap();
    store.zadd_if_score_free("zset", "early", 100).await.unwrap();
    store.zadd_if_score_free("zset", "middle", 200).await.unwrap();

    assert_eq!(
        store.zrange("zset").await.unwrap(),
        vec!["early".to_owned(), "middle".to_owned(), "late".to_owned()]
    );
    assert_eq!(store.zrank("zset", "early").await.unwrap(), Some(0));
    assert_eq!(store.zrank("zset", "missing").await.unwrap(), None);

    assert!(store.zrem("zset", "middle").await.unwrap());
    assert!(!store.zrem("zset", "middle").await.unwrap());
    assert_eq!(store.zcard("zset").await.unwrap(), 2);
}

#[doc(hidden)]
pub async fn take_by_score(store: impl Store) {
    store.zadd_if_score_free("zset", "a", 100).await.unwrap();
    store.zadd_if_score_free("zset", "b", 200).await.unwrap();
    store.zadd_if_score_free("zset", "c", 300).await.unwrap();

    assert_eq!(
        store.take_by_score("zset", 200).await.unwrap(),
        vec!["a".to_owned(), "b".to_owned()]
    );
    assert!(store.take_by_score("zset", 200).await.unwrap().is_empty());
    assert_eq!(store.zrange("zset").await.unwrap(), vec!["c".to_owned()]);
}

#[doc(hidden)]
pub async fn list_push_range_remove(store: impl Store) {
    assert_eq!(store.rpush("list", "a").await.unwrap(), 1);
    assert_eq!(store.rpush("list", "b").await.unwrap(), 2);
    assert_eq!(store.rpush("list", "a").await.unwrap(), 3);

    assert_eq!(
        store.lrange("list").await.unwrap(),
        vec!["a".to_owned(), "b".to_owned(), "a".to_owned()]
    );
    assert_eq!(store.lrem("list", "a").await.unwrap(), 2);
    assert_eq!(store.lrem("list", "a").await.unwrap(), 0);
    assert_eq!(store.llen("list").await.unwrap(), 1);
}

#[doc(hidden)]
pub async fn blpop_respects_key_order(store: impl Store) {
    store.rpush("low", "low-1").await.unwrap();
    store.rpush("high", "high-1").await.unwrap();
    store.rpush("high", "high-2").await.unwrap();
    let keys = ["high".to_owned(), "low".to_owned()];

    let mut popped = vec![];
    while let Some(entry) = store.blpop(&keys, Duration::from_secs(1)).await.unwrap() {
        popped.push(entry);
        if popped.len() == 3 {
            break;
        }
    }

    assert_eq!(
        popped,
        vec![
            ("high".to_owned(), "high-1".to_owned()),
            ("high".to_owned(), "high-2".to_owned()),
            ("low".to_owned(), "low-1".to_owned()),
        ]
    );
}

#[doc(hidden)]
pub async fn blpop_times_out(store: impl Store) {
    let keys = ["empty".to_owned()];
    let started = std::time::Instant::now();

    assert_eq!(
        store.blpop(&keys, Duration::from_secs(1)).await.unwrap(),
        None
    );
    assert!(started.elapsed() >= Duration::from_millis(900));
}

#[doc(hidden)]
pub async fn blpop_wakes_on_push(store: impl Store + Clone + 'static) {
    let keys = ["queue".to_owned()];
    let handle = tokio::spawn({
        let store = store.clone();
        async move { store.blpop(&keys, Duration::from_secs(5)).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    store.rpush("queue", "job").await.unwrap();

    assert_eq!(
        handle.await.unwrap().unwrap(),
        Some(("queue".to_owned(), "job".to_owned()))
    );
}

#[doc(hidden)]
pub async fn blpop_only_one_receiver(store: impl Store + Clone + 'static) {
    let keys = vec!["queue".to_owned()];
    let waiters = (0..2)
        .map(|_| {
            let store = store.clone();
            let keys = keys.clone();
            tokio::spawn(async move { store.blpop(&keys, Duration::from_secs(1)).await })
        })
        .collect::<Vec<_>>();
    tokio::time::sleep(Duration::from_millis(100)).await;
    store.rpush("queue", "job").await.unwrap();

    let received = futures::future::join_all(waiters)
        .await
        .into_iter()
        .filter_map(|result| result.unwrap().unwrap())
        .collect::<Vec<_>>();
    assert_eq!(received, vec![("queue".to_owned(), "job".to_owned())]);
}

#[doc(hidden)]
pub async fn exec_applies_all_ops(store: impl Store) {
    store.hset("hash", "stale", "1").await.unwrap();
    store.zadd_if_score_free("zset", "member", 1).await.unwrap();
    store.rpush("list", "value").await.unwrap();

    store
        .exec(vec![
            Op::hset("hash", "fresh", "2"),
            Op::hdel("hash", "stale"),
            Op::zrem("zset", "member"),
            Op::lrem("list", "value"),
            Op::rpush("other", "value"),
        ])
        .await
        .unwrap();

    assert_eq!(store.hkeys("hash").await.unwrap(), vec!["fresh".to_owned()]);
    assert_eq!(store.zcard("zset").await.unwrap(), 0);
    assert_eq!(store.llen("list").await.unwrap(), 0);
    assert_eq!(store.lrange("other").await.unwrap(), vec!["value".to_owned()]);
}

#[doc(hidden)]
pub async fn purge(store: impl Store) {
    store.hset("hash", "field", "value").await.unwrap();
    store.rpush("list", "value").await.unwrap();

    store.purge().await.unwrap();

    assert_eq!(store.hlen("hash").await.unwrap(), 0);
    assert_eq!(store.llen("list").await.unwrap(), 0);
}
