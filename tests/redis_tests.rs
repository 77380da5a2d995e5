//! Tests against a live Redis server.
//!
//! Ignored by default. Run with `cargo test -- --ignored` after pointing
//! `REDIS_URI` (environment or `.env`) at a disposable server.
mod common;

use common::test_utils::{test_config, values};
use dedup_bloom::{
    BitProbe, BitStore, BloomFilter, Filter, FilterError, RedisBitStore,
    RedisKeyConfigBuilder, RedisKeyFilter, RedisLink, RedisSetConfigBuilder,
    RedisSetFilter, RedisStoreConfig, RedisStoreConfigBuilder,
    ResetConfigBuilder, SetMode,
};
use std::sync::Arc;
use std::time::Duration;

fn redis_config() -> RedisStoreConfig {
    dotenvy::dotenv().ok();
    let url = std::env::var("REDIS_URI")
        .unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
    RedisStoreConfigBuilder::default()
        .url(url)
        .build()
        .expect("Failed to build redis config")
}

fn unique_prefix(test_name: &str) -> String {
    format!("dedup-test:{}:{}:", test_name, std::process::id())
}

async fn delete_keys(link: &RedisLink, keys: Vec<String>) {
    let _: i64 = link
        .run(|mut conn| async move {
            redis::cmd("DEL").arg(&keys).query_async(&mut conn).await
        })
        .await
        .expect("Failed to clean up keys");
}

#[cfg(test)]
mod bloom_tests {
    use super::*;

    #[tokio::test]
    #[ignore]
    async fn test_order_scenario_on_redis() {
        let store = RedisBitStore::connect(&redis_config()).await.unwrap();
        let link = store.link().unwrap();
        let mut config = test_config(20, 4, 1);
        config.key_prefix = unique_prefix("scenario");
        let filter = BloomFilter::new(config, store).await.unwrap();

        assert!(filter.insert(b"order-123").await.unwrap());
        assert!(filter.exists(b"order-123").await.unwrap());
        assert!(!filter.exists(b"order-456").await.unwrap());
        assert!(filter.exists_and_insert(b"order-123").await.unwrap());
        assert!(!filter.exists_and_insert(b"order-789").await.unwrap());
        assert!(filter.exists(b"order-789").await.unwrap());

        delete_keys(&link, filter.shard_keys().to_vec()).await;
    }

    #[tokio::test]
    #[ignore]
    async fn test_bit_primitives() {
        let store = RedisBitStore::connect(&redis_config()).await.unwrap();
        let key = format!("{}0", unique_prefix("bits"));
        store.set_bit(&key, 42).await.unwrap();
        assert!(store.get_bit(&key, 42).await.unwrap());
        assert!(!store.get_bit(&key, 41).await.unwrap());

        let probe = BitProbe::new(key.clone(), vec![42, 43]);
        assert_eq!(
            store.test_and_set_bits(&[probe.clone(), probe.clone()]).await.unwrap(),
            vec![false, true]
        );
        store
            .clear_bits(&[BitProbe::new(key.clone(), vec![43])])
            .await
            .unwrap();
        assert_eq!(store.count_bits(&[key.clone()]).await.unwrap(), vec![1]);

        delete_keys(&store.link().unwrap(), vec![key]).await;
    }

    #[tokio::test]
    #[ignore]
    async fn test_close_releases_the_link() {
        let store = RedisBitStore::connect(&redis_config()).await.unwrap();
        let key = format!("{}0", unique_prefix("closed"));
        store.close().await.unwrap();
        assert!(matches!(store.link(), Err(FilterError::Closed)));
        assert!(matches!(
            store.get_bit(&key, 1).await,
            Err(FilterError::Closed)
        ));
        assert!(matches!(store.close().await, Err(FilterError::Closed)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore]
    async fn test_one_winner_across_instances() {
        let prefix = unique_prefix("contended");
        let mut filters = Vec::new();
        for _ in 0..4 {
            let store = RedisBitStore::connect(&redis_config()).await.unwrap();
            let mut config = test_config(20, 4, 2);
            config.key_prefix = prefix.clone();
            filters.push(Arc::new(BloomFilter::new(config, store).await.unwrap()));
        }
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let filter = filters[i % filters.len()].clone();
                tokio::spawn(async move {
                    filter.exists_and_insert(b"shared").await.unwrap()
                })
            })
            .collect();
        let mut unseen = 0;
        for handle in handles {
            if !handle.await.unwrap() {
                unseen += 1;
            }
        }
        assert_eq!(unseen, 1);

        let link = filters[0].store().link().unwrap();
        delete_keys(&link, filters[0].shard_keys().to_vec()).await;
    }

    #[tokio::test]
    #[ignore]
    async fn test_reset_evicts_on_redis() {
        let store = RedisBitStore::connect(&redis_config()).await.unwrap();
        let mut config = test_config(8, 4, 2);
        config.key_prefix = unique_prefix("reset");
        config.reset = ResetConfigBuilder::default()
            .enabled(true)
            .max_fill_rate(0.5)
            .check_period(Duration::from_secs(60))
            .build()
            .unwrap();
        let filter = BloomFilter::new(config, store).await.unwrap();
        let keys = filter.shard_keys().to_vec();
        for key in &keys {
            filter
                .store()
                .set_bits(&[BitProbe::new(key.clone(), (0..256).collect())])
                .await
                .unwrap();
        }

        filter.insert(b"fresh").await.unwrap();
        let counts = filter.store().count_bits(&keys).await.unwrap();
        assert!(counts.iter().any(|&c| c < 256));
        assert!(filter.exists(b"fresh").await.unwrap());

        delete_keys(&filter.store().link().unwrap(), keys).await;
    }
}

#[cfg(test)]
mod set_tests {
    use super::*;

    async fn set_filter(name: &str, mode: SetMode) -> RedisSetFilter {
        let link = RedisLink::connect(&redis_config()).await.unwrap();
        let config = RedisSetConfigBuilder::default()
            .key_prefix(unique_prefix(name))
            .block_num(2)
            .mode(mode)
            .build()
            .unwrap();
        RedisSetFilter::new(config, link).await.unwrap()
    }

    #[tokio::test]
    #[ignore]
    async fn test_plain_sets() {
        let filter = set_filter("plain", SetMode::Plain).await;
        assert_eq!(
            filter
                .exists_and_insert_many(&values(&["a", "b", "a"]))
                .await
                .unwrap(),
            vec![false, false, true]
        );
        assert_eq!(
            filter.exists_many(&values(&["a", "c"])).await.unwrap(),
            vec![true, false]
        );
        assert!(filter.evict_older_than(Duration::ZERO).await.is_err());

        let link = RedisLink::connect(&redis_config()).await.unwrap();
        delete_keys(&link, filter.set_keys()).await;
    }

    #[tokio::test]
    #[ignore]
    async fn test_scored_sets_expire_by_age() {
        let filter = set_filter("scored", SetMode::Scored).await;
        filter.insert_many(&values(&["old", "older"])).await.unwrap();
        assert!(filter.exists(b"old").await.unwrap());

        assert_eq!(
            filter.evict_older_than(Duration::from_secs(3600)).await.unwrap(),
            0
        );
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(filter.evict_older_than(Duration::ZERO).await.unwrap(), 2);
        assert!(!filter.exists(b"old").await.unwrap());

        let link = RedisLink::connect(&redis_config()).await.unwrap();
        delete_keys(&link, filter.set_keys()).await;
    }

    #[tokio::test]
    #[ignore]
    async fn test_closed_set_filter_rejects_calls() {
        let filter = set_filter("closed", SetMode::Plain).await;
        filter.close().await.unwrap();
        assert!(filter.is_closed());
        assert!(matches!(filter.exists(b"a").await, Err(FilterError::Closed)));
        assert!(matches!(
            filter.insert_many(&[]).await,
            Err(FilterError::Closed)
        ));
    }
}

#[cfg(test)]
mod key_tests {
    use super::*;

    async fn key_filter(name: &str, lock_ttl: u64) -> RedisKeyFilter {
        let link = RedisLink::connect(&redis_config()).await.unwrap();
        let config = RedisKeyConfigBuilder::default()
            .key_prefix(unique_prefix(name))
            .lock_ttl(Duration::from_secs(lock_ttl))
            .confirm_ttl(Duration::from_secs(3600))
            .build()
            .unwrap();
        RedisKeyFilter::new(config, link).await.unwrap()
    }

    async fn cleanup(filter: &RedisKeyFilter, names: &[&str]) {
        let keys = names.iter().map(|n| filter.key(n.as_bytes())).collect();
        let link = RedisLink::connect(&redis_config()).await.unwrap();
        delete_keys(&link, keys).await;
    }

    #[tokio::test]
    #[ignore]
    async fn test_lock_then_confirm_extends_ttl() {
        let filter = key_filter("confirm", 60).await;
        assert!(!filter.exists(b"job-1").await.unwrap());
        assert_eq!(filter.ttl(b"job-1").await.unwrap(), None);

        assert_eq!(
            filter
                .exists_and_lock_many(&values(&["job-1", "job-1"]))
                .await
                .unwrap(),
            vec![false, true]
        );
        let locked = filter.ttl(b"job-1").await.unwrap().unwrap();
        assert!(locked <= Duration::from_secs(60));
        assert!(filter.exists(b"job-1").await.unwrap());

        assert!(filter.confirm(b"job-1").await.unwrap());
        let confirmed = filter.ttl(b"job-1").await.unwrap().unwrap();
        assert!(confirmed > Duration::from_secs(60));

        cleanup(&filter, &["job-1"]).await;
    }

    #[tokio::test]
    #[ignore]
    async fn test_confirm_after_lapsed_lock_writes_nothing() {
        let filter = key_filter("lapsed", 1).await;
        assert!(!filter.exists_and_lock(b"job-2").await.unwrap());
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert!(!filter.confirm(b"job-2").await.unwrap());
        assert!(!filter.exists(b"job-2").await.unwrap());
        assert!(!filter.exists_and_lock(b"job-2").await.unwrap());

        cleanup(&filter, &["job-2"]).await;
    }

    #[tokio::test]
    #[ignore]
    async fn test_insert_sets_confirm_ttl() {
        let filter = key_filter("insert", 60).await;
        assert_eq!(
            filter.insert_many(&values(&["a", "b"])).await.unwrap(),
            vec![true, true]
        );
        assert_eq!(
            filter.exists_many(&values(&["a", "b", "c"])).await.unwrap(),
            vec![true, true, false]
        );
        let ttl = filter.ttl(b"a").await.unwrap().unwrap();
        assert!(ttl > Duration::from_secs(60));

        filter.close().await.unwrap();
        assert!(matches!(filter.ttl(b"a").await, Err(FilterError::Closed)));

        let reopened = key_filter("insert", 60).await;
        cleanup(&reopened, &["a", "b"]).await;
    }
}
