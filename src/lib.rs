//! Deduplication filters for crawlers and stream processors.
//!
//! The main engine is a Bloom filter sharded across `block_num` bit arrays
//! held in a shared [`BitStore`] (Redis in production, memory in tests):
//!
//!    * Digest: each value is hashed to a hex digest; its first byte picks
//!      the shard, and `hash_count` seeded hashes of the digest pick the bit
//!      offsets inside it.
//!    * Atomicity: every batched call is one store request (one Lua script
//!      on Redis), so `exists_and_insert` has exactly one winner among
//!      concurrent callers, across processes.
//!    * Saturation: with the reset policy enabled, once the fullest shard
//!      passes `max_fill_rate` every write first clears a few bits on
//!      another shard. Old entries fade out and the false-positive rate
//!      stays bounded, at the price of occasional false negatives.
//!    * Availability: [`FailSafeFilter`] turns backend outages into a
//!      configured default outcome instead of an error.
//!
//! Exact backends ([`InMemoryFilter`], [`FileFilter`], [`RedisSetFilter`],
//! [`RedisKeyFilter`], [`RedbFilter`]) implement the same [`Filter`] trait, and
//! [`BlockingFilter`] exposes any of them to synchronous code.
//!
//! ```no_run
//! use dedup_bloom::{BloomConfigBuilder, BloomFilter, FailSafeFilter, Filter, MemoryBitStore};
//!
//! # async fn demo() -> dedup_bloom::Result<()> {
//! let config = BloomConfigBuilder::default()
//!     .key_prefix("orders:")
//!     .bit_width(20)
//!     .hash_count(4)
//!     .build()
//!     .expect("complete config");
//! let filter = FailSafeFilter::new(BloomFilter::new(config, MemoryBitStore::new()).await?, false);
//! assert!(!filter.exists_and_insert(b"order-123").await?);
//! assert!(filter.exists_and_insert(b"order-123").await?);
//! # Ok(())
//! # }
//! ```
mod blocking;
mod bloom;
pub mod common;
mod config;
mod counter;
mod error;
mod file_filter;
mod filter;
mod hash;
mod inmemory_filter;
mod logging;
#[cfg(feature = "redb")]
mod redb_filter;
#[cfg(feature = "redis")]
mod redis_key_filter;
#[cfg(feature = "redis")]
mod redis_set_filter;
#[cfg(feature = "redis")]
mod redis_storage;
mod reset;
mod settings;
mod storage;

pub use blocking::BlockingFilter;
pub use bloom::{BloomFilter, Placement};
pub use config::{
    BloomConfig, BloomConfigBuilder, BloomConfigBuilderError, DigestConfig,
    DigestConfigBuilder, DigestConfigBuilderError, MAX_BIT_WIDTH, ResetConfig,
    ResetConfigBuilder, ResetConfigBuilderError,
};
pub use counter::{CounterSummary, FilterCounter};
pub use error::{FilterError, Result};
pub use file_filter::{DUP_FILE_NAME, FileFilter};
pub use filter::{DefaultFilter, FailSafeFilter, Filter, Lifecycle, Resource};
pub use hash::{
    CompressFunction, OffsetHasher, OffsetScheme, SeededHash, ShardRouter,
    ValueHashFunction, address_mask, default_value_hash, hex_to_base64,
    hex_to_sfb, identity,
};
pub use inmemory_filter::InMemoryFilter;
pub use logging::{FilterLogger, NoopLogger, TracingLogger};
#[cfg(feature = "redb")]
pub use redb_filter::{
    RedbFilter, RedbFilterConfig, RedbFilterConfigBuilder,
    RedbFilterConfigBuilderError,
};
#[cfg(feature = "redis")]
pub use redis_key_filter::{
    RedisKeyConfig, RedisKeyConfigBuilder, RedisKeyConfigBuilderError,
    RedisKeyFilter,
};
#[cfg(feature = "redis")]
pub use redis_set_filter::{
    RedisSetConfig, RedisSetConfigBuilder, RedisSetConfigBuilderError,
    RedisSetFilter, SetMode,
};
#[cfg(feature = "redis")]
pub use redis_storage::{
    RedisBitStore, RedisLink, RedisStoreConfig, RedisStoreConfigBuilder,
    RedisStoreConfigBuilderError,
};
pub use reset::{FillSnapshot, ResetPolicy};
pub use settings::Settings;
pub use storage::{BitProbe, BitStore, MAX_KEY_BITS, MemoryBitStore, PAGE_BITS};
