//! Sharded Bloom filter over a [`BitStore`].
//!
//! A value is reduced to a digest, the first digest byte picks one of
//! `block_num` shards, and `hash_count` seeded hashes of the (compressed)
//! digest give the bit offsets inside that shard. Every batched call is a
//! single store request, so a batch is answered atomically with respect to
//! other callers. Writes may be preceded by one eviction request.
use crate::config::BloomConfig;
use crate::error::{FilterError, Result};
use crate::filter::{Filter, Lifecycle};
use crate::hash::{OffsetHasher, ShardRouter};
use crate::reset::{FillSnapshot, ResetPolicy};
use crate::storage::{BitProbe, BitStore};
use async_trait::async_trait;

/// Where a value lives: its shard and the offsets inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub block: usize,
    pub key: String,
    /// Compressed digest the offsets were derived from
    pub digest: String,
    pub offsets: Vec<u64>,
}

impl Placement {
    pub fn probe(&self) -> BitProbe {
        BitProbe::new(self.key.clone(), self.offsets.clone())
    }
}

#[derive(Debug)]
pub struct BloomFilter<S: BitStore> {
    config: BloomConfig,
    store: S,
    router: ShardRouter,
    hasher: OffsetHasher,
    shard_keys: Vec<String>,
    reset: ResetPolicy,
    lifecycle: Lifecycle,
}

impl<S: BitStore> BloomFilter<S> {
    /// Validates `config` and prepares `store`.
    ///
    /// Store setup failures are logged and tolerated: the setup may already
    /// have been done by another process, and a store that is really down
    /// fails the first request anyway.
    pub async fn new(config: BloomConfig, store: S) -> Result<Self> {
        config.validate()?;

        let mask = config.mask();
        let router = ShardRouter::new(config.block_num);
        let hasher =
            OffsetHasher::new(config.offset_scheme, config.hash_count, mask);
        let reset = ResetPolicy::new(config.reset.clone(), mask, router);

        if let Err(e) = store.register().await {
            config.logger.warning("store setup", &e);
        }

        Ok(Self {
            shard_keys: config.shard_keys(),
            config,
            store,
            router,
            hasher,
            reset,
            lifecycle: Lifecycle::default(),
        })
    }

    pub fn config(&self) -> &BloomConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn shard_keys(&self) -> &[String] {
        &self.shard_keys
    }

    pub fn reset_policy(&self) -> &ResetPolicy {
        &self.reset
    }

    /// Shard and offsets of `value`. Pure: touches no storage.
    pub fn locate(&self, value: &[u8]) -> Result<Placement> {
        let raw = self.config.digest.digest(value);
        let block = self.router.block(&raw)?;
        let digest = self.config.digest.compress(&raw);
        let offsets = self.hasher.offsets(digest.as_bytes());
        let key = self
            .shard_keys
            .get(block)
            .cloned()
            .ok_or_else(|| FilterError::IndexOutOfBounds {
                index: block as u64,
                capacity: self.shard_keys.len() as u64,
            })?;
        Ok(Placement {
            block,
            key,
            digest,
            offsets,
        })
    }

    fn locate_all(&self, values: &[&[u8]]) -> Result<Vec<Placement>> {
        values.iter().map(|value| self.locate(value)).collect()
    }

    /// Current fill ratio of every shard, straight from the store.
    ///
    /// Set bits over the `2^bit_width` addressable ones, so a full shard is 1.0.
    pub async fn fill_ratios(&self) -> Result<Vec<f64>> {
        self.lifecycle.ensure_open()?;
        let size = (self.config.mask() + 1) as f64;
        let counts = self.store.count_bits(&self.shard_keys).await?;
        Ok(counts.into_iter().map(|c| c as f64 / size).collect())
    }

    /// Snapshot the reset policy is working from, if any.
    pub fn fill_snapshot(&self) -> Option<FillSnapshot> {
        self.reset.snapshot()
    }

    fn report(
        &self,
        operation: &'static str,
        placements: &[Placement],
        stats: &[bool],
    ) {
        let keys: Vec<String> =
            placements.iter().map(|p| p.digest.clone()).collect();
        self.config.logger.lookup(operation, &keys, stats);
    }

    async fn before_write(&self, placements: &[Placement]) {
        self.reset
            .apply(
                &self.store,
                &self.shard_keys,
                placements,
                self.config.logger.as_ref(),
            )
            .await;
    }
}

fn probes(placements: &[Placement]) -> Vec<BitProbe> {
    placements.iter().map(Placement::probe).collect()
}

fn check_len(stats: &[bool], expected: usize) -> Result<()> {
    if stats.len() != expected {
        return Err(FilterError::MalformedResponse(format!(
            "{} outcomes for {expected} values",
            stats.len()
        )));
    }
    Ok(())
}

#[async_trait]
impl<S: BitStore> Filter for BloomFilter<S> {
    async fn exists_many(&self, values: &[&[u8]]) -> Result<Vec<bool>> {
        self.lifecycle.ensure_open()?;
        if values.is_empty() {
            return Ok(Vec::new());
        }
        let placements = self.locate_all(values)?;
        let stats = self.store.test_bits(&probes(&placements)).await?;
        check_len(&stats, values.len())?;
        self.report("exists", &placements, &stats);
        Ok(stats)
    }

    async fn insert_many(&self, values: &[&[u8]]) -> Result<Vec<bool>> {
        self.lifecycle.ensure_open()?;
        if values.is_empty() {
            return Ok(Vec::new());
        }
        let placements = self.locate_all(values)?;
        self.before_write(&placements).await;
        self.store.set_bits(&probes(&placements)).await?;
        Ok(vec![true; values.len()])
    }

    async fn exists_and_insert_many(&self, values: &[&[u8]]) -> Result<Vec<bool>> {
        self.lifecycle.ensure_open()?;
        if values.is_empty() {
            return Ok(Vec::new());
        }
        let placements = self.locate_all(values)?;
        self.before_write(&placements).await;
        let stats = self.store.test_and_set_bits(&probes(&placements)).await?;
        check_len(&stats, values.len())?;
        self.report("exists_and_insert", &placements, &stats);
        Ok(stats)
    }

    async fn close(&self) -> Result<()> {
        self.lifecycle.close()?;
        self.store.close().await
    }

    fn is_closed(&self) -> bool {
        self.lifecycle.is_closed()
    }
}
