//! Saturation control for the sharded Bloom filter.
//!
//! Shards have a fixed address space, so unbounded insertion drives every bit
//! to one and the false-positive rate towards 100%. Once the fill ratio
//! reaches `max_fill_rate`, every write first clears a few bits on another
//! shard, at offsets perturbed from the ones being written. Eviction is
//! therefore close to random: a Bloom filter cannot tell which value owns a
//! bit.
//!
//! The fill ratio comes from a snapshot that is recomputed at most once per
//! `check_period`. It only decides *when* eviction runs, so a stale value is
//! harmless.
use crate::bloom::Placement;
use crate::config::ResetConfig;
use crate::error::{FilterError, Result};
use crate::hash::ShardRouter;
use crate::logging::FilterLogger;
use crate::storage::{BitProbe, BitStore};
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Per-shard fill ratios at a point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct FillSnapshot {
    taken_at: Instant,
    ratios: Vec<f64>,
}

impl FillSnapshot {
    pub fn new(ratios: Vec<f64>) -> Self {
        Self {
            taken_at: Instant::now(),
            ratios,
        }
    }

    pub fn ratios(&self) -> &[f64] {
        &self.ratios
    }

    pub fn max_ratio(&self) -> f64 {
        self.ratios.iter().copied().fold(0.0, f64::max)
    }

    pub fn age(&self) -> Duration {
        self.taken_at.elapsed()
    }

    pub fn is_fresh(&self, period: Duration) -> bool {
        self.age() < period
    }
}

/// Releases the scan flag when dropped.
struct ScanGuard<'a>(&'a AtomicBool);

impl<'a> ScanGuard<'a> {
    fn claim(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug)]
pub struct ResetPolicy {
    config: ResetConfig,
    mask: u64,
    router: ShardRouter,
    snapshot: Mutex<Option<FillSnapshot>>,
    // Set while a fill-ratio scan is in flight so concurrent callers skip it.
    scanning: AtomicBool,
}

impl ResetPolicy {
    pub fn new(config: ResetConfig, mask: u64, router: ShardRouter) -> Self {
        Self {
            config,
            mask,
            router,
            snapshot: Mutex::new(None),
            scanning: AtomicBool::new(false),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn config(&self) -> &ResetConfig {
        &self.config
    }

    /// Last cached snapshot, fresh or not.
    pub fn snapshot(&self) -> Option<FillSnapshot> {
        self.lock_snapshot().ok().and_then(|s| s.clone())
    }

    /// Drops the cached snapshot so the next write rescans.
    pub fn invalidate(&self) {
        if let Ok(mut snapshot) = self.lock_snapshot() {
            *snapshot = None;
        }
    }

    fn lock_snapshot(&self) -> Result<MutexGuard<'_, Option<FillSnapshot>>> {
        self.snapshot.lock().map_err(|e| {
            FilterError::StorageError(format!("Fill snapshot lock error: {e}"))
        })
    }

    fn cached_ratio(&self) -> Result<Option<f64>> {
        let snapshot = self.lock_snapshot()?;
        Ok(snapshot
            .as_ref()
            .filter(|s| s.is_fresh(self.config.check_period))
            .map(FillSnapshot::max_ratio))
    }

    /// Fill ratio that gates eviction: the fullest shard.
    ///
    /// `None` when the snapshot is stale and another caller is already
    /// rescanning.
    pub async fn fill_ratio<S: BitStore + ?Sized>(
        &self,
        store: &S,
        shard_keys: &[String],
    ) -> Result<Option<f64>> {
        if let Some(ratio) = self.cached_ratio()? {
            return Ok(Some(ratio));
        }
        let Some(_guard) = ScanGuard::claim(&self.scanning) else {
            return Ok(None);
        };
        let counts = store.count_bits(shard_keys).await?;
        if counts.len() != shard_keys.len() {
            return Err(FilterError::MalformedResponse(format!(
                "{} bit counts for {} shards",
                counts.len(),
                shard_keys.len()
            )));
        }
        let size = (self.mask + 1) as f64;
        let ratios = counts.iter().map(|&count| count as f64 / size).collect();
        let snapshot = FillSnapshot::new(ratios);
        let ratio = snapshot.max_ratio();
        *self.lock_snapshot()? = Some(snapshot);
        Ok(Some(ratio))
    }

    /// Clear requests for the values about to be written.
    ///
    /// Each value evicts from a shard other than its own (its own when there
    /// is only one), at `(offset + step) % mask` with `step` drawn from
    /// `1..=block_num` per offset. Requests are merged per target shard.
    pub fn eviction_probes<R: Rng + ?Sized>(
        &self,
        shard_keys: &[String],
        placements: &[Placement],
        rng: &mut R,
    ) -> Vec<BitProbe> {
        let block_num = self.router.block_num() as u64;
        let mut targets: BTreeMap<usize, BTreeSet<u64>> = BTreeMap::new();
        for placement in placements {
            let target = self.router.eviction_target(placement.block, rng);
            let offsets = targets.entry(target).or_default();
            for &offset in &placement.offsets {
                let step = rng.random_range(1..=block_num);
                offsets.insert((offset + step) % self.mask);
            }
        }
        targets
            .into_iter()
            .filter_map(|(block, offsets)| {
                let key = shard_keys.get(block)?;
                Some(BitProbe::new(key.clone(), offsets.into_iter().collect()))
            })
            .collect()
    }

    /// Runs the policy ahead of a write. Failures are logged, never returned.
    pub async fn apply<S: BitStore + ?Sized>(
        &self,
        store: &S,
        shard_keys: &[String],
        placements: &[Placement],
        logger: &dyn FilterLogger,
    ) {
        if !self.config.enabled || placements.is_empty() {
            return;
        }
        if let Err(e) = self.evict(store, shard_keys, placements, logger).await {
            logger.warning("reset policy", &e);
        }
    }

    async fn evict<S: BitStore + ?Sized>(
        &self,
        store: &S,
        shard_keys: &[String],
        placements: &[Placement],
        logger: &dyn FilterLogger,
    ) -> Result<usize> {
        let Some(ratio) = self.fill_ratio(store, shard_keys).await? else {
            return Ok(0);
        };
        if ratio < self.config.max_fill_rate {
            return Ok(0);
        }
        let probes =
            self.eviction_probes(shard_keys, placements, &mut rand::rng());
        if probes.is_empty() {
            return Ok(0);
        }
        store.clear_bits(&probes).await?;
        let cleared = probes.iter().map(|p| p.offsets.len()).sum();
        let keys: Vec<String> = probes.into_iter().map(|p| p.key).collect();
        logger.eviction(&keys, cleared, ratio);
        Ok(cleared)
    }
}
