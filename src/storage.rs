use crate::error::{FilterError, Result};
use async_trait::async_trait;
use bitvec::{array::BitArray, order::Lsb0};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Bits addressable in a single key (a 512 MiB Redis string).
pub const MAX_KEY_BITS: u64 = 1 << 32;

/// A set of bit offsets within one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitProbe {
    pub key: String,
    pub offsets: Vec<u64>,
}

impl BitProbe {
    pub fn new(key: impl Into<String>, offsets: Vec<u64>) -> Self {
        Self {
            key: key.into(),
            offsets,
        }
    }
}

/// Key-addressable bit arrays with batched atomic requests.
///
/// Every method call is one request: implementations must execute all probes
/// of a call without interleaving other requests on the same keys. Keys that
/// were never written read as all zeroes.
#[async_trait]
pub trait BitStore: Send + Sync {
    /// One-time setup such as loading server-side scripts.
    async fn register(&self) -> Result<()> {
        Ok(())
    }

    /// Per probe: whether every offset is set.
    async fn test_bits(&self, probes: &[BitProbe]) -> Result<Vec<bool>>;

    /// Sets every offset of every probe.
    async fn set_bits(&self, probes: &[BitProbe]) -> Result<()>;

    /// Per probe, in order: reports whether every offset was already set,
    /// then sets the ones that were not.
    async fn test_and_set_bits(&self, probes: &[BitProbe]) -> Result<Vec<bool>>;

    /// Clears every offset of every probe.
    async fn clear_bits(&self, probes: &[BitProbe]) -> Result<()>;

    /// Number of set bits per key.
    async fn count_bits(&self, keys: &[String]) -> Result<Vec<u64>>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn get_bit(&self, key: &str, offset: u64) -> Result<bool> {
        let probe = BitProbe::new(key, vec![offset]);
        let bits = self.test_bits(std::slice::from_ref(&probe)).await?;
        bits.first().copied().ok_or_else(|| {
            FilterError::MalformedResponse("empty reply to a bit read".into())
        })
    }

    async fn set_bit(&self, key: &str, offset: u64) -> Result<()> {
        self.set_bits(&[BitProbe::new(key, vec![offset])]).await
    }
}

#[async_trait]
impl<S: BitStore + ?Sized> BitStore for Arc<S> {
    async fn register(&self) -> Result<()> {
        (**self).register().await
    }

    async fn test_bits(&self, probes: &[BitProbe]) -> Result<Vec<bool>> {
        (**self).test_bits(probes).await
    }

    async fn set_bits(&self, probes: &[BitProbe]) -> Result<()> {
        (**self).set_bits(probes).await
    }

    async fn test_and_set_bits(&self, probes: &[BitProbe]) -> Result<Vec<bool>> {
        (**self).test_and_set_bits(probes).await
    }

    async fn clear_bits(&self, probes: &[BitProbe]) -> Result<()> {
        (**self).clear_bits(probes).await
    }

    async fn count_bits(&self, keys: &[String]) -> Result<Vec<u64>> {
        (**self).count_bits(keys).await
    }

    async fn close(&self) -> Result<()> {
        (**self).close().await
    }

    async fn get_bit(&self, key: &str, offset: u64) -> Result<bool> {
        (**self).get_bit(key, offset).await
    }

    async fn set_bit(&self, key: &str, offset: u64) -> Result<()> {
        (**self).set_bit(key, offset).await
    }
}

/// Rejects offsets past the addressable range of a key.
pub(crate) fn check_bounds(probes: &[BitProbe]) -> Result<()> {
    let max_index = probes
        .iter()
        .flat_map(|p| p.offsets.iter().copied())
        .max();
    if let Some(index) = max_index {
        if index >= MAX_KEY_BITS {
            return Err(FilterError::IndexOutOfBounds {
                index,
                capacity: MAX_KEY_BITS,
            });
        }
    }
    Ok(())
}

/// Bits per page of a [`MemoryBitStore`] shard.
pub const PAGE_BITS: u64 = 4096;

type Page = BitArray<[u64; (PAGE_BITS / 64) as usize], Lsb0>;
type Shard = HashMap<u64, Box<Page>>;
type Shards = HashMap<String, Shard>;

/// In-process bit store.
///
/// One mutex guards all shards, which makes every request atomic. A shard
/// is a sparse map of fixed-size pages: a page is allocated when one of its
/// bits is first set and dropped once all of its bits are clear, so memory
/// follows the bits in use rather than the address space.
#[derive(Debug, Default)]
pub struct MemoryBitStore {
    shards: Mutex<Shards>,
    closed: AtomicBool,
}

impl MemoryBitStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bits held in allocated pages across all shards.
    pub fn allocated_bits(&self) -> Result<u64> {
        let shards = self.lock()?;
        Ok(shards.values().map(|pages| pages.len() as u64).sum::<u64>() * PAGE_BITS)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Shards>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FilterError::Closed);
        }
        self.shards.lock().map_err(|e| {
            FilterError::StorageError(format!("Memory store lock error: {e}"))
        })
    }

    fn split(offset: u64) -> (u64, usize) {
        (offset / PAGE_BITS, (offset % PAGE_BITS) as usize)
    }

    fn get(shards: &Shards, key: &str, offset: u64) -> bool {
        let (page, bit) = Self::split(offset);
        shards
            .get(key)
            .and_then(|pages| pages.get(&page))
            .map(|page| page[bit])
            .unwrap_or(false)
    }

    fn put(shards: &mut Shards, key: &str, offset: u64, value: bool) {
        let (index, bit) = Self::split(offset);
        if value {
            shards
                .entry(key.to_string())
                .or_default()
                .entry(index)
                .or_insert_with(|| Box::new(Page::ZERO))
                .set(bit, true);
            return;
        }
        let Some(pages) = shards.get_mut(key) else {
            return;
        };
        if let Some(page) = pages.get_mut(&index) {
            page.set(bit, false);
            if page.not_any() {
                pages.remove(&index);
            }
        }
        if pages.is_empty() {
            shards.remove(key);
        }
    }
}

#[async_trait]
impl BitStore for MemoryBitStore {
    async fn test_bits(&self, probes: &[BitProbe]) -> Result<Vec<bool>> {
        check_bounds(probes)?;
        let shards = self.lock()?;
        Ok(probes
            .iter()
            .map(|probe| {
                probe
                    .offsets
                    .iter()
                    .all(|&offset| Self::get(&shards, &probe.key, offset))
            })
            .collect())
    }

    async fn set_bits(&self, probes: &[BitProbe]) -> Result<()> {
        check_bounds(probes)?;
        let mut shards = self.lock()?;
        for probe in probes {
            for &offset in &probe.offsets {
                Self::put(&mut shards, &probe.key, offset, true);
            }
        }
        Ok(())
    }

    async fn test_and_set_bits(&self, probes: &[BitProbe]) -> Result<Vec<bool>> {
        check_bounds(probes)?;
        let mut shards = self.lock()?;
        let mut stats = Vec::with_capacity(probes.len());
        for probe in probes {
            let mut exists = true;
            for &offset in &probe.offsets {
                if !Self::get(&shards, &probe.key, offset) {
                    exists = false;
                    Self::put(&mut shards, &probe.key, offset, true);
                }
            }
            stats.push(exists);
        }
        Ok(stats)
    }

    async fn clear_bits(&self, probes: &[BitProbe]) -> Result<()> {
        check_bounds(probes)?;
        let mut shards = self.lock()?;
        for probe in probes {
            for &offset in &probe.offsets {
                Self::put(&mut shards, &probe.key, offset, false);
            }
        }
        Ok(())
    }

    async fn count_bits(&self, keys: &[String]) -> Result<Vec<u64>> {
        let shards = self.lock()?;
        Ok(keys
            .iter()
            .map(|key| {
                shards
                    .get(key)
                    .map(|pages| {
                        pages.values().map(|p| p.count_ones() as u64).sum()
                    })
                    .unwrap_or(0)
            })
            .collect())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        let mut shards = self.shards.lock().map_err(|e| {
            FilterError::StorageError(format!("Memory store lock error: {e}"))
        })?;
        shards.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unwritten_keys_read_as_zero() {
        let store = MemoryBitStore::new();
        assert!(!store.get_bit("k", 10).await.unwrap());
        assert_eq!(store.count_bits(&["k".into()]).await.unwrap(), vec![0]);
        let stats = store
            .test_bits(&[BitProbe::new("k", vec![1, 2])])
            .await
            .unwrap();
        assert_eq!(stats, vec![false]);
    }

    #[tokio::test]
    async fn test_set_and_test_bits() {
        let store = MemoryBitStore::new();
        store
            .set_bits(&[BitProbe::new("a", vec![3, 900]), BitProbe::new("b", vec![0])])
            .await
            .unwrap();
        let stats = store
            .test_bits(&[
                BitProbe::new("a", vec![3, 900]),
                BitProbe::new("a", vec![3, 4]),
                BitProbe::new("b", vec![0]),
            ])
            .await
            .unwrap();
        assert_eq!(stats, vec![true, false, true]);
        assert_eq!(
            store.count_bits(&["a".into(), "b".into()]).await.unwrap(),
            vec![2, 1]
        );
    }

    #[tokio::test]
    async fn test_and_set_reports_pre_state_in_order() {
        let store = MemoryBitStore::new();
        let probe = BitProbe::new("k", vec![5, 6, 7]);
        let stats = store
            .test_and_set_bits(&[probe.clone(), probe.clone()])
            .await
            .unwrap();
        assert_eq!(stats, vec![false, true]);
        assert_eq!(store.count_bits(&["k".into()]).await.unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn test_clear_bits() {
        let store = MemoryBitStore::new();
        store.set_bits(&[BitProbe::new("k", vec![1, 2, 3])]).await.unwrap();
        store
            .clear_bits(&[BitProbe::new("k", vec![2, 50]), BitProbe::new("x", vec![1])])
            .await
            .unwrap();
        assert!(store.get_bit("k", 1).await.unwrap());
        assert!(!store.get_bit("k", 2).await.unwrap());
        assert_eq!(store.count_bits(&["k".into()]).await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_offset_bounds() {
        let store = MemoryBitStore::new();
        let err = store
            .set_bits(&[BitProbe::new("k", vec![MAX_KEY_BITS])])
            .await
            .unwrap_err();
        assert!(matches!(err, FilterError::IndexOutOfBounds { .. }));
    }

    #[tokio::test]
    async fn test_wide_shards_allocate_pages_on_demand() {
        let store = MemoryBitStore::new();
        let top = MAX_KEY_BITS - 1;
        store
            .set_bits(&[BitProbe::new("wide", vec![3, top, top / 2])])
            .await
            .unwrap();
        assert_eq!(store.allocated_bits().unwrap(), 3 * PAGE_BITS);
        assert!(store.get_bit("wide", top).await.unwrap());
        assert!(!store.get_bit("wide", top - 1).await.unwrap());
        assert_eq!(store.count_bits(&["wide".into()]).await.unwrap(), vec![3]);

        store
            .clear_bits(&[BitProbe::new("wide", vec![top, top / 2])])
            .await
            .unwrap();
        assert_eq!(store.allocated_bits().unwrap(), PAGE_BITS);
    }

    // Answers single-bit calls itself and fails the batched ones
    struct DirectBits;

    #[async_trait]
    impl BitStore for DirectBits {
        async fn test_bits(&self, _: &[BitProbe]) -> Result<Vec<bool>> {
            Err(FilterError::StorageError("batched read".into()))
        }

        async fn set_bits(&self, _: &[BitProbe]) -> Result<()> {
            Err(FilterError::StorageError("batched write".into()))
        }

        async fn test_and_set_bits(&self, _: &[BitProbe]) -> Result<Vec<bool>> {
            Err(FilterError::StorageError("batched write".into()))
        }

        async fn clear_bits(&self, _: &[BitProbe]) -> Result<()> {
            Err(FilterError::StorageError("batched write".into()))
        }

        async fn count_bits(&self, _: &[String]) -> Result<Vec<u64>> {
            Ok(Vec::new())
        }

        async fn get_bit(&self, _: &str, _: u64) -> Result<bool> {
            Ok(true)
        }

        async fn set_bit(&self, _: &str, _: u64) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_shared_store_keeps_single_bit_overrides() {
        let store: Arc<dyn BitStore> = Arc::new(DirectBits);
        assert!(store.get_bit("k", 1).await.unwrap());
        store.set_bit("k", 1).await.unwrap();
        assert!(store.test_bits(&[]).await.is_err());
    }

    #[tokio::test]
    async fn test_closed_store_rejects_requests() {
        let store = MemoryBitStore::new();
        store.set_bit("k", 1).await.unwrap();
        store.close().await.unwrap();
        assert!(matches!(
            store.get_bit("k", 1).await,
            Err(FilterError::Closed)
        ));
    }
}
