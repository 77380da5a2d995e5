use async_trait::async_trait;
use dedup_bloom::{
    BitProbe, BitStore, BloomConfig, BloomConfigBuilder, BloomFilter,
    FilterError, MemoryBitStore, NoopLogger, Result,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::{fs, path::PathBuf};

/// Temporary path removed (file or directory) when the guard drops
pub struct TestPath {
    path: PathBuf,
}

impl TestPath {
    /// Create a path under the system temp dir named after the test
    pub fn new(test_name: &str) -> Self {
        let path = std::env::temp_dir()
            .join(format!("dedup_test_{}_{}", test_name, std::process::id()));
        let guard = Self { path };
        guard.remove();
        guard
    }

    #[allow(dead_code)]
    pub fn path(&self) -> PathBuf {
        self.path.clone()
    }

    fn remove(&self) {
        if self.path.is_dir() {
            let _ = fs::remove_dir_all(&self.path);
        } else if self.path.exists() {
            let _ = fs::remove_file(&self.path);
        }
    }
}

impl Drop for TestPath {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Borrow string values as the byte slices filters take
#[allow(dead_code)]
pub fn values<'a>(items: &[&'a str]) -> Vec<&'a [u8]> {
    items.iter().map(|s| s.as_bytes()).collect()
}

#[allow(dead_code)]
pub fn test_config(bit_width: u32, hash_count: usize, block_num: usize) -> BloomConfig {
    BloomConfigBuilder::default()
        .key_prefix("test:")
        .bit_width(bit_width)
        .hash_count(hash_count)
        .block_num(block_num)
        .logger(Arc::new(NoopLogger))
        .build()
        .expect("Failed to build test config")
}

#[allow(dead_code)]
pub async fn memory_bloom(config: BloomConfig) -> BloomFilter<Arc<MemoryBitStore>> {
    BloomFilter::new(config, Arc::new(MemoryBitStore::new()))
        .await
        .expect("Failed to create test filter")
}

/// Store whose every request fails, as during a backend outage
#[derive(Debug, Default)]
pub struct FailingStore;

#[allow(dead_code)]
fn outage() -> FilterError {
    FilterError::StorageError("connection refused".into())
}

#[async_trait]
impl BitStore for FailingStore {
    async fn register(&self) -> Result<()> {
        Err(outage())
    }

    async fn test_bits(&self, _: &[BitProbe]) -> Result<Vec<bool>> {
        Err(outage())
    }

    async fn set_bits(&self, _: &[BitProbe]) -> Result<()> {
        Err(outage())
    }

    async fn test_and_set_bits(&self, _: &[BitProbe]) -> Result<Vec<bool>> {
        Err(outage())
    }

    async fn clear_bits(&self, _: &[BitProbe]) -> Result<()> {
        Err(outage())
    }

    async fn count_bits(&self, _: &[String]) -> Result<Vec<u64>> {
        Err(outage())
    }
}

/// Memory store that counts the requests it serves
#[derive(Debug, Default)]
pub struct CountingStore {
    pub inner: MemoryBitStore,
    pub requests: AtomicUsize,
    pub clears: AtomicUsize,
}

#[allow(dead_code)]
impl CountingStore {
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn clears(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }

    fn hit(&self) {
        self.requests.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl BitStore for CountingStore {
    async fn test_bits(&self, probes: &[BitProbe]) -> Result<Vec<bool>> {
        self.hit();
        self.inner.test_bits(probes).await
    }

    async fn set_bits(&self, probes: &[BitProbe]) -> Result<()> {
        self.hit();
        self.inner.set_bits(probes).await
    }

    async fn test_and_set_bits(&self, probes: &[BitProbe]) -> Result<Vec<bool>> {
        self.hit();
        self.inner.test_and_set_bits(probes).await
    }

    async fn clear_bits(&self, probes: &[BitProbe]) -> Result<()> {
        self.hit();
        self.clears.fetch_add(1, Ordering::SeqCst);
        self.inner.clear_bits(probes).await
    }

    async fn count_bits(&self, keys: &[String]) -> Result<Vec<u64>> {
        self.hit();
        self.inner.count_bits(keys).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
