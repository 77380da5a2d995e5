use crate::error::{FilterError, Result};
use crate::hash::{
    CompressFunction, OffsetScheme, ShardRouter, ValueHashFunction,
    address_mask, default_value_hash, identity,
};
use crate::logging::{FilterLogger, TracingLogger};
use derive_builder::Builder;
use std::sync::Arc;
use std::time::Duration;

/// Largest shard address space: a Redis string tops out at 512 MiB.
pub const MAX_BIT_WIDTH: u32 = 32;

const DIGEST_PROBE: &[u8] = b"dedup-probe";

/// Value-to-key transformation shared by every backend.
#[derive(Clone, Debug, Builder)]
#[builder(pattern = "owned")]
pub struct DigestConfig {
    /// Maps a raw value to its digest
    #[builder(default = "default_value_hash")]
    pub hash_function: ValueHashFunction,

    /// Re-encodes the digest before it is stored or hashed into offsets
    #[builder(default = "identity")]
    pub compress_function: CompressFunction,
}

impl Default for DigestConfig {
    fn default() -> Self {
        Self {
            hash_function: default_value_hash,
            compress_function: identity,
        }
    }
}

impl DigestConfig {
    pub fn digest(&self, value: &[u8]) -> String {
        (self.hash_function)(value)
    }

    pub fn compress(&self, digest: &str) -> String {
        (self.compress_function)(digest)
    }

    /// Digest followed by compression: the form exact backends store.
    pub fn key(&self, value: &[u8]) -> String {
        self.compress(&self.digest(value))
    }

    pub fn validate(&self) -> Result<()> {
        let digest = self.digest(DIGEST_PROBE);
        if digest.is_empty() {
            return Err(FilterError::InvalidConfig(
                "Value hash function returned an empty digest".into(),
            ));
        }
        if self.compress(&digest).is_empty() {
            return Err(FilterError::InvalidConfig(
                "Compress function returned an empty key".into(),
            ));
        }
        Ok(())
    }
}

/// Saturation control for the Bloom engine.
#[derive(Clone, Debug, Builder)]
#[builder(pattern = "owned")]
pub struct ResetConfig {
    #[builder(default = "false")]
    pub enabled: bool,

    /// Fill ratio at which eviction starts (0.0 exclusive to 1.0 inclusive)
    #[builder(default = "0.8")]
    pub max_fill_rate: f64,

    /// How long a fill-ratio snapshot is trusted before it is recomputed
    #[builder(default = "Duration::from_secs(7200)")]
    pub check_period: Duration,
}

impl Default for ResetConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_fill_rate: 0.8,
            check_period: Duration::from_secs(7200),
        }
    }
}

impl ResetConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.max_fill_rate > 0.0 && self.max_fill_rate <= 1.0) {
            return Err(FilterError::InvalidConfig(format!(
                "max_fill_rate must be in (0, 1], got {}",
                self.max_fill_rate
            )));
        }
        if self.check_period.is_zero() {
            return Err(FilterError::InvalidConfig(
                "check_period must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration of a sharded Bloom filter.
#[derive(Clone, Debug, Builder)]
#[builder(pattern = "owned")]
pub struct BloomConfig {
    /// Shard keys are `key_prefix + block_index`
    #[builder(setter(into), default = "\"dedup:\".to_string()")]
    pub key_prefix: String,

    /// Bits of address space per shard (1..=32)
    #[builder(default = "32")]
    pub bit_width: u32,

    /// Number of offsets per value
    #[builder(default = "6")]
    pub hash_count: usize,

    /// Number of shards
    #[builder(default = "1")]
    pub block_num: usize,

    #[builder(default)]
    pub offset_scheme: OffsetScheme,

    #[builder(default)]
    pub reset: ResetConfig,

    #[builder(default)]
    pub digest: DigestConfig,

    #[builder(default = "Arc::new(TracingLogger)")]
    pub logger: Arc<dyn FilterLogger>,
}

impl Default for BloomConfig {
    fn default() -> Self {
        Self {
            key_prefix: "dedup:".to_string(),
            bit_width: 32,
            hash_count: 6,
            block_num: 1,
            offset_scheme: OffsetScheme::default(),
            reset: ResetConfig::default(),
            digest: DigestConfig::default(),
            logger: Arc::new(TracingLogger),
        }
    }
}

impl BloomConfig {
    pub fn validate(&self) -> Result<()> {
        if self.bit_width == 0 || self.bit_width > MAX_BIT_WIDTH {
            return Err(FilterError::InvalidConfig(format!(
                "bit_width must be between 1 and {MAX_BIT_WIDTH}, got {}",
                self.bit_width
            )));
        }
        if self.hash_count == 0 {
            return Err(FilterError::InvalidConfig(
                "hash_count must be at least 1".into(),
            ));
        }
        if self.block_num == 0 {
            return Err(FilterError::InvalidConfig(
                "block_num must be at least 1".into(),
            ));
        }
        self.reset.validate()?;
        self.digest.validate()?;
        ShardRouter::new(self.block_num)
            .block(&self.digest.digest(DIGEST_PROBE))
            .map_err(|e| {
                FilterError::InvalidConfig(format!(
                    "Value hash function is not usable for shard routing: {e}"
                ))
            })?;
        Ok(())
    }

    pub fn mask(&self) -> u64 {
        address_mask(self.bit_width)
    }

    pub fn shard_key(&self, block: usize) -> String {
        format!("{}{}", self.key_prefix, block)
    }

    pub fn shard_keys(&self) -> Vec<String> {
        (0..self.block_num).map(|b| self.shard_key(b)).collect()
    }
}
