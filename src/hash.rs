use crate::error::{FilterError, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use fnv::FnvHasher;
use murmur3::{murmur3_32, murmur3_x64_128};
use rand::Rng;
use std::hash::Hasher;
use std::io::Cursor;

/// Maps a raw value to its digest.
///
/// The digest must start with two hex characters: the first byte picks the
/// shard. Filters probe the function once at construction and reject it
/// otherwise.
pub type ValueHashFunction = fn(&[u8]) -> String;

/// Re-encodes a digest into a (usually shorter) storage key.
pub type CompressFunction = fn(&str) -> String;

const SFB_CHARACTERS: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

pub(crate) fn hash_murmur32(key: &[u8]) -> u32 {
    let mut cursor = Cursor::new(key);
    murmur3_32(&mut cursor, 0).expect("Failed to compute Murmur3 hash")
}

pub(crate) fn hash_fnv32(key: &[u8]) -> u32 {
    let mut hasher = FnvHasher::default();
    hasher.write(key);
    hasher.finish() as u32
}

/// 128-bit murmur3 content hash rendered as 32 lowercase hex characters.
pub fn default_value_hash(value: &[u8]) -> String {
    let mut cursor = Cursor::new(value);
    let digest = murmur3_x64_128(&mut cursor, 0)
        .expect("Failed to compute Murmur3 x64/128 hash");
    format!("{digest:032x}")
}

pub fn identity(digest: &str) -> String {
    digest.to_string()
}

/// Hex digest to standard base64 (32 hex chars become 24 base64 chars).
///
/// Input that is not valid hex is returned unchanged.
pub fn hex_to_base64(digest: &str) -> String {
    match hex::decode(digest) {
        Ok(bytes) => STANDARD.encode(bytes),
        Err(_) => digest.to_string(),
    }
}

/// Hex digest to a positional base-64 number (no padding, no leading zeros).
///
/// One to three characters shorter than [`hex_to_base64`] for 128-bit
/// digests. Digests wider than 128 bits or not valid hex are returned
/// unchanged.
pub fn hex_to_sfb(digest: &str) -> String {
    let Ok(mut num) = u128::from_str_radix(digest, 16) else {
        return digest.to_string();
    };
    let mut out = Vec::with_capacity(22);
    while num > 0 {
        out.push(SFB_CHARACTERS[(num % 64) as usize]);
        num /= 64;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Mask for an address space of `bit_width` bits.
pub fn address_mask(bit_width: u32) -> u64 {
    (1u64 << bit_width) - 1
}

/// Polynomial string hash with a per-instance seed.
///
/// `acc += seed * acc + byte` over the input, masked at the end. Wrapping
/// 64-bit arithmetic yields the same low bits as unbounded arithmetic, and
/// the mask never keeps more than 32 of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeededHash {
    seed: u64,
    mask: u64,
}

impl SeededHash {
    pub fn new(seed: u64, mask: u64) -> Self {
        Self { seed, mask }
    }

    pub fn offset(&self, data: &[u8]) -> u64 {
        let acc = data.iter().fold(0u64, |acc, &byte| {
            acc.wrapping_add(self.seed.wrapping_mul(acc))
                .wrapping_add(byte as u64)
        });
        acc & self.mask
    }
}

/// How the `k` bit offsets of a value are derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffsetScheme {
    /// `k` [`SeededHash`] instances with seeds `1..=k`.
    #[default]
    Polynomial,
    /// `h1 + i * h2` over murmur3-32 and FNV-32, masked.
    DoubleHashing,
}

/// Produces the `hash_count` offsets for a compressed digest.
#[derive(Debug, Clone)]
pub struct OffsetHasher {
    scheme: OffsetScheme,
    hashes: Vec<SeededHash>,
    mask: u64,
}

impl OffsetHasher {
    pub fn new(scheme: OffsetScheme, hash_count: usize, mask: u64) -> Self {
        let hashes = (1..=hash_count as u64)
            .map(|seed| SeededHash::new(seed, mask))
            .collect();
        Self {
            scheme,
            hashes,
            mask,
        }
    }

    pub fn hash_count(&self) -> usize {
        self.hashes.len()
    }

    pub fn mask(&self) -> u64 {
        self.mask
    }

    pub fn offsets(&self, data: &[u8]) -> Vec<u64> {
        match self.scheme {
            OffsetScheme::Polynomial => {
                self.hashes.iter().map(|h| h.offset(data)).collect()
            }
            OffsetScheme::DoubleHashing => {
                let h1 = hash_murmur32(data) as u64;
                let h2 = hash_fnv32(data) as u64;
                (0..self.hashes.len() as u64)
                    .map(|i| h1.wrapping_add(i.wrapping_mul(h2)) & self.mask)
                    .collect()
            }
        }
    }
}

/// Routes digests to shards and picks eviction targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRouter {
    block_num: usize,
}

impl ShardRouter {
    pub fn new(block_num: usize) -> Self {
        Self { block_num }
    }

    pub fn block_num(&self) -> usize {
        self.block_num
    }

    /// First digest byte (two hex chars) modulo the shard count.
    pub fn block(&self, digest: &str) -> Result<usize> {
        let head = digest.get(0..2).ok_or_else(|| {
            FilterError::InvalidDigest(format!(
                "digest '{digest}' is shorter than two characters"
            ))
        })?;
        let byte = u8::from_str_radix(head, 16).map_err(|_| {
            FilterError::InvalidDigest(format!(
                "digest '{digest}' does not start with a hex byte"
            ))
        })?;
        Ok(byte as usize % self.block_num)
    }

    /// Uniform pick among the shards other than `current`.
    ///
    /// With a single shard there is nothing else to pick, so `current` is
    /// returned.
    pub fn eviction_target<R: Rng + ?Sized>(
        &self,
        current: usize,
        rng: &mut R,
    ) -> usize {
        if self.block_num <= 1 {
            return current;
        }
        let pick = rng.random_range(0..self.block_num - 1);
        if pick >= current { pick + 1 } else { pick }
    }
}
