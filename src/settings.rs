//! Process-level settings read from `DEDUP_*` environment variables.
use crate::config::{BloomConfig, BloomConfigBuilder, ResetConfigBuilder};
use crate::error::{FilterError, Result};
#[cfg(feature = "redis")]
use crate::redis_storage::{RedisStoreConfig, RedisStoreConfigBuilder};
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub redis_url: String,
    pub redis_timeout: Duration,
    pub key_prefix: String,
    pub bit_width: u32,
    pub hash_count: usize,
    pub block_num: usize,
    pub reset_enabled: bool,
    pub max_fill_rate: f64,
    pub check_period: Duration,
    pub default_stat: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1/".to_string(),
            redis_timeout: Duration::from_secs(5),
            key_prefix: "dedup:".to_string(),
            bit_width: 32,
            hash_count: 6,
            block_num: 1,
            reset_enabled: false,
            max_fill_rate: 0.8,
            check_period: Duration::from_secs(7200),
            default_stat: false,
        }
    }
}

fn parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var_name: &str,
    default: T,
) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(var_name) {
        None => Ok(default),
        Some(value) => {
            value.trim().parse().map_err(|e: T::Err| FilterError::EnvParseError {
                var_name: var_name.to_string(),
                value: value.clone(),
                error: e.to_string(),
            })
        }
    }
}

impl Settings {
    /// Reads settings through `lookup`, falling back to defaults for unset
    /// variables.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            redis_url: lookup("DEDUP_REDIS_URL").unwrap_or(defaults.redis_url),
            redis_timeout: Duration::from_millis(parse(
                &lookup,
                "DEDUP_REDIS_TIMEOUT_MS",
                defaults.redis_timeout.as_millis() as u64,
            )?),
            key_prefix: lookup("DEDUP_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            bit_width: parse(&lookup, "DEDUP_BIT_WIDTH", defaults.bit_width)?,
            hash_count: parse(&lookup, "DEDUP_HASH_COUNT", defaults.hash_count)?,
            block_num: parse(&lookup, "DEDUP_BLOCK_NUM", defaults.block_num)?,
            reset_enabled: parse(
                &lookup,
                "DEDUP_RESET_ENABLED",
                defaults.reset_enabled,
            )?,
            max_fill_rate: parse(
                &lookup,
                "DEDUP_MAX_FILL_RATE",
                defaults.max_fill_rate,
            )?,
            check_period: Duration::from_secs(parse(
                &lookup,
                "DEDUP_CHECK_PERIOD_SECS",
                defaults.check_period.as_secs(),
            )?),
            default_stat: parse(
                &lookup,
                "DEDUP_DEFAULT_STAT",
                defaults.default_stat,
            )?,
        })
    }

    /// Loads `.env` if present, then reads the process environment.
    #[cfg(feature = "cli")]
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn bloom_config(&self) -> Result<BloomConfig> {
        let reset = ResetConfigBuilder::default()
            .enabled(self.reset_enabled)
            .max_fill_rate(self.max_fill_rate)
            .check_period(self.check_period)
            .build()
            .map_err(|e| FilterError::InvalidConfig(e.to_string()))?;
        let config = BloomConfigBuilder::default()
            .key_prefix(self.key_prefix.clone())
            .bit_width(self.bit_width)
            .hash_count(self.hash_count)
            .block_num(self.block_num)
            .reset(reset)
            .build()
            .map_err(|e| FilterError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    #[cfg(feature = "redis")]
    pub fn redis_config(&self) -> Result<RedisStoreConfig> {
        let config = RedisStoreConfigBuilder::default()
            .url(self.redis_url.clone())
            .request_timeout(self.redis_timeout)
            .build()
            .map_err(|e| FilterError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
