//! Exact membership as one expiring Redis string per value.
//!
//! Every value maps to the key `key_prefix + compressed digest`. Two TTLs
//! give a lock/confirm protocol for work queues: [`RedisKeyFilter::exists_and_lock`]
//! claims a value for `lock_ttl`, and [`RedisKeyFilter::confirm`] extends
//! the claim to `confirm_ttl` once the work is done. A worker that dies
//! before confirming lets the lock lapse, so the value is picked up again.
use crate::config::DigestConfig;
use crate::error::{FilterError, Result};
use crate::filter::{Filter, Resource};
use crate::logging::{FilterLogger, TracingLogger};
use crate::redis_storage::RedisLink;
use async_trait::async_trait;
use derive_builder::Builder;
use redis::Script;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const KEY_EXISTS: &str = r#"
local result = {}
for _, key in ipairs(KEYS) do
    table.insert(result, redis.call('EXISTS', key))
end
return result
"#;

const KEY_LOCK: &str = r#"
local result = {}
for _, key in ipairs(KEYS) do
    if redis.call('SET', key, '', 'NX', 'EX', ARGV[1]) then
        table.insert(result, 0)
    else
        table.insert(result, 1)
    end
end
return result
"#;

const KEY_INSERT: &str = r#"
for _, key in ipairs(KEYS) do
    redis.call('SET', key, '', 'EX', ARGV[1])
end
return 1
"#;

const KEY_CONFIRM: &str = r#"
local result = {}
for _, key in ipairs(KEYS) do
    local exist = redis.call('EXISTS', key)
    table.insert(result, exist)
    if exist == 1 then
        redis.call('EXPIRE', key, ARGV[1])
    end
end
return result
"#;

#[derive(Clone, Debug, Builder)]
#[builder(pattern = "owned")]
pub struct RedisKeyConfig {
    #[builder(setter(into), default = "\"dedup:key:\".to_string()")]
    pub key_prefix: String,

    /// Lifetime of a key created by `exists_and_lock`
    #[builder(default = "Duration::from_secs(7200)")]
    pub lock_ttl: Duration,

    /// Lifetime of a key after `insert` or `confirm`
    #[builder(default = "Duration::from_secs(2_592_000)")]
    pub confirm_ttl: Duration,

    #[builder(default)]
    pub digest: DigestConfig,

    #[builder(default = "Arc::new(TracingLogger)")]
    pub logger: Arc<dyn FilterLogger>,
}

impl RedisKeyConfig {
    /// Redis expires keys with second granularity, so both TTLs need at
    /// least one whole second.
    pub fn validate(&self) -> Result<()> {
        for (name, ttl) in [("lock_ttl", self.lock_ttl), ("confirm_ttl", self.confirm_ttl)] {
            if ttl.as_secs() == 0 {
                return Err(FilterError::InvalidConfig(format!(
                    "{name} must be at least one second, got {ttl:?}"
                )));
            }
        }
        self.digest.validate()
    }
}

struct Scripts {
    exists: Script,
    lock: Script,
    insert: Script,
    confirm: Script,
}

pub struct RedisKeyFilter {
    config: RedisKeyConfig,
    link: Resource<RedisLink>,
    scripts: Scripts,
}

impl fmt::Debug for RedisKeyFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisKeyFilter")
            .field("config", &self.config)
            .field("closed", &self.link.is_closed())
            .finish_non_exhaustive()
    }
}

impl RedisKeyFilter {
    pub async fn new(config: RedisKeyConfig, link: RedisLink) -> Result<Self> {
        config.validate()?;
        for source in [KEY_EXISTS, KEY_LOCK, KEY_INSERT, KEY_CONFIRM] {
            if let Err(e) = link.load(source).await {
                config.logger.warning("script load", &e);
            }
        }
        Ok(Self {
            config,
            link: Resource::new(link),
            scripts: Scripts {
                exists: Script::new(KEY_EXISTS),
                lock: Script::new(KEY_LOCK),
                insert: Script::new(KEY_INSERT),
                confirm: Script::new(KEY_CONFIRM),
            },
        })
    }

    pub fn config(&self) -> &RedisKeyConfig {
        &self.config
    }

    /// Redis key holding `value`.
    pub fn key(&self, value: &[u8]) -> String {
        format!("{}{}", self.config.key_prefix, self.config.digest.key(value))
    }

    fn keys(&self, values: &[&[u8]]) -> Vec<String> {
        values.iter().map(|v| self.key(v)).collect()
    }

    async fn flags(
        &self,
        operation: &'static str,
        script: &Script,
        values: &[&[u8]],
        args: &[String],
    ) -> Result<Vec<bool>> {
        let link = self.link.get()?;
        if values.is_empty() {
            return Ok(Vec::new());
        }
        let keys = self.keys(values);
        let raw: Vec<i64> = link.invoke(script, &keys, args).await?;
        if raw.len() != values.len() {
            return Err(FilterError::MalformedResponse(format!(
                "script returned {} flags for {} values",
                raw.len(),
                values.len()
            )));
        }
        let stats: Vec<bool> = raw.into_iter().map(|flag| flag != 0).collect();
        self.config.logger.lookup(operation, &keys, &stats);
        Ok(stats)
    }

    /// Claims every absent value for `lock_ttl`. Same as
    /// [`Filter::exists_and_insert_many`].
    pub async fn exists_and_lock_many(&self, values: &[&[u8]]) -> Result<Vec<bool>> {
        self.exists_and_insert_many(values).await
    }

    pub async fn exists_and_lock(&self, value: &[u8]) -> Result<bool> {
        self.exists_and_insert(value).await
    }

    /// Extends existing keys to `confirm_ttl`.
    ///
    /// Returns whether each key still existed. A `false` means the lock
    /// lapsed before the confirmation and nothing was written.
    pub async fn confirm_many(&self, values: &[&[u8]]) -> Result<Vec<bool>> {
        let args = [self.config.confirm_ttl.as_secs().to_string()];
        self.flags("confirm", &self.scripts.confirm, values, &args)
            .await
    }

    pub async fn confirm(&self, value: &[u8]) -> Result<bool> {
        self.confirm_many(&[value])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                FilterError::MalformedResponse("no outcome for a single value".into())
            })
    }

    /// Remaining lifetime of the key for `value`. `None` when the key is
    /// missing or never expires.
    pub async fn ttl(&self, value: &[u8]) -> Result<Option<Duration>> {
        let link = self.link.get()?;
        let key = self.key(value);
        let millis: i64 = link
            .run(|mut conn| async move {
                redis::cmd("PTTL").arg(&key).query_async(&mut conn).await
            })
            .await?;
        Ok(u64::try_from(millis).ok().map(Duration::from_millis))
    }
}

#[async_trait]
impl Filter for RedisKeyFilter {
    async fn exists_many(&self, values: &[&[u8]]) -> Result<Vec<bool>> {
        self.flags("exists", &self.scripts.exists, values, &[]).await
    }

    /// Writes every value with `confirm_ttl`, refreshing keys already there.
    async fn insert_many(&self, values: &[&[u8]]) -> Result<Vec<bool>> {
        let link = self.link.get()?;
        if values.is_empty() {
            return Ok(Vec::new());
        }
        let keys = self.keys(values);
        let args = [self.config.confirm_ttl.as_secs().to_string()];
        let _: i64 = link.invoke(&self.scripts.insert, &keys, &args).await?;
        Ok(vec![true; values.len()])
    }

    async fn exists_and_insert_many(&self, values: &[&[u8]]) -> Result<Vec<bool>> {
        let args = [self.config.lock_ttl.as_secs().to_string()];
        self.flags("exists_and_lock", &self.scripts.lock, values, &args)
            .await
    }

    async fn close(&self) -> Result<()> {
        self.link.take().map(drop)
    }

    fn is_closed(&self) -> bool {
        self.link.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ttls() {
        let config = RedisKeyConfigBuilder::default().build().unwrap();
        assert_eq!(config.key_prefix, "dedup:key:");
        assert_eq!(config.lock_ttl, Duration::from_secs(7200));
        assert_eq!(config.confirm_ttl, Duration::from_secs(30 * 24 * 3600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sub_second_ttl_is_rejected() {
        let config = RedisKeyConfigBuilder::default()
            .lock_ttl(Duration::from_millis(500))
            .build()
            .unwrap();
        assert!(matches!(
            config.validate(),
            Err(FilterError::InvalidConfig(_))
        ));

        let config = RedisKeyConfigBuilder::default()
            .confirm_ttl(Duration::ZERO)
            .build()
            .unwrap();
        assert!(config.validate().is_err());
    }
}
