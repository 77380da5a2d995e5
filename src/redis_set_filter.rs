//! Exact membership in Redis sets.
//!
//! Values are stored as their compressed digest in one of `block_num` sets
//! named `key_prefix + block`. [`SetMode::Scored`] keeps sorted sets scored
//! with the server time at insertion, so old entries can be dropped with
//! [`RedisSetFilter::evict_older_than`].
use crate::config::DigestConfig;
use crate::error::{FilterError, Result};
use crate::filter::{Filter, Resource};
use crate::hash::ShardRouter;
use crate::logging::{FilterLogger, TracingLogger};
use crate::redis_storage::RedisLink;
use async_trait::async_trait;
use derive_builder::Builder;
use redis::Script;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const SET_EXISTS: &str = r#"
local result = {}
for index, key in ipairs(KEYS) do
    table.insert(result, redis.call('SISMEMBER', key, ARGV[index]))
end
return result
"#;

const SET_INSERT: &str = r#"
for index, key in ipairs(KEYS) do
    redis.call('SADD', key, ARGV[index])
end
return 1
"#;

const SET_EXISTS_AND_INSERT: &str = r#"
local result = {}
for index, key in ipairs(KEYS) do
    local added = redis.call('SADD', key, ARGV[index])
    table.insert(result, 1 - added)
end
return result
"#;

const ZSET_EXISTS: &str = r#"
local result = {}
for index, key in ipairs(KEYS) do
    if redis.call('ZSCORE', key, ARGV[index]) then
        table.insert(result, 1)
    else
        table.insert(result, 0)
    end
end
return result
"#;

const ZSET_INSERT: &str = r#"
local now = redis.call('TIME')[1]
for index, key in ipairs(KEYS) do
    redis.call('ZADD', key, 'NX', now, ARGV[index])
end
return 1
"#;

const ZSET_EXISTS_AND_INSERT: &str = r#"
local now = redis.call('TIME')[1]
local result = {}
for index, key in ipairs(KEYS) do
    local added = redis.call('ZADD', key, 'NX', now, ARGV[index])
    table.insert(result, 1 - added)
end
return result
"#;

const ZSET_EVICT: &str = r#"
local cutoff = redis.call('TIME')[1] - tonumber(ARGV[1])
local removed = 0
for _, key in ipairs(KEYS) do
    removed = removed + redis.call('ZREMRANGEBYSCORE', key, '-inf', cutoff)
end
return removed
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SetMode {
    /// `SISMEMBER` / `SADD`
    #[default]
    Plain,
    /// `ZSCORE` / `ZADD NX`, scored with the insertion time in seconds
    Scored,
}

#[derive(Clone, Debug, Builder)]
#[builder(pattern = "owned")]
pub struct RedisSetConfig {
    #[builder(setter(into), default = "\"dedup:set:\".to_string()")]
    pub key_prefix: String,

    #[builder(default = "1")]
    pub block_num: usize,

    #[builder(default)]
    pub mode: SetMode,

    #[builder(default)]
    pub digest: DigestConfig,

    #[builder(default = "Arc::new(TracingLogger)")]
    pub logger: Arc<dyn FilterLogger>,
}

impl RedisSetConfig {
    pub fn validate(&self) -> Result<()> {
        if self.block_num == 0 {
            return Err(FilterError::InvalidConfig(
                "block_num must be at least 1".into(),
            ));
        }
        self.digest.validate()?;
        ShardRouter::new(self.block_num)
            .block(&self.digest.digest(b"dedup-probe"))
            .map_err(|e| {
                FilterError::InvalidConfig(format!(
                    "Value hash function is not usable for shard routing: {e}"
                ))
            })?;
        Ok(())
    }
}

struct Scripts {
    exists: Script,
    insert: Script,
    exists_and_insert: Script,
}

impl Scripts {
    fn for_mode(mode: SetMode) -> Self {
        let (exists, insert, exists_and_insert) = match mode {
            SetMode::Plain => (SET_EXISTS, SET_INSERT, SET_EXISTS_AND_INSERT),
            SetMode::Scored => (ZSET_EXISTS, ZSET_INSERT, ZSET_EXISTS_AND_INSERT),
        };
        Self {
            exists: Script::new(exists),
            insert: Script::new(insert),
            exists_and_insert: Script::new(exists_and_insert),
        }
    }
}

pub struct RedisSetFilter {
    config: RedisSetConfig,
    link: Resource<RedisLink>,
    router: ShardRouter,
    scripts: Scripts,
    evict: Script,
}

impl fmt::Debug for RedisSetFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisSetFilter")
            .field("config", &self.config)
            .field("closed", &self.link.is_closed())
            .finish_non_exhaustive()
    }
}

impl RedisSetFilter {
    pub async fn new(config: RedisSetConfig, link: RedisLink) -> Result<Self> {
        config.validate()?;
        let filter = Self {
            router: ShardRouter::new(config.block_num),
            scripts: Scripts::for_mode(config.mode),
            evict: Script::new(ZSET_EVICT),
            config,
            link: Resource::new(link.clone()),
        };
        for source in filter.sources() {
            if let Err(e) = link.load(source).await {
                filter.config.logger.warning("script load", &e);
            }
        }
        Ok(filter)
    }

    fn sources(&self) -> [&'static str; 3] {
        match self.config.mode {
            SetMode::Plain => [SET_EXISTS, SET_INSERT, SET_EXISTS_AND_INSERT],
            SetMode::Scored => [ZSET_EXISTS, ZSET_INSERT, ZSET_EXISTS_AND_INSERT],
        }
    }

    pub fn config(&self) -> &RedisSetConfig {
        &self.config
    }

    pub fn set_keys(&self) -> Vec<String> {
        (0..self.config.block_num)
            .map(|b| format!("{}{}", self.config.key_prefix, b))
            .collect()
    }

    /// Set key and member for `value`.
    pub fn locate(&self, value: &[u8]) -> Result<(String, String)> {
        let raw = self.config.digest.digest(value);
        let block = self.router.block(&raw)?;
        Ok((
            format!("{}{}", self.config.key_prefix, block),
            self.config.digest.compress(&raw),
        ))
    }

    fn locate_all(&self, values: &[&[u8]]) -> Result<(Vec<String>, Vec<String>)> {
        let mut keys = Vec::with_capacity(values.len());
        let mut members = Vec::with_capacity(values.len());
        for value in values {
            let (key, member) = self.locate(value)?;
            keys.push(key);
            members.push(member);
        }
        Ok((keys, members))
    }

    async fn flags(
        &self,
        operation: &'static str,
        script: &Script,
        values: &[&[u8]],
    ) -> Result<Vec<bool>> {
        let link = self.link.get()?;
        if values.is_empty() {
            return Ok(Vec::new());
        }
        let (keys, members) = self.locate_all(values)?;
        let raw: Vec<i64> = link.invoke(script, &keys, &members).await?;
        if raw.len() != values.len() {
            return Err(FilterError::MalformedResponse(format!(
                "script returned {} flags for {} values",
                raw.len(),
                values.len()
            )));
        }
        let stats: Vec<bool> = raw.into_iter().map(|flag| flag != 0).collect();
        self.config.logger.lookup(operation, &members, &stats);
        Ok(stats)
    }

    /// Removes entries inserted more than `age` ago. Returns how many went.
    ///
    /// Only sorted sets carry insertion times, so plain mode rejects this.
    pub async fn evict_older_than(&self, age: Duration) -> Result<u64> {
        let link = self.link.get()?;
        if self.config.mode != SetMode::Scored {
            return Err(FilterError::InvalidConfig(
                "age-based eviction needs SetMode::Scored".into(),
            ));
        }
        let keys = self.set_keys();
        let args = [age.as_secs().to_string()];
        link.invoke(&self.evict, &keys, &args).await
    }
}

#[async_trait]
impl Filter for RedisSetFilter {
    async fn exists_many(&self, values: &[&[u8]]) -> Result<Vec<bool>> {
        self.flags("exists", &self.scripts.exists, values).await
    }

    async fn insert_many(&self, values: &[&[u8]]) -> Result<Vec<bool>> {
        let link = self.link.get()?;
        if values.is_empty() {
            return Ok(Vec::new());
        }
        let (keys, members) = self.locate_all(values)?;
        let _: i64 = link
            .invoke(&self.scripts.insert, &keys, &members)
            .await?;
        Ok(vec![true; values.len()])
    }

    async fn exists_and_insert_many(&self, values: &[&[u8]]) -> Result<Vec<bool>> {
        self.flags(
            "exists_and_insert",
            &self.scripts.exists_and_insert,
            values,
        )
        .await
    }

    async fn close(&self) -> Result<()> {
        self.link.take().map(drop)
    }

    fn is_closed(&self) -> bool {
        self.link.is_closed()
    }
}
