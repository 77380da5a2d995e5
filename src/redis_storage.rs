//! Redis-backed bit store.
//!
//! Shards are Redis strings addressed with GETBIT/SETBIT. Every batched
//! request runs as one Lua script, which Redis executes without interleaving
//! other commands. That is what makes `exists_and_insert` atomic across
//! processes sharing a key prefix.
//!
//! Script calling convention: `KEYS[i]` is the shard key of probe `i` and
//! `ARGV[i]` its offsets joined with commas.
use crate::error::{FilterError, Result};
use crate::filter::Resource;
use crate::storage::{BitProbe, BitStore, check_bounds};
use async_trait::async_trait;
use derive_builder::Builder;
use redis::aio::ConnectionManager;
use redis::{Client, FromRedisValue, RedisResult, Script};
use std::fmt;
use std::future::Future;
use std::time::Duration;

const TEST_SCRIPT: &str = r#"
local result = {}
for index, key in ipairs(KEYS) do
    local exist = 1
    for offset in string.gmatch(ARGV[index], "[^,]+") do
        exist = redis.call('GETBIT', key, offset)
        if exist == 0 then
            break
        end
    end
    table.insert(result, exist)
end
return result
"#;

const SET_SCRIPT: &str = r#"
for index, key in ipairs(KEYS) do
    for offset in string.gmatch(ARGV[index], "[^,]+") do
        redis.call('SETBIT', key, offset, 1)
    end
end
return 1
"#;

const TEST_AND_SET_SCRIPT: &str = r#"
local result = {}
for index, key in ipairs(KEYS) do
    local exist = 1
    for offset in string.gmatch(ARGV[index], "[^,]+") do
        if redis.call('GETBIT', key, offset) == 0 then
            exist = 0
            redis.call('SETBIT', key, offset, 1)
        end
    end
    table.insert(result, exist)
end
return result
"#;

const CLEAR_SCRIPT: &str = r#"
for index, key in ipairs(KEYS) do
    for offset in string.gmatch(ARGV[index], "[^,]+") do
        redis.call('SETBIT', key, offset, 0)
    end
end
return 1
"#;

/// Connection settings shared by the Redis backends.
#[derive(Clone, Debug, Builder)]
#[builder(pattern = "owned")]
pub struct RedisStoreConfig {
    #[builder(setter(into), default = "\"redis://127.0.0.1/\".to_string()")]
    pub url: String,

    /// Upper bound for one request, connection setup included
    #[builder(default = "Duration::from_secs(5)")]
    pub request_timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1/".to_string(),
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl RedisStoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(FilterError::InvalidConfig(
                "Redis url must not be empty".into(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(FilterError::InvalidConfig(
                "request_timeout must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Multiplexed connection with a per-request deadline.
///
/// Cloning is cheap and clones share the underlying connection, which
/// reconnects on its own after failures.
#[derive(Clone)]
pub struct RedisLink {
    manager: ConnectionManager,
    timeout: Duration,
}

impl fmt::Debug for RedisLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisLink")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RedisLink {
    pub async fn connect(config: &RedisStoreConfig) -> Result<Self> {
        config.validate()?;
        let client = Client::open(config.url.as_str())?;
        let timeout = config.request_timeout;
        let manager = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| FilterError::Timeout(timeout))??;
        Ok(Self { manager, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Hands a connection to `request` and bounds it by the deadline.
    pub async fn run<T, F, Fut>(&self, request: F) -> Result<T>
    where
        F: FnOnce(ConnectionManager) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, request(self.manager.clone())).await
        {
            Ok(result) => Ok(result?),
            Err(_) => Err(FilterError::Timeout(self.timeout)),
        }
    }

    /// Runs `script` with the given keys and arguments.
    ///
    /// The script is sent by hash and uploaded again if the server has
    /// forgotten it.
    pub async fn invoke<T: FromRedisValue>(
        &self,
        script: &Script,
        keys: &[String],
        args: &[String],
    ) -> Result<T> {
        self.run(|mut conn| async move {
            let mut invocation = script.prepare_invoke();
            for key in keys {
                invocation.key(key);
            }
            for arg in args {
                invocation.arg(arg);
            }
            invocation.invoke_async(&mut conn).await
        })
        .await
    }

    /// Uploads a script so later calls can go by hash.
    pub async fn load(&self, source: &str) -> Result<String> {
        self.run(|mut conn| async move {
            redis::cmd("SCRIPT")
                .arg("LOAD")
                .arg(source)
                .query_async(&mut conn)
                .await
        })
        .await
    }
}

pub struct RedisBitStore {
    link: Resource<RedisLink>,
    test: Script,
    set: Script,
    test_and_set: Script,
    clear: Script,
}

impl fmt::Debug for RedisBitStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBitStore")
            .field("closed", &self.link.is_closed())
            .finish_non_exhaustive()
    }
}

impl RedisBitStore {
    pub async fn connect(config: &RedisStoreConfig) -> Result<Self> {
        Ok(Self::with_link(RedisLink::connect(config).await?))
    }

    pub fn with_link(link: RedisLink) -> Self {
        Self {
            link: Resource::new(link),
            test: Script::new(TEST_SCRIPT),
            set: Script::new(SET_SCRIPT),
            test_and_set: Script::new(TEST_AND_SET_SCRIPT),
            clear: Script::new(CLEAR_SCRIPT),
        }
    }

    /// Shared connection, `Closed` once the store was closed.
    pub fn link(&self) -> Result<RedisLink> {
        self.link.get()
    }

    fn encode(probes: &[BitProbe]) -> Result<(Vec<String>, Vec<String>)> {
        check_bounds(probes)?;
        let keys = probes.iter().map(|p| p.key.clone()).collect();
        let args = probes
            .iter()
            .map(|p| {
                p.offsets
                    .iter()
                    .map(u64::to_string)
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .collect();
        Ok((keys, args))
    }

    async fn flags(&self, script: &Script, probes: &[BitProbe]) -> Result<Vec<bool>> {
        let link = self.link()?;
        if probes.is_empty() {
            return Ok(Vec::new());
        }
        let (keys, args) = Self::encode(probes)?;
        let raw: Vec<i64> = link.invoke(script, &keys, &args).await?;
        if raw.len() != probes.len() {
            return Err(FilterError::MalformedResponse(format!(
                "script returned {} flags for {} probes",
                raw.len(),
                probes.len()
            )));
        }
        Ok(raw.into_iter().map(|flag| flag != 0).collect())
    }

    async fn apply(&self, script: &Script, probes: &[BitProbe]) -> Result<()> {
        let link = self.link()?;
        if probes.is_empty() {
            return Ok(());
        }
        let (keys, args) = Self::encode(probes)?;
        let _: i64 = link.invoke(script, &keys, &args).await?;
        Ok(())
    }
}

#[async_trait]
impl BitStore for RedisBitStore {
    async fn register(&self) -> Result<()> {
        let link = self.link()?;
        for source in [TEST_SCRIPT, SET_SCRIPT, TEST_AND_SET_SCRIPT, CLEAR_SCRIPT] {
            link.load(source).await?;
        }
        Ok(())
    }

    async fn test_bits(&self, probes: &[BitProbe]) -> Result<Vec<bool>> {
        self.flags(&self.test, probes).await
    }

    async fn set_bits(&self, probes: &[BitProbe]) -> Result<()> {
        self.apply(&self.set, probes).await
    }

    async fn test_and_set_bits(&self, probes: &[BitProbe]) -> Result<Vec<bool>> {
        self.flags(&self.test_and_set, probes).await
    }

    async fn clear_bits(&self, probes: &[BitProbe]) -> Result<()> {
        self.apply(&self.clear, probes).await
    }

    async fn count_bits(&self, keys: &[String]) -> Result<Vec<u64>> {
        let link = self.link()?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let counts: Vec<u64> = link
            .run(|mut conn| async move {
                let mut pipe = redis::pipe();
                for key in keys {
                    pipe.cmd("BITCOUNT").arg(key);
                }
                pipe.query_async(&mut conn).await
            })
            .await?;
        if counts.len() != keys.len() {
            return Err(FilterError::MalformedResponse(format!(
                "{} bit counts for {} keys",
                counts.len(),
                keys.len()
            )));
        }
        Ok(counts)
    }

    async fn get_bit(&self, key: &str, offset: u64) -> Result<bool> {
        let link = self.link()?;
        check_bounds(&[BitProbe::new(key, vec![offset])])?;
        let bit: i64 = link
            .run(|mut conn| async move {
                redis::cmd("GETBIT")
                    .arg(key)
                    .arg(offset)
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(bit != 0)
    }

    async fn set_bit(&self, key: &str, offset: u64) -> Result<()> {
        let link = self.link()?;
        check_bounds(&[BitProbe::new(key, vec![offset])])?;
        let _: i64 = link
            .run(|mut conn| async move {
                redis::cmd("SETBIT")
                    .arg(key)
                    .arg(offset)
                    .arg(1)
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.link.take().map(drop)
    }
}
