use crate::config::DigestConfig;
use crate::error::{FilterError, Result};
use crate::filter::{Filter, Lifecycle};
use crate::logging::{FilterLogger, TracingLogger};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// Exact, process-local membership. Nothing survives a restart.
#[derive(Debug)]
pub struct InMemoryFilter {
    digest: DigestConfig,
    keys: Mutex<HashSet<String>>,
    logger: Arc<dyn FilterLogger>,
    lifecycle: Lifecycle,
}

impl Default for InMemoryFilter {
    fn default() -> Self {
        Self::new(DigestConfig::default())
    }
}

impl InMemoryFilter {
    pub fn new(digest: DigestConfig) -> Self {
        Self {
            digest,
            keys: Mutex::new(HashSet::new()),
            logger: Arc::new(TracingLogger),
            lifecycle: Lifecycle::default(),
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn FilterLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.lock()?.is_empty())
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashSet<String>>> {
        self.lifecycle.ensure_open()?;
        self.keys.lock().map_err(|e| {
            FilterError::StorageError(format!("Memory filter lock error: {e}"))
        })
    }

    fn keys_of(&self, values: &[&[u8]]) -> Vec<String> {
        values.iter().map(|v| self.digest.key(v)).collect()
    }
}

#[async_trait]
impl Filter for InMemoryFilter {
    async fn exists_many(&self, values: &[&[u8]]) -> Result<Vec<bool>> {
        let keys = self.keys_of(values);
        let stats: Vec<bool> = {
            let set = self.lock()?;
            keys.iter().map(|k| set.contains(k)).collect()
        };
        self.logger.lookup("exists", &keys, &stats);
        Ok(stats)
    }

    async fn insert_many(&self, values: &[&[u8]]) -> Result<Vec<bool>> {
        let keys = self.keys_of(values);
        let mut set = self.lock()?;
        set.extend(keys);
        Ok(vec![true; values.len()])
    }

    async fn exists_and_insert_many(&self, values: &[&[u8]]) -> Result<Vec<bool>> {
        let keys = self.keys_of(values);
        let stats: Vec<bool> = {
            let mut set = self.lock()?;
            keys.iter().map(|k| !set.insert(k.clone())).collect()
        };
        self.logger.lookup("exists_and_insert", &keys, &stats);
        Ok(stats)
    }

    async fn close(&self) -> Result<()> {
        self.lifecycle.close()?;
        if let Ok(mut set) = self.keys.lock() {
            set.clear();
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.lifecycle.is_closed()
    }
}
