//! Exact membership in a redb table.
//!
//! One table maps the compressed digest of every value seen to its
//! insertion time in unix seconds (0 when `record_time` is off). Batches run
//! in a single transaction on the blocking thread pool.
use crate::config::DigestConfig;
use crate::error::{FilterError, Result};
use crate::filter::{Filter, Resource};
use crate::logging::{FilterLogger, TracingLogger};
use async_trait::async_trait;
use derive_builder::Builder;
use redb::{
    Database, ReadableTable, ReadableTableMetadata, TableDefinition, TableError,
};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

#[derive(Clone, Debug, Builder)]
#[builder(pattern = "owned")]
pub struct RedbFilterConfig {
    /// Database file, created if missing
    #[builder(setter(into))]
    pub path: PathBuf,

    #[builder(setter(into), default = "\"dedup\".to_string()")]
    pub table: String,

    /// Store the insertion time alongside each key
    #[builder(default = "true")]
    pub record_time: bool,

    #[builder(default)]
    pub digest: DigestConfig,

    #[builder(default = "Arc::new(TracingLogger)")]
    pub logger: Arc<dyn FilterLogger>,
}

pub struct RedbFilter {
    config: RedbFilterConfig,
    db: Resource<Arc<Database>>,
}

impl fmt::Debug for RedbFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedbFilter")
            .field("config", &self.config)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn unix_now() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_err(|e| FilterError::StorageError(e.to_string()))?
        .as_secs())
}

impl RedbFilter {
    /// Opens or creates the database and makes sure the table exists.
    pub fn open(config: RedbFilterConfig) -> Result<Self> {
        if config.table.is_empty() {
            return Err(FilterError::InvalidConfig(
                "table name must not be empty".into(),
            ));
        }
        config.digest.validate()?;

        let db = Database::create(&config.path).map_err(redb::Error::from)?;
        let filter = Self {
            config,
            db: Resource::new(Arc::new(db)),
        };
        if let Err(e) = filter.create_table() {
            filter.config.logger.warning("table setup", &e);
        }
        Ok(filter)
    }

    pub fn config(&self) -> &RedbFilterConfig {
        &self.config
    }

    fn create_table(&self) -> Result<()> {
        let db = self.db()?;
        let txn = db.begin_write().map_err(redb::Error::from)?;
        txn.open_table(self.definition())
            .map_err(redb::Error::from)?;
        txn.commit().map_err(redb::Error::from)?;
        Ok(())
    }

    fn definition(&self) -> TableDefinition<'_, &'static str, u64> {
        TableDefinition::new(&self.config.table)
    }

    fn db(&self) -> Result<Arc<Database>> {
        self.db.get()
    }

    fn keys(&self, values: &[&[u8]]) -> Vec<String> {
        values.iter().map(|v| self.config.digest.key(v)).collect()
    }

    /// Runs `work` on the blocking pool with the database handle.
    async fn blocking<T, W>(&self, work: W) -> Result<T>
    where
        T: Send + 'static,
        W: FnOnce(&Database, &str) -> Result<T> + Send + 'static,
    {
        let db = self.db()?;
        let table = self.config.table.clone();
        tokio::task::spawn_blocking(move || work(&db, &table))
            .await
            .map_err(|e| {
                FilterError::StorageError(format!("redb task failed: {e}"))
            })?
    }

    /// When `value` was first inserted, if it was.
    pub async fn inserted_at(&self, value: &[u8]) -> Result<Option<u64>> {
        let key = self.config.digest.key(value);
        self.blocking(move |db, table| {
            let txn = db.begin_read().map_err(redb::Error::from)?;
            let definition = TableDefinition::<&str, u64>::new(table);
            let table = match txn.open_table(definition) {
                Ok(table) => table,
                Err(TableError::TableDoesNotExist(_)) => return Ok(None),
                Err(e) => return Err(redb::Error::from(e).into()),
            };
            let time = table
                .get(key.as_str())
                .map_err(redb::Error::from)?
                .map(|guard| guard.value());
            Ok(time)
        })
        .await
    }

    /// Number of stored keys.
    pub async fn len(&self) -> Result<u64> {
        self.blocking(|db, table| {
            let txn = db.begin_read().map_err(redb::Error::from)?;
            match txn.open_table(TableDefinition::<&str, u64>::new(table)) {
                Ok(table) => Ok(table.len().map_err(redb::Error::from)?),
                Err(TableError::TableDoesNotExist(_)) => Ok(0),
                Err(e) => Err(redb::Error::from(e).into()),
            }
        })
        .await
    }

    /// Writes absent keys and reports which were already present.
    async fn upsert(&self, values: &[&[u8]]) -> Result<Vec<bool>> {
        let keys = self.keys(values);
        let now = if self.config.record_time { unix_now()? } else { 0 };
        let stats = self
            .blocking(move |db, table| {
                let txn = db.begin_write().map_err(redb::Error::from)?;
                let mut stats = Vec::with_capacity(keys.len());
                {
                    let mut table = txn
                        .open_table(TableDefinition::<&str, u64>::new(table))
                        .map_err(redb::Error::from)?;
                    for key in &keys {
                        let seen = table
                            .get(key.as_str())
                            .map_err(redb::Error::from)?
                            .is_some();
                        if !seen {
                            table
                                .insert(key.as_str(), now)
                                .map_err(redb::Error::from)?;
                        }
                        stats.push(seen);
                    }
                }
                txn.commit().map_err(redb::Error::from)?;
                Ok(stats)
            })
            .await?;
        Ok(stats)
    }
}

#[async_trait]
impl Filter for RedbFilter {
    async fn exists_many(&self, values: &[&[u8]]) -> Result<Vec<bool>> {
        if values.is_empty() {
            self.db()?;
            return Ok(Vec::new());
        }
        let keys = self.keys(values);
        let logged = keys.clone();
        let stats = self
            .blocking(move |db, table| {
                let txn = db.begin_read().map_err(redb::Error::from)?;
                let definition = TableDefinition::<&str, u64>::new(table);
                let table = match txn.open_table(definition) {
                    Ok(table) => table,
                    Err(TableError::TableDoesNotExist(_)) => {
                        return Ok(vec![false; keys.len()]);
                    }
                    Err(e) => return Err(redb::Error::from(e).into()),
                };
                keys.iter()
                    .map(|key| -> Result<bool> {
                        Ok(table
                            .get(key.as_str())
                            .map_err(redb::Error::from)?
                            .is_some())
                    })
                    .collect()
            })
            .await?;
        self.config.logger.lookup("exists", &logged, &stats);
        Ok(stats)
    }

    async fn insert_many(&self, values: &[&[u8]]) -> Result<Vec<bool>> {
        if values.is_empty() {
            self.db()?;
            return Ok(Vec::new());
        }
        self.upsert(values).await?;
        Ok(vec![true; values.len()])
    }

    async fn exists_and_insert_many(&self, values: &[&[u8]]) -> Result<Vec<bool>> {
        if values.is_empty() {
            self.db()?;
            return Ok(Vec::new());
        }
        let stats = self.upsert(values).await?;
        self.config
            .logger
            .lookup("exists_and_insert", &self.keys(values), &stats);
        Ok(stats)
    }

    async fn close(&self) -> Result<()> {
        self.db.take().map(drop)
    }

    fn is_closed(&self) -> bool {
        self.db.is_closed()
    }
}
