//! Exact membership persisted in an append-only file.
//!
//! Keys are kept in memory and every new one is appended to `<dir>/dup` as a
//! line. Opening the filter replays the file. The file is never compacted.
//! Appends and flushes run on the blocking thread pool.
use crate::config::DigestConfig;
use crate::error::{FilterError, Result};
use crate::filter::{Filter, Lifecycle};
use crate::logging::{FilterLogger, TracingLogger};
use async_trait::async_trait;
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

pub const DUP_FILE_NAME: &str = "dup";

#[derive(Debug)]
struct Journal {
    keys: HashSet<String>,
    writer: BufWriter<File>,
}

impl Journal {
    fn lock(journal: &Mutex<Journal>) -> Result<MutexGuard<'_, Journal>> {
        journal.lock().map_err(|e| {
            FilterError::StorageError(format!("File filter lock error: {e}"))
        })
    }

    /// Appends the absent keys and flushes once per batch.
    fn record(&mut self, keys: &[String]) -> Result<Vec<bool>> {
        let mut stats = Vec::with_capacity(keys.len());
        for key in keys {
            let seen = self.keys.contains(key);
            if !seen {
                self.append(key.clone())?;
            }
            stats.push(seen);
        }
        self.writer.flush()?;
        Ok(stats)
    }

    fn append(&mut self, key: String) -> Result<()> {
        self.writer.write_all(key.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.keys.insert(key);
        Ok(())
    }
}

#[derive(Debug)]
pub struct FileFilter {
    path: PathBuf,
    digest: DigestConfig,
    journal: Arc<Mutex<Journal>>,
    logger: Arc<dyn FilterLogger>,
    lifecycle: Lifecycle,
}

impl FileFilter {
    /// Opens `<dir>/dup`, creating the directory and file if needed.
    pub fn open(dir: impl AsRef<Path>, digest: DigestConfig) -> Result<Self> {
        digest.validate()?;
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(DUP_FILE_NAME);

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        let mut keys = HashSet::new();
        for line in BufReader::new(&file).lines() {
            let line = line?;
            let key = line.trim_end();
            if !key.is_empty() {
                keys.insert(key.to_string());
            }
        }

        Ok(Self {
            path,
            digest,
            journal: Arc::new(Mutex::new(Journal {
                keys,
                writer: BufWriter::new(file),
            })),
            logger: Arc::new(TracingLogger),
            lifecycle: Lifecycle::default(),
        })
    }

    pub fn with_logger(mut self, logger: Arc<dyn FilterLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.keys.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.lock()?.keys.is_empty())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Journal>> {
        self.lifecycle.ensure_open()?;
        Journal::lock(&self.journal)
    }

    /// Runs `work` on the blocking pool with the journal locked.
    async fn blocking<T, W>(&self, work: W) -> Result<T>
    where
        T: Send + 'static,
        W: FnOnce(&mut Journal) -> Result<T> + Send + 'static,
    {
        self.lifecycle.ensure_open()?;
        let journal = self.journal.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = Journal::lock(&journal)?;
            work(&mut guard)
        })
        .await
        .map_err(|e| FilterError::StorageError(format!("file filter task failed: {e}")))?
    }

    fn keys_of(&self, values: &[&[u8]]) -> Result<Vec<String>> {
        values
            .iter()
            .map(|v| {
                let key = self.digest.key(v);
                if key.contains(['\n', '\r']) || key.is_empty() {
                    return Err(FilterError::InvalidDigest(format!(
                        "key {key:?} cannot be stored as one line"
                    )));
                }
                Ok(key)
            })
            .collect()
    }

    async fn record(&self, keys: &[String]) -> Result<Vec<bool>> {
        let keys = keys.to_vec();
        self.blocking(move |journal| journal.record(&keys)).await
    }
}

#[async_trait]
impl Filter for FileFilter {
    async fn exists_many(&self, values: &[&[u8]]) -> Result<Vec<bool>> {
        let keys = self.keys_of(values)?;
        let stats: Vec<bool> = {
            let journal = self.lock()?;
            keys.iter().map(|k| journal.keys.contains(k)).collect()
        };
        self.logger.lookup("exists", &keys, &stats);
        Ok(stats)
    }

    async fn insert_many(&self, values: &[&[u8]]) -> Result<Vec<bool>> {
        let keys = self.keys_of(values)?;
        self.record(&keys).await?;
        Ok(vec![true; keys.len()])
    }

    async fn exists_and_insert_many(&self, values: &[&[u8]]) -> Result<Vec<bool>> {
        let keys = self.keys_of(values)?;
        let stats = self.record(&keys).await?;
        self.logger.lookup("exists_and_insert", &keys, &stats);
        Ok(stats)
    }

    async fn close(&self) -> Result<()> {
        self.blocking(|journal| Ok(journal.writer.flush()?)).await?;
        self.lifecycle.close()
    }

    fn is_closed(&self) -> bool {
        self.lifecycle.is_closed()
    }
}
