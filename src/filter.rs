use crate::error::{FilterError, Result};
use crate::logging::{FilterLogger, TracingLogger};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Operations every deduplication backend provides.
///
/// Batched calls are the primitive: each returns one outcome per input value,
/// in input order. `true` means "already seen" for the lookups and "accepted"
/// for [`Filter::insert_many`]. Every call after [`Filter::close`] fails with
/// [`FilterError::Closed`].
#[async_trait]
pub trait Filter: Send + Sync {
    async fn exists_many(&self, values: &[&[u8]]) -> Result<Vec<bool>>;

    async fn insert_many(&self, values: &[&[u8]]) -> Result<Vec<bool>>;

    /// Membership before the call, recording every value that was absent.
    async fn exists_and_insert_many(&self, values: &[&[u8]]) -> Result<Vec<bool>>;

    /// Releases backend resources.
    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;

    async fn exists(&self, value: &[u8]) -> Result<bool> {
        single(self.exists_many(&[value]).await?)
    }

    async fn insert(&self, value: &[u8]) -> Result<bool> {
        single(self.insert_many(&[value]).await?)
    }

    async fn exists_and_insert(&self, value: &[u8]) -> Result<bool> {
        single(self.exists_and_insert_many(&[value]).await?)
    }
}

fn single(stats: Vec<bool>) -> Result<bool> {
    stats.into_iter().next().ok_or_else(|| {
        FilterError::MalformedResponse("no outcome for a single value".into())
    })
}

#[async_trait]
impl<F: Filter + ?Sized> Filter for Box<F> {
    async fn exists_many(&self, values: &[&[u8]]) -> Result<Vec<bool>> {
        (**self).exists_many(values).await
    }

    async fn insert_many(&self, values: &[&[u8]]) -> Result<Vec<bool>> {
        (**self).insert_many(values).await
    }

    async fn exists_and_insert_many(&self, values: &[&[u8]]) -> Result<Vec<bool>> {
        (**self).exists_and_insert_many(values).await
    }

    async fn close(&self) -> Result<()> {
        (**self).close().await
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }
}

#[async_trait]
impl<F: Filter + ?Sized> Filter for Arc<F> {
    async fn exists_many(&self, values: &[&[u8]]) -> Result<Vec<bool>> {
        (**self).exists_many(values).await
    }

    async fn insert_many(&self, values: &[&[u8]]) -> Result<Vec<bool>> {
        (**self).insert_many(values).await
    }

    async fn exists_and_insert_many(&self, values: &[&[u8]]) -> Result<Vec<bool>> {
        (**self).exists_and_insert_many(values).await
    }

    async fn close(&self) -> Result<()> {
        (**self).close().await
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }
}

/// `Ready -> Closed` state shared by the backends.
#[derive(Debug, Default)]
pub struct Lifecycle {
    closed: AtomicBool,
}

impl Lifecycle {
    pub fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(FilterError::Closed)
        } else {
            Ok(())
        }
    }

    /// Moves to `Closed`. Closing twice is an error like any other call.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            Err(FilterError::Closed)
        } else {
            Ok(())
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// A backend handle that `close` takes away.
///
/// Holders clone the handle out for each request, so dropping the last
/// clone after [`Resource::take`] releases the connection or database.
#[derive(Debug)]
pub struct Resource<T> {
    slot: Mutex<Option<T>>,
}

impl<T: Clone> Resource<T> {
    pub fn new(handle: T) -> Self {
        Self {
            slot: Mutex::new(Some(handle)),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<T>>> {
        self.slot.lock().map_err(|e| {
            FilterError::StorageError(format!("Resource lock error: {e}"))
        })
    }

    /// Clone of the handle, or `Closed` once it was taken.
    pub fn get(&self) -> Result<T> {
        self.lock()?.clone().ok_or(FilterError::Closed)
    }

    /// Removes the handle. Taking it twice is `Closed`.
    pub fn take(&self) -> Result<T> {
        self.lock()?.take().ok_or(FilterError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().map(|slot| slot.is_none()).unwrap_or(true)
    }
}

/// Replaces backend failures with a configured outcome.
///
/// `default_stat = false` fails open (errors read as "not seen", items pass
/// through); `true` fails closed (errors read as "seen", items are dropped).
/// Each substitution is reported to the logger. [`FilterError::Closed`] is
/// returned as-is.
#[derive(Debug)]
pub struct FailSafeFilter<F> {
    inner: F,
    default_stat: bool,
    logger: Arc<dyn FilterLogger>,
}

impl<F: Filter> FailSafeFilter<F> {
    pub fn new(inner: F, default_stat: bool) -> Self {
        Self {
            inner,
            default_stat,
            logger: Arc::new(TracingLogger),
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn FilterLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn default_stat(&self) -> bool {
        self.default_stat
    }

    pub fn inner(&self) -> &F {
        &self.inner
    }

    pub fn into_inner(self) -> F {
        self.inner
    }

    fn recover(
        &self,
        operation: &'static str,
        count: usize,
        result: Result<Vec<bool>>,
    ) -> Result<Vec<bool>> {
        let error = match result {
            Ok(stats) if stats.len() == count => return Ok(stats),
            Ok(stats) => FilterError::MalformedResponse(format!(
                "{} outcomes for {count} values",
                stats.len()
            )),
            Err(e) if !e.is_substitutable() => return Err(e),
            Err(e) => e,
        };
        self.logger
            .substituted(operation, &error, self.default_stat, count);
        Ok(vec![self.default_stat; count])
    }
}

#[async_trait]
impl<F: Filter> Filter for FailSafeFilter<F> {
    async fn exists_many(&self, values: &[&[u8]]) -> Result<Vec<bool>> {
        let result = self.inner.exists_many(values).await;
        self.recover("exists", values.len(), result)
    }

    async fn insert_many(&self, values: &[&[u8]]) -> Result<Vec<bool>> {
        let result = self.inner.insert_many(values).await;
        self.recover("insert", values.len(), result)
    }

    async fn exists_and_insert_many(&self, values: &[&[u8]]) -> Result<Vec<bool>> {
        let result = self.inner.exists_and_insert_many(values).await;
        self.recover("exists_and_insert", values.len(), result)
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

/// Backend without storage: lookups answer `default_stat`, inserts succeed.
///
/// Lets callers switch deduplication off without touching call sites.
#[derive(Debug, Default)]
pub struct DefaultFilter {
    default_stat: bool,
    lifecycle: Lifecycle,
}

impl DefaultFilter {
    pub fn new(default_stat: bool) -> Self {
        Self {
            default_stat,
            lifecycle: Lifecycle::default(),
        }
    }
}

#[async_trait]
impl Filter for DefaultFilter {
    async fn exists_many(&self, values: &[&[u8]]) -> Result<Vec<bool>> {
        self.lifecycle.ensure_open()?;
        Ok(vec![self.default_stat; values.len()])
    }

    async fn insert_many(&self, values: &[&[u8]]) -> Result<Vec<bool>> {
        self.lifecycle.ensure_open()?;
        Ok(vec![true; values.len()])
    }

    async fn exists_and_insert_many(&self, values: &[&[u8]]) -> Result<Vec<bool>> {
        self.lifecycle.ensure_open()?;
        Ok(vec![self.default_stat; values.len()])
    }

    async fn close(&self) -> Result<()> {
        self.lifecycle.close()
    }

    fn is_closed(&self) -> bool {
        self.lifecycle.is_closed()
    }
}
