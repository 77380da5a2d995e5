//! Synchronous front-end for any [`Filter`].
//!
//! The filter algorithm exists once, in async form. [`BlockingFilter`] owns a
//! current-thread tokio runtime and drives each call to completion on the
//! caller's thread, so blocking callers get the same semantics as async
//! ones. Do not use it from inside another tokio runtime: `block_on` panics
//! there.
use crate::error::{FilterError, Result};
use crate::filter::Filter;
use std::future::Future;
use tokio::runtime::{Builder, Runtime};

#[derive(Debug)]
pub struct BlockingFilter<F> {
    inner: F,
    runtime: Runtime,
}

fn runtime() -> Result<Runtime> {
    Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(FilterError::Io)
}

impl<F: Filter> BlockingFilter<F> {
    /// Wraps a filter that was built elsewhere.
    ///
    /// Filters holding runtime-bound resources (a Redis connection manager)
    /// should be built through [`BlockingFilter::build`] instead, so those
    /// resources belong to this runtime.
    pub fn new(inner: F) -> Result<Self> {
        Ok(Self {
            inner,
            runtime: runtime()?,
        })
    }

    /// Builds the filter on the runtime that will drive it.
    ///
    /// ```no_run
    /// use dedup_bloom::{BlockingFilter, BloomConfig, BloomFilter, MemoryBitStore};
    ///
    /// let filter = BlockingFilter::build(async {
    ///     BloomFilter::new(BloomConfig::default(), MemoryBitStore::new()).await
    /// })?;
    /// let seen = filter.exists_and_insert(b"order-123")?;
    /// # Ok::<(), dedup_bloom::FilterError>(())
    /// ```
    pub fn build<Fut>(init: Fut) -> Result<Self>
    where
        Fut: Future<Output = Result<F>>,
    {
        let runtime = runtime()?;
        let inner = runtime.block_on(init)?;
        Ok(Self { inner, runtime })
    }

    pub fn inner(&self) -> &F {
        &self.inner
    }

    /// Runs an arbitrary future on the owned runtime.
    pub fn block_on<T>(&self, fut: impl Future<Output = T>) -> T {
        self.runtime.block_on(fut)
    }

    pub fn exists(&self, value: &[u8]) -> Result<bool> {
        self.block_on(self.inner.exists(value))
    }

    pub fn insert(&self, value: &[u8]) -> Result<bool> {
        self.block_on(self.inner.insert(value))
    }

    pub fn exists_and_insert(&self, value: &[u8]) -> Result<bool> {
        self.block_on(self.inner.exists_and_insert(value))
    }

    pub fn exists_many(&self, values: &[&[u8]]) -> Result<Vec<bool>> {
        self.block_on(self.inner.exists_many(values))
    }

    pub fn insert_many(&self, values: &[&[u8]]) -> Result<Vec<bool>> {
        self.block_on(self.inner.insert_many(values))
    }

    pub fn exists_and_insert_many(&self, values: &[&[u8]]) -> Result<Vec<bool>> {
        self.block_on(self.inner.exists_and_insert_many(values))
    }

    pub fn close(&self) -> Result<()> {
        self.block_on(self.inner.close())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}
