mod common;

use async_trait::async_trait;
use common::test_utils::{FailingStore, test_config, values};
use dedup_bloom::{
    BloomFilter, FailSafeFilter, Filter, FilterCounter, FilterError,
    FilterLogger, Lifecycle, ResetConfigBuilder, Result,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
struct RecordingLogger {
    substitutions: Mutex<Vec<(&'static str, bool, usize)>>,
    warnings: AtomicUsize,
}

impl FilterLogger for RecordingLogger {
    fn lookup(&self, _: &'static str, _: &[String], _: &[bool]) {}

    fn substituted(
        &self,
        operation: &'static str,
        _: &FilterError,
        substituted: bool,
        count: usize,
    ) {
        self.substitutions
            .lock()
            .unwrap()
            .push((operation, substituted, count));
    }

    fn eviction(&self, _: &[String], _: usize, _: f64) {}

    fn warning(&self, _: &'static str, _: &FilterError) {
        self.warnings.fetch_add(1, Ordering::SeqCst);
    }
}

// Backend that answers with the wrong number of outcomes
#[derive(Debug, Default)]
struct ShortAnswers {
    lifecycle: Lifecycle,
}

#[async_trait]
impl Filter for ShortAnswers {
    async fn exists_many(&self, _: &[&[u8]]) -> Result<Vec<bool>> {
        self.lifecycle.ensure_open()?;
        Ok(vec![true])
    }

    async fn insert_many(&self, _: &[&[u8]]) -> Result<Vec<bool>> {
        self.lifecycle.ensure_open()?;
        Ok(Vec::new())
    }

    async fn exists_and_insert_many(&self, _: &[&[u8]]) -> Result<Vec<bool>> {
        self.lifecycle.ensure_open()?;
        Ok(vec![true])
    }

    async fn close(&self) -> Result<()> {
        self.lifecycle.close()
    }

    fn is_closed(&self) -> bool {
        self.lifecycle.is_closed()
    }
}

async fn unreachable_bloom(logger: Arc<RecordingLogger>) -> BloomFilter<FailingStore> {
    let mut config = test_config(20, 4, 2);
    config.logger = logger;
    BloomFilter::new(config, FailingStore)
        .await
        .expect("setup failures are not fatal")
}

#[cfg(test)]
mod outage_tests {
    use super::*;

    #[tokio::test]
    async fn test_setup_failure_is_a_warning() {
        let logger = Arc::new(RecordingLogger::default());
        let _filter = unreachable_bloom(logger.clone()).await;
        assert_eq!(logger.warnings.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unwrapped_errors_propagate() {
        let filter = unreachable_bloom(Arc::new(RecordingLogger::default())).await;
        assert!(matches!(
            filter.exists_many(&values(&["a", "b"])).await,
            Err(FilterError::StorageError(_))
        ));
    }

    #[tokio::test]
    async fn test_fail_open() {
        let logger = Arc::new(RecordingLogger::default());
        let filter = FailSafeFilter::new(unreachable_bloom(logger.clone()).await, false)
            .with_logger(logger.clone());

        assert_eq!(
            filter.exists_many(&values(&["a", "b"])).await.unwrap(),
            vec![false, false]
        );
        assert!(!filter.exists_and_insert(b"c").await.unwrap());
        assert_eq!(
            filter.insert_many(&values(&["d", "e", "f"])).await.unwrap(),
            vec![false; 3]
        );

        let substitutions = logger.substitutions.lock().unwrap().clone();
        assert_eq!(
            substitutions,
            vec![
                ("exists", false, 2),
                ("exists_and_insert", false, 1),
                ("insert", false, 3),
            ]
        );
    }

    #[tokio::test]
    async fn test_fail_closed() {
        let filter = FailSafeFilter::new(
            unreachable_bloom(Arc::new(RecordingLogger::default())).await,
            true,
        );
        assert_eq!(
            filter.exists_many(&values(&["a", "b"])).await.unwrap(),
            vec![true, true]
        );
        assert!(filter.exists_and_insert(b"a").await.unwrap());
    }

    #[tokio::test]
    async fn test_reset_failures_do_not_block_writes() {
        let logger = Arc::new(RecordingLogger::default());
        let mut config = test_config(20, 4, 2);
        config.logger = logger.clone();
        config.reset = ResetConfigBuilder::default()
            .enabled(true)
            .check_period(Duration::from_secs(60))
            .build()
            .unwrap();
        let filter = FailSafeFilter::new(
            BloomFilter::new(config, FailingStore).await.unwrap(),
            false,
        )
        .with_logger(logger.clone());

        assert_eq!(
            filter.exists_and_insert_many(&values(&["x"])).await.unwrap(),
            vec![false]
        );
        // setup and the reset scan
        assert_eq!(logger.warnings.load(Ordering::SeqCst), 2);
        assert_eq!(logger.substitutions.lock().unwrap().len(), 1);
    }
}

#[cfg(test)]
mod wrapper_tests {
    use super::*;

    #[tokio::test]
    async fn test_wrong_outcome_count_is_substituted() {
        let filter = FailSafeFilter::new(ShortAnswers::default(), false);
        assert_eq!(
            filter.exists_many(&values(&["a", "b", "c"])).await.unwrap(),
            vec![false; 3]
        );
        assert_eq!(
            filter.insert_many(&values(&["a"])).await.unwrap(),
            vec![false]
        );
    }

    #[tokio::test]
    async fn test_closed_is_never_masked() {
        let filter = FailSafeFilter::new(ShortAnswers::default(), true);
        filter.close().await.unwrap();
        assert!(matches!(
            filter.exists_many(&values(&["a"])).await,
            Err(FilterError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_counter_over_substituted_batches() {
        let filter = FailSafeFilter::new(
            unreachable_bloom(Arc::new(RecordingLogger::default())).await,
            true,
        );
        let mut counter = FilterCounter::new();
        for batch in [vec!["a", "b"], vec!["c"]] {
            counter.extend(filter.exists_and_insert_many(&values(&batch)).await.unwrap());
        }
        assert_eq!(counter.len(), 3);
        assert!(counter.all());
        assert!(counter.reached(1.0));
    }
}
