//! Logging collaborator injected into filters.
//!
//! Filters never reach for a global logger: they receive an
//! `Arc<dyn FilterLogger>` at construction. [`TracingLogger`] forwards to
//! `tracing`; [`NoopLogger`] discards everything and is meant for tests.
use crate::error::FilterError;
use std::fmt::Debug;
use tracing::{debug, info, warn};

pub trait FilterLogger: Send + Sync + Debug {
    /// Outcome of a membership lookup, one entry per value.
    fn lookup(&self, operation: &'static str, keys: &[String], stats: &[bool]);

    /// A backend failure replaced by `substituted` for `count` values.
    fn substituted(
        &self,
        operation: &'static str,
        error: &FilterError,
        substituted: bool,
        count: usize,
    );

    /// Bits cleared by the reset policy.
    fn eviction(&self, keys: &[String], cleared: usize, fill_ratio: f64);

    /// Non-fatal problem: setup that may already exist, a failed reset scan.
    fn warning(&self, context: &'static str, error: &FilterError);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl FilterLogger for TracingLogger {
    fn lookup(&self, operation: &'static str, keys: &[String], stats: &[bool]) {
        let seen = stats.iter().filter(|&&s| s).count();
        debug!(
            operation,
            total = stats.len(),
            seen,
            ?keys,
            "dedup lookup"
        );
    }

    fn substituted(
        &self,
        operation: &'static str,
        error: &FilterError,
        substituted: bool,
        count: usize,
    ) {
        warn!(
            operation,
            %error,
            substituted,
            count,
            "backend failure, returning default outcome"
        );
    }

    fn eviction(&self, keys: &[String], cleared: usize, fill_ratio: f64) {
        info!(?keys, cleared, fill_ratio, "reset policy cleared bits");
    }

    fn warning(&self, context: &'static str, error: &FilterError) {
        warn!(context, %error, "non-fatal filter error");
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLogger;

impl FilterLogger for NoopLogger {
    fn lookup(&self, _: &'static str, _: &[String], _: &[bool]) {}

    fn substituted(&self, _: &'static str, _: &FilterError, _: bool, _: usize) {}

    fn eviction(&self, _: &[String], _: usize, _: f64) {}

    fn warning(&self, _: &'static str, _: &FilterError) {}
}
