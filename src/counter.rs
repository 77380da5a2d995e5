use serde::Serialize;

/// Running tally of filter outcomes.
///
/// Feed it the vectors returned by batched calls and ask how many values
/// were already seen, e.g. to slow a producer down once most of its output
/// turns out to be duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterCounter {
    stats: Vec<bool>,
}

/// Serializable view of a [`FilterCounter`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CounterSummary {
    pub total: usize,
    pub seen: usize,
    pub unseen: usize,
    pub seen_ratio: f64,
}

impl FilterCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, stat: bool) {
        self.stats.push(stat);
    }

    pub fn stats(&self) -> &[bool] {
        &self.stats
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    pub fn count(&self, outcome: bool) -> usize {
        self.stats.iter().filter(|&&s| s == outcome).count()
    }

    pub fn true_count(&self) -> usize {
        self.count(true)
    }

    pub fn false_count(&self) -> usize {
        self.count(false)
    }

    pub fn any(&self) -> bool {
        self.stats.iter().any(|&s| s)
    }

    /// `false` when nothing was recorded.
    pub fn all(&self) -> bool {
        !self.stats.is_empty() && self.stats.iter().all(|&s| s)
    }

    /// Share of `true` outcomes, 0.0 when empty.
    pub fn true_ratio(&self) -> f64 {
        if self.stats.is_empty() {
            return 0.0;
        }
        self.true_count() as f64 / self.stats.len() as f64
    }

    /// Whether the share of `true` outcomes is at least `ratio`.
    pub fn reached(&self, ratio: f64) -> bool {
        !self.stats.is_empty() && self.true_ratio() >= ratio
    }

    /// Whether at least `n` outcomes are `true`.
    pub fn reached_count(&self, n: usize) -> bool {
        self.true_count() >= n
    }

    pub fn reset(&mut self) {
        self.stats.clear();
    }

    pub fn summary(&self) -> CounterSummary {
        CounterSummary {
            total: self.len(),
            seen: self.true_count(),
            unseen: self.false_count(),
            seen_ratio: self.true_ratio(),
        }
    }
}

impl Extend<bool> for FilterCounter {
    fn extend<I: IntoIterator<Item = bool>>(&mut self, iter: I) {
        self.stats.extend(iter);
    }
}

impl<'a> Extend<&'a bool> for FilterCounter {
    fn extend<I: IntoIterator<Item = &'a bool>>(&mut self, iter: I) {
        self.stats.extend(iter.into_iter().copied());
    }
}

impl FromIterator<bool> for FilterCounter {
    fn from_iter<I: IntoIterator<Item = bool>>(iter: I) -> Self {
        Self {
            stats: iter.into_iter().collect(),
        }
    }
}
