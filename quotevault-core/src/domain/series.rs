//! Per-symbol bar series and the date-keyed merge.
//!
//! A `SeriesCache` is the mutable, authoritative copy owned by the store.
//! Readers only ever see a `SeriesSnapshot`, an owned copy taken under the
//! store's per-symbol lock.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use super::bar::Bar;
use crate::indicators::{Ema, Indicator, Sma};

/// Union two bar collections by date. On a date collision `incoming` wins;
/// within `incoming` the last occurrence of a date wins. The result is sorted
/// ascending with unique dates.
pub fn merge(existing: &[Bar], incoming: &[Bar]) -> Vec<Bar> {
    let mut by_date: BTreeMap<NaiveDate, Bar> = BTreeMap::new();
    for bar in existing.iter().chain(incoming) {
        by_date.insert(bar.date, bar.clone());
    }
    by_date.into_values().collect()
}

/// What a merge did to the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Dates that were not cached before.
    pub inserted: usize,
    /// Cached dates whose bar changed.
    pub replaced: usize,
    /// Incoming bars identical to what was cached.
    pub unchanged: usize,
}

impl MergeStats {
    pub fn changed(&self) -> bool {
        self.inserted + self.replaced > 0
    }
}

/// Authoritative in-memory series for one symbol.
#[derive(Debug, Clone)]
pub struct SeriesCache {
    symbol: String,
    bars: BTreeMap<NaiveDate, Bar>,
    dirty: bool,
}

impl SeriesCache {
    pub fn empty(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            bars: BTreeMap::new(),
            dirty: false,
        }
    }

    /// Cache built from bars already on disk; starts clean.
    pub fn from_bars(symbol: impl Into<String>, bars: impl IntoIterator<Item = Bar>) -> Self {
        let mut cache = Self::empty(symbol);
        for bar in bars {
            cache.bars.insert(bar.date, bar);
        }
        cache
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// True when the in-memory bars differ from the last successful persist.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Bars in ascending date order.
    pub fn bars(&self) -> impl Iterator<Item = &Bar> {
        self.bars.values()
    }

    pub fn get(&self, date: NaiveDate) -> Option<&Bar> {
        self.bars.get(&date)
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.bars.keys().next().copied()
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.bars.keys().next_back().copied()
    }

    /// Merge `incoming` into this cache in place (incoming wins on collision).
    pub fn merge_from(&mut self, incoming: impl IntoIterator<Item = Bar>) -> MergeStats {
        let mut stats = MergeStats::default();
        for bar in incoming {
            match self.bars.get(&bar.date) {
                None => stats.inserted += 1,
                Some(old) if *old == bar => {
                    stats.unchanged += 1;
                    continue;
                }
                Some(_) => stats.replaced += 1,
            }
            self.bars.insert(bar.date, bar);
        }
        if stats.changed() {
            self.dirty = true;
        }
        stats
    }

    /// Set the close of `date`'s bar to `price`, appending a close-only bar if
    /// that date isn't cached yet. Returns whether anything changed.
    pub fn fold_close(&mut self, date: NaiveDate, price: f64) -> bool {
        let changed = match self.bars.get_mut(&date) {
            Some(bar) if bar.close == price => false,
            Some(bar) => {
                bar.close = price;
                true
            }
            None => {
                self.bars.insert(date, Bar::close_only(date, price));
                true
            }
        };
        if changed {
            self.dirty = true;
        }
        changed
    }

    /// Owned point-in-time copy for readers.
    pub fn snapshot(&self) -> SeriesSnapshot {
        SeriesSnapshot {
            symbol: self.symbol.clone(),
            bars: self.bars.values().cloned().collect(),
            taken_at: Utc::now(),
        }
    }
}

/// Immutable copy of a series handed to consumers (UI, forecasting, reports).
#[derive(Debug, Clone, Serialize)]
pub struct SeriesSnapshot {
    pub symbol: String,
    pub bars: Vec<Bar>,
    pub taken_at: DateTime<Utc>,
}

impl SeriesSnapshot {
    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn last(&self) -> Option<&Bar> {
        self.bars.last()
    }

    pub fn closes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.close).collect()
    }

    /// Bars with every OHLCV field present, as charting wants them.
    pub fn complete_bars(&self) -> Vec<Bar> {
        self.bars.iter().filter(|b| b.is_complete()).cloned().collect()
    }

    /// Rolling mean of closes; `NaN` until `window` bars are available.
    pub fn sma(&self, window: usize) -> Vec<f64> {
        Sma::new(window).compute(&self.bars)
    }

    /// Exponential moving average of closes.
    pub fn ema(&self, span: usize) -> Vec<f64> {
        Ema::new(span).compute(&self.bars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    fn bar(day: u32, close: f64) -> Bar {
        Bar::new(d(day), close - 1.0, close + 1.0, close - 2.0, close, 1_000)
    }

    #[test]
    fn merge_incoming_wins_on_collision() {
        let existing = vec![bar(2, 10.0), bar(3, 11.0)];
        let incoming = vec![bar(3, 99.0), bar(4, 12.0)];
        let merged = merge(&existing, &incoming);

        assert_eq!(merged.len(), 3);
        assert_eq!(merged[1].close, 99.0);
        assert_eq!(merged[2].date, d(4));
    }

    #[test]
    fn merge_sorts_unsorted_input() {
        let merged = merge(&[bar(9, 1.0), bar(2, 2.0)], &[bar(5, 3.0)]);
        let dates: Vec<_> = merged.iter().map(|b| b.date).collect();
        assert_eq!(dates, vec![d(2), d(5), d(9)]);
    }

    #[test]
    fn merge_is_idempotent() {
        let s = vec![bar(2, 10.0), bar(3, 11.0), bar(4, 12.0)];
        assert_eq!(merge(&s, &s), s);
    }

    #[test]
    fn merge_from_marks_dirty_only_on_change() {
        let mut cache = SeriesCache::from_bars("SPY", vec![bar(2, 10.0)]);
        assert!(!cache.is_dirty());

        let stats = cache.merge_from(vec![bar(2, 10.0)]);
        assert_eq!(stats.unchanged, 1);
        assert!(!cache.is_dirty());

        let stats = cache.merge_from(vec![bar(2, 10.5), bar(3, 11.0)]);
        assert_eq!(stats.replaced, 1);
        assert_eq!(stats.inserted, 1);
        assert!(cache.is_dirty());
    }

    #[test]
    fn fold_close_updates_existing_bar() {
        let mut cache = SeriesCache::from_bars("SPY", vec![bar(2, 10.0)]);
        assert!(cache.fold_close(d(2), 10.25));
        let folded = cache.get(d(2)).unwrap();
        assert_eq!(folded.close, 10.25);
        assert_eq!(folded.open, Some(9.0));
        assert!(!cache.fold_close(d(2), 10.25));
    }

    #[test]
    fn fold_close_appends_close_only_bar() {
        let mut cache = SeriesCache::from_bars("SPY", vec![bar(2, 10.0)]);
        assert!(cache.fold_close(d(3), 10.5));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.first_date(), Some(d(2)));
        assert_eq!(cache.last_date(), Some(d(3)));
        assert!(!cache.get(d(3)).unwrap().is_complete());
    }

    #[test]
    fn snapshot_is_detached_copy() {
        let mut cache = SeriesCache::from_bars("SPY", vec![bar(2, 10.0)]);
        let snap = cache.snapshot();
        cache.merge_from(vec![bar(3, 11.0)]);
        assert_eq!(snap.len(), 1);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn complete_bars_skips_close_only() {
        let mut cache = SeriesCache::from_bars("SPY", vec![bar(2, 10.0)]);
        cache.fold_close(d(3), 10.5);
        let snap = cache.snapshot();
        assert_eq!(snap.complete_bars().len(), 1);
        assert_eq!(snap.closes(), vec![10.0, 10.5]);
    }
}
