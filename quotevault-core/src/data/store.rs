//! The historical series store: authoritative per-symbol bars in memory,
//! mirrored to Parquet on disk.
//!
//! Every mutation of one symbol runs under that symbol's mutex, so the bulk
//! refresh, the live fold and the snapshot refresher never interleave a
//! merge. Network fetches happen before the lock is taken. Readers get owned
//! `SeriesSnapshot`s and never observe a half-applied merge.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::parquet::{CacheStatus, LoadSource, SeriesFile};
use super::provider::{HistoryProvider, HistoryWindow};
use crate::domain::{normalize_symbol, Bar, MergeStats, SeriesCache, SeriesSnapshot};
use crate::error::{FetchError, PersistError};
use crate::worker::CancelToken;

type Slot = Arc<Mutex<Option<SeriesCache>>>;

/// Result of a successful bulk refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshOutcome {
    pub symbol: String,
    pub fetched: usize,
    pub stats: MergeStats,
    /// Bars cached after the merge.
    pub total: usize,
    /// False when the merge was applied in memory but the write failed.
    pub persisted: bool,
}

pub struct SeriesStore {
    file: SeriesFile,
    provider: Arc<dyn HistoryProvider>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl SeriesStore {
    pub fn new(file: SeriesFile, provider: Arc<dyn HistoryProvider>) -> Self {
        Self {
            file,
            provider,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn provider(&self) -> &Arc<dyn HistoryProvider> {
        &self.provider
    }

    /// Trading date of `at` for `symbol`, on the provider's calendar.
    pub fn session_date(&self, symbol: &str, at: DateTime<Utc>) -> NaiveDate {
        self.provider.session_date(&normalize_symbol(symbol), at)
    }

    /// Per-symbol slot. The map lock is held only long enough to find or
    /// insert the slot; loading happens under the slot's own lock.
    fn slot(&self, symbol: &str) -> Slot {
        self.slots
            .lock()
            .entry(symbol.to_string())
            .or_default()
            .clone()
    }

    /// Run `f` with the symbol's cache locked, loading it from disk on first use.
    fn with_cache<R>(&self, symbol: &str, f: impl FnOnce(&mut SeriesCache) -> R) -> R {
        let slot = self.slot(symbol);
        let mut guard = slot.lock();
        let cache = guard.get_or_insert_with(|| self.load_from_disk(symbol));
        f(cache)
    }

    fn load_from_disk(&self, symbol: &str) -> SeriesCache {
        match self.file.load(symbol) {
            Ok(loaded) => {
                debug!(symbol, bars = loaded.bars.len(), source = ?loaded.source, "cache loaded");
                match loaded.source {
                    // Imported rows still need their first Parquet write.
                    LoadSource::LegacyCsv => {
                        let mut cache = SeriesCache::empty(symbol);
                        cache.merge_from(loaded.bars);
                        cache
                    }
                    _ => SeriesCache::from_bars(symbol, loaded.bars),
                }
            }
            Err(e) => {
                warn!(symbol, error = %e, "cache load failed, starting empty");
                SeriesCache::empty(symbol)
            }
        }
    }

    /// Ensure the symbol's cache is in memory; returns its bar count.
    pub fn load_cache(&self, symbol: &str) -> usize {
        let symbol = normalize_symbol(symbol);
        self.with_cache(&symbol, |cache| cache.len())
    }

    /// Fetch `window` from the provider and merge it into the cache.
    ///
    /// An empty or failed fetch leaves the cache exactly as it was.
    pub fn refresh_window(
        &self,
        symbol: &str,
        window: HistoryWindow,
    ) -> Result<RefreshOutcome, FetchError> {
        let (start, end) = window.resolve(self.session_date(symbol, Utc::now()));
        self.refresh_range(symbol, start, end)
    }

    pub fn refresh_range(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<RefreshOutcome, FetchError> {
        self.refresh_range_inner(symbol, start, end, None)
    }

    /// `refresh_window` on behalf of a worker. If `token` is cancelled by the
    /// time the fetch returns, the result is dropped under the symbol lock and
    /// `FetchError::Cancelled` comes back, so a fetch that outlived its worker
    /// never lands on top of a newer one.
    pub fn refresh_window_cancellable(
        &self,
        symbol: &str,
        window: HistoryWindow,
        token: &CancelToken,
    ) -> Result<RefreshOutcome, FetchError> {
        let (start, end) = window.resolve(self.session_date(symbol, Utc::now()));
        self.refresh_range_inner(symbol, start, end, Some(token))
    }

    fn refresh_range_inner(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
        token: Option<&CancelToken>,
    ) -> Result<RefreshOutcome, FetchError> {
        let symbol = normalize_symbol(symbol);

        let incoming = match self.provider.fetch_window(&symbol, start, end) {
            Ok(bars) if bars.is_empty() => Err(FetchError::Empty {
                symbol: symbol.clone(),
            }),
            other => other,
        }
        .inspect_err(|e| warn!(symbol, error = %e, "bulk refresh failed, keeping cached series"))?;
        let fetched = incoming.len();

        self.with_cache(&symbol, |cache| {
            if token.is_some_and(CancelToken::is_cancelled) {
                info!(symbol, fetched, "bulk refresh cancelled, dropping result");
                return Err(FetchError::Cancelled {
                    symbol: symbol.clone(),
                });
            }
            let stats = cache.merge_from(incoming);
            let persisted = self.persist_locked(cache).is_ok();
            info!(
                symbol,
                fetched,
                inserted = stats.inserted,
                replaced = stats.replaced,
                total = cache.len(),
                "bulk refresh merged"
            );
            Ok(RefreshOutcome {
                symbol: symbol.clone(),
                fetched,
                stats,
                total: cache.len(),
                persisted,
            })
        })
    }

    /// Write the cache if it has unsaved changes. Returns whether a write happened.
    pub fn persist(&self, symbol: &str) -> Result<bool, PersistError> {
        let symbol = normalize_symbol(symbol);
        self.with_cache(&symbol, |cache| self.persist_locked(cache))
    }

    /// On failure the cache stays dirty so the next persist supersedes it.
    fn persist_locked(&self, cache: &mut SeriesCache) -> Result<bool, PersistError> {
        if !cache.is_dirty() || cache.is_empty() {
            return Ok(false);
        }
        let bars: Vec<Bar> = cache.bars().cloned().collect();
        match self.file.write(cache.symbol(), &bars) {
            Ok(_) => {
                cache.mark_clean();
                Ok(true)
            }
            Err(e) => {
                warn!(symbol = cache.symbol(), error = %e, "persist failed, in-memory series kept");
                Err(e)
            }
        }
    }

    /// Merge one bar and persist if anything changed. A symbol with no
    /// cached bars is left alone.
    pub fn merge_bar(&self, symbol: &str, bar: Bar) -> Result<MergeStats, PersistError> {
        let symbol = normalize_symbol(symbol);
        self.with_cache(&symbol, |cache| {
            if cache.is_empty() {
                debug!(symbol, "no cached series, skipping bar merge");
                return Ok(MergeStats::default());
            }
            let stats = cache.merge_from([bar]);
            if stats.changed() {
                self.persist_locked(cache)?;
            }
            Ok(stats)
        })
    }

    /// Fold a live price into `date`'s close. Does not persist. Returns
    /// whether the cache changed; always false for a symbol with no bars.
    pub fn fold_price(&self, symbol: &str, price: f64, date: NaiveDate) -> bool {
        let symbol = normalize_symbol(symbol);
        self.with_cache(&symbol, |cache| {
            if cache.is_empty() {
                return false;
            }
            cache.fold_close(date, price)
        })
    }

    /// Point-in-time copy of the series, `None` when nothing is cached.
    pub fn get_series(&self, symbol: &str) -> Option<SeriesSnapshot> {
        let symbol = normalize_symbol(symbol);
        self.with_cache(&symbol, |cache| (!cache.is_empty()).then(|| cache.snapshot()))
    }

    pub fn has_data(&self, symbol: &str) -> bool {
        self.load_cache(symbol) > 0
    }

    pub fn is_dirty(&self, symbol: &str) -> bool {
        let symbol = normalize_symbol(symbol);
        self.with_cache(&symbol, |cache| cache.is_dirty())
    }

    /// Symbols currently held in memory, sorted.
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.slots.lock().keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Persist every dirty cache; returns the failures.
    pub fn persist_all_dirty(&self) -> Vec<(String, PersistError)> {
        let mut failures = Vec::new();
        for symbol in self.symbols() {
            match self.persist(&symbol) {
                Ok(true) => debug!(symbol, "flushed dirty series"),
                Ok(false) => {}
                Err(e) => failures.push((symbol, e)),
            }
        }
        failures
    }

    pub fn status(&self, symbols: &[&str]) -> Vec<CacheStatus> {
        self.file.status(symbols)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    struct FixedProvider {
        bars: Vec<Bar>,
    }

    impl HistoryProvider for FixedProvider {
        fn name(&self) -> &str {
            "fixed"
        }

        fn fetch_window(&self, _: &str, _: NaiveDate, _: NaiveDate) -> Result<Vec<Bar>, FetchError> {
            Ok(self.bars.clone())
        }

        fn fetch_session_bar(&self, symbol: &str) -> Result<Bar, FetchError> {
            self.bars.last().cloned().ok_or_else(|| FetchError::Empty {
                symbol: symbol.to_string(),
            })
        }
    }

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    fn bar(day: u32, close: f64) -> Bar {
        Bar::new(d(day), close, close + 1.0, close - 1.0, close, 100)
    }

    fn store(dir: &TempDir, bars: Vec<Bar>) -> SeriesStore {
        SeriesStore::new(
            SeriesFile::new(dir.path()),
            Arc::new(FixedProvider { bars }),
        )
    }

    #[test]
    fn get_series_is_none_without_data() {
        let dir = TempDir::new().unwrap();
        assert!(store(&dir, vec![]).get_series("SPY").is_none());
    }

    #[test]
    fn refresh_normalizes_symbol_and_persists() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, vec![bar(2, 10.0), bar(3, 11.0)]);

        let outcome = store.refresh_range(" spy", d(1), d(5)).unwrap();
        assert_eq!(outcome.symbol, "SPY");
        assert_eq!(outcome.total, 2);
        assert!(outcome.persisted);
        assert!(!store.is_dirty("SPY"));
        assert!(dir.path().join("SPY.parquet").exists());
    }

    #[test]
    fn cancelled_refresh_leaves_cache_untouched() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, vec![bar(2, 10.0)]);
        store.refresh_range("SPY", d(1), d(5)).unwrap();

        let token = CancelToken::new();
        token.cancel();
        let err = store
            .refresh_window_cancellable("SPY", HistoryWindow::Days(5), &token)
            .unwrap_err();
        assert!(matches!(err, FetchError::Cancelled { .. }));
        assert_eq!(store.get_series("SPY").unwrap().len(), 1);
        assert!(!store.is_dirty("SPY"));

        let live = CancelToken::new();
        let outcome = store
            .refresh_window_cancellable("SPY", HistoryWindow::Days(5), &live)
            .unwrap();
        assert_eq!(outcome.total, 1);
    }

    #[test]
    fn fold_and_merge_skip_empty_cache() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, vec![]);

        assert!(!store.fold_price("SPY", 10.0, d(2)));
        assert_eq!(store.merge_bar("SPY", bar(2, 10.0)).unwrap(), MergeStats::default());
        assert!(store.get_series("SPY").is_none());
    }

    #[test]
    fn fold_marks_dirty_until_persisted() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, vec![bar(2, 10.0)]);
        store.refresh_range("SPY", d(1), d(5)).unwrap();

        assert!(store.fold_price("SPY", 10.5, d(3)));
        assert!(store.is_dirty("SPY"));
        assert!(store.persist("SPY").unwrap());
        assert!(!store.persist("SPY").unwrap());

        let reloaded = SeriesFile::new(dir.path()).load("SPY").unwrap();
        assert_eq!(reloaded.bars.len(), 2);
        assert_eq!(reloaded.bars[1].close, 10.5);
    }

    #[test]
    fn merge_bar_persists_only_on_change() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, vec![bar(2, 10.0)]);
        store.refresh_range("SPY", d(1), d(5)).unwrap();
        let written = fs::metadata(dir.path().join("SPY.parquet")).unwrap().modified().unwrap();

        let stats = store.merge_bar("SPY", bar(2, 10.0)).unwrap();
        assert!(!stats.changed());
        let after = fs::metadata(dir.path().join("SPY.parquet")).unwrap().modified().unwrap();
        assert_eq!(written, after);

        let stats = store.merge_bar("SPY", bar(3, 12.0)).unwrap();
        assert_eq!(stats.inserted, 1);
        assert_eq!(store.get_series("SPY").unwrap().len(), 2);
    }

    #[test]
    fn legacy_import_is_dirty_until_first_persist() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("QQQ.csv"),
            "Date,Open,High,Low,Close,Volume\n2024-01-02,1,2,0.5,1.5,100\n",
        )
        .unwrap();
        let store = store(&dir, vec![]);

        assert!(store.has_data("QQQ"));
        assert!(store.is_dirty("QQQ"));
        assert!(store.persist_all_dirty().is_empty());
        assert!(dir.path().join("QQQ.parquet").exists());
    }
}
