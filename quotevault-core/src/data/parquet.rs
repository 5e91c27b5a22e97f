//! On-disk series files.
//!
//! Layout: `{cache_dir}/{SYMBOL}.parquet` with columns
//! `Date, Open, High, Low, Close, Volume`, plus `{SYMBOL}.meta.json`.
//!
//! - Writes are atomic (write to `.tmp`, rename into place) and replace the
//!   whole file.
//! - Reads are tolerant: column names match case-insensitively, dates may be
//!   stored as Date, Datetime or text, prices as any numeric or text type.
//!   Rows missing a date or close are dropped one by one.
//! - A file that cannot be decoded at all is renamed to `.quarantined`.
//! - A legacy `{SYMBOL}.csv` is imported when no Parquet file exists.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::{Bar, RawRow};
use crate::error::{ParseError, PersistError};

/// `NaiveDate::num_days_from_ce()` of 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// Metadata sidecar for a cached symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMeta {
    pub symbol: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub bar_count: usize,
    pub data_hash: String,
    pub updated_at: DateTime<Utc>,
}

/// Cache status for a single symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStatus {
    pub symbol: String,
    pub cached: bool,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub bar_count: Option<usize>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Where a load found its bars.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Parquet,
    LegacyCsv,
    /// The Parquet file was unreadable and has been moved aside.
    Quarantined,
    Missing,
}

#[derive(Debug, Clone)]
pub struct LoadedSeries {
    pub bars: Vec<Bar>,
    pub source: LoadSource,
    /// Rows rejected individually (bad date, missing close).
    pub dropped: usize,
}

/// Reads and writes the per-symbol files under one cache directory.
#[derive(Debug, Clone)]
pub struct SeriesFile {
    cache_dir: PathBuf,
}

impl SeriesFile {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    /// `{cache_dir}/{SYMBOL}.parquet`
    pub fn path(&self, symbol: &str) -> PathBuf {
        self.cache_dir.join(format!("{symbol}.parquet"))
    }

    pub fn meta_path(&self, symbol: &str) -> PathBuf {
        self.cache_dir.join(format!("{symbol}.meta.json"))
    }

    pub fn legacy_csv_path(&self, symbol: &str) -> PathBuf {
        self.cache_dir.join(format!("{symbol}.csv"))
    }

    /// Load whatever is on disk for `symbol`.
    ///
    /// Never fails on bad content: undecodable Parquet is quarantined and an
    /// empty result returned. Only I/O errors on an existing legacy CSV bubble up.
    pub fn load(&self, symbol: &str) -> Result<LoadedSeries, PersistError> {
        let path = self.path(symbol);
        if path.exists() {
            return Ok(match read_parquet(&path) {
                Ok(rows) => {
                    let (bars, dropped) = validate_rows(symbol, rows);
                    LoadedSeries {
                        bars,
                        source: LoadSource::Parquet,
                        dropped,
                    }
                }
                Err(e) => {
                    self.quarantine(&path, &e);
                    LoadedSeries {
                        bars: Vec::new(),
                        source: LoadSource::Quarantined,
                        dropped: 0,
                    }
                }
            });
        }

        let csv_path = self.legacy_csv_path(symbol);
        if csv_path.exists() {
            let rows = read_legacy_csv(&csv_path)?;
            let (bars, dropped) = validate_rows(symbol, rows);
            info!(symbol, bars = bars.len(), "imported legacy csv cache");
            return Ok(LoadedSeries {
                bars,
                source: LoadSource::LegacyCsv,
                dropped,
            });
        }

        Ok(LoadedSeries {
            bars: Vec::new(),
            source: LoadSource::Missing,
            dropped: 0,
        })
    }

    fn quarantine(&self, path: &Path, reason: &PersistError) {
        let target = path.with_extension("parquet.quarantined");
        warn!(path = %path.display(), error = %reason, "quarantining unreadable cache file");
        if let Err(e) = fs::rename(path, &target) {
            warn!(path = %path.display(), error = %e, "quarantine rename failed");
        }
    }

    /// Replace the file for `symbol` with `bars` (ascending, unique dates)
    /// and refresh the metadata sidecar.
    pub fn write(&self, symbol: &str, bars: &[Bar]) -> Result<CacheMeta, PersistError> {
        let (Some(first), Some(last)) = (bars.first(), bars.last()) else {
            return Err(PersistError::Encode(format!("no bars to write for {symbol}")));
        };

        fs::create_dir_all(&self.cache_dir)
            .map_err(|e| PersistError::io(&self.cache_dir, e))?;

        let mut df = bars_to_dataframe(bars)?;
        let path = self.path(symbol);
        let tmp_path = path.with_extension("parquet.tmp");
        write_parquet(&mut df, &tmp_path)?;
        rename_into_place(&tmp_path, &path)?;

        let meta = CacheMeta {
            symbol: symbol.to_string(),
            start_date: first.date,
            end_date: last.date,
            bar_count: bars.len(),
            data_hash: data_hash(bars)?,
            updated_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&meta)
            .map_err(|e| PersistError::Meta(format!("meta serialization: {e}")))?;
        let meta_path = self.meta_path(symbol);
        let meta_tmp = meta_path.with_extension("json.tmp");
        fs::write(&meta_tmp, json).map_err(|e| PersistError::io(&meta_tmp, e))?;
        rename_into_place(&meta_tmp, &meta_path)?;

        debug!(symbol, bars = bars.len(), path = %path.display(), "series written");
        Ok(meta)
    }

    pub fn get_meta(&self, symbol: &str) -> Option<CacheMeta> {
        let content = fs::read_to_string(self.meta_path(symbol)).ok()?;
        serde_json::from_str(&content).ok()
    }

    pub fn status(&self, symbols: &[&str]) -> Vec<CacheStatus> {
        symbols
            .iter()
            .map(|sym| {
                let meta = self.get_meta(sym);
                CacheStatus {
                    symbol: sym.to_string(),
                    cached: meta.is_some() || self.path(sym).exists(),
                    start_date: meta.as_ref().map(|m| m.start_date),
                    end_date: meta.as_ref().map(|m| m.end_date),
                    bar_count: meta.as_ref().map(|m| m.bar_count),
                    updated_at: meta.as_ref().map(|m| m.updated_at),
                }
            })
            .collect()
    }

    /// Symbols with a Parquet file in the cache directory, sorted.
    pub fn cached_symbols(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.cache_dir) else {
            return Vec::new();
        };
        let mut symbols: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().into_string().ok()?;
                name.strip_suffix(".parquet").map(str::to_string)
            })
            .collect();
        symbols.sort();
        symbols
    }
}

/// BLAKE3 of the JSON-serialized bars.
pub fn data_hash(bars: &[Bar]) -> Result<String, PersistError> {
    let bytes = serde_json::to_vec(bars)
        .map_err(|e| PersistError::Meta(format!("hash serialization: {e}")))?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

fn rename_into_place(tmp: &Path, dest: &Path) -> Result<(), PersistError> {
    fs::rename(tmp, dest).map_err(|e| {
        let _ = fs::remove_file(tmp);
        PersistError::io(dest, e)
    })
}

fn validate_rows(symbol: &str, rows: Vec<RawRow>) -> (Vec<Bar>, usize) {
    let total = rows.len();
    let mut bars: Vec<Bar> = rows
        .into_iter()
        .filter_map(|row| match row.into_bar() {
            Ok(bar) => Some(bar),
            Err(e) => {
                debug!(symbol, error = %e, "dropping cached row");
                None
            }
        })
        .collect();
    let dropped = total - bars.len();
    if dropped > 0 {
        warn!(symbol, dropped, "dropped malformed rows from cache file");
    }
    bars.sort_by_key(|b| b.date);
    (bars, dropped)
}

// ── Parquet I/O helpers ─────────────────────────────────────────────

fn date_to_days(date: NaiveDate) -> i32 {
    date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE
}

fn days_to_date(days: i32) -> Option<NaiveDate> {
    NaiveDate::from_num_days_from_ce_opt(days.checked_add(UNIX_EPOCH_DAYS_FROM_CE)?)
}

fn bars_to_dataframe(bars: &[Bar]) -> Result<DataFrame, PersistError> {
    let dates: Vec<i32> = bars.iter().map(|b| date_to_days(b.date)).collect();
    let opens: Vec<Option<f64>> = bars.iter().map(|b| b.open).collect();
    let highs: Vec<Option<f64>> = bars.iter().map(|b| b.high).collect();
    let lows: Vec<Option<f64>> = bars.iter().map(|b| b.low).collect();
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let volumes: Vec<Option<u64>> = bars.iter().map(|b| b.volume).collect();

    DataFrame::new(vec![
        Column::new("Date".into(), dates)
            .cast(&DataType::Date)
            .map_err(|e| PersistError::Encode(format!("date cast: {e}")))?,
        Column::new("Open".into(), opens),
        Column::new("High".into(), highs),
        Column::new("Low".into(), lows),
        Column::new("Close".into(), closes),
        Column::new("Volume".into(), volumes),
    ])
    .map_err(|e| PersistError::Encode(format!("dataframe creation: {e}")))
}

fn write_parquet(df: &mut DataFrame, path: &Path) -> Result<(), PersistError> {
    let file = fs::File::create(path).map_err(|e| PersistError::io(path, e))?;
    ParquetWriter::new(file)
        .finish(df)
        .map_err(|e| PersistError::Encode(format!("write parquet: {e}")))?;
    Ok(())
}

fn read_parquet(path: &Path) -> Result<Vec<RawRow>, PersistError> {
    let file = fs::File::open(path).map_err(|e| PersistError::io(path, e))?;
    let df = ParquetReader::new(file)
        .finish()
        .map_err(|e| PersistError::Decode(format!("read: {e}")))?;
    dataframe_to_rows(&df)
}

fn find_column<'a>(df: &'a DataFrame, name: &str) -> Option<&'a Column> {
    df.get_columns()
        .iter()
        .find(|c| c.name().as_str().eq_ignore_ascii_case(name))
}

fn float_values(df: &DataFrame, name: &str) -> Result<Vec<Option<f64>>, PersistError> {
    let Some(col) = find_column(df, name) else {
        return Ok(vec![None; df.height()]);
    };
    let cast = col
        .cast(&DataType::Float64)
        .map_err(|e| PersistError::Decode(format!("{name} column: {e}")))?;
    let ca = cast
        .f64()
        .map_err(|e| PersistError::Decode(format!("{name} column type: {e}")))?;
    Ok(ca.into_iter().collect())
}

fn date_values(col: &Column) -> Result<Vec<Option<NaiveDate>>, PersistError> {
    if matches!(col.dtype(), DataType::String) {
        let ca = col
            .str()
            .map_err(|e| PersistError::Decode(format!("date column type: {e}")))?;
        return Ok(ca
            .into_iter()
            .map(|v| v.and_then(|s| parse_date_str(s).ok()))
            .collect());
    }

    let cast = col
        .cast(&DataType::Date)
        .map_err(|e| PersistError::Decode(format!("date column: {e}")))?;
    let ca = cast
        .date()
        .map_err(|e| PersistError::Decode(format!("date column type: {e}")))?;
    Ok((0..ca.len())
        .map(|i| ca.get(i).and_then(days_to_date))
        .collect())
}

fn dataframe_to_rows(df: &DataFrame) -> Result<Vec<RawRow>, PersistError> {
    let date_col = find_column(df, "date")
        .ok_or_else(|| PersistError::Decode("missing column 'Date'".into()))?;
    if find_column(df, "close").is_none() {
        return Err(PersistError::Decode("missing column 'Close'".into()));
    }

    let dates = date_values(date_col)?;
    let opens = float_values(df, "open")?;
    let highs = float_values(df, "high")?;
    let lows = float_values(df, "low")?;
    let closes = float_values(df, "close")?;
    let volumes = float_values(df, "volume")?;

    Ok((0..df.height())
        .map(|i| RawRow {
            date: dates[i],
            open: opens[i],
            high: highs[i],
            low: lows[i],
            close: closes[i],
            volume: volumes[i],
        })
        .collect())
}

/// Accepts `2024-01-02`, `2024-01-02 00:00:00`, `2024-01-02T00:00:00Z`
/// and `01/02/2024`.
fn parse_date_str(s: &str) -> Result<NaiveDate, ParseError> {
    let s = s.trim();
    if let Some(prefix) = s.get(..10) {
        if let Ok(d) = NaiveDate::parse_from_str(prefix, "%Y-%m-%d") {
            return Ok(d);
        }
    }
    NaiveDate::parse_from_str(s, "%m/%d/%Y").map_err(|_| ParseError::InvalidDate(s.to_string()))
}

// ── Legacy CSV import ───────────────────────────────────────────────

fn read_legacy_csv(path: &Path) -> Result<Vec<RawRow>, PersistError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|e| PersistError::Decode(format!("{}: {e}", path.display())))?;

    let headers = reader
        .headers()
        .map_err(|e| PersistError::Decode(format!("csv headers: {e}")))?
        .clone();
    let idx = |name: &str| {
        headers
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(name))
    };
    let (Some(date_idx), Some(close_idx)) = (idx("date"), idx("close")) else {
        return Err(PersistError::Decode(format!(
            "{} lacks Date/Close columns",
            path.display()
        )));
    };
    let (open_idx, high_idx, low_idx, vol_idx) = (idx("open"), idx("high"), idx("low"), idx("volume"));

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "skipping unreadable csv record");
                continue;
            }
        };
        let num = |i: Option<usize>| {
            i.and_then(|i| record.get(i))
                .and_then(|v| v.trim().parse::<f64>().ok())
        };
        rows.push(RawRow {
            date: record.get(date_idx).and_then(|s| parse_date_str(s).ok()),
            open: num(open_idx),
            high: num(high_idx),
            low: num(low_idx),
            close: num(Some(close_idx)),
            volume: num(vol_idx),
        });
    }
    Ok(rows)
}
