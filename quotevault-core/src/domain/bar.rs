//! Bar and Quote: the units of market data the cache holds.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// OHLCV bar for a single symbol on a single calendar date.
///
/// `close` is the only required price. The other fields are `None` when the
/// source omitted them or they could not be parsed; a live-price fold creates
/// close-only bars until the next snapshot refresh fills them in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub date: NaiveDate,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: f64,
    pub volume: Option<u64>,
}

impl Bar {
    /// Bar with every field present.
    pub fn new(date: NaiveDate, open: f64, high: f64, low: f64, close: f64, volume: u64) -> Self {
        Self {
            date,
            open: Some(open),
            high: Some(high),
            low: Some(low),
            close,
            volume: Some(volume),
        }
    }

    /// Bar that only knows its close (today's bar built from a live price).
    pub fn close_only(date: NaiveDate, close: f64) -> Self {
        Self {
            date,
            open: None,
            high: None,
            low: None,
            close,
            volume: None,
        }
    }

    /// True when every OHLCV field is present.
    pub fn is_complete(&self) -> bool {
        self.open.is_some() && self.high.is_some() && self.low.is_some() && self.volume.is_some()
    }

    /// Basic OHLC sanity check: high >= low, high >= open/close, low <= open/close.
    pub fn is_sane(&self) -> bool {
        let (Some(open), Some(high), Some(low)) = (self.open, self.high, self.low) else {
            return false;
        };
        high >= low
            && high >= open
            && high >= self.close
            && low <= open
            && low <= self.close
            && open > 0.0
            && self.close > 0.0
    }
}

/// A row as read from a provider response or a cache file, before validation.
///
/// Volume is kept as `f64` because files written by other tools store it as a
/// float column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRow {
    pub date: Option<NaiveDate>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<f64>,
}

impl RawRow {
    /// Validate into a `Bar`. Rows missing a date or a finite close are rejected;
    /// non-finite optional fields become `None`.
    pub fn into_bar(self) -> Result<Bar, ParseError> {
        let date = self.date.ok_or(ParseError::MissingDate)?;
        let close = finite(self.close).ok_or(ParseError::MissingClose { date })?;
        Ok(Bar {
            date,
            open: finite(self.open),
            high: finite(self.high),
            low: finite(self.low),
            close,
            volume: finite(self.volume)
                .filter(|v| *v >= 0.0)
                .map(|v| v.round() as u64),
        })
    }
}

fn finite(v: Option<f64>) -> Option<f64> {
    v.filter(|x| x.is_finite())
}

/// One price observation from the live feed. Never persisted directly; only
/// folded into the current day's bar.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Quote {
    pub symbol: String,
    pub price: f64,
    pub received_at: DateTime<Utc>,
}

impl Quote {
    pub fn new(symbol: impl Into<String>, price: f64) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            received_at: Utc::now(),
        }
    }
}

/// Canonical form of a ticker symbol: trimmed, upper-case.
pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}
