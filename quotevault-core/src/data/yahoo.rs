//! Yahoo Finance history provider.
//!
//! Fetches daily OHLCV bars and the current intraday session from Yahoo's v8
//! chart API. Handles rate limiting, retries with exponential backoff,
//! response parsing, and the circuit breaker.
//!
//! Yahoo Finance has no official API and is subject to unannounced format
//! changes; any row that doesn't parse is dropped on its own.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, warn};

use super::circuit_breaker::CircuitBreaker;
use super::provider::HistoryProvider;
use crate::domain::{Bar, RawRow};
use crate::error::FetchError;

const CHART_BASE: &str = "https://query2.finance.yahoo.com/v8/finance/chart";

/// UTC offset (seconds) assumed for a symbol before Yahoo has reported one:
/// US Eastern standard time.
const DEFAULT_GMTOFFSET: i64 = -18_000;

/// Yahoo Finance v8 chart API response.
#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartResult,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    result: Option<Vec<ChartData>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    meta: Option<ChartMeta>,
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct ChartMeta {
    gmtoffset: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<QuoteData>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct QuoteData {
    open: Vec<Option<f64>>,
    high: Vec<Option<f64>>,
    low: Vec<Option<f64>>,
    close: Vec<Option<f64>>,
    volume: Vec<Option<f64>>,
}

/// Yahoo Finance data provider.
pub struct YahooProvider {
    client: reqwest::blocking::Client,
    circuit_breaker: Arc<CircuitBreaker>,
    max_retries: u32,
    base_delay: Duration,
    /// Exchange `gmtoffset` last reported per symbol.
    offsets: Mutex<HashMap<String, i64>>,
}

impl YahooProvider {
    /// Build a provider with connect and overall request timeouts.
    pub fn new(
        circuit_breaker: Arc<CircuitBreaker>,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;

        Ok(Self {
            client,
            circuit_breaker,
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            offsets: Mutex::new(HashMap::new()),
        })
    }

    /// Remember the exchange offset a response reports; returns the offset
    /// to date its rows with.
    fn learn_offset(&self, symbol: &str, data: &ChartData) -> i64 {
        let mut offsets = self.offsets.lock();
        match data.meta.as_ref().and_then(|m| m.gmtoffset) {
            Some(offset) => {
                offsets.insert(symbol.to_string(), offset);
                offset
            }
            None => offsets.get(symbol).copied().unwrap_or(DEFAULT_GMTOFFSET),
        }
    }

    fn offset(&self, symbol: &str) -> i64 {
        self.offsets
            .lock()
            .get(symbol)
            .copied()
            .unwrap_or(DEFAULT_GMTOFFSET)
    }

    /// Daily bars for a symbol and date range.
    fn daily_url(symbol: &str, start: NaiveDate, end: NaiveDate) -> String {
        let start_ts = start
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp())
            .unwrap_or(0);
        let end_ts = end
            .and_hms_opt(23, 59, 59)
            .map(|dt| dt.and_utc().timestamp())
            .unwrap_or(start_ts);
        format!("{CHART_BASE}/{symbol}?period1={start_ts}&period2={end_ts}&interval=1d")
    }

    /// One-minute bars for the current session.
    fn session_url(symbol: &str) -> String {
        format!("{CHART_BASE}/{symbol}?range=1d&interval=1m")
    }

    /// Execute a request with retry and circuit breaker logic.
    fn get_chart(&self, symbol: &str, url: &str) -> Result<ChartResponse, FetchError> {
        if !self.circuit_breaker.is_allowed() {
            return Err(FetchError::CircuitBreakerTripped);
        }

        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.base_delay * 2u32.pow(attempt - 1);
                debug!(symbol, attempt, delay_ms = delay.as_millis() as u64, "retrying chart request");
                std::thread::sleep(delay);
            }

            if !self.circuit_breaker.is_allowed() {
                return Err(FetchError::CircuitBreakerTripped);
            }

            match self.client.get(url).send() {
                Ok(resp) => {
                    let status = resp.status();

                    if status == reqwest::StatusCode::FORBIDDEN {
                        self.circuit_breaker.trip();
                        return Err(FetchError::CircuitBreakerTripped);
                    }

                    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                        self.circuit_breaker.record_failure();
                        let retry_after = resp
                            .headers()
                            .get("retry-after")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.parse::<u64>().ok())
                            .unwrap_or(60);
                        last_error = Some(FetchError::RateLimited {
                            retry_after_secs: retry_after,
                        });
                        continue;
                    }

                    if status == reqwest::StatusCode::UNAUTHORIZED {
                        return Err(FetchError::AuthenticationRequired(
                            "Yahoo Finance requires authentication".into(),
                        ));
                    }

                    if status == reqwest::StatusCode::NOT_FOUND {
                        return Err(FetchError::SymbolNotFound {
                            symbol: symbol.to_string(),
                        });
                    }

                    if !status.is_success() {
                        self.circuit_breaker.record_failure();
                        last_error = Some(FetchError::Http {
                            status: status.as_u16(),
                            symbol: symbol.to_string(),
                        });
                        continue;
                    }

                    let chart: ChartResponse = resp.json().map_err(|e| {
                        FetchError::ResponseFormatChanged(format!(
                            "failed to parse response for {symbol}: {e}"
                        ))
                    })?;
                    self.circuit_breaker.record_success();
                    return Ok(chart);
                }
                Err(e) => {
                    if e.is_connect() || e.is_timeout() {
                        last_error = Some(FetchError::NetworkUnreachable(e.to_string()));
                        continue;
                    }
                    return Err(FetchError::NetworkUnreachable(e.to_string()));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| FetchError::NetworkUnreachable("max retries exceeded".into())))
    }
}

/// Unwrap the first chart result, mapping Yahoo's error object.
fn first_result(symbol: &str, resp: ChartResponse) -> Result<ChartData, FetchError> {
    let results = resp.chart.result.ok_or_else(|| match resp.chart.error {
        Some(err) if err.code == "Not Found" => FetchError::SymbolNotFound {
            symbol: symbol.to_string(),
        },
        Some(err) => {
            FetchError::ResponseFormatChanged(format!("{}: {}", err.code, err.description))
        }
        None => FetchError::Empty {
            symbol: symbol.to_string(),
        },
    })?;

    results.into_iter().next().ok_or_else(|| FetchError::Empty {
        symbol: symbol.to_string(),
    })
}

/// Calendar date of `at` at a UTC offset given in seconds.
fn exchange_date(at: DateTime<Utc>, gmtoffset: i64) -> NaiveDate {
    i32::try_from(gmtoffset)
        .ok()
        .and_then(FixedOffset::east_opt)
        .map_or_else(|| at.date_naive(), |tz| at.with_timezone(&tz).date_naive())
}

/// Flatten a chart result into raw rows dated in the exchange's local time.
/// Rows with no values at all (holidays, halted minutes) are skipped.
fn chart_rows(data: ChartData, gmtoffset: i64) -> Vec<RawRow> {
    let Some(timestamps) = data.timestamp else {
        return Vec::new();
    };
    let quote = data.indicators.quote.into_iter().next().unwrap_or_default();
    let at = |v: &Vec<Option<f64>>, i: usize| v.get(i).copied().flatten();

    timestamps
        .iter()
        .enumerate()
        .filter_map(|(i, &ts)| {
            let row = RawRow {
                date: DateTime::from_timestamp(ts, 0).map(|at| exchange_date(at, gmtoffset)),
                open: at(&quote.open, i),
                high: at(&quote.high, i),
                low: at(&quote.low, i),
                close: at(&quote.close, i),
                volume: at(&quote.volume, i),
            };
            let all_empty = row.open.is_none()
                && row.high.is_none()
                && row.low.is_none()
                && row.close.is_none()
                && row.volume.is_none();
            (!all_empty).then_some(row)
        })
        .collect()
}

/// Validate daily rows, dropping bad ones individually.
fn parse_daily(symbol: &str, data: ChartData, gmtoffset: i64) -> Vec<Bar> {
    let rows = chart_rows(data, gmtoffset);
    let total = rows.len();
    let bars: Vec<Bar> = rows
        .into_iter()
        .filter_map(|row| match row.into_bar() {
            Ok(bar) => Some(bar),
            Err(e) => {
                debug!(symbol, error = %e, "dropping daily row");
                None
            }
        })
        .collect();
    if bars.len() < total {
        warn!(symbol, dropped = total - bars.len(), kept = bars.len(), "dropped malformed rows");
    }
    // Kept as delivered; the close is still usable.
    let inconsistent = bars.iter().filter(|b| b.is_complete() && !b.is_sane()).count();
    if inconsistent > 0 {
        warn!(symbol, rows = inconsistent, "OHLC values out of order in provider data");
    }
    bars
}

/// Aggregate the most recent trading date's intraday rows into a daily bar:
/// first open, max high, min low, last close, summed volume.
fn aggregate_session(rows: &[RawRow]) -> Option<RawRow> {
    let date = rows.iter().rev().find_map(|r| r.date)?;
    let session: Vec<&RawRow> = rows.iter().filter(|r| r.date == Some(date)).collect();

    let fold_opt = |f: fn(f64, f64) -> f64, pick: fn(&RawRow) -> Option<f64>| {
        session
            .iter()
            .filter_map(|r| pick(r))
            .reduce(f)
    };

    Some(RawRow {
        date: Some(date),
        open: session.iter().find_map(|r| r.open),
        high: fold_opt(f64::max, |r| r.high),
        low: fold_opt(f64::min, |r| r.low),
        close: session.iter().rev().find_map(|r| r.close),
        volume: fold_opt(|a, b| a + b, |r| r.volume),
    })
}

impl HistoryProvider for YahooProvider {
    fn name(&self) -> &str {
        "yahoo_finance"
    }

    fn fetch_window(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Bar>, FetchError> {
        let chart = self.get_chart(symbol, &Self::daily_url(symbol, start, end))?;
        let data = first_result(symbol, chart)?;
        let offset = self.learn_offset(symbol, &data);
        let bars = parse_daily(symbol, data, offset);
        if bars.is_empty() {
            return Err(FetchError::Empty {
                symbol: symbol.to_string(),
            });
        }
        Ok(bars)
    }

    fn fetch_session_bar(&self, symbol: &str) -> Result<Bar, FetchError> {
        let chart = self.get_chart(symbol, &Self::session_url(symbol))?;
        let data = first_result(symbol, chart)?;
        let offset = self.learn_offset(symbol, &data);
        let rows = chart_rows(data, offset);
        aggregate_session(&rows)
            .and_then(|row| row.into_bar().ok())
            .ok_or_else(|| FetchError::Empty {
                symbol: symbol.to_string(),
            })
    }

    fn is_available(&self) -> bool {
        self.circuit_breaker.is_allowed()
    }

    /// Dated in exchange time, like the bars in chart responses.
    fn session_date(&self, symbol: &str, at: DateTime<Utc>) -> NaiveDate {
        exchange_date(at, self.offset(symbol))
    }
}
