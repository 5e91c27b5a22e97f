//! History provider trait and request windows.
//!
//! The `HistoryProvider` trait abstracts over remote sources (Yahoo Finance,
//! test fakes) so the store never knows where bars come from.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Days, Local, Months, NaiveDate, Utc};

use crate::domain::Bar;
use crate::error::FetchError;

/// Trait for remote bar sources.
///
/// Sources are unreliable: they may return nothing, rate-limit, or omit
/// fields. Implementations drop unusable rows themselves and report an empty
/// result as `Ok(vec![])` or `FetchError::Empty`; the store treats both alike.
pub trait HistoryProvider: Send + Sync {
    /// Human-readable name of this provider.
    fn name(&self) -> &str;

    /// Daily bars for `symbol` between `start` and `end` inclusive.
    fn fetch_window(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Bar>, FetchError>;

    /// The current session aggregated into one daily bar.
    fn fetch_session_bar(&self, symbol: &str) -> Result<Bar, FetchError>;

    /// False while the provider is refusing requests (circuit breaker open).
    fn is_available(&self) -> bool {
        true
    }

    /// Trading date that `at` falls on for `symbol`, on the same calendar
    /// the provider dates its own bars with. Live folds and the store's idea
    /// of "today" go through here. Providers that know the exchange's time
    /// zone override this; the default is the local calendar day.
    fn session_date(&self, _symbol: &str, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&Local).date_naive()
    }
}

/// Look-back period for a bulk refresh, in the `6mo` / `1y` / `ytd` notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryWindow {
    Days(u32),
    Weeks(u32),
    Months(u32),
    Years(u32),
    YearToDate,
    Max,
}

impl HistoryWindow {
    /// Inclusive date range ending at `today`. Look-backs reaching past
    /// 1970-01-01 are clamped to it, same as `max`.
    pub fn resolve(&self, today: NaiveDate) -> (NaiveDate, NaiveDate) {
        let floor = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or(NaiveDate::MIN);
        let start = match *self {
            HistoryWindow::Days(n) => today.checked_sub_days(Days::new(u64::from(n))),
            HistoryWindow::Weeks(n) => today.checked_sub_days(Days::new(u64::from(n) * 7)),
            HistoryWindow::Months(n) => today.checked_sub_months(Months::new(n)),
            HistoryWindow::Years(n) => today.checked_sub_months(Months::new(n.saturating_mul(12))),
            HistoryWindow::YearToDate => NaiveDate::from_ymd_opt(today.year(), 1, 1),
            HistoryWindow::Max => Some(floor),
        };
        (start.map_or(floor, |s| s.max(floor)).min(today), today)
    }
}

impl Default for HistoryWindow {
    fn default() -> Self {
        HistoryWindow::Months(6)
    }
}

impl fmt::Display for HistoryWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HistoryWindow::Days(n) => write!(f, "{n}d"),
            HistoryWindow::Weeks(n) => write!(f, "{n}wk"),
            HistoryWindow::Months(n) => write!(f, "{n}mo"),
            HistoryWindow::Years(n) => write!(f, "{n}y"),
            HistoryWindow::YearToDate => f.write_str("ytd"),
            HistoryWindow::Max => f.write_str("max"),
        }
    }
}

impl FromStr for HistoryWindow {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        match s.as_str() {
            "ytd" => return Ok(HistoryWindow::YearToDate),
            "max" => return Ok(HistoryWindow::Max),
            _ => {}
        }

        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("window '{s}' has no unit (use d, wk, mo, y)"))?;
        let (num, unit) = s.split_at(split);
        let n: u32 = num
            .parse()
            .map_err(|_| format!("window '{s}' must start with a number"))?;
        if n == 0 {
            return Err(format!("window '{s}' must be positive"));
        }

        match unit {
            "d" => Ok(HistoryWindow::Days(n)),
            "wk" | "w" => Ok(HistoryWindow::Weeks(n)),
            "mo" | "m" => Ok(HistoryWindow::Months(n)),
            "y" | "yr" => Ok(HistoryWindow::Years(n)),
            other => Err(format!("unknown window unit '{other}' (use d, wk, mo, y)")),
        }
    }
}
