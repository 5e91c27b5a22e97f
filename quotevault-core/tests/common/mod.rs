//! Shared fakes for integration tests: an in-memory history provider and
//! channel-backed price feeds.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;

use quotevault_core::data::HistoryProvider;
use quotevault_core::error::{FetchError, StreamError};
use quotevault_core::stream::{FeedConnector, PriceFeed};
use quotevault_core::worker::CancelToken;
use quotevault_core::Bar;

pub fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

/// `n` consecutive daily bars starting at `start`, closes `base, base+1, ...`.
pub fn daily_bars(start: NaiveDate, n: usize, base: f64) -> Vec<Bar> {
    (0..n)
        .map(|i| {
            let close = base + i as f64;
            Bar::new(
                start + chrono::Duration::days(i as i64),
                close - 0.5,
                close + 1.0,
                close - 1.0,
                close,
                1_000 + i as u64,
            )
        })
        .collect()
}

pub fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    f()
}

// ── History provider ────────────────────────────────────────────────

/// Returns queued window responses in order, each after its delay; an empty
/// queue answers with `FetchError::Empty`.
#[derive(Default)]
pub struct FakeProvider {
    windows: Mutex<VecDeque<(Duration, Result<Vec<Bar>, FetchError>)>>,
    session: Mutex<Option<Bar>>,
    session_day: Mutex<Option<NaiveDate>>,
    pub window_calls: AtomicUsize,
    pub session_calls: AtomicUsize,
}

impl FakeProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_window(&self, response: Result<Vec<Bar>, FetchError>) {
        self.push_slow_window(Duration::ZERO, response);
    }

    /// Queue a response that takes `delay` to arrive.
    pub fn push_slow_window(&self, delay: Duration, response: Result<Vec<Bar>, FetchError>) {
        self.windows.lock().push_back((delay, response));
    }

    pub fn set_session(&self, bar: Bar) {
        *self.session.lock() = Some(bar);
    }

    /// Pin the trading date reported for every instant.
    pub fn set_session_day(&self, day: NaiveDate) {
        *self.session_day.lock() = Some(day);
    }
}

impl HistoryProvider for FakeProvider {
    fn name(&self) -> &str {
        "fake"
    }

    fn fetch_window(&self, symbol: &str, _: NaiveDate, _: NaiveDate) -> Result<Vec<Bar>, FetchError> {
        self.window_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.windows.lock().pop_front();
        match next {
            Some((delay, response)) => {
                thread::sleep(delay);
                response
            }
            None => Err(FetchError::Empty {
                symbol: symbol.to_string(),
            }),
        }
    }

    fn fetch_session_bar(&self, symbol: &str) -> Result<Bar, FetchError> {
        self.session_calls.fetch_add(1, Ordering::SeqCst);
        self.session.lock().clone().ok_or_else(|| FetchError::Empty {
            symbol: symbol.to_string(),
        })
    }

    fn session_date(&self, _symbol: &str, at: DateTime<Utc>) -> NaiveDate {
        self.session_day
            .lock()
            .unwrap_or_else(|| at.with_timezone(&chrono::Local).date_naive())
    }
}

// ── Price feeds ─────────────────────────────────────────────────────

/// Feed reading frames from a channel. A dropped sender reads as the peer
/// closing the connection.
pub struct ChannelFeed {
    rx: Receiver<String>,
}

impl PriceFeed for ChannelFeed {
    fn next_message(&mut self, timeout: Duration) -> Result<Option<String>, StreamError> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(StreamError::ClosedByPeer),
        }
    }

    fn close(&mut self) {}
}

/// Feed that never delivers anything.
pub struct IdleFeed;

impl PriceFeed for IdleFeed {
    fn next_message(&mut self, timeout: Duration) -> Result<Option<String>, StreamError> {
        thread::sleep(timeout);
        Ok(None)
    }

    fn close(&mut self) {}
}

/// Hands out queued channel feeds, then idle feeds.
#[derive(Default)]
pub struct ChannelConnector {
    feeds: Mutex<VecDeque<Receiver<String>>>,
    pub connects: AtomicUsize,
}

impl ChannelConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue one connection; frames sent on the returned sender arrive on it.
    pub fn queue_feed(&self) -> Sender<String> {
        let (tx, rx) = mpsc::channel();
        self.feeds.lock().push_back(rx);
        tx
    }
}

impl FeedConnector for ChannelConnector {
    fn connect(&self, _symbol: &str, _token: &CancelToken) -> Result<Box<dyn PriceFeed>, StreamError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(match self.feeds.lock().pop_front() {
            Some(rx) => Box::new(ChannelFeed { rx }),
            None => Box::new(IdleFeed),
        })
    }
}

/// Every connection attempt fails.
#[derive(Default)]
pub struct RefusingConnector {
    pub connects: AtomicUsize,
}

impl FeedConnector for RefusingConnector {
    fn connect(&self, _symbol: &str, _token: &CancelToken) -> Result<Box<dyn PriceFeed>, StreamError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Err(StreamError::Connect("connection refused".into()))
    }
}

pub fn tick(symbol: &str, price: f64) -> String {
    format!(r#"{{"id":"{symbol}","price":{price}}}"#)
}
