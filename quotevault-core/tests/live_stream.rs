//! Live quote stream against channel-backed feeds.

mod common;

use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Local;
use common::{d, daily_bars, tick, ChannelConnector, FakeProvider, RefusingConnector};
use quotevault_core::data::{SeriesFile, SeriesStore};
use quotevault_core::error::StreamError;
use quotevault_core::stream::{LiveQuoteStream, LiveStreamConfig};
use quotevault_core::worker::CancelToken;
use quotevault_core::{MarketEvent, Notifier};
use tempfile::TempDir;

fn seeded_store(dir: &TempDir) -> Arc<SeriesStore> {
    let provider = FakeProvider::new();
    let today = Local::now().date_naive();
    provider.push_window(Ok(daily_bars(today - chrono::Duration::days(5), 5, 100.0)));
    let store = Arc::new(SeriesStore::new(SeriesFile::new(dir.path()), provider));
    store.refresh_range("SPY", today, today).unwrap();
    store
}

fn config(emit_ms: u64, persist_ms: u64) -> LiveStreamConfig {
    LiveStreamConfig {
        emit_interval: Duration::from_millis(emit_ms),
        persist_interval: Duration::from_millis(persist_ms),
        poll_tick: Duration::from_millis(50),
    }
}

fn prices(events: &Receiver<MarketEvent>) -> Vec<f64> {
    events
        .try_iter()
        .filter_map(|e| match e {
            MarketEvent::Price { price, .. } => Some(price),
            _ => None,
        })
        .collect()
}

#[test]
fn emits_are_throttled_and_latest_price_arrives() {
    let dir = TempDir::new().unwrap();
    let store = seeded_store(&dir);
    let connector = ChannelConnector::new();
    let tx = connector.queue_feed();
    let notifier = Notifier::new();
    let events = notifier.subscribe();

    let stream = LiveQuoteStream::new("SPY", store, connector, notifier, config(500, 5_000));
    let token = CancelToken::new();
    let runner = {
        let token = token.clone();
        thread::spawn(move || stream.run(&token))
    };

    // 100 ticks inside one second.
    for i in 0..100 {
        tx.send(tick("SPY", 100.0 + i as f64)).unwrap();
        thread::sleep(Duration::from_millis(5));
    }
    // Give the trailing edge time to flush.
    thread::sleep(Duration::from_millis(700));
    token.cancel();
    let stats = runner.join().unwrap().unwrap();

    let emitted = prices(&events);
    assert_eq!(stats.ticks, 100);
    assert!((2..=4).contains(&emitted.len()), "emitted {emitted:?}");
    assert_eq!(emitted.first(), Some(&100.0));
    assert_eq!(emitted.last(), Some(&199.0));
}

#[test]
fn two_second_burst_at_10ms_emits_exactly_four_prices() {
    let dir = TempDir::new().unwrap();
    let store = seeded_store(&dir);
    let connector = ChannelConnector::new();
    let tx = connector.queue_feed();
    let notifier = Notifier::new();
    let events = notifier.subscribe();

    let stream = LiveQuoteStream::new("SPY", store, connector, notifier, config(500, 5_000));
    let token = CancelToken::new();
    let runner = {
        let token = token.clone();
        thread::spawn(move || stream.run(&token))
    };

    // One tick every 10 ms on a fixed schedule, so sleep overshoot can't
    // stretch the burst past two seconds.
    let start = Instant::now();
    for i in 0..200u32 {
        let due = start + Duration::from_millis(u64::from(i) * 10);
        thread::sleep(due.saturating_duration_since(Instant::now()));
        tx.send(tick("SPY", 100.0 + f64::from(i))).unwrap();
    }
    thread::sleep(Duration::from_millis(100));
    token.cancel();
    let stats = runner.join().unwrap().unwrap();

    let emitted = prices(&events);
    assert_eq!(stats.ticks, 200);
    assert_eq!(emitted.len(), 4, "emitted {emitted:?}");
    assert_eq!(emitted[0], 100.0);
    assert!(emitted.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn fold_uses_the_provider_session_date() {
    let dir = TempDir::new().unwrap();
    let provider = FakeProvider::new();
    provider.push_window(Ok(daily_bars(d(2030, 1, 1), 3, 100.0)));
    // The exchange is already on Jan 7 whatever the local clock says.
    provider.set_session_day(d(2030, 1, 7));
    let store = Arc::new(SeriesStore::new(SeriesFile::new(dir.path()), provider));
    store.refresh_range("SPY", d(2030, 1, 1), d(2030, 1, 3)).unwrap();

    let connector = ChannelConnector::new();
    let tx = connector.queue_feed();
    let stream = LiveQuoteStream::new("SPY", store.clone(), connector, Notifier::new(), config(10, 60_000));
    let token = CancelToken::new();
    let runner = {
        let token = token.clone();
        thread::spawn(move || stream.run(&token))
    };
    tx.send(tick("SPY", 105.0)).unwrap();
    thread::sleep(Duration::from_millis(100));
    token.cancel();
    runner.join().unwrap().unwrap();

    let series = store.get_series("SPY").unwrap();
    let dates: Vec<_> = series.bars.iter().map(|b| b.date).collect();
    assert_eq!(dates, vec![d(2030, 1, 1), d(2030, 1, 2), d(2030, 1, 3), d(2030, 1, 7)]);
    assert_eq!(series.bars[3].close, 105.0);
}

#[test]
fn latest_price_is_folded_into_today() {
    let dir = TempDir::new().unwrap();
    let store = seeded_store(&dir);
    let connector = ChannelConnector::new();
    let tx = connector.queue_feed();

    let stream = LiveQuoteStream::new("SPY", store.clone(), connector, Notifier::new(), config(10, 60_000));
    let token = CancelToken::new();
    let runner = {
        let token = token.clone();
        thread::spawn(move || stream.run(&token))
    };

    tx.send(tick("SPY", 321.5)).unwrap();
    tx.send(tick("SPY", 322.0)).unwrap();
    thread::sleep(Duration::from_millis(100));
    token.cancel();
    let stats = runner.join().unwrap().unwrap();

    // First tick persisted on the leading edge, the last one on shutdown.
    assert_eq!(stats.persisted, 2);
    let today = Local::now().date_naive();
    let on_disk = SeriesFile::new(dir.path()).load("SPY").unwrap();
    let bar = on_disk.bars.iter().find(|b| b.date == today).unwrap();
    assert_eq!(bar.close, 322.0);
    assert!(!bar.is_complete());
    assert_eq!(store.get_series("SPY").unwrap().len(), 6);
}

#[test]
fn malformed_and_foreign_frames_are_dropped() {
    let dir = TempDir::new().unwrap();
    let store = seeded_store(&dir);
    let connector = ChannelConnector::new();
    let tx = connector.queue_feed();
    let notifier = Notifier::new();
    let events = notifier.subscribe();

    let stream = LiveQuoteStream::new("SPY", store, connector, notifier, config(10, 60_000));
    let token = CancelToken::new();
    let runner = {
        let token = token.clone();
        thread::spawn(move || stream.run(&token))
    };

    tx.send("garbage".into()).unwrap();
    tx.send(tick("QQQ", 400.0)).unwrap();
    tx.send(r#"{"id":"SPY","price":"NaN"}"#.into()).unwrap();
    tx.send(tick("SPY", 101.0)).unwrap();
    thread::sleep(Duration::from_millis(100));
    token.cancel();
    let stats = runner.join().unwrap().unwrap();

    assert_eq!(stats.ticks, 1);
    assert_eq!(stats.dropped, 2);
    assert_eq!(prices(&events), vec![101.0]);
}

#[test]
fn cancel_is_observed_within_a_poll_tick() {
    let dir = TempDir::new().unwrap();
    let store = seeded_store(&dir);
    let connector = ChannelConnector::new();
    let _tx = connector.queue_feed();

    let stream = LiveQuoteStream::new("SPY", store, connector, Notifier::new(), config(500, 5_000));
    let token = CancelToken::new();
    let runner = {
        let token = token.clone();
        thread::spawn(move || stream.run(&token))
    };
    thread::sleep(Duration::from_millis(100));

    let start = Instant::now();
    token.cancel();
    runner.join().unwrap().unwrap();
    assert!(start.elapsed() < Duration::from_millis(500));
}

#[test]
fn peer_close_is_reported_upward() {
    let dir = TempDir::new().unwrap();
    let store = seeded_store(&dir);
    let connector = ChannelConnector::new();
    drop(connector.queue_feed());

    let stream = LiveQuoteStream::new("SPY", store, connector, Notifier::new(), config(500, 5_000));
    let err = stream.run(&CancelToken::new()).unwrap_err();
    assert!(matches!(err, StreamError::ClosedByPeer));
}

#[test]
fn connect_failure_is_reported_upward() {
    let dir = TempDir::new().unwrap();
    let store = seeded_store(&dir);
    let connector = Arc::new(RefusingConnector::default());

    let stream = LiveQuoteStream::new("SPY", store, connector.clone(), Notifier::new(), config(500, 5_000));
    assert!(matches!(
        stream.run(&CancelToken::new()),
        Err(StreamError::Connect(_))
    ));
    assert_eq!(connector.connects.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[test]
fn fold_is_skipped_without_cached_series() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SeriesStore::new(SeriesFile::new(dir.path()), FakeProvider::new()));
    let connector = ChannelConnector::new();
    let tx = connector.queue_feed();

    let stream = LiveQuoteStream::new("SPY", store.clone(), connector, Notifier::new(), config(10, 10));
    let token = CancelToken::new();
    let runner = {
        let token = token.clone();
        thread::spawn(move || stream.run(&token))
    };
    tx.send(tick("SPY", 10.0)).unwrap();
    thread::sleep(Duration::from_millis(100));
    token.cancel();
    let stats = runner.join().unwrap().unwrap();

    assert_eq!(stats.persisted, 0);
    assert!(store.get_series("SPY").is_none());
    assert!(!dir.path().join("SPY.parquet").exists());
}
