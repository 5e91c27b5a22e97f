//! Engine facade end to end with a fake provider and channel feeds.

mod common;

use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{d, daily_bars, tick, wait_until, ChannelConnector, FakeProvider};
use quotevault_core::data::{HistoryWindow, SeriesFile};
use quotevault_core::error::FetchError;
use quotevault_core::worker::{StopKind, SupervisorError, WorkerKey, WorkerRole, WorkerState};
use quotevault_core::{EngineConfig, EngineError, MarketDataEngine, MarketEvent};
use tempfile::TempDir;

fn test_config(dir: &TempDir) -> EngineConfig {
    EngineConfig {
        cache_dir: dir.path().to_path_buf(),
        emit_interval_ms: 20,
        persist_interval_ms: 100,
        refresh_period_secs: 60,
        poll_granularity_secs: 1,
        stream_poll_tick_ms: 20,
        cancel_grace_ms: 500,
        ..EngineConfig::default()
    }
}

fn engine(dir: &TempDir, provider: &Arc<FakeProvider>, connector: &Arc<ChannelConnector>) -> MarketDataEngine {
    MarketDataEngine::new(test_config(dir), provider.clone(), connector.clone()).unwrap()
}

/// Wait for the first event matching `pred`, skipping others.
fn expect_event(
    events: &Receiver<MarketEvent>,
    mut pred: impl FnMut(&MarketEvent) -> bool,
) -> MarketEvent {
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let event = events
            .recv_timeout(remaining)
            .expect("expected event did not arrive");
        if pred(&event) {
            return event;
        }
    }
}

fn live_and_refresh(symbol: &str) -> Vec<WorkerKey> {
    vec![WorkerKey::live(symbol), WorkerKey::refresh(symbol)]
}

#[test]
fn load_symbol_fetches_then_streams() {
    let dir = TempDir::new().unwrap();
    let provider = FakeProvider::new();
    let connector = ChannelConnector::new();
    provider.push_window(Ok(daily_bars(d(2024, 1, 1), 10, 100.0)));
    let feed = connector.queue_feed();
    let engine = engine(&dir, &provider, &connector);
    let events = engine.subscribe();

    let key = engine.load_symbol("spy", Some(HistoryWindow::Days(10))).unwrap();
    assert_eq!(key, WorkerKey::fetch("SPY"));

    let updated = expect_event(&events, |e| matches!(e, MarketEvent::SeriesUpdated { .. }));
    assert_eq!(
        updated,
        MarketEvent::SeriesUpdated {
            symbol: "SPY".into(),
            bars: 10,
            changed: true,
        }
    );
    assert!(wait_until(Duration::from_secs(2), || {
        engine.running_workers() == live_and_refresh("SPY")
    }));
    assert_eq!(engine.get_series("SPY").unwrap().len(), 10);

    feed.send(tick("SPY", 123.45)).unwrap();
    let price = expect_event(&events, |e| matches!(e, MarketEvent::Price { .. }));
    assert_eq!(
        price,
        MarketEvent::Price {
            symbol: "SPY".into(),
            price: 123.45,
        }
    );

    let report = engine.shutdown();
    assert!(report.is_clean());
    assert_eq!(report.stopped.first().map(|(k, _)| k.role), Some(WorkerRole::Live));
    assert!(engine.running_workers().is_empty());
}

#[test]
fn replaced_fetch_result_is_dropped_when_it_arrives_late() {
    let dir = TempDir::new().unwrap();
    let provider = FakeProvider::new();
    let connector = ChannelConnector::new();
    // First fetch outlives the stop grace; the replacement answers at once.
    provider.push_slow_window(Duration::from_millis(800), Ok(daily_bars(d(2024, 1, 1), 3, 1.0)));
    provider.push_window(Ok(daily_bars(d(2024, 1, 1), 3, 2.0)));
    let engine = MarketDataEngine::new(
        EngineConfig {
            cancel_grace_ms: 100,
            auto_activate: false,
            ..test_config(&dir)
        },
        provider.clone(),
        connector,
    )
    .unwrap();
    let events = engine.subscribe();
    let key = WorkerKey::fetch("SPY");

    engine.load_symbol("SPY", None).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        provider.window_calls.load(std::sync::atomic::Ordering::SeqCst) == 1
    }));
    engine.load_symbol("SPY", None).unwrap();
    assert!(events.try_iter().any(|e| e
        == MarketEvent::WorkerStopped {
            key: key.clone(),
            kind: StopKind::Forced,
        }));
    assert!(wait_until(Duration::from_secs(2), || {
        engine.worker_state(&key) == WorkerState::Stopped(StopKind::Clean)
    }));
    assert_eq!(engine.get_series("SPY").unwrap().bars[0].close, 2.0);

    // Let the detached fetch finish; its bars must not land.
    thread::sleep(Duration::from_millis(1_000));
    assert_eq!(engine.get_series("SPY").unwrap().bars[0].close, 2.0);
    let on_disk = SeriesFile::new(dir.path()).load("SPY").unwrap();
    assert_eq!(on_disk.bars[0].close, 2.0);
}

#[test]
fn failed_fetch_ends_its_worker_with_the_fetch_error() {
    let dir = TempDir::new().unwrap();
    let provider = FakeProvider::new();
    let connector = ChannelConnector::new();
    provider.push_window(Err(FetchError::SymbolNotFound {
        symbol: "NOPE".into(),
    }));
    let engine = engine(&dir, &provider, &connector);
    let events = engine.subscribe();

    engine.load_symbol("nope", None).unwrap();
    let failed = expect_event(&events, |e| matches!(e, MarketEvent::WorkerFailed { .. }));
    assert_eq!(
        failed,
        MarketEvent::WorkerFailed {
            key: WorkerKey::fetch("NOPE"),
            message: "symbol not found: NOPE".into(),
        }
    );
}

#[test]
fn oversized_window_refreshes_without_overflow() {
    let dir = TempDir::new().unwrap();
    let provider = FakeProvider::new();
    let connector = ChannelConnector::new();
    provider.push_window(Ok(daily_bars(d(2024, 3, 1), 2, 10.0)));
    let engine = engine(&dir, &provider, &connector);

    let window: HistoryWindow = "99999999d".parse().unwrap();
    let outcome = engine.refresh_now("SPY", Some(window)).unwrap();
    assert_eq!(outcome.total, 2);
}

#[test]
fn failed_first_fetch_does_not_activate() {
    let dir = TempDir::new().unwrap();
    let provider = FakeProvider::new();
    let connector = ChannelConnector::new();
    provider.push_window(Err(FetchError::NetworkUnreachable("offline".into())));
    let engine = engine(&dir, &provider, &connector);
    let events = engine.subscribe();

    let key = engine.load_symbol("AAPL", None).unwrap();
    let failed = expect_event(&events, |e| matches!(e, MarketEvent::FetchFailed { .. }));
    assert!(matches!(failed, MarketEvent::FetchFailed { ref symbol, .. } if symbol == "AAPL"));

    assert!(wait_until(Duration::from_secs(2), || {
        engine.worker_state(&key) == WorkerState::Stopped(StopKind::Clean)
    }));
    assert!(engine.running_workers().is_empty());
    assert!(engine.get_series("AAPL").is_none());
    assert_eq!(connector.connects.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[test]
fn stale_cache_is_served_and_streamed() {
    let dir = TempDir::new().unwrap();
    SeriesFile::new(dir.path())
        .write("QQQ", &daily_bars(d(2023, 6, 1), 20, 300.0))
        .unwrap();

    let provider = FakeProvider::new();
    let connector = ChannelConnector::new();
    provider.push_window(Err(FetchError::RateLimited {
        retry_after_secs: 60,
    }));
    let engine = engine(&dir, &provider, &connector);
    let events = engine.subscribe();

    engine.load_symbol("QQQ", None).unwrap();
    expect_event(&events, |e| matches!(e, MarketEvent::FetchFailed { .. }));

    assert!(wait_until(Duration::from_secs(2), || {
        engine.running_workers() == live_and_refresh("QQQ")
    }));
    assert_eq!(engine.get_series("QQQ").unwrap().len(), 20);
    engine.shutdown();
}

#[test]
fn deactivate_stops_live_and_refresh() {
    let dir = TempDir::new().unwrap();
    SeriesFile::new(dir.path())
        .write("IWM", &daily_bars(d(2024, 2, 1), 5, 200.0))
        .unwrap();
    let provider = FakeProvider::new();
    let connector = ChannelConnector::new();
    let engine = engine(&dir, &provider, &connector);

    engine.activate("iwm").unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        engine.worker_state(&WorkerKey::live("IWM")) == WorkerState::Running
    }));

    let stopped = engine.deactivate("IWM");
    assert_eq!(
        stopped,
        vec![
            (WorkerKey::live("IWM"), StopKind::Clean),
            (WorkerKey::refresh("IWM"), StopKind::Clean),
        ]
    );
    assert!(engine.running_workers().is_empty());
    assert!(engine.deactivate("IWM").is_empty());
}

#[test]
fn refresh_now_reports_synchronously() {
    let dir = TempDir::new().unwrap();
    let provider = FakeProvider::new();
    let connector = ChannelConnector::new();
    provider.push_window(Ok(daily_bars(d(2024, 3, 1), 7, 10.0)));
    let engine = engine(&dir, &provider, &connector);
    let events = engine.subscribe();

    let outcome = engine.refresh_now("DIA", Some(HistoryWindow::Weeks(1))).unwrap();
    assert_eq!(outcome.total, 7);
    assert!(outcome.persisted);
    assert!(matches!(events.try_recv(), Ok(MarketEvent::SeriesUpdated { bars: 7, .. })));

    let status = engine.cache_status(&["DIA"]);
    assert_eq!(status[0].bar_count, Some(7));
    assert!(engine.running_workers().is_empty());
}

#[test]
fn start_is_refused_after_shutdown() {
    let dir = TempDir::new().unwrap();
    let provider = FakeProvider::new();
    let connector = ChannelConnector::new();
    let engine = engine(&dir, &provider, &connector);

    assert!(engine.shutdown().stopped.is_empty());
    assert!(matches!(
        engine.activate("SPY"),
        Err(EngineError::Supervisor(SupervisorError::ShuttingDown))
    ));
    assert!(matches!(
        engine.load_symbol("SPY", None),
        Err(EngineError::Supervisor(SupervisorError::ShuttingDown))
    ));
}

#[test]
fn invalid_config_is_rejected() {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig {
        emit_interval_ms: 0,
        ..test_config(&dir)
    };
    let result = MarketDataEngine::new(config, FakeProvider::new(), ChannelConnector::new());
    assert!(matches!(result, Err(EngineError::Config(_))));
}
