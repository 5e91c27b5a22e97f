//! Engine facade: the one object a UI holds.
//!
//! Wires the store, the supervisor and the worker bodies together:
//! - `load_symbol` runs a bulk refresh on a `Fetch` worker and, once the
//!   symbol has data, activates it
//! - `activate` starts the `Live` stream and `Refresh` loop for a symbol
//! - `get_series` returns a snapshot synchronously; `subscribe` delivers
//!   throttled prices and lifecycle events
//!
//! Cloning the engine is cheap; every clone drives the same workers.

use std::sync::mpsc::Receiver;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::data::{
    CacheStatus, CircuitBreaker, HistoryProvider, HistoryWindow, RefreshOutcome, SeriesFile,
    SeriesStore, YahooProvider,
};
use crate::domain::{normalize_symbol, SeriesSnapshot};
use crate::error::{EngineError, WorkerError};
use crate::notify::{MarketEvent, Notifier};
use crate::refresh::SnapshotRefresher;
use crate::stream::{FeedConnector, LiveQuoteStream, WsFeedConnector};
use crate::worker::{
    ShutdownReport, StopKind, WorkerKey, WorkerRole, WorkerState, WorkerSupervisor,
};

struct EngineInner {
    config: EngineConfig,
    store: Arc<SeriesStore>,
    connector: Arc<dyn FeedConnector>,
    supervisor: WorkerSupervisor,
    notifier: Notifier,
}

#[derive(Clone)]
pub struct MarketDataEngine {
    inner: Arc<EngineInner>,
}

impl MarketDataEngine {
    pub fn new(
        config: EngineConfig,
        provider: Arc<dyn HistoryProvider>,
        connector: Arc<dyn FeedConnector>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let notifier = Notifier::new();
        let store = Arc::new(SeriesStore::new(
            SeriesFile::new(config.cache_dir.clone()),
            provider,
        ));
        let supervisor = WorkerSupervisor::new(config.supervisor(), notifier.clone());
        info!(cache_dir = %config.cache_dir.display(), "engine ready");

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                store,
                connector,
                supervisor,
                notifier,
            }),
        })
    }

    /// Engine backed by Yahoo Finance for history and the configured
    /// WebSocket endpoint for live prices.
    pub fn with_yahoo(config: EngineConfig) -> Result<Self, EngineError> {
        let breaker = Arc::new(CircuitBreaker::default_provider());
        let provider = YahooProvider::new(breaker, config.connect_timeout(), config.http_timeout())?;
        let connector = WsFeedConnector::new(config.stream_url.clone(), config.connect_timeout());
        Self::new(config, Arc::new(provider), Arc::new(connector))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<SeriesStore> {
        &self.inner.store
    }

    /// Bulk-refresh `symbol` in the background. Replaces a fetch already
    /// running for the same symbol; the replaced fetch's result is dropped
    /// even if it arrives late. Results arrive as `SeriesUpdated` or
    /// `FetchFailed`, and a failed fetch also ends its worker with
    /// `WorkerFailed`.
    pub fn load_symbol(
        &self,
        symbol: &str,
        window: Option<HistoryWindow>,
    ) -> Result<WorkerKey, EngineError> {
        let symbol = normalize_symbol(symbol);
        let window = match window {
            Some(w) => w,
            None => self.inner.config.window()?,
        };
        let key = WorkerKey::fetch(&symbol);
        let inner = self.inner.clone();

        self.inner.supervisor.start(key.clone(), move |token| {
            let outcome = inner.store.refresh_window_cancellable(&symbol, window, token);
            if token.is_cancelled() {
                return Ok(());
            }
            inner.report_refresh(&symbol, &outcome);

            // Stale data is still worth streaming onto.
            if inner.config.auto_activate && inner.store.has_data(&symbol) && !token.is_cancelled() {
                if let Err(e) = inner.activate(&symbol) {
                    debug!(symbol, error = %e, "auto-activate skipped");
                }
            }
            outcome.map(|_| ()).map_err(WorkerError::from)
        })?;
        Ok(key)
    }

    /// Bulk-refresh on the calling thread.
    pub fn refresh_now(
        &self,
        symbol: &str,
        window: Option<HistoryWindow>,
    ) -> Result<RefreshOutcome, EngineError> {
        let symbol = normalize_symbol(symbol);
        let window = match window {
            Some(w) => w,
            None => self.inner.config.window()?,
        };
        let outcome = self.inner.store.refresh_window(&symbol, window);
        self.inner.report_refresh(&symbol, &outcome);
        Ok(outcome?)
    }

    /// Start the live stream and snapshot refresher for `symbol`, replacing
    /// any already running.
    pub fn activate(&self, symbol: &str) -> Result<(), EngineError> {
        self.inner.activate(&normalize_symbol(symbol))
    }

    /// Stop the live stream and snapshot refresher for `symbol`.
    pub fn deactivate(&self, symbol: &str) -> Vec<(WorkerKey, StopKind)> {
        let symbol = normalize_symbol(symbol);
        [WorkerKey::live(&symbol), WorkerKey::refresh(&symbol)]
            .into_iter()
            .filter_map(|key| {
                let kind = self.inner.supervisor.cancel(&key)?;
                Some((key, kind))
            })
            .collect()
    }

    pub fn get_series(&self, symbol: &str) -> Option<SeriesSnapshot> {
        self.inner.store.get_series(symbol)
    }

    pub fn subscribe(&self) -> Receiver<MarketEvent> {
        self.inner.notifier.subscribe()
    }

    pub fn worker_state(&self, key: &WorkerKey) -> WorkerState {
        self.inner.supervisor.state(key)
    }

    pub fn running_workers(&self) -> Vec<WorkerKey> {
        self.inner.supervisor.running_keys()
    }

    pub fn cache_status(&self, symbols: &[&str]) -> Vec<CacheStatus> {
        self.inner.store.status(symbols)
    }

    /// Stop all workers, then write any series with unsaved changes.
    pub fn shutdown(&self) -> ShutdownReport {
        let report = self.inner.supervisor.shutdown_all();
        for (symbol, e) in self.inner.store.persist_all_dirty() {
            warn!(symbol, error = %e, "final persist failed");
        }
        report
    }
}

impl EngineInner {
    fn activate(&self, symbol: &str) -> Result<(), EngineError> {
        let stream = LiveQuoteStream::new(
            symbol,
            self.store.clone(),
            self.connector.clone(),
            self.notifier.clone(),
            self.config.live_stream(),
        );
        self.supervisor.start(WorkerKey::new(symbol, WorkerRole::Live), move |token| {
            stream.run(token).map(|_| ()).map_err(WorkerError::from)
        })?;

        let refresher = SnapshotRefresher::new(
            symbol,
            self.store.clone(),
            self.notifier.clone(),
            self.config.refresh(),
        );
        self.supervisor
            .start(WorkerKey::new(symbol, WorkerRole::Refresh), move |token| {
                refresher.run(token);
                Ok(())
            })?;

        info!(symbol, "symbol activated");
        Ok(())
    }

    fn report_refresh<E: std::fmt::Display>(
        &self,
        symbol: &str,
        outcome: &Result<RefreshOutcome, E>,
    ) {
        let event = match outcome {
            Ok(o) => MarketEvent::SeriesUpdated {
                symbol: symbol.to_string(),
                bars: o.total,
                changed: o.stats.changed(),
            },
            Err(e) => MarketEvent::FetchFailed {
                symbol: symbol.to_string(),
                message: e.to_string(),
            },
        };
        self.notifier.send(event);
    }
}
