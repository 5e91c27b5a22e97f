//! Periodic snapshot refresher.
//!
//! Every `period` the refresher pulls the current session aggregated into one
//! daily bar and merges it into the store, filling in the open/high/low/volume
//! that live folds leave empty. Remote failures are reported and the loop
//! carries on; only cancellation ends it.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::data::SeriesStore;
use crate::domain::MergeStats;
use crate::notify::{MarketEvent, Notifier};
use crate::worker::CancelToken;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefreshConfig {
    pub period: Duration,
    /// Longest uninterrupted sleep between cancellation checks.
    pub poll_granularity: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(300),
            poll_granularity: Duration::from_secs(5),
        }
    }
}

/// What one refresh tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// No cached series yet (or the provider is refusing requests).
    Skipped,
    Merged(MergeStats),
    Failed(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshStats {
    pub ticks: u64,
    pub merged: u64,
    pub failed: u64,
}

pub struct SnapshotRefresher {
    symbol: String,
    store: Arc<SeriesStore>,
    notifier: Notifier,
    config: RefreshConfig,
}

impl SnapshotRefresher {
    pub fn new(
        symbol: impl Into<String>,
        store: Arc<SeriesStore>,
        notifier: Notifier,
        config: RefreshConfig,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            store,
            notifier,
            config,
        }
    }

    /// Tick immediately, then every `period` until cancelled.
    pub fn run(&self, token: &CancelToken) -> RefreshStats {
        let mut stats = RefreshStats::default();
        info!(symbol = %self.symbol, period_secs = self.config.period.as_secs(), "snapshot refresher started");

        while !token.is_cancelled() {
            stats.ticks += 1;
            match self.tick() {
                TickOutcome::Merged(m) if m.changed() => stats.merged += 1,
                TickOutcome::Failed(_) => stats.failed += 1,
                _ => {}
            }
            if token.sleep_sliced(self.config.period, self.config.poll_granularity) {
                break;
            }
        }

        info!(symbol = %self.symbol, ticks = stats.ticks, "snapshot refresher stopped");
        stats
    }

    pub fn tick(&self) -> TickOutcome {
        if !self.store.has_data(&self.symbol) {
            debug!(symbol = %self.symbol, "no cached series, skipping snapshot");
            return TickOutcome::Skipped;
        }
        if !self.store.provider().is_available() {
            debug!(symbol = %self.symbol, "provider unavailable, skipping snapshot");
            return TickOutcome::Skipped;
        }

        let bar = match self.store.provider().fetch_session_bar(&self.symbol) {
            Ok(bar) => bar,
            Err(e) => return self.fail(e.to_string()),
        };

        match self.store.merge_bar(&self.symbol, bar) {
            Ok(stats) => {
                debug!(
                    symbol = %self.symbol,
                    inserted = stats.inserted,
                    replaced = stats.replaced,
                    "snapshot merged"
                );
                TickOutcome::Merged(stats)
            }
            Err(e) => self.fail(e.to_string()),
        }
    }

    fn fail(&self, message: String) -> TickOutcome {
        warn!(symbol = %self.symbol, error = %message, "snapshot refresh failed");
        self.notifier.send(MarketEvent::RefreshFailed {
            symbol: self.symbol.clone(),
            message: message.clone(),
        });
        TickOutcome::Failed(message)
    }
}
