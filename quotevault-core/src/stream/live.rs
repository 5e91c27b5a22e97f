//! Live quote stream for one symbol.
//!
//! Ticks arrive as fast as the feed pushes them. Two independent throttles
//! sit behind the parser:
//! - emit: at most one `MarketEvent::Price` per `emit_interval`, latest wins
//! - persist: at most one fold + write of today's close per `persist_interval`
//!
//! Both flush their trailing value once the feed has been quiet for a full
//! interval, so a burst followed by silence still delivers the final price.
//! Folds are dated on the provider's session calendar, the same one its bulk
//! and snapshot bars use.
//! The stream never restarts itself; connection errors go back to the caller.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use super::feed::{parse_tick, FeedConnector, PriceFeed};
use super::throttle::Throttle;
use crate::data::SeriesStore;
use crate::domain::Quote;
use crate::error::StreamError;
use crate::notify::{MarketEvent, Notifier};
use crate::worker::CancelToken;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiveStreamConfig {
    pub emit_interval: Duration,
    pub persist_interval: Duration,
    /// Upper bound on how long a read blocks before cancellation is re-checked.
    pub poll_tick: Duration,
}

impl Default for LiveStreamConfig {
    fn default() -> Self {
        Self {
            emit_interval: Duration::from_millis(500),
            persist_interval: Duration::from_secs(5),
            poll_tick: Duration::from_millis(250),
        }
    }
}

/// Counters for one run of the stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub ticks: u64,
    pub emitted: u64,
    pub persisted: u64,
    pub dropped: u64,
}

pub struct LiveQuoteStream {
    symbol: String,
    store: Arc<SeriesStore>,
    connector: Arc<dyn FeedConnector>,
    notifier: Notifier,
    config: LiveStreamConfig,
}

impl LiveQuoteStream {
    pub fn new(
        symbol: impl Into<String>,
        store: Arc<SeriesStore>,
        connector: Arc<dyn FeedConnector>,
        notifier: Notifier,
        config: LiveStreamConfig,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            store,
            connector,
            notifier,
            config,
        }
    }

    /// Connect and pump ticks until `token` is cancelled or the feed fails.
    pub fn run(&self, token: &CancelToken) -> Result<StreamStats, StreamError> {
        if token.is_cancelled() {
            return Ok(StreamStats::default());
        }
        let mut feed = self.connector.connect(&self.symbol, token)?;
        info!(symbol = %self.symbol, "live stream connected");

        let result = self.pump(feed.as_mut(), token);
        feed.close();

        match &result {
            Ok(stats) => info!(
                symbol = %self.symbol,
                ticks = stats.ticks,
                emitted = stats.emitted,
                persisted = stats.persisted,
                "live stream stopped"
            ),
            Err(e) => warn!(symbol = %self.symbol, error = %e, "live stream failed"),
        }
        result
    }

    fn pump(&self, feed: &mut dyn PriceFeed, token: &CancelToken) -> Result<StreamStats, StreamError> {
        let mut stats = StreamStats::default();
        let mut emit = Throttle::new(self.config.emit_interval);
        let mut persist = Throttle::new(self.config.persist_interval);

        while !token.is_cancelled() {
            let frame = match feed.next_message(self.config.poll_tick) {
                Ok(frame) => frame,
                // A cancelled token shuts the socket, which surfaces as a read error.
                Err(_) if token.is_cancelled() => break,
                Err(e) => return Err(e),
            };

            let now = Instant::now();
            if let Some(text) = frame {
                match parse_tick(&self.symbol, &text) {
                    Ok(Some(price)) => {
                        stats.ticks += 1;
                        trace!(symbol = %self.symbol, price, "tick");
                        let quote = Quote::new(self.symbol.as_str(), price);
                        if let Some(q) = emit.offer(quote.clone(), now) {
                            self.emit(q, &mut stats);
                        }
                        if let Some(q) = persist.offer(quote, now) {
                            self.fold_and_persist(q, &mut stats);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        stats.dropped += 1;
                        debug!(symbol = %self.symbol, error = %e, "dropping frame");
                    }
                }
            }

            if let Some(q) = emit.flush(now) {
                self.emit(q, &mut stats);
            }
            if let Some(q) = persist.flush(now) {
                self.fold_and_persist(q, &mut stats);
            }
        }

        // The last price seen still belongs in today's bar.
        if let Some(q) = persist.take_pending() {
            self.fold_and_persist(q, &mut stats);
        }
        Ok(stats)
    }

    fn emit(&self, quote: Quote, stats: &mut StreamStats) {
        stats.emitted += 1;
        self.notifier.send(MarketEvent::Price {
            symbol: quote.symbol,
            price: quote.price,
        });
    }

    /// Fold into the bar of the trading day the quote arrived on.
    fn fold_and_persist(&self, quote: Quote, stats: &mut StreamStats) {
        let day = self.store.session_date(&self.symbol, quote.received_at);
        if !self.store.fold_price(&self.symbol, quote.price, day) {
            return;
        }
        // Failures are logged by the store and leave the cache dirty.
        if let Ok(true) = self.store.persist(&self.symbol) {
            stats.persisted += 1;
        }
    }
}
