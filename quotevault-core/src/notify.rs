//! Events published to consumers.
//!
//! Workers never touch consumer state; they push `MarketEvent`s through the
//! `Notifier`, which fans out to every `mpsc` receiver handed out by
//! `subscribe()`. Disconnected receivers are pruned on the next send.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::worker::{StopKind, WorkerKey};

/// Something a consumer may want to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum MarketEvent {
    /// Throttled live price.
    Price { symbol: String, price: f64 },
    /// A bulk refresh merged into the series.
    SeriesUpdated {
        symbol: String,
        bars: usize,
        changed: bool,
    },
    /// A bulk refresh failed; the cached series (if any) is unchanged.
    FetchFailed { symbol: String, message: String },
    /// A snapshot refresh tick failed; the refresher keeps running.
    RefreshFailed { symbol: String, message: String },
    /// A worker ended with an error it will not recover from.
    WorkerFailed { key: WorkerKey, message: String },
    WorkerStopped { key: WorkerKey, kind: StopKind },
}

#[derive(Clone, Default)]
pub struct Notifier {
    subscribers: Arc<Mutex<Vec<Sender<MarketEvent>>>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<MarketEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn send(&self, event: MarketEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
