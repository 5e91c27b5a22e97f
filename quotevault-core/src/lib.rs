//! QuoteVault Core: local market-data cache kept fresh from three sources.
//!
//! This crate contains the ingestion and caching engine behind the desktop app:
//! - Domain types (bars, quotes, per-symbol series with date-keyed merge)
//! - Parquet-backed series store with single-writer merges and snapshot reads
//! - Yahoo Finance history provider with retry and circuit breaker
//! - Live quote stream with emit and persistence throttling
//! - Periodic snapshot refresher
//! - Worker supervisor: one worker per (symbol, role), bounded cancellation
//! - Engine facade tying the above together for UI consumers

pub mod config;
pub mod data;
pub mod domain;
pub mod engine;
pub mod error;
pub mod indicators;
pub mod notify;
pub mod refresh;
pub mod stream;
pub mod worker;

pub use config::EngineConfig;
pub use domain::{Bar, Quote, SeriesCache, SeriesSnapshot};
pub use engine::MarketDataEngine;
pub use error::{EngineError, FetchError, ParseError, PersistError, StreamError, WorkerError};
pub use notify::{MarketEvent, Notifier};
