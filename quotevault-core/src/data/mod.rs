//! Data layer: providers, on-disk series files, and the series store.

pub mod circuit_breaker;
pub mod parquet;
pub mod provider;
pub mod store;
pub mod yahoo;

pub use circuit_breaker::CircuitBreaker;
pub use parquet::{CacheMeta, CacheStatus, LoadSource, LoadedSeries, SeriesFile};
pub use provider::{HistoryProvider, HistoryWindow};
pub use store::{RefreshOutcome, SeriesStore};
pub use yahoo::YahooProvider;
