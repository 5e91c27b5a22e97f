//! Domain types: bars, quotes, and per-symbol series.

pub mod bar;
pub mod series;

pub use bar::{normalize_symbol, Bar, Quote, RawRow};
pub use series::{merge, MergeStats, SeriesCache, SeriesSnapshot};
