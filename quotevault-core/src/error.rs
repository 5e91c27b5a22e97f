//! Error taxonomy.
//!
//! Row- and tick-level problems (`ParseError`) are absorbed where they occur.
//! Fetch and persist failures are non-fatal and leave the cached series alone.
//! Stream failures travel up to the supervisor, which owns restart policy.

use std::path::PathBuf;

use chrono::NaiveDate;
use thiserror::Error;

/// Bulk or snapshot source returned nothing usable.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("no data returned for '{symbol}'")]
    Empty { symbol: String },

    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("rate limited by provider (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),

    #[error("authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("symbol not found: {symbol}")]
    SymbolNotFound { symbol: String },

    #[error("hard stop: data provider has blocked requests (circuit breaker tripped)")]
    CircuitBreakerTripped,

    #[error("HTTP {status} for '{symbol}'")]
    Http { status: u16, symbol: String },

    #[error("http client setup failed: {0}")]
    Client(String),

    #[error("fetch for '{symbol}' was cancelled, result dropped")]
    Cancelled { symbol: String },
}

/// A single row or tick that could not be turned into data.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("row has no date")]
    MissingDate,

    #[error("unparsable date '{0}'")]
    InvalidDate(String),

    #[error("row for {date} has no close")]
    MissingClose { date: NaiveDate },

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("invalid price: {0}")]
    InvalidPrice(String),
}

/// The live price connection failed or was closed.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("invalid stream url '{0}'")]
    InvalidUrl(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("websocket handshake failed: {0}")]
    Handshake(String),

    #[error("connection closed by peer")]
    ClosedByPeer,

    #[error("stream protocol error: {0}")]
    Protocol(String),
}

/// Writing or reading the on-disk series failed.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parquet encode failed: {0}")]
    Encode(String),

    #[error("cache file unreadable: {0}")]
    Decode(String),

    #[error("metadata error: {0}")]
    Meta(String),
}

impl PersistError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failure returned by a supervised worker body.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("worker panicked: {0}")]
    Panicked(String),
}

impl WorkerError {
    /// Connection-level failures are worth another attempt; everything else is final.
    pub fn is_restartable(&self) -> bool {
        matches!(self, WorkerError::Stream(_))
    }
}

/// Errors surfaced by the engine facade.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Supervisor(#[from] crate::worker::SupervisorError),
}

impl EngineError {
    /// Short status line for a UI; never exposes internal detail.
    pub fn user_message(&self) -> String {
        match self {
            EngineError::Config(_) => "Configuration problem, check settings".into(),
            EngineError::Fetch(FetchError::Empty { symbol })
            | EngineError::Fetch(FetchError::SymbolNotFound { symbol }) => {
                format!("No data found for {symbol}")
            }
            EngineError::Fetch(FetchError::RateLimited { .. })
            | EngineError::Fetch(FetchError::CircuitBreakerTripped) => {
                "Data provider is throttling requests, showing cached data".into()
            }
            EngineError::Fetch(_) => "Could not reach data provider, showing cached data".into(),
            EngineError::Supervisor(_) => "Background task could not be started".into(),
        }
    }
}
