//! Engine configuration, loaded from TOML.
//!
//! Every field has a default so a partial file (or none at all) works:
//!
//! ```toml
//! cache_dir = "data"
//! default_window = "1y"
//! emit_interval_ms = 500
//!
//! [restart]
//! max_restarts = 5
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::data::HistoryWindow;
use crate::refresh::RefreshConfig;
use crate::stream::LiveStreamConfig;
use crate::worker::{RestartConfig, SupervisorConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cache_dir: PathBuf,
    /// Bulk refresh window, e.g. `6mo`, `1y`, `ytd`.
    pub default_window: String,
    pub emit_interval_ms: u64,
    pub persist_interval_ms: u64,
    pub refresh_period_secs: u64,
    pub poll_granularity_secs: u64,
    pub stream_poll_tick_ms: u64,
    pub cancel_grace_ms: u64,
    pub http_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub stream_url: String,
    /// Start the live stream and refresher once a bulk refresh lands.
    pub auto_activate: bool,
    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    pub log_level: String,
    pub restart: RestartConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("data"),
            default_window: HistoryWindow::default().to_string(),
            emit_interval_ms: 500,
            persist_interval_ms: 5_000,
            refresh_period_secs: 300,
            poll_granularity_secs: 5,
            stream_poll_tick_ms: 250,
            cancel_grace_ms: 2_500,
            http_timeout_secs: 30,
            connect_timeout_secs: 10,
            stream_url: "wss://streamer.finance.yahoo.com/".to_string(),
            auto_activate: true,
            log_level: "info".to_string(),
            restart: RestartConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("emit_interval_ms", self.emit_interval_ms),
            ("persist_interval_ms", self.persist_interval_ms),
            ("refresh_period_secs", self.refresh_period_secs),
            ("poll_granularity_secs", self.poll_granularity_secs),
            ("stream_poll_tick_ms", self.stream_poll_tick_ms),
            ("http_timeout_secs", self.http_timeout_secs),
            ("connect_timeout_secs", self.connect_timeout_secs),
        ];
        for (field, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".into(),
                });
            }
        }
        if self.stream_poll_tick_ms > 1_000 {
            return Err(ConfigError::Invalid {
                field: "stream_poll_tick_ms",
                reason: "must be at most 1000 so cancellation is seen within a second".into(),
            });
        }
        if !self.restart.multiplier.is_finite() || self.restart.multiplier < 1.0 {
            return Err(ConfigError::Invalid {
                field: "restart.multiplier",
                reason: "must be at least 1.0".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.restart.jitter_factor) {
            return Err(ConfigError::Invalid {
                field: "restart.jitter_factor",
                reason: "must be between 0 and 1".into(),
            });
        }
        self.window()?;
        Ok(())
    }

    pub fn window(&self) -> Result<HistoryWindow, ConfigError> {
        self.default_window
            .parse()
            .map_err(|reason| ConfigError::Invalid {
                field: "default_window",
                reason,
            })
    }

    pub fn live_stream(&self) -> LiveStreamConfig {
        LiveStreamConfig {
            emit_interval: Duration::from_millis(self.emit_interval_ms),
            persist_interval: Duration::from_millis(self.persist_interval_ms),
            poll_tick: Duration::from_millis(self.stream_poll_tick_ms),
        }
    }

    pub fn refresh(&self) -> RefreshConfig {
        RefreshConfig {
            period: Duration::from_secs(self.refresh_period_secs),
            poll_granularity: Duration::from_secs(self.poll_granularity_secs),
        }
    }

    pub fn supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            cancel_grace: Duration::from_millis(self.cancel_grace_ms),
            restart: self.restart.clone(),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
