//! QuoteVault CLI: fetch, inspect and watch the local market-data cache.
//!
//! Commands:
//! - `fetch`: bulk-refresh symbols from Yahoo Finance into the Parquet cache
//! - `show`: print the tail of a cached series with optional SMA/EMA
//! - `watch`: stream live prices for a symbol, folding them into the cache
//! - `cache status`: report cached symbols, date ranges and file sizes

use std::path::{Path, PathBuf};
use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use quotevault_core::data::{HistoryWindow, SeriesFile};
use quotevault_core::{EngineConfig, MarketDataEngine, MarketEvent};

#[derive(Parser)]
#[command(
    name = "quotevault",
    about = "QuoteVault: local market-data cache kept fresh from Yahoo Finance"
)]
struct Cli {
    /// Path to a TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Cache directory (overrides the config file).
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bulk-refresh symbols and merge them into the cache.
    Fetch {
        /// Symbols to fetch (e.g., SPY QQQ AAPL).
        #[arg(required = true)]
        symbols: Vec<String>,

        /// Window to fetch: 5d, 2wk, 6mo, 1y, ytd, max. Defaults to the config value.
        #[arg(long)]
        window: Option<String>,
    },
    /// Print the most recent bars of a cached series.
    Show {
        symbol: String,

        /// Number of bars to print.
        #[arg(long, default_value_t = 10)]
        tail: usize,

        /// Add a simple moving average column.
        #[arg(long)]
        sma: Option<usize>,

        /// Add an exponential moving average column.
        #[arg(long)]
        ema: Option<usize>,
    },
    /// Stream live prices for a symbol.
    Watch {
        symbol: String,

        /// Stop after this many seconds.
        #[arg(long, default_value_t = 60)]
        seconds: u64,

        /// Skip the initial bulk refresh.
        #[arg(long, default_value_t = false)]
        no_fetch: bool,
    },
    /// Cache management commands.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show cached symbols, date ranges, and sizes.
    Status,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(dir) = cli.cache_dir {
        config.cache_dir = dir;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();
    tracing::debug!(cache_dir = %config.cache_dir.display(), "configuration loaded");

    // tungstenite uses rustls, which needs one process-wide crypto provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    match cli.command {
        Commands::Fetch { symbols, window } => run_fetch(config, &symbols, window.as_deref()),
        Commands::Show {
            symbol,
            tail,
            sma,
            ema,
        } => run_show(config, &symbol, tail, sma, ema),
        Commands::Watch {
            symbol,
            seconds,
            no_fetch,
        } => run_watch(config, &symbol, Duration::from_secs(seconds), no_fetch),
        Commands::Cache { action } => match action {
            CacheAction::Status => run_cache_status(&config.cache_dir),
        },
    }
}

fn parse_window(window: Option<&str>) -> Result<Option<HistoryWindow>> {
    window
        .map(|w| w.parse::<HistoryWindow>().map_err(anyhow::Error::msg))
        .transpose()
}

fn run_fetch(config: EngineConfig, symbols: &[String], window: Option<&str>) -> Result<()> {
    let window = parse_window(window)?;
    let engine = MarketDataEngine::with_yahoo(EngineConfig {
        auto_activate: false,
        ..config
    })?;

    let mut failed = 0usize;
    for symbol in symbols {
        match engine.refresh_now(symbol, window) {
            Ok(outcome) => println!(
                "{:<8} fetched {:>5}  new {:>5}  revised {:>5}  total {:>6}{}",
                outcome.symbol,
                outcome.fetched,
                outcome.stats.inserted,
                outcome.stats.replaced,
                outcome.total,
                if outcome.persisted { "" } else { "  (not saved)" }
            ),
            Err(e) => {
                failed += 1;
                eprintln!("Error for {symbol}: {e}");
            }
        }
    }
    engine.shutdown();

    if failed == symbols.len() {
        bail!("all {failed} symbol(s) failed");
    }
    Ok(())
}

fn run_show(
    config: EngineConfig,
    symbol: &str,
    tail: usize,
    sma: Option<usize>,
    ema: Option<usize>,
) -> Result<()> {
    let engine = MarketDataEngine::with_yahoo(config)?;
    let Some(series) = engine.get_series(symbol) else {
        bail!("no cached data for {symbol}; run `quotevault fetch {symbol}` first");
    };

    let sma_values = sma.map(|w| series.sma(w));
    let ema_values = ema.map(|s| series.ema(s));
    let start = series.len().saturating_sub(tail);

    println!("{}: {} bars", series.symbol, series.len());
    print!(
        "{:<12} {:>10} {:>10} {:>10} {:>10} {:>12}",
        "Date", "Open", "High", "Low", "Close", "Volume"
    );
    if let Some(w) = sma {
        print!(" {:>10}", format!("SMA{w}"));
    }
    if let Some(s) = ema {
        print!(" {:>10}", format!("EMA{s}"));
    }
    println!();

    let opt = |v: Option<f64>| v.map_or_else(|| "-".to_string(), |x| format!("{x:.2}"));
    let val = |v: f64| if v.is_nan() { "-".to_string() } else { format!("{v:.2}") };

    for (i, bar) in series.bars.iter().enumerate().skip(start) {
        print!(
            "{:<12} {:>10} {:>10} {:>10} {:>10.2} {:>12}",
            bar.date.to_string(),
            opt(bar.open),
            opt(bar.high),
            opt(bar.low),
            bar.close,
            bar.volume.map_or_else(|| "-".to_string(), |v| v.to_string())
        );
        if let Some(values) = &sma_values {
            print!(" {:>10}", val(values[i]));
        }
        if let Some(values) = &ema_values {
            print!(" {:>10}", val(values[i]));
        }
        println!();
    }
    Ok(())
}

fn run_watch(config: EngineConfig, symbol: &str, duration: Duration, no_fetch: bool) -> Result<()> {
    let engine = MarketDataEngine::with_yahoo(config)?;
    let events = engine.subscribe();

    if no_fetch {
        engine.activate(symbol)?;
    } else {
        engine.load_symbol(symbol, None)?;
    }

    let deadline = Instant::now() + duration;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match events.recv_timeout(remaining) {
            Ok(MarketEvent::Price { symbol, price }) => {
                println!("{} {symbol:<8} {price:>12.4}", chrono::Local::now().format("%H:%M:%S%.3f"));
            }
            Ok(MarketEvent::SeriesUpdated { symbol, bars, .. }) => {
                println!("{symbol}: series updated ({bars} bars)");
            }
            Ok(MarketEvent::FetchFailed { symbol, message }) => {
                eprintln!("{symbol}: fetch failed: {message}");
            }
            Ok(MarketEvent::WorkerFailed { key, message }) => {
                eprintln!("{key}: {message}");
            }
            Ok(_) => {}
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => break,
        }
    }

    let report = engine.shutdown();
    for key in report.forced() {
        eprintln!("WARNING: {key} did not stop in time");
    }
    Ok(())
}

fn run_cache_status(cache_dir: &Path) -> Result<()> {
    if !cache_dir.exists() {
        println!("Cache directory does not exist: {}", cache_dir.display());
        return Ok(());
    }

    let file = SeriesFile::new(cache_dir);
    let symbols = file.cached_symbols();
    if symbols.is_empty() {
        println!("Cache is empty: {}", cache_dir.display());
        return Ok(());
    }

    let refs: Vec<&str> = symbols.iter().map(String::as_str).collect();
    let mut total_size = 0u64;

    println!("Cache: {}", cache_dir.display());
    println!("Symbols: {}", symbols.len());
    println!();
    println!(
        "{:<8} {:<25} {:>8} {:>10}  {}",
        "Symbol", "Date Range", "Bars", "Size", "Updated"
    );
    println!("{}", "-".repeat(75));
    for status in file.status(&refs) {
        let size = std::fs::metadata(file.path(&status.symbol))
            .with_context(|| format!("stat {}", status.symbol))?
            .len();
        total_size += size;
        let range = match (status.start_date, status.end_date) {
            (Some(s), Some(e)) => format!("{s} to {e}"),
            _ => "unknown".to_string(),
        };
        let bars = status.bar_count.map_or_else(|| "-".to_string(), |n| n.to_string());
        let updated = status
            .updated_at
            .map_or_else(|| "-".to_string(), |t| t.format("%Y-%m-%d %H:%M").to_string());
        println!(
            "{:<8} {:<25} {:>8} {:>10}  {}",
            status.symbol,
            range,
            bars,
            format_size(size),
            updated
        );
    }
    println!();
    println!("Total size: {}", format_size(total_size));
    Ok(())
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
