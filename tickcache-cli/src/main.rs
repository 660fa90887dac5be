//! tickcache CLI: synchronize, stream, query and manage the local cache.
//!
//! Commands:
//! - `update`: bring the cache in line with the configured universe
//! - `market`: refresh the all-symbols daily snapshot
//! - `tickers`: refresh the ticker reference listing
//! - `query`: print or export a cached series
//! - `stream`: stream quotes, charts and trades for one market session
//! - `cache status` / `cache compact`: inspect and compact the store

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tickcache_core::calendar::TradingCalendar;
use tickcache_core::config::{RateLimit, Settings};
use tickcache_core::data::{
    BlockingHttp, FinvizFetcher, PolygonFetcher, RateLimiter, TdaFetcher, TdaHttpClient,
};
use tickcache_core::domain::{DailyBar, IntradayBar};
use tickcache_core::series::{
    intraday_namespace, query, resample, series_dates, symbol_namespaces, DateKey, MarketSnapshot,
    ReferenceTable, DAILY_NAMESPACE, MARKET_KEY, REFERENCE_KEY,
};
use tickcache_core::store::{join_key, Store};
use tickcache_core::timeslot::{Period, SESSION_MINUTES};
use tickcache_sync::stream::TdaStreamClient;
use tickcache_sync::{
    desired_symbols, CacheSynchronizer, StdoutProgress, StreamSession, SyncOptions, Upstreams,
};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tickcache", about = "tickcache: local market data cache")]
struct Cli {
    /// Settings file. Missing file means defaults.
    #[arg(long, global = true, default_value = "tickcache.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Synchronize cached symbols with the desired universe.
    Update {
        /// Symbols to keep cached. Defaults to `universe.symbols`.
        #[arg(long, num_args = 1..)]
        symbols: Vec<String>,

        /// Also keep the top N symbols by volume from the market snapshot.
        #[arg(long)]
        top: Option<usize>,

        /// Only refresh daily bars and ticker entries.
        #[arg(long, default_value_t = false)]
        skip_intraday: bool,
    },
    /// Refresh the all-symbols daily snapshot.
    Market {
        /// Report staleness instead of fetching a long gap.
        #[arg(long, default_value_t = false)]
        quick_check: bool,

        /// Fill sessions missing from inside the snapshot.
        #[arg(long, default_value_t = false)]
        backfill: bool,
    },
    /// Refresh the ticker reference listing.
    Tickers,
    /// Print a cached series, or write it to CSV.
    Query {
        symbol: String,

        /// Bar period in minutes; omit for daily bars.
        #[arg(long)]
        period: Option<u32>,

        /// First date: YYYY-MM-DD or a session offset.
        #[arg(long, allow_hyphen_values = true)]
        from: Option<String>,

        /// Last date: YYYY-MM-DD or a session offset (-1 is the last session).
        #[arg(long, allow_hyphen_values = true)]
        to: Option<String>,

        /// Write rows to this CSV file instead of stdout.
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Stream one market session into the store.
    Stream {
        /// Symbols to stream. Defaults to `stream.symbols`.
        #[arg(long, num_args = 1..)]
        symbols: Vec<String>,

        /// Request delayed quotes.
        #[arg(long, default_value_t = false)]
        delayed: bool,

        /// Stop after this many minutes.
        #[arg(long)]
        minutes: Option<u64>,
    },
    /// Cache management commands.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Report store size and per-namespace object counts.
    Status,
    /// Checkpoint and rebuild the store file.
    Compact,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(Some(cli.config.as_path()))
        .with_context(|| format!("loading settings from {}", cli.config.display()))?;

    match cli.command {
        Commands::Update {
            symbols,
            top,
            skip_intraday,
        } => run_update(&settings, symbols, top, skip_intraday),
        Commands::Market {
            quick_check,
            backfill,
        } => run_market(&settings, quick_check, backfill),
        Commands::Tickers => run_tickers(&settings),
        Commands::Query {
            symbol,
            period,
            from,
            to,
            csv,
        } => run_query(&settings, &symbol, period, from, to, csv.as_deref()),
        Commands::Stream {
            symbols,
            delayed,
            minutes,
        } => run_stream(&settings, symbols, delayed, minutes),
        Commands::Cache { action } => match action {
            CacheAction::Status => run_cache_status(&settings),
            CacheAction::Compact => run_cache_compact(&settings),
        },
    }
}

fn open_store(settings: &Settings) -> Result<Arc<Store>> {
    let store = Store::open(&settings.store_path)
        .with_context(|| format!("opening store at {}", settings.store_path.display()))?;
    Ok(Arc::new(store))
}

/// Live upstream adapters sharing one store for their limiters.
struct Live {
    tda: TdaFetcher,
    polygon: PolygonFetcher,
    finviz: FinvizFetcher,
}

impl Live {
    fn connect(store: &Arc<Store>, settings: &Settings, calendar: &TradingCalendar) -> Result<Self> {
        let limits = &settings.rate_limits;
        let limiter = |name: &str, limit: &RateLimit| RateLimiter::from_limit(store.clone(), name, limit, settings.backoff);
        let http = Arc::new(BlockingHttp::new()?);

        let tda = TdaFetcher::new(
            Arc::new(TdaHttpClient::from_env()?),
            limiter("tda", &limits.tda)?,
            calendar.clone(),
            limits.tda.retries,
        );
        let polygon = PolygonFetcher::from_env(
            http.clone(),
            limiter("polygon", &limits.polygon)?,
            calendar.clone(),
            limits.polygon.retries,
        )?;
        let finviz = FinvizFetcher::new(http, limiter("finviz", &limits.finviz)?, limits.finviz.retries);
        Ok(Self {
            tda,
            polygon,
            finviz,
        })
    }

    fn upstreams(&self) -> Upstreams<'_> {
        Upstreams {
            tda: &self.tda,
            polygon: &self.polygon,
            finviz: &self.finviz,
        }
    }
}

fn run_update(settings: &Settings, symbols: Vec<String>, top: Option<usize>, skip_intraday: bool) -> Result<()> {
    let store = open_store(settings)?;
    let calendar = TradingCalendar::new();
    let live = Live::connect(&store, settings, &calendar)?;

    let configured = if symbols.is_empty() {
        settings.universe.symbols.clone()
    } else {
        symbols
    };
    let top_n = top.unwrap_or(if configured.is_empty() {
        settings.universe.top_n
    } else {
        0
    });

    let snapshot = MarketSnapshot::new(&store, &live.polygon);
    if top_n > 0 {
        let status = snapshot.update(true)?;
        info!(?status, "market snapshot");
    }
    let desired = desired_symbols(&configured, &snapshot.load()?, top_n);
    if desired.is_empty() {
        bail!("no symbols to cache: pass --symbols or --top, or set universe.symbols");
    }

    let synchronizer = CacheSynchronizer::new(&store, live.upstreams(), settings.worker_budget).with_options(
        SyncOptions {
            skip_intraday,
            market_quick_check: true,
        },
    );
    let summary = synchronizer.sync(&desired, &StdoutProgress)?;

    if summary.failed > 0 {
        for (symbol, err) in &summary.errors {
            eprintln!("Error for {symbol}: {err}");
        }
        std::process::exit(1);
    }
    Ok(())
}

fn run_market(settings: &Settings, quick_check: bool, backfill: bool) -> Result<()> {
    let store = open_store(settings)?;
    let calendar = TradingCalendar::new();
    let live = Live::connect(&store, settings, &calendar)?;
    let snapshot = MarketSnapshot::new(&store, &live.polygon);

    let status = if backfill {
        snapshot.backfill()?
    } else {
        snapshot.update(quick_check)?
    };
    let dates = snapshot.dates()?;
    println!("Market snapshot: {status:?}");
    match (dates.first(), dates.last()) {
        (Some(first), Some(last)) => println!("Sessions: {} ({first} to {last})", dates.len()),
        _ => println!("Sessions: 0"),
    }
    Ok(())
}

fn run_tickers(settings: &Settings) -> Result<()> {
    let store = open_store(settings)?;
    let calendar = TradingCalendar::new();
    let live = Live::connect(&store, settings, &calendar)?;
    match ReferenceTable::new(&store).refresh(&live.polygon)? {
        Some(count) => println!("Ticker reference: {count} tickers"),
        None => println!("Ticker reference unchanged (upstream returned nothing)"),
    }
    Ok(())
}

fn parse_key(raw: Option<String>) -> Result<Option<DateKey>> {
    Ok(raw.as_deref().map(str::parse).transpose()?)
}

fn run_query(
    settings: &Settings,
    symbol: &str,
    period: Option<u32>,
    from: Option<String>,
    to: Option<String>,
    csv_path: Option<&Path>,
) -> Result<()> {
    let store = open_store(settings)?;
    let calendar = TradingCalendar::new();
    let symbol = symbol.trim().to_ascii_uppercase();
    let (from, to) = (parse_key(from)?, parse_key(to)?);

    match period {
        None => {
            let rows: Vec<DailyBar> = store.get_table(&join_key(DAILY_NAMESPACE, &symbol))?.unwrap_or_default();
            let dates = series_dates(&rows);
            let Some(rows) = query::select(&rows, |b| b.date, &dates, &calendar, from.as_ref(), to.as_ref())?
            else {
                println!("No daily bars cached for {symbol} in that range");
                return Ok(());
            };
            emit(&rows, csv_path, |b| {
                vec![
                    b.date.to_string(),
                    b.open.to_string(),
                    b.high.to_string(),
                    b.low.to_string(),
                    b.close.to_string(),
                    b.volume.to_string(),
                    b.twap.to_string(),
                ]
            }, &["date", "open", "high", "low", "close", "volume", "twap"])
        }
        Some(minutes) => {
            if minutes == 0 || minutes > SESSION_MINUTES {
                bail!("--period must be between 1 and {SESSION_MINUTES} minutes, got {minutes}");
            }
            let source = if minutes % 5 == 0 { Period::Five } else { Period::One };
            let stored: Vec<IntradayBar> = store
                .get_table(&join_key(&intraday_namespace(source), &symbol))?
                .unwrap_or_default();
            let rows = if minutes == source.minutes() {
                stored
            } else {
                resample(&stored, minutes)
            };
            let dates = series_dates(&rows);
            let Some(rows) = query::select(&rows, |b| b.date, &dates, &calendar, from.as_ref(), to.as_ref())?
            else {
                println!("No {minutes}-minute bars cached for {symbol} in that range");
                return Ok(());
            };
            emit(&rows, csv_path, |b| {
                vec![
                    b.timestamp.to_rfc3339(),
                    b.timeslot.to_string(),
                    b.segment.as_str().to_string(),
                    b.open.to_string(),
                    b.high.to_string(),
                    b.low.to_string(),
                    b.close.to_string(),
                    b.volume.to_string(),
                    b.twap.to_string(),
                    b.filled.to_string(),
                ]
            }, &[
                "timestamp", "timeslot", "segment", "open", "high", "low", "close", "volume", "twap", "filled",
            ])
        }
    }
}

fn emit<R>(rows: &[R], csv_path: Option<&Path>, fields: impl Fn(&R) -> Vec<String>, header: &[&str]) -> Result<()> {
    match csv_path {
        Some(path) => {
            let mut writer = csv::Writer::from_path(path).with_context(|| format!("creating {}", path.display()))?;
            writer.write_record(header)?;
            for row in rows {
                writer.write_record(fields(row))?;
            }
            writer.flush()?;
            println!("Wrote {} rows to {}", rows.len(), path.display());
        }
        None => {
            println!("{}", header.join("\t"));
            for row in rows {
                println!("{}", fields(row).join("\t"));
            }
        }
    }
    Ok(())
}

fn run_stream(settings: &Settings, symbols: Vec<String>, delayed: bool, minutes: Option<u64>) -> Result<()> {
    let store = open_store(settings)?;
    let mut stream = settings.stream.clone();
    if !symbols.is_empty() {
        stream.symbols = symbols;
    }
    if delayed {
        stream.realtime = false;
    }

    let cancel = CancellationToken::new();
    watch_ctrl_c(cancel.clone())?;

    let session = StreamSession::new(store, TradingCalendar::new(), stream);
    let client = TdaStreamClient::from_env()?;
    let limit = minutes.map(|m| Duration::from_secs(m * 60));
    let report = session.run(client, limit, cancel)?;

    if !report.ran {
        println!("Market is closed; nothing streamed.");
        return Ok(());
    }
    println!(
        "Streamed {} events for {} symbols ({} chart flushes)",
        report.events, report.symbols, report.flushes
    );
    Ok(())
}

/// Cancel `token` on Ctrl-C from a detached signal thread.
fn watch_ctrl_c(token: CancellationToken) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    std::thread::Builder::new()
        .name("tickcache-signal".into())
        .spawn(move || {
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received, stopping stream");
                    token.cancel();
                }
            })
        })?;
    Ok(())
}

fn run_cache_status(settings: &Settings) -> Result<()> {
    if !settings.store_path.exists() {
        println!("Store does not exist: {}", settings.store_path.display());
        return Ok(());
    }
    let store = open_store(settings)?;

    println!("Store: {}", settings.store_path.display());
    println!("Total size: {}", format_size(store.size_on_disk()));
    println!();
    println!("{:<20} {:>8} {:>12} {:>10}", "Namespace", "Objects", "Rows", "Size");
    println!("{}", "-".repeat(53));
    for namespace in symbol_namespaces() {
        let metas = store.list_meta(&namespace)?;
        let rows: u64 = metas.iter().map(|m| m.rows).sum();
        let size: u64 = metas.iter().map(|m| m.size).sum();
        println!("{:<20} {:>8} {:>12} {:>10}", namespace, metas.len(), rows, format_size(size));
    }
    for key in [MARKET_KEY, REFERENCE_KEY] {
        match store.meta(key)? {
            Some(meta) => println!(
                "{:<20} {:>8} {:>12} {:>10}",
                key,
                1,
                meta.rows,
                format_size(meta.size)
            ),
            None => println!("{:<20} {:>8} {:>12} {:>10}", key, 0, 0, "-"),
        }
    }
    Ok(())
}

fn run_cache_compact(settings: &Settings) -> Result<()> {
    let store = open_store(settings)?;
    let before = store.size_on_disk();
    store.compact()?;
    let after = store.size_on_disk();
    println!("Compacted: {} -> {}", format_size(before), format_size(after));
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
