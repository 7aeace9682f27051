//! # fb-runner
//!
//! Runs a brokerage session against the paper broker.
//!
//! Loads a JSON configuration file, logs in, activates the configured
//! account, subscribes the configured instruments and logs quotes, fills and
//! session events until Ctrl+C. The paper broker is fed a synthetic price
//! path so the whole pipeline can be watched end to end.
//!
//! # Usage
//!
//! ```bash
//! fb-runner config/paper.json --log-level info
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use fb_core::logging::LogOptions;
use fb_core::types::{FillEvent, Quote};
use fb_md::QuoteHandler;
use fb_paper::{PaperBroker, paper_quote, paper_timestamp};
use fb_td::{FillHandler, FillOutcome, SessionEvent, TradingSession};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Brokerage session runner (paper venue).
#[derive(Parser)]
#[command(name = "fb-runner", about = "Brokerage session runner (paper venue)")]
struct Cli {
    /// Configuration file path (JSON).
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Optional log directory for file output.
    #[arg(long)]
    log_dir: Option<String>,

    /// Write file logs as JSON lines.
    #[arg(long)]
    json_logs: bool,

    /// Interval between synthetic paper quotes, in milliseconds.
    #[arg(long, default_value_t = 500)]
    quote_interval_ms: u64,
}

struct LogQuotes;

#[async_trait]
impl QuoteHandler for LogQuotes {
    async fn on_quote(&self, quote: Quote) {
        info!(
            "quote {} last={} bid={} ask={} ts={}",
            quote.instrument, quote.price, quote.bid, quote.ask, quote.timestamp
        );
    }
}

struct LogFills;

#[async_trait]
impl FillHandler for LogFills {
    async fn on_fill(&self, fill: FillEvent, outcome: FillOutcome) {
        info!("fill {} {} {}@{} -> {outcome:?}", fill.instrument, fill.order_no, fill.filled_qty, fill.filled_price);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration
    let config = fb_core::config::load_config(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    // 2. Initialize logging
    let module_name = config.module_name();
    let log_dir = cli.log_dir.clone().or_else(|| config.log_path());
    let _log_guard = fb_core::logging::init_logging(&LogOptions {
        level: &cli.log_level,
        dir: log_dir.as_deref(),
        file_prefix: &module_name,
        json_file: cli.json_logs,
    });

    info!(
        "{module_name} starting: config={}, {} instrument(s), {} md connection(s)",
        cli.config.display(),
        config.instruments.len(),
        config.marketdata.effective_connections()
    );
    let credentials = config.credentials.clone().unwrap_or_else(PaperBroker::credentials);
    let instruments = config.instruments.clone();

    // 3. Build the session
    let broker = Arc::new(PaperBroker::new());
    let (session, mut events) = TradingSession::new(Arc::clone(&broker), config);
    session.set_quote_handler(Arc::new(LogQuotes));
    session.set_fill_handler(Arc::new(LogFills));

    let event_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Fatal { target, message } => error!("session fatal on {target}: {message}"),
                SessionEvent::Error { message } => warn!("session error: {message}"),
                other => info!("session event: {other:?}"),
            }
        }
    });

    // 4. Log in and pick an account
    let accounts = session.login(credentials).await.context("login failed")?;
    if session.active_account().is_none() {
        let first = accounts.first().context("login returned no accounts")?;
        session.set_active_account(&first.account_no)?;
    }
    info!("trading as account {:?}", session.active_account().map(|a| a.account_no));

    // 5. Subscribe
    for instrument in &instruments {
        match session.subscribe_realtime_trades(instrument).await {
            Ok(outcome) => info!("{instrument} subscribed on connection {}", outcome.slot()),
            Err(e) => error!("{instrument} subscribe failed: {e}"),
        }
    }

    let (end_of_session, end_rx) = watch::channel(false);
    session.spawn_reconciler(end_rx)?;

    // 6. Feed the paper venue
    let feeder = {
        let broker = Arc::clone(&broker);
        let instruments = instruments.clone();
        let period = Duration::from_millis(cli.quote_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            let mut step: u64 = 0;
            loop {
                ticker.tick().await;
                for (i, instrument) in instruments.iter().enumerate() {
                    let base = 100.0 + 10.0 * i as f64;
                    let offset = ((step + i as u64) % 20) as f64 * 0.05;
                    broker.push_quote(paper_quote(instrument, base + offset, paper_timestamp()));
                }
                step += 1;
            }
        })
    };

    info!("session running, press Ctrl+C to stop");

    // 7. Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    // 8. Stop gracefully
    let _ = end_of_session.send(true);
    feeder.abort();
    session.terminate().await;
    drop(session);
    let _ = tokio::time::timeout(Duration::from_secs(1), event_task).await;

    info!("session stopped, goodbye");
    Ok(())
}
