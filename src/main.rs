//! Bitget step-grid market maker: buy ladder below the market, paired sell
//! one step above every buy fill, all order traffic batched over the private
//! WebSocket.
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod error;
mod exchange;
mod grid;

use config::AppConfig;
use exchange::{connect, BitgetAuth, ChannelConfig, CommandQueue, OutboundSink};
use grid::{GridEngine, GridParams, GridRunner, OrderLedger, RunnerSettings};

const EVENT_CAPACITY: usize = 1024;
const FIRST_PRICE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "bitget_grid", about = "Step grid market maker for Bitget spot")]
struct Args {
    /// TOML config file; defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured symbol
    #[arg(short, long)]
    symbol: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let mut cfg = AppConfig::load(args.config.as_deref())?;
    if let Some(symbol) = args.symbol {
        cfg.symbol = symbol;
    }
    cfg.validate()?;

    info!("═══════════════════════════════════════════════════════════════");
    info!(
        "[BOT] {} grid: {} levels, step {}, {} USDT per order",
        cfg.symbol, cfg.max_orders, cfg.price_step, cfg.order_amount_usdt
    );
    info!("═══════════════════════════════════════════════════════════════");

    // ═══ CHANNELS ═══
    let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);

    let public = connect(
        ChannelConfig::public(
            &cfg.ws_endpoints.public,
            &cfg.inst_type,
            &cfg.symbol,
            cfg.transport.clone(),
        ),
        events_tx.clone(),
    )
    .await
    .context("public channel")?;

    let private = Arc::new(
        connect(
            ChannelConfig::private(
                &cfg.ws_endpoints.private,
                &cfg.inst_type,
                &cfg.symbol,
                BitgetAuth::from_credentials(&cfg.credentials),
                cfg.transport.clone(),
            ),
            events_tx,
        )
        .await
        .context("private channel")?,
    );

    // ═══ ORDER PIPELINE ═══
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let queue = Arc::new(CommandQueue::new(cfg.batch.max_batch_size));
    let sink: Arc<dyn OutboundSink> = private.clone();
    let flusher = queue.spawn_flusher(sink, cfg.batch_interval(), shutdown_rx.clone());

    let params = GridParams::from_config(&cfg);
    let ledger = OrderLedger::new(
        params,
        &cfg.inst_type,
        &cfg.symbol,
        queue.clone(),
        Duration::from_secs(cfg.strategy.processed_retention_secs),
    );
    let engine = GridEngine::new(params, ledger).into_shared();

    // ═══ FIRST LADDER ═══
    let mut price_rx = public.watch_price();
    let first = tokio::time::timeout(FIRST_PRICE_TIMEOUT, price_rx.wait_for(|p| p.is_some()))
        .await
        .map(|r| r.map(|p| *p));
    match first {
        Ok(Ok(price)) => {
            match engine.lock().await.initial_placement(price) {
                Ok(n) => info!("[BOT] Initial ladder queued: {} buys", n),
                Err(e) => warn!("[BOT] Initial placement deferred: {}", e),
            }
        }
        Ok(Err(_)) => warn!("[BOT] Price feed closed before first tick"),
        Err(_) => warn!(
            "[BOT] No price after {}s, strategy will place once one arrives",
            FIRST_PRICE_TIMEOUT.as_secs()
        ),
    }

    let runner = GridRunner::new(
        engine.clone(),
        public.watch_price(),
        RunnerSettings::from_config(&cfg.strategy),
    )
    .spawn(events_rx, shutdown_rx);

    // ═══ SHUTDOWN ═══
    tokio::signal::ctrl_c().await.context("ctrl-c handler")?;
    info!("[BOT] Shutting down...");
    let _ = shutdown_tx.send(true);

    if let Err(e) = runner.await {
        error!("[BOT] Strategy task failed: {}", e);
    }
    if let Err(e) = flusher.await {
        error!("[BOT] Flusher task failed: {}", e);
    }

    let status = engine.lock().await.status(public.latest_price());
    info!("[BOT] Final: {}", status);
    if !queue.is_empty() {
        warn!("[BOT] {} commands were never sent", queue.len());
    }

    private.disconnect().await;
    public.disconnect().await;
    info!("[BOT] Stopped");
    Ok(())
}
