use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use margind::config::Config;
use margind::controller::Controller;
use margind::db::{init_db, HistoryStore};
use margind::error::AppError;
use margind::exchange::{BitfinexExchange, ExchangeAdapter, ExchangeError};
use margind::monitor::TickScheduler;
use margind::notify::{Notifier, NullNotifier, TelegramNotifier};
use margind::stream::BitfinexStream;

/// Simulated cross-margin daemon for Bitfinex derivatives.
#[derive(Parser)]
#[command(name = "margind", version, about)]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long, default_value = "config/margind.toml")]
    config: String,

    /// Force liquidation into dry-run mode regardless of config
    #[arg(long)]
    dry_run: bool,

    /// Log filter, e.g. "info" or "margind=debug"
    #[arg(long, env = "MARGIND_LOG", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cli.log_level))
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("margind failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let config = Arc::new(Config::from_path(&cli.config)?);
    if cli.dry_run {
        info!("running with forced liquidation dry-run");
    }

    let pool = init_db(&config.database.path).await?;
    let history = Arc::new(HistoryStore::new(pool));

    let exchange: Arc<dyn ExchangeAdapter> = Arc::new(BitfinexExchange::new(
        config.bitfinex.base_url.clone(),
        config.bitfinex.api_key.clone(),
        config.bitfinex.api_secret.clone(),
    ));

    let notifier: Arc<dyn Notifier> = if config.telegram.enabled {
        Arc::new(TelegramNotifier::new(config.telegram.clone()))
    } else {
        Arc::new(NullNotifier)
    };

    // Startup preflight: credentials must work before anything is scheduled.
    match preflight(exchange.as_ref()).await {
        Ok((position_count, equity)) => {
            info!(position_count, equity, "exchange preflight passed");
        }
        Err(e) => {
            notifier
                .retry_exhausted_alert("startup preflight", &e.to_string())
                .await;
            return Err(e.into());
        }
    }

    let (event_tx, mut event_rx) = mpsc::channel(256);
    let stream = Arc::new(BitfinexStream::spawn(
        config.bitfinex.ws_url.clone(),
        event_tx,
    ));

    let controller = Arc::new(
        Controller::new(
            Arc::clone(&config),
            Arc::clone(&exchange),
            history,
            Arc::clone(&notifier),
            cli.dry_run,
        )
        .with_subscription_sink(stream),
    );

    // Mailbox drain: streamed events are handled in arrival order, one at a
    // time, behind the controller gate. Shutdown lets an in-flight handler
    // finish; only the wait for the next event is interrupted.
    let drain_shutdown = Arc::new(tokio::sync::Notify::new());
    let drain = tokio::spawn({
        let controller = Arc::clone(&controller);
        let shutdown = Arc::clone(&drain_shutdown);
        async move {
            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    event = event_rx.recv() => match event {
                        Some(event) => controller.handle_stream_event(event).await,
                        None => break,
                    },
                }
            }
        }
    });

    let scheduler = TickScheduler::new(
        Arc::clone(&controller),
        Duration::from_secs(config.monitor.poll_interval_sec),
    );
    scheduler.start();

    notifier
        .send(format!(
            "<b>margind started</b>\nmode: {}\npoll interval: {}s",
            if cli.dry_run { "dry-run" } else { "normal" },
            config.monitor.poll_interval_sec
        ))
        .await;
    info!("margind running");

    wait_for_shutdown().await;
    info!("shutdown signal received");

    scheduler.stop().await;
    drain_shutdown.notify_one();
    let _ = drain.await;
    notifier.send("<b>margind stopped</b>".to_string()).await;
    info!("shutdown complete");
    Ok(())
}

/// Verify credentials and connectivity; returns (position count, equity).
async fn preflight(
    exchange: &dyn ExchangeAdapter,
) -> Result<(usize, f64), ExchangeError> {
    let positions = exchange.list_positions().await?;
    let available = exchange.available_balance().await?;

    let total_margin: margind::Decimal = positions.iter().map(|p| p.margin).sum();
    let equity = (total_margin + available).to_f64_lossy();
    Ok((positions.len(), equity))
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate = match tokio::signal::unix::signal(
            tokio::signal::unix::SignalKind::terminate(),
        ) {
            Ok(signal) => signal,
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            result = ctrl_c => {
                if let Err(e) = result {
                    warn!("ctrl-c handler error: {e}");
                }
            }
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = ctrl_c.await {
            warn!("ctrl-c handler error: {e}");
        }
    }
}
