use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_appender::rolling;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use portwatch::audit::{AuditSink, PgAuditSink};
use portwatch::config::AppConfig;
use portwatch::delivery::telegram::TelegramTransport;
use portwatch::delivery::DeliveryQueue;
use portwatch::monitor::benchmark::BenchmarkMonitor;
use portwatch::monitor::probe::TcpProber;
use portwatch::monitor::scheduler::{Scheduler, SchedulerConfig};
use portwatch::store::postgres::PgStore;
use portwatch::store::TargetStore;

#[derive(Parser, Debug)]
#[command(author, version, about = "TCP endpoint monitoring daemon", long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "portwatch.toml")]
    config: PathBuf,
}

fn init_logging() {
    // Log to a file: JSON format, daily rotation
    let file_appender = rolling::daily("logs", "portwatchd.log");
    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .json();

    // Log to stdout: human-readable format
    let stdout_layer = fmt::layer().with_writer(std::io::stdout);

    // Default to `info` level if RUST_LOG is not set.
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx::query=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init_logging();

    let config = AppConfig::load(&args.config)?;
    if config.database_url.is_empty() {
        error!("no database URL configured (portwatch.toml or DATABASE_URL)");
        return Err("missing database_url".into());
    }
    if config.telegram_token.is_empty() {
        error!("no bot token configured (portwatch.toml or TELEGRAM_TOKEN)");
        return Err("missing telegram_token".into());
    }

    info!(config_path = %args.config.display(), "starting portwatchd");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;
    let store = Arc::new(PgStore::new(pool.clone(), config.monitor.min_interval_seconds));
    store.init_schema().await?;
    info!("database schema ready");

    let audit: Arc<dyn AuditSink> = Arc::new(PgAuditSink::new(pool));
    let transport = Arc::new(TelegramTransport::new(config.telegram_token.clone()));
    let queue = DeliveryQueue::new(config.delivery.queue_config(), transport);
    queue.start();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = Scheduler::new(
        Arc::clone(&store) as Arc<dyn TargetStore>,
        Arc::new(TcpProber),
        queue.clone(),
        Arc::clone(&audit),
        SchedulerConfig {
            tick: config.monitor.tick(),
            probe_timeout: config.monitor.probe_timeout(),
            max_concurrent_probes: config.monitor.max_concurrent_probes,
        },
    );
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_rx.clone()));

    let benchmark = BenchmarkMonitor::new(
        config.benchmark.clone(),
        queue.clone(),
        Arc::clone(&audit),
        config.admin_chat_ids.clone(),
    );
    let benchmark_handle = tokio::spawn(benchmark.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, draining");

    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(Duration::from_secs(5), scheduler_handle)
        .await
        .is_err()
    {
        error!("scheduler did not stop within 5s");
    }
    let _ = tokio::time::timeout(Duration::from_secs(5), benchmark_handle).await;
    queue.shutdown(Duration::from_secs(10)).await;

    info!("portwatchd stopped");
    Ok(())
}
