//! logmill daemon
//!
//! Wires the engine together and runs the schedulers: per-source log
//! collection, bucket rollups after each batch, and the retention sweep.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use logmill::aggregate::{self, Aggregator};
use logmill::collector::{Collector, Scheduler};
use logmill::config::Config;
use logmill::db::dimensions::DimensionStore;
use logmill::db::Database;
use logmill::events::EventBus;
use logmill::geoip::GeoIp;
use logmill::ua::UaParser;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (before any other initialization)
    let _ = dotenvy::dotenv();

    // Initialize logging based on LOG_FORMAT env var
    // Use LOG_FORMAT=gcp for structured GCP Cloud Logging
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "gcp" {
        tracing_subscriber::registry()
            .with(tracing_subscriber::filter::LevelFilter::INFO)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(Level::INFO)
            .init();
    }

    info!("Starting logmill...");

    let config = Config::load()?;
    info!("Configuration loaded");

    let db = Database::new(&config.database).await?;
    db.run_migrations().await?;
    info!("Database initialized");

    let geoip = Arc::new(GeoIp::new(
        &config.geoip.database,
        &config.geoip.asn_database,
    ));
    if geoip.is_available() {
        info!("GeoIP enabled");
    } else {
        info!("GeoIP disabled (database not found)");
    }

    let ua_parser = Arc::new(UaParser::new());
    let dims = Arc::new(DimensionStore::new(db.clone()));
    let aggregator = Arc::new(Aggregator::new(db.clone(), config.collector.top_n));

    // Event bus for collection observability
    let (event_tx, _) = tokio::sync::broadcast::channel(1000);
    let event_bus = EventBus::new(event_tx);
    let mut event_rx = event_bus.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            tracing::debug!(?event, "collection event");
        }
    });

    let collector = Arc::new(
        Collector::new(
            db.clone(),
            dims,
            geoip,
            ua_parser,
            aggregator,
            event_bus,
            config.collector.batch_size,
        )
        .with_max_chunk_bytes(config.collector.max_chunk_mb as i64 * 1024 * 1024),
    );

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    let scheduler = Scheduler::new(
        collector.clone(),
        db.clone(),
        Duration::from_secs(config.collector.tick_secs),
    );
    let scheduler_handle = scheduler.start(shutdown_tx.subscribe());
    info!("Collector scheduler started");

    let retention_handle = aggregate::start_retention_task(db.clone(), shutdown_tx.subscribe());
    info!("Retention task started");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    let _ = shutdown_tx.send(());
    let _ = scheduler_handle.await;
    let _ = retention_handle.await;

    Ok(())
}
