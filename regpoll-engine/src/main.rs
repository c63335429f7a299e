//! regpoll: polls Modbus devices through one shared connection.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use regpoll_engine::config::EngineConfig;
use regpoll_engine::publisher::SnapshotPublisher;
use regpoll_engine::{ModbusTransport, PollScheduler, TransportSerializer};

/// Modbus register poller (TCP/RTU).
#[derive(Parser, Debug)]
#[command(name = "regpoll")]
#[command(about = "Polls Modbus devices and decodes their registers")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long, default_value = "regpoll.json5")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = EngineConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    let log_config = config
        .logging
        .clone()
        .with_level_override(args.log_level.as_deref());
    regpoll_common::init_tracing(&log_config)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!("Starting regpoll");
    info!("Loaded configuration from {:?}", args.config);

    let registry = config.registry()?;
    info!(
        "Decoders available: {}",
        registry.ids().collect::<Vec<_>>().join(", ")
    );

    let serializer = Arc::new(TransportSerializer::new(ModbusTransport::new(
        config.request_timeout(),
    )));
    let scheduler = Arc::new(PollScheduler::new(registry, serializer));

    if let Some(params) = &config.connection {
        match scheduler.connect(params).await {
            Ok(()) => info!("Connected to {}", params.endpoint()),
            // Devices stay idle until a connection exists.
            Err(e) => error!("Failed to connect to {}: {}", params.endpoint(), e),
        }
    } else {
        warn!("No connection configured, pollers will stay idle");
    }

    for device in &config.devices {
        scheduler
            .add_device(device.clone())
            .with_context(|| format!("Failed to add device '{}'", device.id))?;
    }
    for collector in &config.collectors {
        scheduler
            .add_collector(collector.clone())
            .with_context(|| format!("Failed to add collector '{}'", collector.id))?;
    }

    info!(
        "regpoll running with {} device(s) and {} collector(s)",
        config.devices.len(),
        config.collectors.len()
    );

    let cancel = CancellationToken::new();
    let mut session = None;
    let mut status = None;
    let mut publish_task = None;

    if let Some(publish) = &config.publish {
        info!("Connecting to Zenoh...");
        let zenoh = Arc::new(
            regpoll_common::connect(&publish.zenoh)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to connect to Zenoh: {}", e))?,
        );
        info!("Connected to Zenoh");

        let publisher = SnapshotPublisher::new(zenoh.clone(), &publish.key_prefix, publish.format);
        let status_key = publisher.keys().status();
        let online = serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "devices": config.devices.iter().map(|d| &d.id).collect::<Vec<_>>(),
            "collectors": config.collectors.iter().map(|c| &c.id).collect::<Vec<_>>(),
            "status": "running",
            "timestamp": regpoll_common::current_timestamp_millis(),
        });
        if let Err(e) = publisher.publish(&status_key, &online).await {
            error!("Failed to publish status: {}", e);
        }
        status = Some((publisher.clone(), status_key));

        publish_task = Some(tokio::spawn(publisher.run(
            scheduler.clone(),
            Duration::from_millis(publish.interval_ms),
            cancel.clone(),
        )));
        session = Some(zenoh);
    }

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    cancel.cancel();
    if let Some(task) = publish_task {
        if let Err(e) = task.await {
            warn!("Publisher task failed: {}", e);
        }
    }

    scheduler.shutdown().await;
    if scheduler.is_connected() {
        if let Err(e) = scheduler.disconnect().await {
            warn!("Disconnect failed: {}", e);
        }
    }

    if let Some((publisher, status_key)) = status {
        let offline = serde_json::json!({
            "status": "offline",
            "timestamp": regpoll_common::current_timestamp_millis(),
        });
        let _ = publisher.publish(&status_key, &offline).await;
    }

    if let Some(session) = session {
        session
            .close()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to close Zenoh session: {}", e))?;
    }
    info!("regpoll stopped");

    Ok(())
}
