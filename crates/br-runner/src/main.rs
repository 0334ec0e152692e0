//! # br-runner
//!
//! Main entry point for the botrelay hub.
//!
//! Loads a JSON configuration file, builds the configured upstream providers,
//! wires them into the execution service and connection hub, and serves
//! downstream WebSocket connections until Ctrl+C.
//!
//! # Usage
//!
//! ```bash
//! br-runner config.json --log-level info
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use br_core::SubscriptionEventReceiver;
use br_hub::hub::{ConnectionHub, Upstream};
use br_hub::registry::ProviderRegistry;
use br_hub::server::HubServer;
use br_oms::checkpoint::LmdbCheckpoint;
use br_oms::event::OmsEventReceiver;
use br_oms::service::ExecutionService;
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

/// Market data and order relay hub for trading bots.
#[derive(Parser)]
#[command(name = "br-runner", about = "Market data and order relay hub for trading bots")]
struct Cli {
    /// Configuration file path (JSON).
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Optional log directory for file output. Overrides `service.log_path`.
    #[arg(long)]
    log_dir: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration (the log format lives in it)
    let config = br_core::config::load_config(&cli.config)?;

    // 2. Initialize logging
    let log_dir = cli.log_dir.clone().or_else(|| config.service.log_path.clone());
    br_core::logging::init_logging(
        &cli.log_level,
        log_dir.as_deref(),
        &config.module_name(),
        config.service.log_format,
    );
    info!("br-runner starting, config={}, log_level={}", cli.config.display(), cli.log_level);

    // 3. Build providers
    let registry = ProviderRegistry::with_builtin();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let market_data = match &config.market_data {
        Some(cfg) => {
            let source = registry.build_market_data(cfg, event_tx.clone())?;
            info!("market data provider '{}' created", source.name());
            Some(source)
        }
        None => None,
    };

    let broker = match &config.broker {
        Some(cfg) => {
            let source = registry.build_broker(cfg, event_tx.clone())?;
            info!("broker provider '{}' created", source.name());
            Some(source)
        }
        None => None,
    };
    drop(event_tx);

    // 4. Execution service, restored from the checkpoint if configured
    let (oms_tx, oms_rx) = mpsc::unbounded_channel();
    let execution = match &broker {
        Some(broker) => {
            let mut service = ExecutionService::new(broker.clone(), oms_tx);
            if let Some(cp) = &config.checkpoint {
                let sink = LmdbCheckpoint::open(&cp.dir)?;
                info!("checkpointing to {}", sink.path().display());
                service = service.with_checkpoint(Arc::new(sink), cp.collection.clone());
            }
            let service = Arc::new(service);
            match service.restore_positions().await {
                Ok(n) => info!("restored {n} active position(s)"),
                Err(e) => error!("position restore failed: {e:#}"),
            }
            Some(service)
        }
        None => None,
    };

    // 5. Hub and server
    let hub = Arc::new(ConnectionHub::new(
        config.hub.effective_instance_id(),
        Upstream { market_data, broker, execution },
    ));
    info!("hub instance id {}", hub.instance_id());

    tokio::spawn(pump_upstream(event_rx, hub.clone()));
    tokio::spawn(pump_oms(oms_rx, hub.clone()));

    let server = HubServer::bind(&config.hub.listen_addr, hub.clone(), config.hub.outbound_buffer).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_task = tokio::spawn(server.run(shutdown_rx));

    info!("serving, press Ctrl+C to stop");

    // 6. Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("server stopped with error: {e:#}"),
        Err(e) => error!("server task failed: {e}"),
    }

    info!("hub stopped, goodbye");
    Ok(())
}

/// Feeds upstream events through [`ConnectionHub::ingest`].
async fn pump_upstream(mut rx: SubscriptionEventReceiver, hub: Arc<ConnectionHub>) {
    while let Some(event) = rx.recv().await {
        hub.ingest(event).await;
    }
    info!("upstream event channel closed");
}

async fn pump_oms(mut rx: OmsEventReceiver, hub: Arc<ConnectionHub>) {
    while let Some(event) = rx.recv().await {
        hub.publish_oms(event).await;
    }
}
