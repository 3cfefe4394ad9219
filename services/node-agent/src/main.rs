//! MangoFaaS node agent
//!
//! Runs on each worker host and executes function invocations in
//! Firecracker microVMs.
//!
//! ## Startup
//!
//! 1. Host network: per-VM subnets, forwarding and NAT rules
//! 2. VM pool, prewarmed with generic VMs
//! 3. Background loops: idle VM reclaimer, image cache evictor
//! 4. Request reader, until Ctrl-C
//!
//! On shutdown every loop stops and the pool tears down all VMs.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mango_ipam::IpPoolManager;
use mango_node_agent::command::HostCommandRunner;
use mango_node_agent::image::{Buckets, ImageService};
use mango_node_agent::network::{IpTablesNetworkSetup, NetworkSetup};
use mango_node_agent::pool::{FirecrackerLauncher, ProcessPool};
use mango_node_agent::reader::{
    Dispatcher, KafkaReplySink, KafkaRequestReader, PartitionRouter,
};
use mango_node_agent::{Config, PendingRequestStore};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        firecracker = %config.firecracker_path.display(),
        work_dir = %config.work_dir.display(),
        pool_max_size = config.pool_max_size,
        ip_subnet = %config.ip_subnet,
        brokers = %config.kafka_brokers,
        "Starting MangoFaaS node agent"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Host network
    let ipam = Arc::new(IpPoolManager::new());
    let network = Arc::new(
        IpTablesNetworkSetup::new(
            ipam,
            Arc::new(HostCommandRunner),
            &config.ip_subnet,
            &config.egress_interface,
        )
        .context("failed to prepare VM subnets")?,
    );
    network
        .initialize()
        .await
        .context("failed to install forwarding rules")?;

    // VM pool
    let store = Arc::new(PendingRequestStore::new(config.queue_capacity));
    let launcher = Arc::new(FirecrackerLauncher::new(config.launcher_config()));
    let pool = ProcessPool::new(config.pool_config(), network, launcher, store.clone());
    pool.prewarm().await;

    let reclaimer_handle = tokio::spawn(pool.clone().run_reclaimer(shutdown_rx.clone()));

    // Images
    let buckets = Buckets::s3(&config.s3_settings()).context("failed to configure object storage")?;
    let images = Arc::new(ImageService::new(buckets, &config.cache_dir, config.overlay_dir()));
    let evictor_handle = tokio::spawn(images.clone().run_evictor(shutdown_rx.clone()));

    // Request reader
    let replies = Arc::new(KafkaReplySink::new(&config.kafka_brokers)?);
    let dispatcher = Arc::new(Dispatcher::new(pool.clone(), store, images, replies));
    let router = PartitionRouter::new(config.router_config(), dispatcher).with_shutdown(shutdown_rx.clone());
    let reader = KafkaRequestReader::new(config.kafka_settings(), router)?;
    let mut reader_handle = tokio::spawn(reader.run(shutdown_rx.clone()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut reader_handle => {
            match result {
                Ok(Ok(())) => info!("Request reader exited"),
                Ok(Err(e)) => error!(error = %e, "Request reader error"),
                Err(e) => error!(error = %e, "Request reader task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    if !reader_handle.is_finished() {
        let _ = reader_handle.await;
    }
    let _ = reclaimer_handle.await;
    let _ = evictor_handle.await;

    pool.shutdown().await;

    info!("Node agent shutdown complete");
    Ok(())
}
