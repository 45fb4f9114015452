//! `multigress` is an ingress watcher and HAProxy config templating
//! service. It aims to enable user-facing transparent multi-cluster
//! deployments in Kubernetes.

use anyhow::{Context, Result};
use multigress_controller::{Cluster, Config, Handler, VirtualServers, CHANNEL_CAPACITY};
use std::path::PathBuf;
use structopt::StructOpt;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, StructOpt)]
#[structopt(name = "multigress", about = "Multi-cluster ingress edge router")]
struct Args {
    /// Path to the configuration file
    #[structopt(long, default_value = "config.yml", parse(from_os_str))]
    config: PathBuf,

    /// Enable verbose logging
    #[structopt(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::from_args();
    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = Config::from_file(&args.config)
        .with_context(|| format!("couldn't load config {}", args.config.display()))?;
    debug!("Config loaded");

    let (snapshot_tx, snapshot_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (exposure_tx, exposure_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (stop_tx, stop_rx) = watch::channel(false);

    let mut clusters = Vec::new();
    for cluster_config in &config.clusters {
        debug!(cluster = %cluster_config.name, "Starting cluster handler");
        let mut cluster = Cluster::new(
            cluster_config.clone(),
            snapshot_tx.clone(),
            exposure_tx.clone(),
        );
        cluster.start();
        clusters.push(cluster);
    }
    drop(snapshot_tx);
    drop(exposure_tx);
    debug!("All cluster handlers loaded");

    let handler =
        Handler::new(&config, snapshot_rx).context("couldn't init the haproxy handler")?;
    let mut handler_task = tokio::spawn(handler.run(stop_rx.clone()));
    debug!("HAProxy handler loaded");

    let balancer = VirtualServers::new(config.ips.clone(), exposure_rx);
    let balancer_task = tokio::spawn(balancer.run(stop_rx.clone()));
    debug!("Balancer started");

    // Block until an interrupt arrives or the render path fails; the latter
    // is fatal so that supervision restarts us on a clean observation cycle.
    let result = tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Interrupt received, shutting down");
            Ok(())
        }
        res = &mut handler_task => match res {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(error.context("haproxy handler failed")),
            Err(error) => Err(anyhow::Error::from(error).context("haproxy handler panicked")),
        },
    };

    let _ = stop_tx.send(true);
    for mut cluster in clusters {
        cluster.stop().await;
    }
    handler_task.abort();
    let _ = balancer_task.await;

    result
}
