//! Per-cluster watch loop.
//!
//! One `Cluster` owns the connection to a single Kubernetes cluster. A
//! worker task drives the connect/subscribe/pump state machine, tolerating
//! disconnects and server-driven re-list cycles; a companion aggregator
//! task folds the pumped change events into the cluster's snapshot and
//! publishes it after every accepted change.

mod aggregator;
mod pump;

use crate::config;
use crate::k8s::{self, Subscriptions};
use anyhow::{Context, Result};
use multigress_core::{BackendChange, ClusterSnapshot, IngressChange, ServiceExposureChange};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

/// Delay between reconnection attempts.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(60);

/// Capacity of the per-cluster change channels.
const EVENT_CAPACITY: usize = 16;

/// Handles all tasks related to a single cluster.
pub struct Cluster {
    config: config::Cluster,
    snapshot_tx: mpsc::Sender<ClusterSnapshot>,
    exposure_tx: mpsc::Sender<ServiceExposureChange>,
    ready_rx: watch::Receiver<bool>,
    ready_tx: Option<watch::Sender<bool>>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// How one subscription phase ended.
enum Phase {
    /// Stop was requested.
    Stopped,
    /// The server ended the subscriptions; resubscribe right away.
    Expired,
}

// === impl Cluster ===

impl Cluster {
    /// Creates a handler for the configured cluster. Snapshots and service
    /// exposures are published on the supplied shared channels.
    pub fn new(
        config: config::Cluster,
        snapshot_tx: mpsc::Sender<ClusterSnapshot>,
        exposure_tx: mpsc::Sender<ServiceExposureChange>,
    ) -> Self {
        let (ready_tx, ready_rx) = watch::channel(false);
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            config,
            snapshot_tx,
            exposure_tx,
            ready_rx,
            ready_tx: Some(ready_tx),
            stop_tx,
            stop_rx,
            tasks: Vec::new(),
        }
    }

    /// Starts the watch and aggregation tasks; calling more than once has
    /// no further effect.
    pub fn start(&mut self) {
        let ready_tx = match self.ready_tx.take() {
            Some(ready_tx) => ready_tx,
            None => return,
        };
        let (ingress_tx, ingress_rx) = mpsc::channel(EVENT_CAPACITY);
        let (backend_tx, backend_rx) = mpsc::channel(EVENT_CAPACITY);
        let (clear_tx, clear_rx) = mpsc::channel(1);

        self.tasks.push(tokio::spawn(aggregator::aggregate(
            ClusterSnapshot::new(self.config.name.clone()),
            ingress_rx,
            backend_rx,
            clear_rx,
            self.snapshot_tx.clone(),
        )));

        let worker = Worker {
            config: self.config.clone(),
            ingress_tx,
            backend_tx,
            clear_tx,
            exposure_tx: self.exposure_tx.clone(),
            stop_rx: self.stop_rx.clone(),
        };
        self.tasks.push(tokio::spawn(worker.run(ready_tx)));
    }

    /// Blocks until the first successful subscription install.
    pub async fn wait_ready(&mut self) {
        // An error here means the worker already exited; there is nothing
        // left to wait for.
        let _ = self.ready_rx.wait_for(|ready| *ready).await;
    }

    /// Requests termination and waits for the tasks to drain. After return,
    /// no further snapshots are published for this cluster.
    pub async fn stop(&mut self) {
        let _ = self.stop_tx.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

/// The connect/subscribe/pump state machine for one cluster.
struct Worker {
    config: config::Cluster,
    ingress_tx: mpsc::Sender<IngressChange>,
    backend_tx: mpsc::Sender<BackendChange>,
    clear_tx: mpsc::Sender<()>,
    exposure_tx: mpsc::Sender<ServiceExposureChange>,
    stop_rx: watch::Receiver<bool>,
}

// === impl Worker ===

impl Worker {
    async fn run(self, ready_tx: watch::Sender<bool>) {
        let mut healthy = false;
        loop {
            if *self.stop_rx.borrow() {
                break;
            }
            match self.phase(&ready_tx, &mut healthy).await {
                Ok(Phase::Stopped) => break,
                Ok(Phase::Expired) => {
                    debug!(cluster = %self.config.name, "Subscriptions expired, resubscribing");
                    // A fresh subscription replays the current state, so the
                    // stale snapshot has to go first.
                    self.discard_state().await;
                }
                Err(error) => {
                    warn!(cluster = %self.config.name, ?error, "Couldn't watch cluster resources");
                    if healthy {
                        healthy = false;
                        self.discard_state().await;
                    }
                    if self.sleep_or_stop(RECONNECT_BACKOFF).await {
                        break;
                    }
                }
            }
        }
        debug!(cluster = %self.config.name, "Cluster handler stopped");
    }

    /// Connects, installs the subscriptions, and pumps until one of them
    /// terminates or stop is requested. Dropping the pumps tears the watch
    /// streams down.
    async fn phase(&self, ready_tx: &watch::Sender<bool>, healthy: &mut bool) -> Result<Phase> {
        let client = k8s::connect(&self.config)
            .await
            .context("couldn't connect to cluster")?;
        let subscriptions = Subscriptions::install(client, &self.config)
            .await
            .context("couldn't install watches, check RBAC")?;
        *healthy = true;
        let _ = ready_tx.send(true);
        info!(cluster = %self.config.name, "Watching cluster");

        let ingress_pump = pump::pump_ingresses(
            &self.config.name,
            subscriptions.ingresses,
            self.ingress_tx.clone(),
        );
        let pod_pump = pump::pump_pods(
            &self.config.name,
            subscriptions.pods,
            self.backend_tx.clone(),
        );
        let service_pump = pump::pump_services(
            &self.config.name,
            subscriptions.services,
            self.exposure_tx.clone(),
        );
        tokio::pin!(ingress_pump, pod_pump, service_pump);

        let mut stop_rx = self.stop_rx.clone();
        tokio::select! {
            _ = stop_rx.wait_for(|stop| *stop) => Ok(Phase::Stopped),
            res = &mut ingress_pump => res.map(|()| Phase::Expired).context("ingress subscription"),
            res = &mut pod_pump => res.map(|()| Phase::Expired).context("pod subscription"),
            res = &mut service_pump => res.map(|()| Phase::Expired).context("service subscription"),
        }
    }

    /// Clears the aggregator, which publishes an empty snapshot so the
    /// downstream view reflects the outage.
    async fn discard_state(&self) {
        let _ = self.clear_tx.send(()).await;
    }

    /// Returns true when stop was requested during the sleep.
    async fn sleep_or_stop(&self, delay: Duration) -> bool {
        let mut stop_rx = self.stop_rx.clone();
        tokio::select! {
            _ = time::sleep(delay) => false,
            _ = stop_rx.wait_for(|stop| *stop) => true,
        }
    }
}
