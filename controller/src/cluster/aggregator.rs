//! Per-cluster aggregation: serialises a cluster's change events into its
//! snapshot and publishes the snapshot by value after every applied
//! operation.

use multigress_core::{BackendChange, ClusterSnapshot, IngressChange};
use tokio::sync::mpsc;
use tracing::info;

/// Drives one cluster's snapshot until the owning watcher drops its
/// senders. All mutation goes through this task, so the snapshot needs no
/// locking.
pub(super) async fn aggregate(
    mut snapshot: ClusterSnapshot,
    mut ingresses: mpsc::Receiver<IngressChange>,
    mut backends: mpsc::Receiver<BackendChange>,
    mut clear: mpsc::Receiver<()>,
    out: mpsc::Sender<ClusterSnapshot>,
) {
    loop {
        tokio::select! {
            change = ingresses.recv() => match change {
                Some(change) => {
                    if change.created {
                        info!(
                            cluster = %snapshot.name,
                            ingress = %change.ingress.name,
                            "Detected new ingress"
                        );
                    } else {
                        info!(
                            cluster = %snapshot.name,
                            ingress = %change.ingress.name,
                            "Removed old ingress"
                        );
                    }
                    snapshot.apply_ingress(change);
                }
                None => return,
            },
            change = backends.recv() => match change {
                Some(change) => {
                    if change.created {
                        info!(
                            cluster = %snapshot.name,
                            backend = %change.backend.name,
                            ip = %change.backend.ip,
                            "Detected new backend pod"
                        );
                    } else {
                        info!(
                            cluster = %snapshot.name,
                            backend = %change.backend.name,
                            ip = %change.backend.ip,
                            "Removed old backend pod"
                        );
                    }
                    snapshot.apply_backend(change);
                }
                None => return,
            },
            cleared = clear.recv() => match cleared {
                Some(()) => {
                    info!(cluster = %snapshot.name, "Discarding cluster state");
                    snapshot.clear();
                }
                None => return,
            },
        }
        if out.send(snapshot.clone()).await.is_err() {
            return;
        }
    }
}
