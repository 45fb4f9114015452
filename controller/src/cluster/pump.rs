//! Subscription pumps: convert raw watch events into domain change events,
//! deduplicating against a remembered per-cluster view so noisy resyncs do
//! not propagate downstream.

use crate::k8s::{self, ResourceExt, Watch, WatchEvent};
use anyhow::{anyhow, bail, Result};
use multigress_core::{
    Backend, BackendChange, Ingress, IngressChange, Protocol, ServiceExposure,
    ServiceExposureChange,
};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Remembered ingresses for one subscription phase.
#[derive(Debug, Default)]
pub(super) struct IngressView {
    known: HashMap<String, Ingress>,
}

/// Remembered controller pods for one subscription phase.
#[derive(Debug, Default)]
pub(super) struct PodView {
    known: HashMap<String, Backend>,
}

// === impl IngressView ===

impl IngressView {
    /// Notes an observed ingress and returns the changes to apply: nothing
    /// when the remembered value is equivalent, a create for a new name,
    /// and delete-then-create when a known ingress actually changed.
    pub(super) fn upsert(&mut self, ingress: Ingress) -> Vec<IngressChange> {
        match self.known.insert(ingress.name.clone(), ingress.clone()) {
            None => vec![IngressChange {
                ingress,
                created: true,
            }],
            Some(prev) if prev == ingress => Vec::new(),
            Some(prev) => vec![
                IngressChange {
                    ingress: prev,
                    created: false,
                },
                IngressChange {
                    ingress,
                    created: true,
                },
            ],
        }
    }

    pub(super) fn remove(&mut self, name: &str) -> Option<IngressChange> {
        self.known.remove(name).map(|ingress| IngressChange {
            ingress,
            created: false,
        })
    }
}

// === impl PodView ===

impl PodView {
    /// An added pod produces a create unless the remembered value is
    /// already equivalent.
    pub(super) fn add(&mut self, backend: Backend) -> Option<BackendChange> {
        match self.known.insert(backend.name.clone(), backend.clone()) {
            Some(prev) if prev == backend => None,
            _ => Some(BackendChange {
                backend,
                created: true,
            }),
        }
    }

    /// A modified pod may have moved address, so this always emits
    /// delete-then-create.
    pub(super) fn replace(&mut self, backend: Backend) -> [BackendChange; 2] {
        self.known.insert(backend.name.clone(), backend.clone());
        [
            BackendChange {
                backend: backend.clone(),
                created: false,
            },
            BackendChange {
                backend,
                created: true,
            },
        ]
    }

    pub(super) fn remove(&mut self, name: &str) -> Option<BackendChange> {
        self.known.remove(name).map(|backend| BackendChange {
            backend,
            created: false,
        })
    }
}

/// Normalises an ingress object to its fully-qualified name and host list.
pub(super) fn ingress_value(ingress: &k8s::Ingress) -> Ingress {
    let name = format!(
        "{}-{}",
        ingress.namespace().unwrap_or_default(),
        ingress.name_any()
    );
    let hosts = ingress
        .spec
        .as_ref()
        .and_then(|spec| spec.rules.as_ref())
        .map(|rules| rules.iter().filter_map(|rule| rule.host.clone()).collect())
        .unwrap_or_default();
    Ingress { name, hosts }
}

/// Normalises a controller pod to a backend endpoint; pods without a
/// parsable address are rejected.
pub(super) fn backend_value(pod: &k8s::Pod) -> Result<Backend> {
    let name = format!("{}-{}", pod.namespace().unwrap_or_default(), pod.name_any());
    let ip = pod
        .status
        .as_ref()
        .and_then(|status| status.pod_ip.as_deref())
        .ok_or_else(|| anyhow!("pod {} has no address", name))?;
    let ip = ip
        .parse()
        .map_err(|_| anyhow!("pod {} has unparsable address {:?}", name, ip))?;
    Ok(Backend { name, ip })
}

/// The exposed ports of a service, or nothing for services that are not of
/// LoadBalancer type or carry no usable cluster IP.
pub(super) fn service_exposures(cluster: &str, service: &k8s::Service) -> Vec<ServiceExposure> {
    let name = format!(
        "{}-{}",
        service.namespace().unwrap_or_default(),
        service.name_any()
    );
    let Some(spec) = service.spec.as_ref() else {
        return Vec::new();
    };
    if spec.type_.as_deref() != Some("LoadBalancer") {
        return Vec::new();
    }
    let ip = spec
        .cluster_ip
        .as_deref()
        .filter(|ip| *ip != "None")
        .and_then(|ip| ip.parse().ok());
    let Some(ip) = ip else {
        error!(cluster = %cluster, service = %name, "Exposed service has no usable cluster IP");
        return Vec::new();
    };

    spec.ports
        .iter()
        .flatten()
        .filter_map(|port| {
            let protocol = match port.protocol.as_deref().unwrap_or("TCP") {
                "TCP" => Protocol::Tcp,
                "UDP" => Protocol::Udp,
                other => {
                    warn!(
                        cluster = %cluster,
                        service = %name,
                        protocol = %other,
                        "Skipping unsupported service protocol"
                    );
                    return None;
                }
            };
            let port = u16::try_from(port.port).ok()?;
            Some(ServiceExposure {
                name: name.clone(),
                ip,
                port,
                protocol,
            })
        })
        .collect()
}

pub(super) async fn pump_ingresses(
    cluster: &str,
    mut events: Watch<k8s::Ingress>,
    tx: mpsc::Sender<IngressChange>,
) -> Result<()> {
    let mut view = IngressView::default();
    while let Some(event) = events.recv().await? {
        match event {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
                for change in view.upsert(ingress_value(&obj)) {
                    send(&tx, change).await?;
                }
            }
            WatchEvent::Deleted(obj) => {
                if let Some(change) = view.remove(&ingress_value(&obj).name) {
                    send(&tx, change).await?;
                }
            }
            WatchEvent::Bookmark(_) => {}
            WatchEvent::Error(response) => {
                bail!("ingress watch error: {} ({})", response.message, response.reason)
            }
        }
    }
    debug!(cluster = %cluster, "Ingress subscription expired");
    Ok(())
}

pub(super) async fn pump_pods(
    cluster: &str,
    mut events: Watch<k8s::Pod>,
    tx: mpsc::Sender<BackendChange>,
) -> Result<()> {
    let mut view = PodView::default();
    while let Some(event) = events.recv().await? {
        match event {
            WatchEvent::Added(obj) => match backend_value(&obj) {
                Ok(backend) => {
                    if let Some(change) = view.add(backend) {
                        send(&tx, change).await?;
                    }
                }
                Err(error) => error!(cluster = %cluster, %error, "Dropping pod event"),
            },
            WatchEvent::Modified(obj) => match backend_value(&obj) {
                Ok(backend) => {
                    for change in view.replace(backend) {
                        send(&tx, change).await?;
                    }
                }
                Err(error) => error!(cluster = %cluster, %error, "Dropping pod event"),
            },
            WatchEvent::Deleted(obj) => {
                let name = format!("{}-{}", obj.namespace().unwrap_or_default(), obj.name_any());
                if let Some(change) = view.remove(&name) {
                    send(&tx, change).await?;
                }
            }
            WatchEvent::Bookmark(_) => {}
            WatchEvent::Error(response) => {
                bail!("pod watch error: {} ({})", response.message, response.reason)
            }
        }
    }
    debug!(cluster = %cluster, "Pod subscription expired");
    Ok(())
}

pub(super) async fn pump_services(
    cluster: &str,
    mut events: Watch<k8s::Service>,
    tx: mpsc::Sender<ServiceExposureChange>,
) -> Result<()> {
    while let Some(event) = events.recv().await? {
        match event {
            WatchEvent::Added(obj) => {
                for service in service_exposures(cluster, &obj) {
                    send(&tx, ServiceExposureChange { service, created: true }).await?;
                }
            }
            WatchEvent::Deleted(obj) => {
                for service in service_exposures(cluster, &obj) {
                    send(&tx, ServiceExposureChange { service, created: false }).await?;
                }
            }
            WatchEvent::Modified(obj) => {
                let exposures = service_exposures(cluster, &obj);
                for service in exposures.iter().cloned() {
                    send(&tx, ServiceExposureChange { service, created: false }).await?;
                }
                for service in exposures {
                    send(&tx, ServiceExposureChange { service, created: true }).await?;
                }
            }
            WatchEvent::Bookmark(_) => {}
            WatchEvent::Error(response) => {
                bail!("service watch error: {} ({})", response.message, response.reason)
            }
        }
    }
    debug!(cluster = %cluster, "Service subscription expired");
    Ok(())
}

async fn send<T>(tx: &mpsc::Sender<T>, change: T) -> Result<()> {
    tx.send(change)
        .await
        .map_err(|_| anyhow!("change channel closed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use k8s_openapi::api::core::v1::{PodStatus, ServicePort, ServiceSpec};
    use k8s_openapi::api::networking::v1::{IngressRule, IngressSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn meta(ns: &str, name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(ns.to_string()),
            ..ObjectMeta::default()
        }
    }

    fn mk_ingress(ns: &str, name: &str, hosts: &[&str]) -> k8s::Ingress {
        k8s::Ingress {
            metadata: meta(ns, name),
            spec: Some(IngressSpec {
                rules: Some(
                    hosts
                        .iter()
                        .map(|host| IngressRule {
                            host: Some(host.to_string()),
                            ..IngressRule::default()
                        })
                        .collect(),
                ),
                ..IngressSpec::default()
            }),
            ..k8s::Ingress::default()
        }
    }

    fn mk_pod(ns: &str, name: &str, ip: Option<&str>) -> k8s::Pod {
        k8s::Pod {
            metadata: meta(ns, name),
            status: Some(PodStatus {
                pod_ip: ip.map(|ip| ip.to_string()),
                ..PodStatus::default()
            }),
            ..k8s::Pod::default()
        }
    }

    fn mk_service(ns: &str, name: &str, type_: &str, ip: &str, ports: &[(i32, &str)]) -> k8s::Service {
        k8s::Service {
            metadata: meta(ns, name),
            spec: Some(ServiceSpec {
                type_: Some(type_.to_string()),
                cluster_ip: Some(ip.to_string()),
                ports: Some(
                    ports
                        .iter()
                        .map(|(port, protocol)| ServicePort {
                            port: *port,
                            protocol: Some(protocol.to_string()),
                            ..ServicePort::default()
                        })
                        .collect(),
                ),
                ..ServiceSpec::default()
            }),
            ..k8s::Service::default()
        }
    }

    fn mk_watch<T: Send + 'static>(events: Vec<WatchEvent<T>>) -> Watch<T> {
        stream::iter(events.into_iter().map(kube::Result::Ok)).into()
    }

    async fn drain<T>(mut rx: mpsc::Receiver<T>) -> Vec<T> {
        rx.close();
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            out.push(item);
        }
        out
    }

    #[tokio::test]
    async fn replayed_ingress_event_is_coalesced() {
        let (tx, rx) = mpsc::channel(64);
        let events = mk_watch(vec![
            WatchEvent::Added(mk_ingress("default", "www", &["example.org"])),
            WatchEvent::Modified(mk_ingress("default", "www", &["example.org"])),
            WatchEvent::Modified(mk_ingress("default", "www", &["example.org"])),
        ]);
        pump_ingresses("fake", events, tx).await.unwrap();

        let changes = drain(rx).await;
        assert_eq!(changes.len(), 1);
        assert!(changes[0].created);
        assert_eq!(changes[0].ingress.name, "default-www");
        assert_eq!(changes[0].ingress.hosts, vec!["example.org"]);
    }

    #[tokio::test]
    async fn changed_ingress_emits_delete_then_create() {
        let (tx, rx) = mpsc::channel(64);
        let events = mk_watch(vec![
            WatchEvent::Added(mk_ingress("default", "www", &["example.org"])),
            WatchEvent::Modified(mk_ingress("default", "www", &["example.org", "foo.org"])),
        ]);
        pump_ingresses("fake", events, tx).await.unwrap();

        let changes = drain(rx).await;
        assert_eq!(changes.len(), 3);
        assert!(changes[0].created);
        assert!(!changes[1].created);
        assert_eq!(changes[1].ingress.hosts, vec!["example.org"]);
        assert!(changes[2].created);
        assert_eq!(changes[2].ingress.hosts, vec!["example.org", "foo.org"]);
    }

    #[tokio::test]
    async fn deleted_ingress_is_forgotten() {
        let (tx, rx) = mpsc::channel(64);
        let events = mk_watch(vec![
            WatchEvent::Added(mk_ingress("default", "www", &["example.org"])),
            WatchEvent::Deleted(mk_ingress("default", "www", &["example.org"])),
            WatchEvent::Deleted(mk_ingress("default", "www", &["example.org"])),
        ]);
        pump_ingresses("fake", events, tx).await.unwrap();

        let changes = drain(rx).await;
        assert_eq!(changes.len(), 2);
        assert!(!changes[1].created);
    }

    #[tokio::test]
    async fn error_event_aborts_the_pump() {
        let (tx, _rx) = mpsc::channel(64);
        let events = mk_watch(vec![WatchEvent::Error(k8s::ErrorResponse {
            status: "Failure".to_string(),
            message: "too old resource version".to_string(),
            reason: "Expired".to_string(),
            code: 410,
        })]);
        assert!(pump_ingresses("fake", events, tx).await.is_err());
    }

    #[tokio::test]
    async fn pod_without_address_is_dropped() {
        let (tx, rx) = mpsc::channel(64);
        let events = mk_watch(vec![
            WatchEvent::Added(mk_pod("ingress-nginx", "ctl-0", None)),
            WatchEvent::Added(mk_pod("ingress-nginx", "ctl-1", Some("not-an-ip"))),
            WatchEvent::Added(mk_pod("ingress-nginx", "ctl-2", Some("10.0.0.2"))),
        ]);
        pump_pods("fake", events, tx).await.unwrap();

        let changes = drain(rx).await;
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].backend.name, "ingress-nginx-ctl-2");
    }

    #[tokio::test]
    async fn modified_pod_replaces_unconditionally() {
        let (tx, rx) = mpsc::channel(64);
        let events = mk_watch(vec![
            WatchEvent::Added(mk_pod("ingress-nginx", "ctl-0", Some("10.0.0.1"))),
            WatchEvent::Added(mk_pod("ingress-nginx", "ctl-0", Some("10.0.0.1"))),
            WatchEvent::Modified(mk_pod("ingress-nginx", "ctl-0", Some("10.0.0.9"))),
        ]);
        pump_pods("fake", events, tx).await.unwrap();

        let changes = drain(rx).await;
        assert_eq!(changes.len(), 3);
        assert!(changes[0].created);
        assert!(!changes[1].created);
        assert!(changes[2].created);
        assert_eq!(changes[2].backend.ip, "10.0.0.9".parse::<std::net::IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn only_load_balancer_services_are_exposed() {
        let (tx, rx) = mpsc::channel(64);
        let events = mk_watch(vec![
            WatchEvent::Added(mk_service("default", "internal", "ClusterIP", "10.1.0.9", &[(80, "TCP")])),
            WatchEvent::Added(mk_service("default", "public", "LoadBalancer", "10.1.0.1", &[(443, "TCP"), (53, "UDP")])),
        ]);
        pump_services("fake", events, tx).await.unwrap();

        let changes = drain(rx).await;
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| c.created && c.service.name == "default-public"));
        assert_eq!(changes[0].service.port, 443);
        assert_eq!(changes[0].service.protocol, Protocol::Tcp);
        assert_eq!(changes[1].service.port, 53);
        assert_eq!(changes[1].service.protocol, Protocol::Udp);
    }

    #[tokio::test]
    async fn modified_service_reprograms_each_port() {
        let (tx, rx) = mpsc::channel(64);
        let events = mk_watch(vec![WatchEvent::Modified(mk_service(
            "default",
            "public",
            "LoadBalancer",
            "10.1.0.1",
            &[(443, "TCP")],
        ))]);
        pump_services("fake", events, tx).await.unwrap();

        let changes = drain(rx).await;
        assert_eq!(changes.len(), 2);
        assert!(!changes[0].created);
        assert!(changes[1].created);
    }
}
