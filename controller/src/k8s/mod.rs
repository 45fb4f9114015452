//! Kubernetes plumbing: client construction and the per-cluster watch
//! subscriptions.

mod watch;

pub use self::watch::{Watch, WatchEvent};
pub use k8s_openapi::api::core::v1::{Pod, Service};
pub use k8s_openapi::api::networking::v1::Ingress;
pub use kube::core::ErrorResponse;
pub use kube::ResourceExt;

use crate::config;
use anyhow::Result;
use kube::api::{Api, WatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};

/// Server-side watch timeout. The API server caps watch durations near five
/// minutes (and the client rejects anything above that); expiry just means
/// the pumps return and the watcher resubscribes.
const DEFAULT_TIMEOUT_SECS: u32 = 290;

/// The three per-cluster subscriptions.
pub struct Subscriptions {
    pub ingresses: Watch<Ingress>,
    pub pods: Watch<Pod>,
    pub services: Watch<Service>,
}

/// Builds a client for the cluster described by `config` from its
/// kubeconfig. Construction is lazy; a broken cluster surfaces when the
/// subscriptions are installed.
pub async fn connect(config: &config::Cluster) -> Result<kube::Client> {
    let kubeconfig = Kubeconfig::read_from(&config.kubeconfig)?;
    let client_config =
        kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
    Ok(kube::Client::try_from(client_config)?)
}

// === impl Subscriptions ===

impl Subscriptions {
    /// Installs the ingress, controller-pod, and service watches: ingresses
    /// and services cluster-wide, pods in the controller namespace filtered
    /// by the controller's app label.
    pub async fn install(client: kube::Client, config: &config::Cluster) -> Result<Self> {
        let params = WatchParams::default().timeout(DEFAULT_TIMEOUT_SECS);
        let pod_params = WatchParams::default()
            .labels(&format!(
                "app.kubernetes.io/name={}",
                config.ingress_app_name
            ))
            .timeout(DEFAULT_TIMEOUT_SECS);

        let ingresses: Api<Ingress> = Api::all(client.clone());
        let pods: Api<Pod> = Api::namespaced(client.clone(), &config.ingress_namespace);
        let services: Api<Service> = Api::all(client);

        Ok(Self {
            ingresses: ingresses.watch(&params, "0").await?.into(),
            pods: pods.watch(&pod_params, "0").await?.into(),
            services: services.watch(&params, "0").await?.into(),
        })
    }
}
