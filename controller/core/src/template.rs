use crate::{Backend, Certificate, ClusterSnapshot};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::path::PathBuf;

/// First loopback port handed out to a TLS wrap frontend. Every certificate
/// actually used consumes the next port.
pub const FIRST_FORWARD_PORT: u16 = 12345;

/// The render-time description of a certificate actually used.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SniDetail {
    /// Hosts this certificate will be presented for: routed hosts matching
    /// one of its patterns and not claimed by an earlier certificate.
    pub hosts: Vec<String>,
    /// Whether any of the certificate's patterns is a wildcard.
    pub is_wildcard: bool,
    /// Path to the key+chain bundle in PEM format.
    pub path: PathBuf,
    /// Loopback port of the TLS-terminating wrap frontend.
    pub local_forward_port: u16,
}

/// Everything the edge-proxy template is executed against.
///
/// All maps are ordered so that the same multiset of cluster snapshots
/// renders to byte-identical output.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TemplateInfo {
    /// Certificate name to its SNI detail.
    pub sni: BTreeMap<String, SniDetail>,
    /// Backend-combination key to the endpoints behind it.
    pub backend_combinations: BTreeMap<String, Vec<Backend>>,
    /// Host to the backend-combination key serving it.
    pub host_to_backend: BTreeMap<String, String>,
    /// Certificate presented when SNI matches nothing, if any wildcard
    /// certificate is in use.
    pub default_wildcard_cert: Option<String>,
    /// Front-end addresses the proxy binds.
    pub ips: Vec<IpAddr>,
}

// === impl TemplateInfo ===

impl TemplateInfo {
    /// Derives the routing tables from the current cluster snapshots, the
    /// declared certificates (in configuration order), and the advertised
    /// front-end addresses.
    pub fn build(
        clusters: &BTreeMap<String, ClusterSnapshot>,
        certificates: &[Certificate],
        ips: &[IpAddr],
    ) -> Self {
        // Which clusters serve each host. The set both deduplicates (two
        // ingresses in one cluster may list the same host) and sorts, which
        // fixes the combination key and the endpoint concatenation order.
        let mut clusters_by_host: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for snapshot in clusters.values() {
            for ingress in &snapshot.ingresses {
                for host in &ingress.hosts {
                    clusters_by_host
                        .entry(host)
                        .or_default()
                        .insert(snapshot.name.as_str());
                }
            }
        }

        let mut host_to_backend = BTreeMap::new();
        let mut backend_combinations: BTreeMap<String, Vec<Backend>> = BTreeMap::new();
        for (host, names) in &clusters_by_host {
            let key = names.iter().copied().collect::<Vec<_>>().join("-");
            if !backend_combinations.contains_key(&key) {
                let endpoints: Vec<Backend> = names
                    .iter()
                    .filter_map(|name| clusters.get(*name))
                    .flat_map(|snapshot| snapshot.backends.iter().cloned())
                    .collect();
                if endpoints.is_empty() {
                    // A host no endpoint serves must not reach the proxy
                    // configuration at all.
                    continue;
                }
                backend_combinations.insert(key.clone(), endpoints);
            }
            host_to_backend.insert((*host).to_string(), key);
        }

        // Certificates are considered in configuration order; the first
        // match claims a host, and the last wildcard in use becomes the
        // default.
        let mut sni = BTreeMap::new();
        let mut claimed: BTreeSet<String> = BTreeSet::new();
        let mut default_wildcard_cert = None;
        let mut port = FIRST_FORWARD_PORT;
        for cert in certificates {
            let hosts: Vec<String> = host_to_backend
                .keys()
                .filter(|host| !claimed.contains(host.as_str()) && cert.matches(host))
                .cloned()
                .collect();
            let is_wildcard = cert.is_wildcard();
            if hosts.is_empty() && !is_wildcard {
                continue;
            }
            claimed.extend(hosts.iter().cloned());
            if is_wildcard {
                default_wildcard_cert = Some(cert.name.clone());
            }
            sni.insert(
                cert.name.clone(),
                SniDetail {
                    hosts,
                    is_wildcard,
                    path: cert.path.clone(),
                    local_forward_port: port,
                },
            );
            port += 1;
        }

        Self {
            sni,
            backend_combinations,
            host_to_backend,
            default_wildcard_cert,
            ips: ips.to_vec(),
        }
    }

    /// Routed hosts no used certificate covers. These are served over plain
    /// HTTP only and are worth an operator warning.
    pub fn uncovered_hosts(&self) -> Vec<&str> {
        self.host_to_backend
            .keys()
            .map(String::as_str)
            .filter(|host| {
                !self
                    .sni
                    .values()
                    .any(|detail| detail.hosts.iter().any(|h| h == host))
            })
            .collect()
    }
}
