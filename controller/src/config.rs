//! Declarative configuration, loaded once at startup.
//!
//! Parsing is strict (unknown keys are fatal); defaults are applied after
//! decode and before validation, and validation failures are typed errors
//! naming the offending field and the cluster/certificate it belongs to.

use multigress_core::Certificate;
use serde::Deserialize;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("couldn't read {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("couldn't parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("cluster {index}: name missing")]
    ClusterNameMissing { index: usize },

    #[error("cluster {name:?}: kubeconfig missing")]
    KubeconfigMissing { name: String },

    #[error("certificate {index}: name missing")]
    CertificateNameMissing { index: usize },

    #[error("certificate {name:?}: cert missing")]
    CertificatePathMissing { name: String },

    #[error("certificate {name:?}: not valid for any domain")]
    CertificateDomainsMissing { name: String },

    #[error("cluster list missing")]
    ClustersMissing,

    #[error("certificate list missing")]
    CertificatesMissing,

    #[error("ip list missing")]
    IpsMissing,
}

/// The validated configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Template rendered on every update.
    pub haproxy_template_path: PathBuf,
    /// Where the rendered configuration is written.
    pub haproxy_dropin_path: PathBuf,
    /// Recognised but not applied; the drop-in is always written 0644.
    pub haproxy_dropin_mode: Option<String>,
    pub clusters: Vec<Cluster>,
    pub certificates: Vec<Certificate>,
    /// Front-end addresses the edge proxy binds.
    pub ips: Vec<IpAddr>,
}

/// One cluster to route to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cluster {
    /// Symbolic name, also used in backend-combination keys and logging.
    pub name: String,
    /// Credentials used to connect.
    pub kubeconfig: PathBuf,
    /// Namespace the ingress controller runs in.
    pub ingress_namespace: String,
    /// Value of the controller pods' `app.kubernetes.io/name` label.
    pub ingress_app_name: String,
    /// Port the controller pods serve on. Informational only.
    pub ingress_port: u16,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct RawConfig {
    #[serde(default)]
    haproxy_template_path: PathBuf,
    #[serde(default)]
    haproxy_dropin_path: PathBuf,
    #[serde(default)]
    haproxy_dropin_mode: Option<String>,
    clusters: Option<Vec<RawCluster>>,
    certificates: Option<Vec<RawCertificate>>,
    #[serde(default)]
    ips: Vec<IpAddr>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct RawCluster {
    #[serde(default)]
    name: String,
    #[serde(default)]
    kubeconfig: PathBuf,
    #[serde(default = "default_ingress_namespace")]
    ingress_namespace: String,
    #[serde(default = "default_ingress_app_name", rename = "ingressDeamonSetName")]
    ingress_app_name: String,
    #[serde(default = "default_ingress_port")]
    ingress_port: u16,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCertificate {
    #[serde(default)]
    name: String,
    #[serde(default)]
    cert: PathBuf,
    #[serde(default)]
    domains: Vec<String>,
}

fn default_ingress_namespace() -> String {
    "ingress-nginx".to_string()
}

fn default_ingress_app_name() -> String {
    "ingress-nginx".to_string()
}

fn default_ingress_port() -> u16 {
    80
}

// === impl Config ===

impl Config {
    /// Loads and validates the configuration at `path`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        let raw: RawConfig = serde_yaml::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;
        Self::validate(raw)
    }

    fn validate(raw: RawConfig) -> Result<Self, ConfigError> {
        let clusters = raw
            .clusters
            .ok_or(ConfigError::ClustersMissing)?
            .into_iter()
            .enumerate()
            .map(|(index, cluster)| {
                if cluster.name.is_empty() {
                    return Err(ConfigError::ClusterNameMissing { index });
                }
                if cluster.kubeconfig.as_os_str().is_empty() {
                    return Err(ConfigError::KubeconfigMissing { name: cluster.name });
                }
                Ok(Cluster {
                    name: cluster.name,
                    kubeconfig: cluster.kubeconfig,
                    ingress_namespace: cluster.ingress_namespace,
                    ingress_app_name: cluster.ingress_app_name,
                    ingress_port: cluster.ingress_port,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let certificates = raw
            .certificates
            .ok_or(ConfigError::CertificatesMissing)?
            .into_iter()
            .enumerate()
            .map(|(index, cert)| {
                if cert.name.is_empty() {
                    return Err(ConfigError::CertificateNameMissing { index });
                }
                if cert.cert.as_os_str().is_empty() {
                    return Err(ConfigError::CertificatePathMissing { name: cert.name });
                }
                if cert.domains.is_empty() {
                    return Err(ConfigError::CertificateDomainsMissing { name: cert.name });
                }
                Ok(Certificate {
                    name: cert.name,
                    path: cert.cert,
                    domains: cert.domains,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        if raw.ips.is_empty() {
            return Err(ConfigError::IpsMissing);
        }

        Ok(Self {
            haproxy_template_path: raw.haproxy_template_path,
            haproxy_dropin_path: raw.haproxy_dropin_path,
            haproxy_dropin_mode: raw.haproxy_dropin_mode,
            clusters,
            certificates,
            ips: raw.ips,
        })
    }
}
