#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Core domain model for multigress.
//!
//! Value types describing what each cluster currently serves, the change
//! events exchanged between the watchers and the aggregators, and the pure
//! derivation of the edge-proxy routing tables. This crate has no Kubernetes
//! or IO dependencies, so the derivation stays deterministic and testable.

mod template;

pub use self::template::{SniDetail, TemplateInfo, FIRST_FORWARD_PORT};

use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;

/// An ingress as observed in one cluster: its fully-qualified name
/// (`<namespace>-<name>`) and the hostnames it serves, in rule order.
///
/// Two ingresses are equivalent iff their names match and their host lists
/// are element-wise equal in order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Ingress {
    pub name: String,
    pub hosts: Vec<String>,
}

/// One ingress-controller endpoint: the pod's fully-qualified name and its
/// address.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Backend {
    pub name: String,
    pub ip: IpAddr,
}

/// Everything one cluster currently serves. Owned and mutated only by the
/// cluster's aggregator; published by value after every accepted change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClusterSnapshot {
    pub name: String,
    pub ingresses: Vec<Ingress>,
    pub backends: Vec<Backend>,
}

/// An upsert or removal of a single ingress.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IngressChange {
    pub ingress: Ingress,
    pub created: bool,
}

/// An upsert or removal of a single backend endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendChange {
    pub backend: Backend,
    pub created: bool,
}

/// Layer-4 protocol of an exposed service port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// One externally exposed service port: the service's fully-qualified name,
/// its cluster IP, and the port/protocol pair to forward.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceExposure {
    pub name: String,
    pub ip: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
}

/// A service gaining or losing external exposure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceExposureChange {
    pub service: ServiceExposure,
    pub created: bool,
}

/// A TLS certificate made available to the edge proxy: its symbolic name,
/// the on-disk key+chain bundle, and the domain patterns it covers. A
/// pattern beginning with `*` matches every host ending with the remaining
/// literal suffix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Certificate {
    pub name: String,
    pub path: PathBuf,
    pub domains: Vec<String>,
}

// === impl ClusterSnapshot ===

impl ClusterSnapshot {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ingresses: Vec::new(),
            backends: Vec::new(),
        }
    }

    /// Applies an ingress change. Creations append; removals take out the
    /// entry with the matching name. Order is not meaningful downstream, so
    /// removal may swap with the last element.
    pub fn apply_ingress(&mut self, change: IngressChange) {
        if change.created {
            self.ingresses.push(change.ingress);
        } else if let Some(idx) = self
            .ingresses
            .iter()
            .position(|i| i.name == change.ingress.name)
        {
            self.ingresses.swap_remove(idx);
        }
    }

    /// Applies a backend change; same semantics as `apply_ingress`.
    pub fn apply_backend(&mut self, change: BackendChange) {
        if change.created {
            self.backends.push(change.backend);
        } else if let Some(idx) = self
            .backends
            .iter()
            .position(|b| b.name == change.backend.name)
        {
            self.backends.swap_remove(idx);
        }
    }

    /// Forgets everything this cluster served, e.g. when its connection is
    /// lost or about to be re-established.
    pub fn clear(&mut self) {
        self.ingresses.clear();
        self.backends.clear();
    }
}

// === impl Protocol ===

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

// === impl Certificate ===

impl Certificate {
    /// Whether any of this certificate's patterns covers `host`: exact
    /// equality for plain patterns, literal suffix match for `*` patterns.
    /// The bare pattern `*` matches every host.
    pub fn matches(&self, host: &str) -> bool {
        self.domains
            .iter()
            .any(|domain| match domain.strip_prefix('*') {
                Some(suffix) => host.ends_with(suffix),
                None => domain == host,
            })
    }

    pub fn is_wildcard(&self) -> bool {
        self.domains.iter().any(|domain| domain.starts_with('*'))
    }
}
