#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Multigress controller.
//!
//! Watches ingresses, ingress-controller pods, and externally exposed
//! services across any number of Kubernetes clusters; aggregates a
//! cross-cluster view of which hostnames are served where; renders the
//! operator-supplied HAProxy template from the derived routing tables; and
//! reloads the edge proxy. An optional balancer mirrors exposed services
//! into IPVS virtual servers on the advertised front-end addresses.

pub mod cluster;
pub mod config;
pub mod haproxy;
pub mod ipvs;
mod k8s;

pub use self::cluster::Cluster;
pub use self::config::Config;
pub use self::haproxy::Handler;
pub use self::ipvs::VirtualServers;

/// Capacity of the shared snapshot and service-exposure channels; buffered
/// so a burst from one cluster does not stall the others.
pub const CHANNEL_CAPACITY: usize = 16;
