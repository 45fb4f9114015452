//! IPVS virtual-server programming for externally exposed services.
//!
//! Mirrors the service-exposure stream into the kernel: each advertised
//! front-end address gets a virtual server per exposed port, masquerading
//! to the service's cluster IP, plus an iptables INPUT accept rule for the
//! port. Everything is driven through the platform tools (`ipvsadm`,
//! `iptables`); a failed operation is logged and the remaining addresses
//! are still processed.

use multigress_core::{Protocol, ServiceExposure, ServiceExposureChange};
use std::net::IpAddr;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

/// Programs virtual servers for services that request external exposure.
pub struct VirtualServers {
    ips: Vec<IpAddr>,
    events: mpsc::Receiver<ServiceExposureChange>,
}

// === impl VirtualServers ===

impl VirtualServers {
    pub fn new(ips: Vec<IpAddr>, events: mpsc::Receiver<ServiceExposureChange>) -> Self {
        Self { ips, events }
    }

    /// Consumes exposure events until stop or until every watcher is gone.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(change) => self.apply(change).await,
                    None => return,
                },
                _ = stop.changed() => return,
            }
        }
    }

    async fn apply(&self, change: ServiceExposureChange) {
        let service = &change.service;
        if change.created {
            info!(
                service = %service.name,
                port = service.port,
                protocol = %service.protocol,
                "Adding virtual servers"
            );
            self.ensure_accept_rule(service).await;
            for ip in &self.ips {
                run("ipvsadm", &add_virtual_server_args(*ip, service)).await;
                run("ipvsadm", &add_real_server_args(*ip, service)).await;
            }
        } else {
            info!(
                service = %service.name,
                port = service.port,
                protocol = %service.protocol,
                "Removing virtual servers"
            );
            self.remove_accept_rule(service).await;
            for ip in &self.ips {
                run("ipvsadm", &delete_virtual_server_args(*ip, service)).await;
            }
        }
    }

    async fn ensure_accept_rule(&self, service: &ServiceExposure) {
        if !check("iptables", &accept_rule_args("-C", service)).await {
            run("iptables", &accept_rule_args("-A", service)).await;
        }
    }

    async fn remove_accept_rule(&self, service: &ServiceExposure) {
        if check("iptables", &accept_rule_args("-C", service)).await {
            run("iptables", &accept_rule_args("-D", service)).await;
        }
    }
}

fn protocol_flag(protocol: Protocol) -> &'static str {
    match protocol {
        Protocol::Tcp => "-t",
        Protocol::Udp => "-u",
    }
}

/// `ipvsadm -A`: a round-robin virtual server on the front-end address.
fn add_virtual_server_args(ip: IpAddr, service: &ServiceExposure) -> Vec<String> {
    vec![
        "-A".to_string(),
        protocol_flag(service.protocol).to_string(),
        format!("{}:{}", ip, service.port),
        "-s".to_string(),
        "rr".to_string(),
    ]
}

/// `ipvsadm -a`: one masqueraded real server at the cluster IP, weight 1.
fn add_real_server_args(ip: IpAddr, service: &ServiceExposure) -> Vec<String> {
    vec![
        "-a".to_string(),
        protocol_flag(service.protocol).to_string(),
        format!("{}:{}", ip, service.port),
        "-r".to_string(),
        format!("{}:{}", service.ip, service.port),
        "-m".to_string(),
        "-w".to_string(),
        "1".to_string(),
    ]
}

fn delete_virtual_server_args(ip: IpAddr, service: &ServiceExposure) -> Vec<String> {
    vec![
        "-D".to_string(),
        protocol_flag(service.protocol).to_string(),
        format!("{}:{}", ip, service.port),
    ]
}

fn accept_rule_args(op: &str, service: &ServiceExposure) -> Vec<String> {
    vec![
        op.to_string(),
        "INPUT".to_string(),
        "-p".to_string(),
        service.protocol.as_str().to_string(),
        "--dport".to_string(),
        service.port.to_string(),
        "-j".to_string(),
        "ACCEPT".to_string(),
    ]
}

async fn run(program: &str, args: &[String]) {
    match Command::new(program).args(args).status().await {
        Ok(status) if status.success() => {
            debug!(program = %program, args = ?args, "Applied")
        }
        Ok(status) => {
            error!(program = %program, args = ?args, status = %status, "Command failed")
        }
        Err(error) => {
            error!(program = %program, args = ?args, %error, "Couldn't run command")
        }
    }
}

async fn check(program: &str, args: &[String]) -> bool {
    matches!(
        Command::new(program).args(args).status().await,
        Ok(status) if status.success()
    )
}
