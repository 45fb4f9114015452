//! Edge-proxy configuration handling: consumes cluster snapshots, derives
//! the routing tables, renders the operator template, and reloads HAProxy.

use crate::config::Config;
use anyhow::{bail, Context, Result};
use minijinja::Environment;
use multigress_core::{Certificate, ClusterSnapshot, TemplateInfo};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::net::IpAddr;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::time;
use tracing::{debug, info, warn};

/// How often pending snapshot changes are flushed into a render+reload.
const DEBOUNCE_TICK: Duration = Duration::from_secs(1);

/// Mode the drop-in is written with. The `haproxyDropinMode` option is
/// recognised but not applied.
const DROPIN_MODE: u32 = 0o644;

const TEMPLATE_NAME: &str = "haproxy";

/// Renders and applies the HAProxy drop-in from the latest cluster
/// snapshots.
///
/// The handler is the single consumer of the shared snapshot channel. It
/// stores the newest snapshot per cluster, collapses bursts of updates into
/// at most one render per tick, and treats render, write, and reload
/// failures as fatal.
pub struct Handler {
    template: Environment<'static>,
    dropin_path: PathBuf,
    certificates: Vec<Certificate>,
    ips: Vec<IpAddr>,
    updates: mpsc::Receiver<ClusterSnapshot>,
    clusters: BTreeMap<String, ClusterSnapshot>,
    dirty: bool,
    /// When set, suppresses the reload and signals each completed write
    /// instead. Installed by the tests.
    debug_file_events: Option<mpsc::Sender<()>>,
}

// === impl Handler ===

impl Handler {
    /// Reads and parses the configured template. Template problems surface
    /// here rather than at the first render.
    pub fn new(config: &Config, updates: mpsc::Receiver<ClusterSnapshot>) -> Result<Self> {
        let source = fs::read_to_string(&config.haproxy_template_path).with_context(|| {
            format!(
                "couldn't read template {}",
                config.haproxy_template_path.display()
            )
        })?;
        let mut template = Environment::new();
        template
            .add_template_owned(TEMPLATE_NAME.to_string(), source)
            .context("couldn't parse haproxy template")?;

        if config.haproxy_dropin_mode.is_some() {
            warn!("haproxyDropinMode is recognised but not applied; the drop-in is written 0644");
        }

        Ok(Self {
            template,
            dropin_path: config.haproxy_dropin_path.clone(),
            certificates: config.certificates.clone(),
            ips: config.ips.clone(),
            updates,
            clusters: BTreeMap::new(),
            dirty: false,
            debug_file_events: None,
        })
    }

    /// Consumes snapshots until stop or until every watcher is gone,
    /// rendering at most once per tick. Render-path errors propagate and
    /// are fatal to the process.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> Result<()> {
        let mut ticks = time::interval(DEBOUNCE_TICK);
        ticks.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                snapshot = self.updates.recv() => match snapshot {
                    Some(snapshot) => self.store(snapshot),
                    None => return Ok(()),
                },
                _ = ticks.tick() => {
                    if self.dirty {
                        self.dirty = false;
                        self.apply().await?;
                    }
                }
                _ = stop.changed() => return Ok(()),
            }
        }
    }

    /// Remembers a cluster's newest snapshot, ignoring publications that
    /// are equivalent to the stored one.
    fn store(&mut self, snapshot: ClusterSnapshot) {
        if self.clusters.get(&snapshot.name) == Some(&snapshot) {
            debug!(cluster = %snapshot.name, "Ignoring equivalent snapshot");
            return;
        }
        debug!(
            cluster = %snapshot.name,
            ingresses = snapshot.ingresses.len(),
            backends = snapshot.backends.len(),
            "Cluster state changed"
        );
        self.clusters.insert(snapshot.name.clone(), snapshot);
        self.dirty = true;
    }

    /// Rebuilds the routing tables, renders, writes, and reloads.
    async fn apply(&mut self) -> Result<()> {
        let info = TemplateInfo::build(&self.clusters, &self.certificates, &self.ips);
        for host in info.uncovered_hosts() {
            warn!(host = %host, "No certificate matches host");
        }

        let rendered = self
            .template
            .get_template(TEMPLATE_NAME)
            .context("template vanished from the environment")?
            .render(&info)
            .context("couldn't render haproxy template")?;
        self.write(&rendered)
            .with_context(|| format!("couldn't write {}", self.dropin_path.display()))?;
        info!(
            path = %self.dropin_path.display(),
            hosts = info.host_to_backend.len(),
            certificates = info.sni.len(),
            "Wrote haproxy drop-in"
        );

        match &self.debug_file_events {
            Some(events) => {
                let _ = events.send(()).await;
            }
            None => self.reload().await?,
        }
        Ok(())
    }

    fn write(&self, rendered: &str) -> std::io::Result<()> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(DROPIN_MODE)
            .open(&self.dropin_path)?;
        file.write_all(rendered.as_bytes())
    }

    async fn reload(&self) -> Result<()> {
        let status = Command::new("systemctl")
            .args(["reload", "haproxy.service"])
            .status()
            .await
            .context("couldn't run systemctl")?;
        if !status.success() {
            bail!("haproxy reload exited with {}", status);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use multigress_core::{Backend, Ingress};
    use std::path::Path;

    const TEMPLATE_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/../etc/haproxy.cfg.tmpl");

    fn mk_config(dropin: &Path) -> Config {
        Config {
            haproxy_template_path: TEMPLATE_PATH.into(),
            haproxy_dropin_path: dropin.to_owned(),
            haproxy_dropin_mode: None,
            clusters: Vec::new(),
            certificates: vec![
                Certificate {
                    name: "dummycert".to_string(),
                    path: "/etc/ssl/dummy.pem".into(),
                    domains: vec!["*.example.org".to_string()],
                },
                Certificate {
                    name: "dummycert2".to_string(),
                    path: "/etc/ssl/dummy.pem".into(),
                    domains: vec!["doc.example.org".to_string(), "foo.example.org".to_string()],
                },
            ],
            ips: vec!["127.0.0.1".parse().unwrap()],
        }
    }

    fn mk_snapshot() -> ClusterSnapshot {
        ClusterSnapshot {
            name: "default".to_string(),
            ingresses: vec![
                Ingress {
                    name: "example-ingress".to_string(),
                    hosts: vec!["test.example.org".to_string()],
                },
                Ingress {
                    name: "example2-ingress".to_string(),
                    hosts: vec!["foo.example.org".to_string()],
                },
            ],
            backends: vec![Backend {
                name: "foobar".to_string(),
                ip: "127.0.0.1".parse().unwrap(),
            }],
        }
    }

    struct Harness {
        snapshots: mpsc::Sender<ClusterSnapshot>,
        file_events: mpsc::Receiver<()>,
        stop: watch::Sender<bool>,
        task: tokio::task::JoinHandle<Result<()>>,
        dropin: PathBuf,
    }

    fn mk_harness(name: &str) -> Harness {
        let dropin = std::env::temp_dir().join(format!("multigress-dropin-{}.cfg", name));
        let _ = fs::remove_file(&dropin);
        let (snapshot_tx, snapshot_rx) = mpsc::channel(8);
        let (event_tx, file_events) = mpsc::channel(8);
        let (stop, stop_rx) = watch::channel(false);
        let mut handler = Handler::new(&mk_config(&dropin), snapshot_rx).unwrap();
        handler.debug_file_events = Some(event_tx);
        let task = tokio::spawn(handler.run(stop_rx));
        Harness {
            snapshots: snapshot_tx,
            file_events,
            stop,
            task,
            dropin,
        }
    }

    impl Harness {
        async fn shutdown(mut self) {
            let _ = self.stop.send(true);
            self.task.await.unwrap().unwrap();
            let _ = fs::remove_file(&self.dropin);
            self.file_events.close();
        }
    }

    #[tokio::test]
    async fn renders_and_writes_the_dropin() {
        let mut harness = mk_harness("renders");
        harness.snapshots.send(mk_snapshot()).await.unwrap();

        time::timeout(Duration::from_secs(5), harness.file_events.recv())
            .await
            .expect("the handler should write within one tick")
            .unwrap();
        let metadata = fs::metadata(&harness.dropin).unwrap();
        assert!(metadata.len() >= 100, "generated file should not be trivial");

        harness.shutdown().await;
    }

    #[tokio::test]
    async fn equivalent_snapshots_render_at_most_once() {
        let mut harness = mk_harness("coalesce");
        harness.snapshots.send(mk_snapshot()).await.unwrap();
        harness.snapshots.send(mk_snapshot()).await.unwrap();

        time::timeout(Duration::from_secs(5), harness.file_events.recv())
            .await
            .expect("the first update should render")
            .unwrap();
        let second = time::timeout(Duration::from_millis(2500), harness.file_events.recv()).await;
        assert!(second.is_err(), "an equivalent snapshot must not rerender");

        harness.shutdown().await;
    }

    #[tokio::test]
    async fn quiet_ticks_write_nothing() {
        let harness = mk_harness("quiet");
        time::sleep(Duration::from_millis(2500)).await;
        assert!(!harness.dropin.exists());
        harness.shutdown().await;
    }

    #[test]
    fn template_realises_the_routing_model() {
        let source = fs::read_to_string(TEMPLATE_PATH).unwrap();
        let mut env = Environment::new();
        env.add_template_owned(TEMPLATE_NAME.to_string(), source)
            .unwrap();

        let config = mk_config(Path::new("/dev/null"));
        let clusters: BTreeMap<String, ClusterSnapshot> =
            [("default".to_string(), mk_snapshot())].into();
        let info = TemplateInfo::build(&clusters, &config.certificates, &config.ips);
        let rendered = env
            .get_template(TEMPLATE_NAME)
            .unwrap()
            .render(&info)
            .unwrap();

        // Plain-HTTP stage.
        assert!(rendered.contains("bind 127.0.0.1:80"));
        assert!(rendered.contains("acl host-test.example.org hdr(host) -i test.example.org"));
        // TCP/SNI stage.
        assert!(rendered.contains("bind 127.0.0.1:443"));
        assert!(rendered.contains("tcp-request inspect-delay 5s"));
        assert!(rendered.contains("use_backend wrap-dummycert if { req_ssl_sni -i test.example.org }"));
        assert!(rendered.contains("default_backend wrap-dummycert"));
        // Wrap pair.
        assert!(rendered.contains("server loopback 127.0.0.1:12345 send-proxy-v2"));
        assert!(rendered.contains("bind 127.0.0.1:12345 ssl crt /etc/ssl/dummy.pem accept-proxy"));
        // Logical backend with health-checked endpoints.
        assert!(rendered.contains("backend default"));
        assert!(rendered.contains("balance source"));
        assert!(rendered.contains("hash-type consistent"));
        assert!(rendered.contains("server foobar 127.0.0.1:80 check"));
    }
}
