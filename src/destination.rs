//! Destination role: port reservation, daemon supervision, registration.
//!
//! A destination reserves a port on its host, runs the transfer daemon over
//! the base path and advertises its endpoint on the destination queue.
//! Supervision is a single select loop over the daemon's output, its exit
//! status, the stop signal and a periodic tick driving health checks and
//! the initial registration.

use anyhow::{bail, Context};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;

use crate::config::DestinationConfig;
use crate::coord::{self, SessionClient};
use crate::deststate::{Activation, DestStateBoard};
use crate::rsync;

/// Supervision tick interval.
const TICK_INTERVAL: Duration = Duration::from_secs(5);
/// Base path health check cadence, in ticks.
const HEALTH_EVERY: u64 = 10;
/// Ticks the daemon must survive before the endpoint is advertised.
const REGISTER_AFTER: u64 = 2;
/// How long a port reservation waits for the shared lease.
const PORT_LOCK_WAIT: Duration = Duration::from_secs(30);

/// An endpoint advertisement on the destination queue: `{port}:{identity}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub port: u16,
    pub identity: String,
}

impl Advertisement {
    pub fn encode(&self) -> String {
        format!("{}:{}", self.port, self.identity)
    }

    pub fn decode(token: &str) -> anyhow::Result<Self> {
        let Some((port, identity)) = token.split_once(':') else {
            bail!("malformed destination advertisement {token:?}");
        };
        let port = port
            .parse()
            .with_context(|| format!("malformed port in advertisement {token:?}"))?;
        if identity.is_empty() {
            bail!("empty identity in advertisement {token:?}");
        }
        Ok(Advertisement {
            port,
            identity: identity.to_string(),
        })
    }
}

/// Why a supervised daemon stopped running.
enum SupervisionEnd {
    /// Stop signal observed; the daemon was killed on purpose.
    Stopped,
    /// The daemon exited on its own.
    Died,
}

/// Fold one output read into the supervision state. Marks the stream
/// exhausted at EOF or on read failure; an exhausted stream resolves
/// immediately on every poll and must not be selected on again.
fn daemon_output_line(read: std::io::Result<Option<String>>, done: &mut bool) -> Option<String> {
    match read {
        Ok(Some(line)) => Some(line),
        Ok(None) => {
            *done = true;
            None
        }
        Err(e) => {
            tracing::debug!("daemon output read failed: {e}");
            *done = true;
            None
        }
    }
}

pub struct DestinationCoordinator {
    session: SessionClient,
    cfg: DestinationConfig,
}

impl DestinationCoordinator {
    pub fn new(session: SessionClient, cfg: DestinationConfig) -> anyhow::Result<Self> {
        cfg.validate()?;
        Ok(DestinationCoordinator { session, cfg })
    }

    /// Reserve a daemon port on this host. Claims are ephemeral nodes under
    /// `usedports/{host}`, taken under a shared lease so two destinations on
    /// one host never probe the same port concurrently.
    async fn reserve_port(&self) -> anyhow::Result<u16> {
        let identity = self.session.identity().to_string();
        let host = self.session.identity().host().to_string();
        let lease = self.session.lock("portlock", &identity);
        if !lease.acquire_wait(PORT_LOCK_WAIT).await? {
            bail!("timed out waiting for the port reservation lease");
        }
        let result = self.reserve_port_locked(&host, &identity).await;
        lease.release().await?;
        result
    }

    async fn reserve_port_locked(&self, host: &str, identity: &str) -> anyhow::Result<u16> {
        let host_node = self.session.node(&format!("usedports/{host}"));
        self.session.ensure_path(&host_node).await?;
        let port = match self.cfg.port {
            Some(port) => {
                // a fixed port is an operator promise; a live claim on it
                // means the deployment is wrong, not that we should move
                if self.session.exists(&format!("{host_node}/{port}")).await? {
                    bail!("port {port} on {host} is already claimed");
                }
                port
            }
            None => {
                let mut probe = self.cfg.start_port;
                loop {
                    if !self.session.exists(&format!("{host_node}/{probe}")).await? {
                        break probe;
                    }
                    probe = match probe.checked_add(1) {
                        Some(next) => next,
                        None => bail!("no free port on {host} above {}", self.cfg.start_port),
                    };
                }
            }
        };
        self.session
            .create_node(&format!("{host_node}/{port}"), identity, true)
            .await?;
        self.session
            .ensure_path(&self.session.node("portmap"))
            .await?;
        let portmap = self.session.node(&format!("portmap/{identity}"));
        if !self
            .session
            .create_if_absent(&portmap, &port.to_string(), true)
            .await?
        {
            self.session.set_str(&portmap, &port.to_string()).await?;
        }
        tracing::info!("reserved port {port} on {host}");
        Ok(port)
    }

    /// Run the daemon until the stop signal, relaunching it up to the
    /// configured attempt limit when it dies.
    pub async fn run(&self) -> anyhow::Result<()> {
        let identity = self.session.identity().to_string();
        let board = DestStateBoard::new(&self.session);
        board.register(&identity).await?;
        let port = self.reserve_port().await?;
        let module = rsync::module_name(self.session.session());
        let config = rsync::daemon_config(&module, &self.cfg.base_path)?;
        let ad = Advertisement {
            port,
            identity: identity.clone(),
        };
        let mut stop_rx = self.session.subscribe_stop();
        for attempt in 1..=self.cfg.attempts {
            if *stop_rx.borrow() {
                break;
            }
            tracing::info!(
                "starting transfer daemon on port {port} (attempt {attempt}/{})",
                self.cfg.attempts
            );
            match self
                .supervise_daemon(config.path(), port, &ad, &board, &mut stop_rx)
                .await?
            {
                SupervisionEnd::Stopped => {
                    tracing::info!("stop signal received, leaving session");
                    return Ok(());
                }
                SupervisionEnd::Died => {
                    tracing::warn!("transfer daemon exited unexpectedly");
                }
            }
        }
        if *stop_rx.borrow() {
            tracing::info!("stop signal received, leaving session");
            return Ok(());
        }
        bail!(
            "transfer daemon died {} times, giving up",
            self.cfg.attempts
        )
    }

    async fn supervise_daemon(
        &self,
        config: &std::path::Path,
        port: u16,
        ad: &Advertisement,
        board: &DestStateBoard<'_>,
        stop_rx: &mut tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<SupervisionEnd> {
        let mut child = rsync::daemon_command(config, port, self.cfg.drop_cache)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to spawn transfer daemon")?;
        let stdout = child
            .stdout
            .take()
            .context("daemon stdout not captured")?;
        let stderr = child
            .stderr
            .take()
            .context("daemon stderr not captured")?;
        let mut out_lines = tokio::io::BufReader::new(stdout).lines();
        let mut err_lines = tokio::io::BufReader::new(stderr).lines();
        let dest_queue = self.session.queue(coord::QUEUE_DESTS);

        let mut interval = tokio::time::interval(TICK_INTERVAL);
        let mut ticks: u64 = 0;
        let mut registered = false;
        let mut paused = false;
        let mut out_done = false;
        let mut err_done = false;
        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    child.kill().await.context("failed to kill transfer daemon")?;
                    return Ok(SupervisionEnd::Stopped);
                }
                read = out_lines.next_line(), if !out_done => {
                    if let Some(line) = daemon_output_line(read, &mut out_done) {
                        tracing::debug!("daemon: {line}");
                    }
                }
                read = err_lines.next_line(), if !err_done => {
                    if let Some(line) = daemon_output_line(read, &mut err_done) {
                        tracing::warn!("daemon: {line}");
                    }
                }
                status = child.wait() => {
                    let status = status.context("failed to reap transfer daemon")?;
                    tracing::warn!("transfer daemon exited with {status}");
                    return Ok(SupervisionEnd::Died);
                }
                _ = interval.tick() => {
                    // the first tick activates the state node so sources see
                    // us as usable before the advertisement goes out
                    if ticks % HEALTH_EVERY == 0 {
                        paused = self
                            .check_health(ad, board, &dest_queue, paused, registered)
                            .await?;
                    }
                    if !registered && !paused && ticks > REGISTER_AFTER {
                        dest_queue.put(&ad.encode()).await?;
                        tracing::info!("advertising endpoint {}", ad.encode());
                        registered = true;
                    }
                    ticks += 1;
                }
            }
        }
    }

    /// Couple the advertised state to base path reachability. Returns the
    /// new paused flag.
    async fn check_health(
        &self,
        ad: &Advertisement,
        board: &DestStateBoard<'_>,
        dest_queue: &coord::queue::LockingQueue,
        paused: bool,
        registered: bool,
    ) -> anyhow::Result<bool> {
        let base_ok = !self.cfg.verify_path || self.cfg.base_path.is_dir();
        if base_ok {
            if paused || !registered {
                if board.activate(&ad.identity).await? == Activation::Reenqueue {
                    // sources dropped the advertisement when they disabled us
                    dest_queue.put(&ad.encode()).await?;
                    tracing::info!("re-advertising endpoint {}", ad.encode());
                }
            }
            Ok(false)
        } else {
            if !paused {
                tracing::warn!(
                    "base path {} not reachable, pausing",
                    self.cfg.base_path.display()
                );
            }
            board.pause(&ad.identity).await?;
            Ok(true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advertisement_round_trip() {
        let ad = Advertisement {
            port: 4444,
            identity: "node1.example.net:4242".to_string(),
        };
        assert_eq!(ad.encode(), "4444:node1.example.net:4242");
        assert_eq!(Advertisement::decode(&ad.encode()).unwrap(), ad);
    }

    #[test]
    fn malformed_advertisements_rejected() {
        assert!(Advertisement::decode("no-separator").is_err());
        assert!(Advertisement::decode("notaport:host:1").is_err());
        assert!(Advertisement::decode("4444:").is_err());
    }

    #[test]
    fn daemon_output_eof_marks_stream_exhausted() {
        let mut done = false;
        assert_eq!(
            daemon_output_line(Ok(Some("connect from host".to_string())), &mut done),
            Some("connect from host".to_string())
        );
        assert!(!done);
        assert_eq!(daemon_output_line(Ok(None), &mut done), None);
        assert!(done);
    }

    #[test]
    fn daemon_output_error_marks_stream_exhausted() {
        let mut done = false;
        let err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        assert_eq!(daemon_output_line(Err(err), &mut done), None);
        assert!(done);
    }
}
