//! Thin semantic layer over the coordination service.
//!
//! Wraps a connected ZooKeeper handle with the session-scoped namespace,
//! the process identity, membership parties and the ready/stop watch
//! protocol. Recipes (lease, locking queue, party, counter) live in the
//! submodules and are handed out by [`SessionClient`] factories.
//!
//! Connection loss is deliberately not retried here: the coordination
//! service's session expiry releases leases and ephemeral registrations on
//! its own, and a process that lost its session must not keep acting on
//! stale state.

pub mod counter;
pub mod lock;
pub mod party;
pub mod queue;

use anyhow::{bail, Context};
use std::collections::HashMap;
use zookeeper_client as zk;

use crate::config::ConnectConfig;
use crate::identity::Identity;

/// Fixed namespace prefix all coordination nodes live under.
pub const BASE_NODE: &str = "/zkmirror";

/// Party joined by every participant.
pub const PARTY_ALL: &str = "all";
/// Party joined by source processes.
pub const PARTY_SOURCES: &str = "sources";
/// Party joined by destination processes.
pub const PARTY_DESTS: &str = "dests";

/// Queue of encoded work units to transfer.
pub const QUEUE_PATHS: &str = "pathQueue";
/// Queue of destination endpoint advertisements.
pub const QUEUE_DESTS: &str = "destQueue";
/// Queue of successfully transferred units.
pub const QUEUE_COMPLETED: &str = "completedQueue";
/// Queue of units that exhausted their transfer attempts.
pub const QUEUE_FAILED: &str = "failedQueue";
/// Queue of captured transfer output awaiting the final report.
pub const QUEUE_OUTPUT: &str = "outputQueue";

/// Value of a freshly created ready watch.
const WATCH_START: &str = "start";
/// Value signalling that the run is complete.
const WATCH_STOP: &str = "stop";

pub(crate) fn persistent() -> zk::CreateOptions<'static> {
    zk::CreateMode::Persistent.with_acls(zk::Acls::anyone_all())
}

pub(crate) fn ephemeral() -> zk::CreateOptions<'static> {
    zk::CreateMode::Ephemeral.with_acls(zk::Acls::anyone_all())
}

pub(crate) fn persistent_sequential() -> zk::CreateOptions<'static> {
    zk::CreateMode::PersistentSequential.with_acls(zk::Acls::anyone_all())
}

/// Map a logical name onto the namespace. Absolute paths must already live
/// under [`BASE_NODE`]; bare relative names are appended to it.
pub fn resolve_path(path: &str) -> anyhow::Result<String> {
    if path.starts_with(BASE_NODE) {
        Ok(path.to_string())
    } else if path.starts_with('/') {
        bail!("path {path} is not under {BASE_NODE}");
    } else {
        Ok(format!("{BASE_NODE}/{path}"))
    }
}

/// One process's connection to a replication session.
pub struct SessionClient {
    client: zk::Client,
    session: String,
    identity: Identity,
    parties: HashMap<String, party::Party>,
}

impl SessionClient {
    /// Connect to the ensemble and join the given membership parties.
    pub async fn connect(
        cfg: &ConnectConfig,
        identity: Identity,
        parties: &[&str],
    ) -> anyhow::Result<Self> {
        let mut connector = zk::Client::connector();
        connector.session_timeout(std::time::Duration::from_secs(30));
        if let Some((user, pass)) = &cfg.credentials {
            connector.auth("digest".to_string(), format!("{user}:{pass}").into_bytes());
        }
        let client = connector
            .connect(&cfg.servers.join(","))
            .await
            .with_context(|| format!("failed to connect to {:?}", cfg.servers))?;
        tracing::debug!("coordination client connected as {identity}");
        let mut session = SessionClient {
            client,
            session: cfg.session.clone(),
            identity,
            parties: HashMap::new(),
        };
        session.join_parties(parties).await?;
        Ok(session)
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Absolute path of a session-scoped node.
    pub fn node(&self, relative: &str) -> String {
        format!("{BASE_NODE}/{}/{relative}", self.session)
    }

    async fn join_parties(&mut self, names: &[&str]) -> anyhow::Result<()> {
        if names.is_empty() {
            tracing::debug!("no parties to join");
            return Ok(());
        }
        tracing::debug!("joining {} parties: {}", names.len(), names.join(", "));
        for name in names {
            let party = party::Party::new(
                self.client.clone(),
                self.node(&format!("parties/{name}")),
                self.identity.to_string(),
            );
            party.join().await?;
            self.parties.insert(name.to_string(), party);
        }
        Ok(())
    }

    pub async fn party_members(&self, name: &str) -> anyhow::Result<Vec<String>> {
        match self.parties.get(name) {
            Some(party) => party.members().await,
            None => {
                // parties we did not join can still be inspected
                party::Party::new(
                    self.client.clone(),
                    self.node(&format!("parties/{name}")),
                    self.identity.to_string(),
                )
                .members()
                .await
            }
        }
    }

    pub async fn party_len(&self, name: &str) -> anyhow::Result<usize> {
        Ok(self.party_members(name).await?.len())
    }

    pub async fn member_of(&self, name: &str, identity: &str) -> anyhow::Result<bool> {
        Ok(self
            .party_members(name)
            .await?
            .iter()
            .any(|member| member == identity))
    }

    /// Exclusive lease scoped to this session.
    pub fn lock(&self, name: &str, contender: &str) -> lock::Lease {
        lock::Lease::new(self.client.clone(), self.node(name), contender.to_string())
    }

    /// Locking queue scoped to this session.
    pub fn queue(&self, name: &str) -> queue::LockingQueue {
        queue::LockingQueue::new(self.client.clone(), self.node(name))
    }

    /// Distributed counter at a logical name. Relative names are scoped to
    /// this session; absolute paths must already live inside the namespace.
    pub fn counter(&self, name: &str) -> anyhow::Result<counter::Counter> {
        let path = if name.starts_with('/') {
            resolve_path(name)?
        } else {
            resolve_path(&format!("{}/{name}", self.session))?
        };
        Ok(counter::Counter::new(self.client.clone(), path))
    }

    pub async fn ensure_path(&self, path: &str) -> anyhow::Result<()> {
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            match self.client.create(&current, &[], &persistent()).await {
                Ok(_) | Err(zk::Error::NodeExists) => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("failed to create node {current}"))
                }
            }
        }
        Ok(())
    }

    /// Create a node, failing if it already exists.
    pub async fn create_node(
        &self,
        path: &str,
        value: &str,
        ephemeral_node: bool,
    ) -> anyhow::Result<()> {
        let options = if ephemeral_node {
            ephemeral()
        } else {
            persistent()
        };
        match self.client.create(path, value.as_bytes(), &options).await {
            Ok(_) => {
                tracing::debug!("created node {path}");
                Ok(())
            }
            Err(zk::Error::NodeExists) => bail!("node {path} already exists"),
            Err(zk::Error::NoNode) => bail!("parent node(s) of {path} missing"),
            Err(e) => Err(e).with_context(|| format!("failed to create node {path}")),
        }
    }

    /// Create a node if absent; returns false if it already existed.
    pub async fn create_if_absent(
        &self,
        path: &str,
        value: &str,
        ephemeral_node: bool,
    ) -> anyhow::Result<bool> {
        let options = if ephemeral_node {
            ephemeral()
        } else {
            persistent()
        };
        match self.client.create(path, value.as_bytes(), &options).await {
            Ok(_) => Ok(true),
            Err(zk::Error::NodeExists) => Ok(false),
            Err(e) => Err(e).with_context(|| format!("failed to create node {path}")),
        }
    }

    pub async fn exists(&self, path: &str) -> anyhow::Result<bool> {
        Ok(self
            .client
            .check_stat(path)
            .await
            .with_context(|| format!("failed to check node {path}"))?
            .is_some())
    }

    /// Read a node's value; `None` when the node does not exist.
    pub async fn get_str(&self, path: &str) -> anyhow::Result<Option<String>> {
        match self.client.get_data(path).await {
            Ok((data, _)) => Ok(Some(String::from_utf8_lossy(&data).into_owned())),
            Err(zk::Error::NoNode) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read node {path}")),
        }
    }

    pub async fn set_str(&self, path: &str, value: &str) -> anyhow::Result<()> {
        self.client
            .set_data(path, value.as_bytes(), None)
            .await
            .with_context(|| format!("failed to write node {path}"))?;
        Ok(())
    }

    /// Delete a node, tolerating its absence.
    pub async fn delete_node(&self, path: &str) -> anyhow::Result<()> {
        match self.client.delete(path, None).await {
            Ok(()) | Err(zk::Error::NoNode) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to delete node {path}")),
        }
    }

    /// Delete a subtree bottom-up.
    pub async fn delete_recursive(&self, path: &str) -> anyhow::Result<()> {
        let children = match self.client.list_children(path).await {
            Ok(children) => children,
            Err(zk::Error::NoNode) => return Ok(()),
            Err(e) => return Err(e).with_context(|| format!("failed to list node {path}")),
        };
        for child in children {
            Box::pin(self.delete_recursive(&format!("{path}/{child}"))).await?;
        }
        self.delete_node(path).await
    }

    fn watch_node(&self) -> String {
        self.node("watch/ready")
    }

    /// Start the ready watch other participants register on. Returns false
    /// if the node already exists, which indicates an unclean prior run that
    /// the caller must reconcile before retrying.
    pub async fn start_ready_watch(&self) -> anyhow::Result<bool> {
        self.ensure_path(&self.node("watch")).await?;
        let path = self.watch_node();
        if !self.create_if_absent(&path, WATCH_START, false).await? {
            tracing::error!("watch node {path} already exists");
            return Ok(false);
        }
        Ok(true)
    }

    /// Flip the ready watch to "stop", telling all participants to wind down.
    pub async fn signal_stop(&self) -> anyhow::Result<()> {
        self.set_str(&self.watch_node(), WATCH_STOP).await
    }

    /// Remove the ready watch node. Only valid once all parties confirmed
    /// disconnect.
    pub async fn remove_ready_watch(&self) -> anyhow::Result<()> {
        self.delete_node(&self.watch_node()).await
    }

    /// Register on the ready watch. The returned channel flips to `true`
    /// exactly once, when the stop signal is observed. The watcher task does
    /// nothing but post that one event; all control flow stays with the
    /// owning loop.
    pub fn subscribe_stop(&self) -> tokio::sync::watch::Receiver<bool> {
        let (tx, rx) = tokio::sync::watch::channel(false);
        let client = self.client.clone();
        let path = self.watch_node();
        tokio::spawn(async move {
            loop {
                if tx.is_closed() {
                    return;
                }
                match client.get_and_watch_data(&path).await {
                    Ok((data, _, watcher)) => {
                        if data == WATCH_STOP.as_bytes() {
                            tracing::debug!("stop signal observed on {path}");
                            let _ = tx.send(true);
                            return;
                        }
                        watcher.changed().await;
                    }
                    Err(zk::Error::NoNode) => {
                        // watch node not created yet; wait for it to appear
                        match client.check_and_watch_stat(&path).await {
                            Ok((Some(_), _)) => continue,
                            Ok((None, watcher)) => {
                                watcher.changed().await;
                            }
                            Err(e) => {
                                tracing::warn!("stop watch on {path} failed: {e}");
                                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!("stop watch on {path} failed: {e}");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            }
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_keeps_namespaced_paths() {
        let path = format!("{BASE_NODE}/run1/lock");
        assert_eq!(resolve_path(&path).unwrap(), path);
    }

    #[test]
    fn resolve_appends_relative_names() {
        assert_eq!(
            resolve_path("run1/lock").unwrap(),
            format!("{BASE_NODE}/run1/lock")
        );
    }

    #[test]
    fn resolve_rejects_namespace_escapes() {
        assert!(resolve_path("/etc/passwd").is_err());
        assert!(resolve_path("/admin/other").is_err());
    }
}
