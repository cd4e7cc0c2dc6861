//! Exclusive lease recipe.
//!
//! A lease is a single ephemeral node; whoever creates it holds the lock
//! until it releases it or its session expires. The session lock must never
//! queue, so acquisition is non-blocking, with a bounded waiting variant
//! for short internal critical sections (port reservation, destination
//! state changes).

use anyhow::Context;
use zookeeper_client as zk;

pub struct Lease {
    client: zk::Client,
    path: String,
    contender: String,
}

impl Lease {
    pub(crate) fn new(client: zk::Client, path: String, contender: String) -> Self {
        Lease {
            client,
            path,
            contender,
        }
    }

    /// Attempt to take the lease without waiting. Returns immediately with
    /// success or failure.
    pub async fn try_acquire(&self) -> anyhow::Result<bool> {
        match self
            .client
            .create(&self.path, self.contender.as_bytes(), &super::ephemeral())
            .await
        {
            Ok(_) => {
                tracing::debug!("acquired lease {}", self.path);
                Ok(true)
            }
            Err(zk::Error::NodeExists) => Ok(false),
            Err(e) => Err(e).with_context(|| format!("failed to acquire lease {}", self.path)),
        }
    }

    /// Acquire the lease, waiting up to `timeout` for the current holder to
    /// let go. Returns false if the deadline passes first.
    pub async fn acquire_wait(&self, timeout: std::time::Duration) -> anyhow::Result<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.try_acquire().await? {
                return Ok(true);
            }
            let (stat, watcher) = self
                .client
                .check_and_watch_stat(&self.path)
                .await
                .with_context(|| format!("failed to watch lease {}", self.path))?;
            if stat.is_none() {
                // holder vanished between the create attempt and the watch
                continue;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            if tokio::time::timeout(remaining, watcher.changed())
                .await
                .is_err()
            {
                return Ok(false);
            }
        }
    }

    /// Release the lease. Tolerates the node already being gone, e.g. after
    /// a session expiry already evicted us.
    pub async fn release(&self) -> anyhow::Result<()> {
        match self.client.delete(&self.path, None).await {
            Ok(()) | Err(zk::Error::NoNode) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to release lease {}", self.path)),
        }
    }

    /// Identity of the current holder, if any.
    pub async fn holder(&self) -> anyhow::Result<Option<String>> {
        match self.client.get_data(&self.path).await {
            Ok((data, _)) => Ok(Some(String::from_utf8_lossy(&data).into_owned())),
            Err(zk::Error::NoNode) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to inspect lease {}", self.path)),
        }
    }
}
