//! Distributed monotonic counter recipe.
//!
//! The counter value is the node's data, updated through a compare-and-set
//! loop on the node version. Contending writers retry on version conflicts.

use anyhow::Context;
use zookeeper_client as zk;

pub struct Counter {
    client: zk::Client,
    path: String,
}

impl Counter {
    pub(crate) fn new(client: zk::Client, path: String) -> Self {
        Counter { client, path }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Create the counter node at zero if it does not exist yet.
    pub async fn ensure(&self) -> anyhow::Result<()> {
        match self
            .client
            .create(&self.path, b"0", &super::persistent())
            .await
        {
            Ok(_) | Err(zk::Error::NodeExists) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to create counter {}", self.path)),
        }
    }

    /// Add `delta` to the counter.
    pub async fn add(&self, delta: i64) -> anyhow::Result<()> {
        loop {
            let (data, stat) = self
                .client
                .get_data(&self.path)
                .await
                .with_context(|| format!("failed to read counter {}", self.path))?;
            let current: i64 = String::from_utf8_lossy(&data).trim().parse().unwrap_or(0);
            let next = (current + delta).to_string();
            match self
                .client
                .set_data(&self.path, next.as_bytes(), Some(stat.version))
                .await
            {
                Ok(_) => return Ok(()),
                // another writer got in first; re-read and retry
                Err(zk::Error::BadVersion) => continue,
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("failed to update counter {}", self.path))
                }
            }
        }
    }

    /// Current value; zero when the node does not exist.
    pub async fn value(&self) -> anyhow::Result<i64> {
        match self.client.get_data(&self.path).await {
            Ok((data, _)) => Ok(String::from_utf8_lossy(&data).trim().parse().unwrap_or(0)),
            Err(zk::Error::NoNode) => Ok(0),
            Err(e) => Err(e).with_context(|| format!("failed to read counter {}", self.path)),
        }
    }
}
