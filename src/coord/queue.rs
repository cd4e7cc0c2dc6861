//! Locking queue recipe.
//!
//! Entries are persistent sequential children of `{queue}/entries`, named
//! `entry-{priority:03}-{sequence}` so that a plain lexicographic sort
//! yields priority-then-FIFO order (lower priority number first). A holder
//! claims an entry by creating an ephemeral marker of the same name under
//! `{queue}/taken`: at most one holder can exist at a time, and the claim
//! evaporates with the holder's session, returning the entry to the pool.
//! An entry only leaves the queue when the holder consumes it.

use anyhow::Context;
use zookeeper_client as zk;

/// Default entry priority.
pub const PRIORITY_DEFAULT: u8 = 100;
/// Priority for re-enqueued work, sorted ahead of fresh entries.
pub const PRIORITY_REQUEUE: u8 = 50;

/// A claimed queue entry. The claim stays with this process until the entry
/// is consumed or released (or the session ends).
#[derive(Debug, Clone)]
pub struct HeldEntry {
    name: String,
    pub data: String,
}

fn entry_prefix(priority: u8) -> String {
    format!("entry-{priority:03}-")
}

pub struct LockingQueue {
    client: zk::Client,
    path: String,
}

impl LockingQueue {
    pub(crate) fn new(client: zk::Client, path: String) -> Self {
        LockingQueue { client, path }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn entries_path(&self) -> String {
        format!("{}/entries", self.path)
    }

    fn taken_path(&self) -> String {
        format!("{}/taken", self.path)
    }

    async fn ensure(&self) -> anyhow::Result<()> {
        for node in [
            self.path.clone(),
            self.entries_path(),
            self.taken_path(),
        ] {
            match self.client.create(&node, &[], &super::persistent()).await {
                Ok(_) | Err(zk::Error::NodeExists) => {}
                Err(zk::Error::NoNode) => {
                    anyhow::bail!("parent node(s) of queue {} missing", self.path)
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("failed to create queue node {node}"))
                }
            }
        }
        Ok(())
    }

    pub async fn put(&self, data: &str) -> anyhow::Result<()> {
        self.put_with_priority(data, PRIORITY_DEFAULT).await
    }

    pub async fn put_with_priority(&self, data: &str, priority: u8) -> anyhow::Result<()> {
        self.ensure().await?;
        let prefix = format!("{}/{}", self.entries_path(), entry_prefix(priority));
        self.client
            .create(&prefix, data.as_bytes(), &super::persistent_sequential())
            .await
            .with_context(|| format!("failed to enqueue onto {}", self.path))?;
        Ok(())
    }

    /// Number of entries still in the queue, claimed ones included.
    pub async fn len(&self) -> anyhow::Result<usize> {
        match self.client.list_children(&self.entries_path()).await {
            Ok(children) => Ok(children.len()),
            Err(zk::Error::NoNode) => Ok(0),
            Err(e) => Err(e).with_context(|| format!("failed to measure queue {}", self.path)),
        }
    }

    pub async fn is_empty(&self) -> anyhow::Result<bool> {
        Ok(self.len().await? == 0)
    }

    pub async fn node_exists(&self) -> anyhow::Result<bool> {
        Ok(self
            .client
            .check_stat(&self.path)
            .await
            .with_context(|| format!("failed to check queue {}", self.path))?
            .is_some())
    }

    /// Claim the first unclaimed entry, waiting up to `timeout` for one to
    /// appear. Returns `None` on timeout or when the queue node is gone.
    pub async fn take(&self, timeout: std::time::Duration) -> anyhow::Result<Option<HeldEntry>> {
        self.ensure().await?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let (mut children, _, watcher) = match self
                .client
                .get_and_watch_children(&self.entries_path())
                .await
            {
                Ok(listing) => listing,
                // queue torn down mid-run: the stop signal is imminent
                Err(zk::Error::NoNode) => return Ok(None),
                Err(e) => {
                    return Err(e).with_context(|| format!("failed to list queue {}", self.path))
                }
            };
            children.sort();
            for name in children {
                let marker = format!("{}/{name}", self.taken_path());
                match self.client.create(&marker, &[], &super::ephemeral()).await {
                    Ok(_) => {}
                    Err(zk::Error::NodeExists) => continue,
                    Err(e) => {
                        return Err(e)
                            .with_context(|| format!("failed to claim entry {name} on {}", self.path))
                    }
                }
                let entry = format!("{}/{name}", self.entries_path());
                match self.client.get_data(&entry).await {
                    Ok((data, _)) => {
                        return Ok(Some(HeldEntry {
                            name,
                            data: String::from_utf8_lossy(&data).into_owned(),
                        }))
                    }
                    Err(zk::Error::NoNode) => {
                        // consumed behind our back; drop the stale marker
                        let _ = self.client.delete(&marker, None).await;
                        continue;
                    }
                    Err(e) => {
                        return Err(e)
                            .with_context(|| format!("failed to read entry {name} on {}", self.path))
                    }
                }
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            // nothing claimable right now; wait for the entry set to change
            let _ = tokio::time::timeout(remaining, watcher.changed()).await;
        }
    }

    /// Remove a claimed entry from the queue for good.
    pub async fn consume(&self, held: &HeldEntry) -> anyhow::Result<()> {
        let entry = format!("{}/{}", self.entries_path(), held.name);
        match self.client.delete(&entry, None).await {
            Ok(()) | Err(zk::Error::NoNode) => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to consume entry {} on {}", held.name, self.path))
            }
        }
        self.drop_marker(held).await
    }

    /// Give a claimed entry back to the pool without consuming it.
    pub async fn release(&self, held: &HeldEntry) -> anyhow::Result<()> {
        self.drop_marker(held).await
    }

    async fn drop_marker(&self, held: &HeldEntry) -> anyhow::Result<()> {
        let marker = format!("{}/{}", self.taken_path(), held.name);
        match self.client.delete(&marker, None).await {
            Ok(()) | Err(zk::Error::NoNode) => Ok(()),
            Err(e) => Err(e)
                .with_context(|| format!("failed to unclaim entry {} on {}", held.name, self.path)),
        }
    }

    /// Tear the whole queue down, entries and claims included.
    pub async fn delete(&self) -> anyhow::Result<()> {
        for node in [self.entries_path(), self.taken_path(), self.path.clone()] {
            let children = match self.client.list_children(&node).await {
                Ok(children) => children,
                Err(zk::Error::NoNode) => continue,
                Err(e) => {
                    return Err(e).with_context(|| format!("failed to list queue node {node}"))
                }
            };
            for child in children {
                match self.client.delete(&format!("{node}/{child}"), None).await {
                    Ok(()) | Err(zk::Error::NoNode) => {}
                    Err(e) => {
                        return Err(e)
                            .with_context(|| format!("failed to delete queue child {child}"))
                    }
                }
            }
            match self.client.delete(&node, None).await {
                Ok(()) | Err(zk::Error::NoNode) => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("failed to delete queue node {node}"))
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_names_sort_priority_first() {
        let requeued = format!("{}{:010}", entry_prefix(PRIORITY_REQUEUE), 7);
        let fresh = format!("{}{:010}", entry_prefix(PRIORITY_DEFAULT), 3);
        let mut names = vec![fresh.clone(), requeued.clone()];
        names.sort();
        assert_eq!(names, vec![requeued, fresh]);
    }

    #[test]
    fn entry_names_sort_fifo_within_priority() {
        let a = format!("{}{:010}", entry_prefix(PRIORITY_DEFAULT), 11);
        let b = format!("{}{:010}", entry_prefix(PRIORITY_DEFAULT), 2);
        let mut names = vec![a.clone(), b.clone()];
        names.sort();
        assert_eq!(names, vec![b, a]);
    }
}
