//! Membership party recipe.
//!
//! A party is a set of ephemeral children keyed by participant identity.
//! Entries vanish automatically when the owning session disconnects, so the
//! children listing always reflects live membership.

use anyhow::Context;
use zookeeper_client as zk;

pub struct Party {
    client: zk::Client,
    path: String,
    identity: String,
}

impl Party {
    pub(crate) fn new(client: zk::Client, path: String, identity: String) -> Self {
        Party {
            client,
            path,
            identity,
        }
    }

    /// Join the party under this process's identity. Idempotent.
    pub async fn join(&self) -> anyhow::Result<()> {
        let mut parent = String::new();
        for segment in self.path.split('/').filter(|s| !s.is_empty()) {
            parent.push('/');
            parent.push_str(segment);
            match self.client.create(&parent, &[], &super::persistent()).await {
                Ok(_) | Err(zk::Error::NodeExists) => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("failed to create party {parent}"))
                }
            }
        }
        let member = format!("{}/{}", self.path, self.identity);
        match self.client.create(&member, &[], &super::ephemeral()).await {
            Ok(_) | Err(zk::Error::NodeExists) => {
                tracing::debug!("joined party {}", self.path);
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("failed to join party {}", self.path)),
        }
    }

    /// Current live members.
    pub async fn members(&self) -> anyhow::Result<Vec<String>> {
        match self.client.list_children(&self.path).await {
            Ok(children) => Ok(children),
            Err(zk::Error::NoNode) => Ok(Vec::new()),
            Err(e) => Err(e).with_context(|| format!("failed to list party {}", self.path)),
        }
    }
}
