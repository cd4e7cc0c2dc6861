//! Distributed transfer statistics.
//!
//! One monotonic counter per recognized rsync metric, scoped to the session
//! and shared by all followers. The snapshot is a flat name→value map meant
//! for structured log emission; the session cleanup deletes the whole stats
//! subtree.

use std::collections::BTreeMap;

use crate::coord::{counter::Counter, SessionClient};

/// Metrics recognized in rsync `--stats` output, space-normalized.
pub const RSYNC_STATS: [&str; 9] = [
    "Number_of_files",
    "Number_of_files_transferred",
    "Total_file_size",
    "Total_transferred_file_size",
    "Literal_data",
    "Matched_data",
    "File_list_size",
    "Total_bytes_sent",
    "Total_bytes_received",
];

/// Normalize a raw stat label to its counter name, if recognized.
pub fn recognize(label: &str) -> Option<&'static str> {
    let normalized = label.trim().replace(' ', "_");
    RSYNC_STATS.iter().copied().find(|name| *name == normalized)
}

pub struct StatsAggregator {
    counters: BTreeMap<&'static str, Counter>,
}

impl StatsAggregator {
    /// Ensure the stats subtree and one counter per metric.
    pub async fn new(session: &SessionClient) -> anyhow::Result<Self> {
        session.ensure_path(&session.node("stats")).await?;
        let mut counters = BTreeMap::new();
        for name in RSYNC_STATS {
            let counter = session.counter(&format!("stats/{name}"))?;
            counter.ensure().await?;
            counters.insert(name, counter);
        }
        Ok(StatsAggregator { counters })
    }

    /// Add to a recognized metric. Unrecognized names were filtered out at
    /// parse time; hitting one here is a programming error upstream and is
    /// only logged.
    pub async fn add(&self, name: &str, delta: i64) -> anyhow::Result<()> {
        match self.counters.get(name) {
            Some(counter) => counter.add(delta).await,
            None => {
                tracing::debug!("metric not recognised: {name}");
                Ok(())
            }
        }
    }

    /// Current value of every counter.
    pub async fn snapshot(&self) -> anyhow::Result<BTreeMap<String, i64>> {
        let mut snapshot = BTreeMap::new();
        for (name, counter) in &self.counters {
            snapshot.insert(name.to_string(), counter.value().await?);
        }
        Ok(snapshot)
    }

    /// JSON rendering of the snapshot for progress logging.
    pub async fn snapshot_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(&self.snapshot().await?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognize_normalizes_spaces() {
        assert_eq!(recognize("Number of files"), Some("Number_of_files"));
        assert_eq!(recognize("Total bytes sent"), Some("Total_bytes_sent"));
        assert_eq!(recognize("  Literal data "), Some("Literal_data"));
    }

    #[test]
    fn recognize_rejects_unknown_labels() {
        assert_eq!(recognize("sent"), None);
        assert_eq!(recognize("Total bytes mangled"), None);
    }
}
