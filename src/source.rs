//! Source role: leader election, queue seeding, dispatch, termination.
//!
//! Every source process races for the session lease once at startup. The
//! winner partitions the tree, seeds the path queue and manages the run to
//! completion; losers turn into workers that claim units off the path queue
//! and push them to destination daemons until the stop signal arrives. A
//! process never changes role mid-run.

use anyhow::{bail, Context};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

use crate::config::SourceConfig;
use crate::coord::lock::Lease;
use crate::coord::queue::{HeldEntry, LockingQueue, PRIORITY_REQUEUE};
use crate::coord::{self, SessionClient};
use crate::destination::Advertisement;
use crate::deststate::{DestStateBoard, Probe};
use crate::identity::Identity;
use crate::rsync::{self, RsyncInvoker};
use crate::stats::StatsAggregator;
use crate::walk::{self, WalkFilter, WorkUnit};

/// How long a worker waits on a queue before rechecking the stop flag, and
/// how long it backs off after failing to acquire a destination.
const DEST_WAIT: Duration = Duration::from_secs(5);
/// Leader progress and membership poll interval.
const POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Pause before rechecking an unreachable base path.
const PATH_RECHECK_WAIT: Duration = Duration::from_secs(20);
/// Destination acquisition tries per dispatch attempt.
const DEST_TRIES: u32 = 3;

/// Exit code of status mode when no run is in progress.
pub const NO_ACTIVE_SESSION: i32 = 14;

/// Final per-run accounting, persisted to the done-file.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RunSummary {
    pub unfinished: usize,
    pub failed: usize,
    pub completed: usize,
}

/// How one claimed work unit resolved.
enum Dispatch {
    Completed,
    Failed,
    /// No usable destination; the unit went back onto the path queue ahead
    /// of fresh entries.
    Requeued,
}

pub struct SourceCoordinator {
    session: SessionClient,
    cfg: SourceConfig,
    invoker: RsyncInvoker,
    lock: Lease,
    path_queue: LockingQueue,
    dest_queue: LockingQueue,
    completed_queue: LockingQueue,
    failed_queue: LockingQueue,
    output_queue: LockingQueue,
    stats: StatsAggregator,
}

impl SourceCoordinator {
    pub async fn new(session: SessionClient, cfg: SourceConfig) -> anyhow::Result<Self> {
        cfg.validate()?;
        let invoker = RsyncInvoker::new(&cfg.base_path, session.session(), cfg.rsync.clone());
        let lock = session.lock("lock", &session.identity().to_string());
        let stats = StatsAggregator::new(&session).await?;
        Ok(SourceCoordinator {
            invoker,
            lock,
            path_queue: session.queue(coord::QUEUE_PATHS),
            dest_queue: session.queue(coord::QUEUE_DESTS),
            completed_queue: session.queue(coord::QUEUE_COMPLETED),
            failed_queue: session.queue(coord::QUEUE_FAILED),
            output_queue: session.queue(coord::QUEUE_OUTPUT),
            stats,
            session,
            cfg,
        })
    }

    /// Race for the lease and settle into the winning role.
    pub async fn run(&self) -> anyhow::Result<()> {
        if self.lock.try_acquire().await? {
            let summary = self.lead().await?;
            if let Some(path) = &self.cfg.done_file {
                write_done_file(path, &summary)?;
            }
            tracing::info!(
                "run complete: {} completed, {} failed, {} unfinished",
                summary.completed,
                summary.failed,
                summary.unfinished
            );
        } else {
            self.follow().await?;
        }
        Ok(())
    }

    async fn lead(&self) -> anyhow::Result<RunSummary> {
        tracing::info!(
            "{} leading session {}",
            self.session.identity(),
            self.session.session()
        );
        if !self.session.start_ready_watch().await? {
            if self.session.party_len(coord::PARTY_ALL).await? == 1 {
                tracing::warn!("previous run ended uncleanly, clearing session state");
                self.cleanup().await?;
                self.lock.release().await?;
                bail!("stale session state cleared, rerun to start a fresh session");
            }
            bail!(
                "session {} already has live participants",
                self.session.session()
            );
        }
        // entries from an interrupted run must not leak into this one
        self.path_queue.delete().await?;

        let started = std::time::Instant::now();
        let units = self.partition().await?;
        tracing::info!(
            "partitioned {} into {} units in {:.2?}",
            self.cfg.base_path.display(),
            units.len(),
            started.elapsed()
        );
        for token in walk::encode_paths(&units) {
            self.path_queue.put(&token).await?;
        }

        let mut last_progress = None;
        loop {
            let todo = self.path_queue.len().await?;
            if todo == 0 {
                break;
            }
            let progress = (
                todo,
                self.completed_queue.len().await?,
                self.failed_queue.len().await?,
            );
            if last_progress != Some(progress) {
                tracing::info!(
                    "{todo} units outstanding, {} completed, {} failed; {} sources, {} dests",
                    progress.1,
                    progress.2,
                    self.session.party_len(coord::PARTY_SOURCES).await?,
                    self.session.party_len(coord::PARTY_DESTS).await?,
                );
                tracing::info!("transfer stats {}", self.stats.snapshot_json().await?);
                last_progress = Some(progress);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        tracing::info!("all units dispatched, signalling stop");
        self.session.signal_stop().await?;
        loop {
            let members = self.session.party_len(coord::PARTY_ALL).await?;
            if members <= 1 {
                break;
            }
            tracing::info!("waiting for {} participants to disconnect", members - 1);
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        let summary = self.cleanup().await?;
        self.lock.release().await?;
        Ok(summary)
    }

    /// Partition the tree off the runtime threads; deep trees mean a lot of
    /// blocking directory reads.
    async fn partition(&self) -> anyhow::Result<Vec<WorkUnit>> {
        let cfg = self.cfg.clone();
        tokio::task::spawn_blocking(move || {
            let filter = WalkFilter::new(cfg.exclude_re.as_deref(), cfg.exclude_user.as_deref())?;
            walk::get_pathlist(&cfg.base_path, cfg.depth, &filter, &cfg.subpath_overrides)
        })
        .await
        .context("partition task failed")?
    }

    /// Tear down all session state, reporting what every queue held. Runs
    /// only once all other participants are gone.
    async fn cleanup(&self) -> anyhow::Result<RunSummary> {
        let summary = RunSummary {
            unfinished: self.path_queue.len().await?,
            failed: self.failed_queue.len().await?,
            completed: self.completed_queue.len().await?,
        };
        for token in drain(&self.path_queue).await? {
            tracing::warn!("unit not transferred: {token}");
        }
        self.dest_queue.delete().await?;
        self.path_queue.delete().await?;

        tracing::info!("final transfer stats {}", self.stats.snapshot_json().await?);
        self.session
            .delete_recursive(&self.session.node("stats"))
            .await?;

        for token in drain(&self.failed_queue).await? {
            tracing::error!("unit failed: {token}");
        }
        for token in drain(&self.completed_queue).await? {
            tracing::debug!("unit completed: {token}");
        }
        for text in drain(&self.output_queue).await? {
            tracing::info!("transfer output:\n{text}");
        }
        self.failed_queue.delete().await?;
        self.completed_queue.delete().await?;
        self.output_queue.delete().await?;

        self.session.remove_ready_watch().await?;
        Ok(summary)
    }

    async fn follow(&self) -> anyhow::Result<()> {
        tracing::info!(
            "{} following leader {:?} in session {}",
            self.session.identity(),
            self.lock.holder().await?,
            self.session.session()
        );
        let mut stop_rx = self.session.subscribe_stop();
        loop {
            if *stop_rx.borrow() {
                break;
            }
            if self.cfg.verify_path && !self.cfg.base_path.is_dir() {
                tracing::warn!(
                    "base path {} not reachable, holding off",
                    self.cfg.base_path.display()
                );
                tokio::select! {
                    _ = tokio::time::sleep(PATH_RECHECK_WAIT) => {}
                    _ = stop_rx.changed() => {}
                }
                continue;
            }
            let Some(held) = self.path_queue.take(DEST_WAIT).await? else {
                continue;
            };
            let token = held.data.clone();
            let unit = match WorkUnit::decode(&token) {
                Ok(unit) => unit,
                Err(e) => {
                    tracing::error!("dropping malformed work unit: {e:#}");
                    self.path_queue.consume(&held).await?;
                    continue;
                }
            };
            if let Err(e) = rsync::unit_under_base(&unit, &self.cfg.base_path) {
                tracing::error!("{e:#}");
                self.failed_queue.put(&token).await?;
                self.path_queue.consume(&held).await?;
                continue;
            }
            match self.dispatch(&unit, &token).await? {
                Dispatch::Completed => {
                    self.completed_queue.put(&token).await?;
                    self.path_queue.consume(&held).await?;
                }
                Dispatch::Failed => {
                    self.failed_queue.put(&token).await?;
                    self.path_queue.consume(&held).await?;
                }
                Dispatch::Requeued => {
                    self.requeue(&held, &token).await?;
                    tokio::select! {
                        _ = tokio::time::sleep(DEST_WAIT) => {}
                        _ = stop_rx.changed() => {}
                    }
                }
            }
        }
        tracing::info!("stop signal received, leaving session");
        Ok(())
    }

    /// Put the unit back ahead of fresh entries, then drop the claim. The
    /// reversed order would open a window where the unit is in no queue.
    async fn requeue(&self, held: &HeldEntry, token: &str) -> anyhow::Result<()> {
        tracing::info!("no destination for {token}, requeueing");
        self.path_queue
            .put_with_priority(token, PRIORITY_REQUEUE)
            .await?;
        self.path_queue.consume(held).await
    }

    /// Try the transfer up to the configured attempt limit. Each attempt
    /// acquires a destination afresh; the advertisement goes back to the
    /// pool as soon as the transfer resolves, so one destination serves at
    /// most one transfer at a time.
    async fn dispatch(&self, unit: &WorkUnit, token: &str) -> anyhow::Result<Dispatch> {
        for attempt in 1..=self.cfg.attempts {
            let Some((held_dest, ad)) = self.acquire_destination().await? else {
                return Ok(Dispatch::Requeued);
            };
            let host = Identity::host_of(&ad.identity).to_string();
            tracing::info!(
                "transferring {} to {host}:{} (attempt {attempt}/{})",
                unit.path.display(),
                ad.port,
                self.cfg.attempts
            );
            let outcome = self.invoker.run_transfer(unit, &host, ad.port).await;
            self.dest_queue.release(&held_dest).await?;
            let outcome = outcome?;

            let output = if self.invoker.verbose() {
                let (listing, rest) = rsync::split_verbose_listing(&outcome.output);
                if let Some(listing) = listing {
                    tracing::info!("transferred files:\n{listing}");
                }
                rest
            } else {
                outcome.output
            };
            if outcome.success {
                for (name, value) in rsync::parse_stats(&output) {
                    self.stats.add(name, value).await?;
                }
                return Ok(Dispatch::Completed);
            }
            tracing::warn!(
                "transfer of {} to {host}:{} failed (attempt {attempt}/{})",
                unit.path.display(),
                ad.port,
                self.cfg.attempts
            );
            if !output.trim().is_empty() {
                self.output_queue
                    .put(&format!("{token}\n{output}"))
                    .await?;
            }
            if let Some(wait) = retry_pause(attempt, self.cfg.attempts) {
                tokio::time::sleep(wait).await;
            }
        }
        Ok(Dispatch::Failed)
    }

    /// Claim a live destination advertisement, trying a bounded number of
    /// times with a wait in between.
    async fn acquire_destination(
        &self,
    ) -> anyhow::Result<Option<(HeldEntry, Advertisement)>> {
        let board = DestStateBoard::new(&self.session);
        for attempt in 1..=DEST_TRIES {
            if let Some(found) = self.try_destination(&board).await? {
                return Ok(Some(found));
            }
            if attempt < DEST_TRIES {
                tokio::time::sleep(DEST_WAIT).await;
            }
        }
        tracing::warn!("still no destination after {DEST_TRIES} tries");
        Ok(None)
    }

    /// One destination queue take plus validation. Stale advertisements
    /// (dead destination, paused state, port mismatch) are consumed on sight
    /// so nobody trips over them again; a not-yet-activated destination is
    /// released back for later.
    async fn try_destination(
        &self,
        board: &DestStateBoard<'_>,
    ) -> anyhow::Result<Option<(HeldEntry, Advertisement)>> {
        let Some(held) = self.dest_queue.take(DEST_WAIT).await? else {
            tracing::debug!("destinations not yet available");
            return Ok(None);
        };
        let ad = match Advertisement::decode(&held.data) {
            Ok(ad) => ad,
            Err(e) => {
                tracing::error!("dropping malformed destination advertisement: {e:#}");
                self.dest_queue.consume(&held).await?;
                return Ok(None);
            }
        };
        if !self.session.member_of(coord::PARTY_ALL, &ad.identity).await? {
            tracing::warn!("destination {} is gone, dropping advertisement", ad.identity);
            self.dest_queue.consume(&held).await?;
            return Ok(None);
        }
        match board.probe(&ad.identity).await? {
            Probe::Usable => {}
            Probe::NotUsable => {
                tracing::warn!(
                    "destination {} was paused, dropping advertisement",
                    ad.identity
                );
                self.dest_queue.consume(&held).await?;
                return Ok(None);
            }
            Probe::Unknown => {
                tracing::debug!("destination {} has no state yet", ad.identity);
                self.dest_queue.release(&held).await?;
                return Ok(None);
            }
        }
        let reserved = self
            .session
            .get_str(&self.session.node(&format!("portmap/{}", ad.identity)))
            .await?;
        if reserved.as_deref() != Some(ad.port.to_string().as_str()) {
            tracing::warn!(
                "destination {} advertises port {} but reserved {reserved:?}",
                ad.identity,
                ad.port
            );
            self.dest_queue.consume(&held).await?;
            return Ok(None);
        }
        Ok(Some((held, ad)))
    }
}

/// Pause between failed transfer attempts; the last attempt gets none.
fn retry_pause(attempt: u32, attempts: u32) -> Option<Duration> {
    (attempt < attempts).then_some(DEST_WAIT)
}

/// Claim and consume every remaining entry, returning the payloads.
async fn drain(queue: &LockingQueue) -> anyhow::Result<Vec<String>> {
    let mut items = Vec::new();
    while let Some(held) = queue.take(Duration::ZERO).await? {
        queue.consume(&held).await?;
        items.push(held.data);
    }
    Ok(items)
}

/// Persist the final accounting record.
pub fn write_done_file(path: &Path, summary: &RunSummary) -> anyhow::Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("failed to create done-file {}", path.display()))?;
    serde_json::to_writer(file, summary)
        .with_context(|| format!("failed to write done-file {}", path.display()))?;
    Ok(())
}

/// Status probe: report run progress without participating. Returns the
/// process exit code.
pub async fn report_state(session: &SessionClient) -> anyhow::Result<i32> {
    let path_queue = session.queue(coord::QUEUE_PATHS);
    if !path_queue.node_exists().await? {
        tracing::info!("no active session {}", session.session());
        return Ok(NO_ACTIVE_SESSION);
    }
    let todo = path_queue.len().await?;
    if todo == 0 {
        tracing::info!("session {} has no outstanding units", session.session());
        return Ok(NO_ACTIVE_SESSION);
    }
    tracing::info!(
        "session {}: {todo} units outstanding, {} completed, {} failed",
        session.session(),
        session.queue(coord::QUEUE_COMPLETED).len().await?,
        session.queue(coord::QUEUE_FAILED).len().await?,
    );
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn done_file_is_flat_json() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("done.json");
        let summary = RunSummary {
            unfinished: 1,
            failed: 2,
            completed: 40,
        };
        write_done_file(&path, &summary).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, r#"{"unfinished":1,"failed":2,"completed":40}"#);
    }

    #[test]
    fn failed_transfers_back_off_between_attempts() {
        assert_eq!(retry_pause(1, 3), Some(DEST_WAIT));
        assert_eq!(retry_pause(2, 3), Some(DEST_WAIT));
        assert_eq!(retry_pause(3, 3), None);
        assert_eq!(retry_pause(1, 1), None);
    }
}
