//! Destination health states.
//!
//! Every destination keeps an ephemeral state node under `dests/`; its value
//! moves between active, paused and disabled. The destination itself pauses
//! and reactivates based on base path reachability, while sources downgrade
//! a paused destination to disabled when they trip over it during dispatch.
//! All writes happen under a short shared lease so concurrent transitions
//! serialize instead of interleaving.
//!
//! The transition rules are pure functions; the board applies them against
//! the coordination service.

use anyhow::{bail, Context};
use std::time::Duration;

use crate::coord::SessionClient;

/// How long a state change waits for the shared lease.
const STATE_LOCK_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestState {
    Active,
    Paused,
    Disabled,
}

impl DestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DestState::Active => "active",
            DestState::Paused => "paused",
            DestState::Disabled => "disabled",
        }
    }

    /// Decode a state node value. Empty and unknown values read as "no state
    /// recorded yet".
    pub fn from_value(value: &str) -> Option<DestState> {
        match value {
            "active" => Some(DestState::Active),
            "paused" => Some(DestState::Paused),
            "disabled" => Some(DestState::Disabled),
            _ => None,
        }
    }
}

impl std::fmt::Display for DestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of reactivating a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// State moved to active; nothing else to do.
    Activated,
    /// State moved to active from disabled; the destination must advertise
    /// itself on the destination queue again, since sources dropped its old
    /// advertisement when they disabled it.
    Reenqueue,
    /// Already active.
    Ignored,
}

/// Outcome of a source probing a destination before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    Usable,
    /// The destination was paused; the prober downgraded it to disabled and
    /// must drop its queue advertisement.
    NotUsable,
    /// No state recorded or already disabled; the advertisement is stale.
    Unknown,
}

/// Only a live destination can pause. A node without a state was never
/// activated, and a paused or disabled destination stays down until it
/// reactivates itself.
pub fn pause_transition(old: Option<DestState>) -> Option<DestState> {
    match old {
        Some(DestState::Active) => Some(DestState::Paused),
        None | Some(DestState::Paused) | Some(DestState::Disabled) => None,
    }
}

pub fn activate_transition(old: Option<DestState>) -> Activation {
    match old {
        None | Some(DestState::Paused) => Activation::Activated,
        Some(DestState::Disabled) => Activation::Reenqueue,
        Some(DestState::Active) => Activation::Ignored,
    }
}

/// Probing is destructive for paused destinations: a source that finds one
/// paused marks it disabled so no other source wastes a dispatch on it.
pub fn probe_transition(old: Option<DestState>) -> Probe {
    match old {
        Some(DestState::Active) => Probe::Usable,
        Some(DestState::Paused) => Probe::NotUsable,
        None | Some(DestState::Disabled) => Probe::Unknown,
    }
}

/// View of the destination state nodes for one session.
pub struct DestStateBoard<'a> {
    session: &'a SessionClient,
}

impl<'a> DestStateBoard<'a> {
    pub fn new(session: &'a SessionClient) -> Self {
        DestStateBoard { session }
    }

    fn state_node(&self, identity: &str) -> String {
        self.session.node(&format!("dests/{identity}"))
    }

    /// Register this destination's state node. The node is ephemeral; a dead
    /// destination leaves no state behind.
    pub async fn register(&self, identity: &str) -> anyhow::Result<()> {
        self.session.ensure_path(&self.session.node("dests")).await?;
        self.session
            .create_if_absent(&self.state_node(identity), "", true)
            .await?;
        Ok(())
    }

    pub async fn state_of(&self, identity: &str) -> anyhow::Result<Option<DestState>> {
        Ok(self
            .session
            .get_str(&self.state_node(identity))
            .await?
            .as_deref()
            .and_then(DestState::from_value))
    }

    async fn with_lease<F, T>(&self, apply: F) -> anyhow::Result<T>
    where
        F: std::future::Future<Output = anyhow::Result<T>>,
    {
        let lease = self
            .session
            .lock("destslock", &self.session.identity().to_string());
        if !lease.acquire_wait(STATE_LOCK_WAIT).await? {
            bail!("timed out waiting for destination state lease");
        }
        let result = apply.await;
        lease.release().await?;
        result
    }

    /// Pause a destination whose base path went away.
    pub async fn pause(&self, identity: &str) -> anyhow::Result<()> {
        let node = self.state_node(identity);
        self.with_lease(async {
            let old = self.state_of(identity).await?;
            if let Some(next) = pause_transition(old) {
                tracing::warn!("destination {identity} paused");
                self.session.set_str(&node, next.as_str()).await?;
            }
            Ok(())
        })
        .await
    }

    /// Reactivate a destination whose base path came back.
    pub async fn activate(&self, identity: &str) -> anyhow::Result<Activation> {
        let node = self.state_node(identity);
        self.with_lease(async {
            let old = self.state_of(identity).await?;
            let outcome = activate_transition(old);
            if outcome != Activation::Ignored {
                tracing::info!("destination {identity} active");
                self.session
                    .set_str(&node, DestState::Active.as_str())
                    .await?;
            }
            Ok(outcome)
        })
        .await
    }

    /// Probe a destination before dispatching to it, downgrading paused
    /// destinations to disabled.
    pub async fn probe(&self, identity: &str) -> anyhow::Result<Probe> {
        let node = self.state_node(identity);
        self.with_lease(async {
            let old = self.state_of(identity).await?;
            let outcome = probe_transition(old);
            if outcome == Probe::NotUsable {
                tracing::warn!("destination {identity} disabled");
                self.session
                    .set_str(&node, DestState::Disabled.as_str())
                    .await
                    .with_context(|| format!("failed to disable destination {identity}"))?;
            }
            Ok(outcome)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_destination_activates() {
        assert_eq!(activate_transition(None), Activation::Activated);
    }

    #[test]
    fn pause_only_moves_live_destinations() {
        // never-activated destinations keep their empty state
        assert_eq!(pause_transition(None), None);
        assert_eq!(
            pause_transition(Some(DestState::Active)),
            Some(DestState::Paused)
        );
        assert_eq!(pause_transition(Some(DestState::Paused)), None);
        assert_eq!(pause_transition(Some(DestState::Disabled)), None);
    }

    #[test]
    fn reactivation_after_disable_requires_reenqueue() {
        assert_eq!(
            activate_transition(Some(DestState::Disabled)),
            Activation::Reenqueue
        );
        assert_eq!(
            activate_transition(Some(DestState::Paused)),
            Activation::Activated
        );
        assert_eq!(
            activate_transition(Some(DestState::Active)),
            Activation::Ignored
        );
    }

    #[test]
    fn probe_downgrades_paused() {
        assert_eq!(probe_transition(Some(DestState::Active)), Probe::Usable);
        assert_eq!(probe_transition(Some(DestState::Paused)), Probe::NotUsable);
        assert_eq!(probe_transition(Some(DestState::Disabled)), Probe::Unknown);
        assert_eq!(probe_transition(None), Probe::Unknown);
    }

    #[test]
    fn pause_disable_activate_sequence() {
        // unreachable path pauses, dispatch probe disables, recovery requires
        // a fresh advertisement
        let paused = pause_transition(Some(DestState::Active));
        assert_eq!(paused, Some(DestState::Paused));
        assert_eq!(probe_transition(paused), Probe::NotUsable);
        assert_eq!(
            activate_transition(Some(DestState::Disabled)),
            Activation::Reenqueue
        );
    }

    #[test]
    fn state_values_round_trip() {
        for state in [DestState::Active, DestState::Paused, DestState::Disabled] {
            assert_eq!(DestState::from_value(state.as_str()), Some(state));
        }
        assert_eq!(DestState::from_value(""), None);
        assert_eq!(DestState::from_value("bogus"), None);
    }
}
