//! Leader election client.
//!
//! Coordination is a lease object at a fixed path. Exactly one instance
//! holds the lease at a time; holding it means leadership. Transitions are
//! delivered to the reconciler as messages — leadership is a state with
//! entry/exit events, never a function that blocks for its duration.
//! Fencing is by session identity: the holder identity is unique per
//! process and verified before every renewal.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::Client;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;
use tracing::{info, warn};

/* ============================= CONFIG ============================= */

const LEASE_NAMESPACE: &str = "default";
const LEASE_DURATION_SECONDS: i32 = 15;
const LEASE_RENEW_INTERVAL: Duration = Duration::from_secs(5);
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
pub const BACKOFF_CAP: Duration = Duration::from_secs(30);

/* ============================= TRANSITIONS ============================= */

/// Leadership transition reported to the reconciler. The sequence is
/// monotonic: a `BecameLeader` is always eventually followed by a
/// `BecameFollower` (or process exit), never by a second `BecameLeader`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipTransition {
    BecameLeader,
    BecameFollower,
}

enum HoldOutcome {
    Lost,
    Shutdown,
}

/* ============================= ELECTOR ============================= */

pub struct Elector {
    leases: Api<Lease>,
    lease_name: String,
    identity: String,
    transitions: mpsc::UnboundedSender<LeadershipTransition>,
}

impl Elector {
    pub fn new(
        client: Client,
        lease_name: String,
        transitions: mpsc::UnboundedSender<LeadershipTransition>,
    ) -> Self {
        let host = env::var("HOSTNAME").unwrap_or_else(|_| "sdn-zerotrust".to_string());
        let identity = format!("{host}-{}", uuid::Uuid::new_v4());
        Self {
            leases: Api::namespaced(client, LEASE_NAMESPACE),
            lease_name,
            identity,
            transitions,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Run the election loop until shutdown. Never returns an error:
    /// coordination outages are reported as follower state and retried with
    /// exponential backoff, forever.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            lease = %self.lease_name,
            identity = %self.identity,
            "election_client_started"
        );

        let mut backoff = BACKOFF_INITIAL;
        loop {
            let acquired = tokio::select! {
                _ = shutdown.recv() => {
                    return;
                }
                result = self.try_acquire() => result,
            };

            match acquired {
                Ok(true) => {
                    backoff = BACKOFF_INITIAL;
                    info!(identity = %self.identity, "leadership_acquired");
                    let _ = self.transitions.send(LeadershipTransition::BecameLeader);

                    match self.hold(&mut shutdown).await {
                        HoldOutcome::Lost => {
                            info!("leadership_lost");
                            let _ = self.transitions.send(LeadershipTransition::BecameFollower);
                        }
                        HoldOutcome::Shutdown => {
                            self.release().await;
                            return;
                        }
                    }
                }
                Ok(false) => {
                    backoff = BACKOFF_INITIAL;
                    tokio::select! {
                        _ = shutdown.recv() => return,
                        _ = sleep(ACQUIRE_POLL_INTERVAL) => {}
                    }
                }
                Err(e) => {
                    warn!(error = %e, retry_in = ?backoff, "coordination_unreachable");
                    let _ = self.transitions.send(LeadershipTransition::BecameFollower);
                    tokio::select! {
                        _ = shutdown.recv() => return,
                        _ = sleep(backoff) => {}
                    }
                    backoff = next_backoff(backoff);
                }
            }
        }
    }

    /// Hold leadership by renewing the lease, verifying the holder identity
    /// before every renewal. Any renewal failure is treated as loss; the new
    /// leader reconciles authoritatively, so erring toward follower is safe.
    async fn hold(&self, shutdown: &mut broadcast::Receiver<()>) -> HoldOutcome {
        loop {
            tokio::select! {
                _ = shutdown.recv() => return HoldOutcome::Shutdown,
                _ = sleep(LEASE_RENEW_INTERVAL) => {
                    match self.renew().await {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!("lease_taken_by_other_holder");
                            return HoldOutcome::Lost;
                        }
                        Err(e) => {
                            warn!(error = %e, "lease_renewal_failed");
                            return HoldOutcome::Lost;
                        }
                    }
                }
            }
        }
    }

    /// One acquisition attempt: create a fresh lease, or take over an
    /// expired one. `Ok(false)` means another holder is alive.
    async fn try_acquire(&self) -> Result<bool> {
        let now = MicroTime(Utc::now());
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(LEASE_DURATION_SECONDS),
                acquire_time: Some(now.clone()),
                renew_time: Some(now),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        };

        match self.leases.create(&PostParams::default(), &lease).await {
            Ok(_) => return Ok(true),
            Err(kube::Error::Api(err)) if err.code == 409 => {}
            Err(e) => return Err(e).context("lease create failed"),
        }

        // Lease exists — claim it only if it is ours or expired.
        let existing = self
            .leases
            .get(&self.lease_name)
            .await
            .context("lease get failed")?;

        if !lease_is_claimable(existing.spec.as_ref(), &self.identity, Utc::now()) {
            return Ok(false);
        }

        let transitions = existing
            .spec
            .as_ref()
            .and_then(|s| s.lease_transitions)
            .unwrap_or(0)
            + 1;

        info!(lease = %self.lease_name, transitions, "lease_takeover");
        let now = MicroTime(Utc::now());
        let patch = serde_json::json!({
            "spec": {
                "holderIdentity": self.identity,
                "leaseDurationSeconds": LEASE_DURATION_SECONDS,
                "acquireTime": now,
                "renewTime": now,
                "leaseTransitions": transitions
            }
        });

        self.leases
            .patch(&self.lease_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .context("lease takeover failed")?;
        Ok(true)
    }

    /// Renew the lease. `Ok(false)` means the holder identity no longer
    /// matches ours — another instance fenced us out.
    async fn renew(&self) -> Result<bool> {
        let existing = self
            .leases
            .get(&self.lease_name)
            .await
            .context("lease get failed")?;

        let ours = existing
            .spec
            .as_ref()
            .and_then(|s| s.holder_identity.as_deref())
            == Some(self.identity.as_str());
        if !ours {
            return Ok(false);
        }

        let patch = serde_json::json!({
            "spec": { "renewTime": MicroTime(Utc::now()) }
        });
        self.leases
            .patch(&self.lease_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .context("lease renew failed")?;
        Ok(true)
    }

    /// Delete the lease on graceful shutdown so the next candidate does not
    /// have to wait out the expiry window. Only our own lease is deleted.
    async fn release(&self) {
        let ours = match self.leases.get(&self.lease_name).await {
            Ok(lease) => {
                lease
                    .spec
                    .as_ref()
                    .and_then(|s| s.holder_identity.as_deref())
                    == Some(self.identity.as_str())
            }
            Err(_) => false,
        };

        if ours {
            match self.leases.delete(&self.lease_name, &DeleteParams::default()).await {
                Ok(_) => info!(lease = %self.lease_name, "lease_released"),
                Err(e) => warn!(error = %e, "lease_release_failed"),
            }
        }
    }
}

/* ============================= DECISIONS ============================= */

/// Whether a lease can be claimed by `identity`: it is unowned, already
/// ours, or its renewal window has lapsed.
pub fn lease_is_claimable(
    spec: Option<&LeaseSpec>,
    identity: &str,
    now: DateTime<Utc>,
) -> bool {
    let Some(spec) = spec else {
        return true;
    };

    if spec.holder_identity.as_deref() == Some(identity) {
        return true;
    }

    spec.renew_time.as_ref().is_none_or(|t| {
        let duration_secs = spec.lease_duration_seconds.unwrap_or(LEASE_DURATION_SECONDS) as i64;
        now.signed_duration_since(t.0) > chrono::Duration::seconds(duration_secs)
    })
}

/// Exponential backoff step: doubles, capped.
pub fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(BACKOFF_CAP)
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(holder: Option<&str>, renewed_secs_ago: Option<i64>, duration: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: holder.map(str::to_string),
            lease_duration_seconds: Some(duration),
            renew_time: renewed_secs_ago
                .map(|s| MicroTime(Utc::now() - chrono::Duration::seconds(s))),
            ..Default::default()
        }
    }

    // ── lease_is_claimable ──

    #[test]
    fn test_missing_spec_is_claimable() {
        assert!(lease_is_claimable(None, "me", Utc::now()));
    }

    #[test]
    fn test_own_lease_is_claimable() {
        let s = spec(Some("me"), Some(0), 15);
        assert!(lease_is_claimable(Some(&s), "me", Utc::now()));
    }

    #[test]
    fn test_fresh_foreign_lease_is_not_claimable() {
        let s = spec(Some("other"), Some(2), 15);
        assert!(!lease_is_claimable(Some(&s), "me", Utc::now()));
    }

    #[test]
    fn test_expired_foreign_lease_is_claimable() {
        let s = spec(Some("other"), Some(60), 15);
        assert!(lease_is_claimable(Some(&s), "me", Utc::now()));
    }

    #[test]
    fn test_never_renewed_lease_is_claimable() {
        let s = spec(Some("other"), None, 15);
        assert!(lease_is_claimable(Some(&s), "me", Utc::now()));
    }

    // ── next_backoff ──

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut d = BACKOFF_INITIAL;
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(d.as_secs());
            d = next_backoff(d);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 30, 30]);
    }
}
