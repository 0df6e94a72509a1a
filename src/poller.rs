//! Policy poller: periodically reloads the enabled policy set from the
//! repository while this instance is leader, and hands each snapshot to the
//! reconciler as a message. A failed fetch keeps the previous snapshot; the
//! next tick retries on schedule.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::reconcile::ReconcileInput;
use crate::repository::PolicyRepository;

pub async fn run(
    repository: Arc<dyn PolicyRepository>,
    interval: Duration,
    leader: watch::Receiver<bool>,
    inbox: mpsc::UnboundedSender<ReconcileInput>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(interval_secs = interval.as_secs(), "policy_poller_started");

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("policy_poller_stopped");
                return;
            }
            _ = ticker.tick() => {
                if !*leader.borrow() {
                    continue;
                }

                match repository.fetch_enabled().await {
                    Ok(policies) => {
                        metrics::POLICY_REFRESHES.inc();
                        debug!(policies = policies.len(), "policy_snapshot_fetched");
                        if inbox.send(ReconcileInput::PoliciesRefreshed(policies)).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        metrics::POLICY_REFRESH_ERRORS.inc();
                        warn!(error = %e, "policy_poll_failed");
                    }
                }
            }
        }
    }
}
