//! The reconciler: single serial consumer of every input source, owner of
//! the pod index and the policy cache, and the only component that mutates
//! switch rule tables.
//!
//! Every input lands in one inbox. Inputs arriving while a pass runs are
//! coalesced: they mark the state dirty and the follow-up pass reflects all
//! of them at once, bounding the work per burst. All rule writes are gated
//! on leadership; a transition observed mid-pass abandons the pass.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::election::LeadershipTransition;
use crate::metrics;
use crate::openflow::{FlowMatch, Role, ZT_COOKIE};
use crate::pods::{PodEvent, PodIndex, PodRecord};
use crate::policy::{Action, Ipv4Net, Policy};
use crate::repository::PolicyRepository;
use crate::switch::{SwitchEvent, SwitchManager};

/* ============================= INPUTS ============================= */

/// Everything that can reach the reconciler, serialized into one inbox.
#[derive(Debug)]
pub enum ReconcileInput {
    Leadership(LeadershipTransition),
    Pod(PodEvent),
    PodResync(Vec<PodRecord>),
    PoliciesRefreshed(Vec<Policy>),
    Switch(SwitchEvent),
    Shutdown,
}

/* ============================= DESIRED RULES ============================= */

/// One concrete rule the controller wants installed on every switch.
///
/// The derived ordering — policy id, then source, then destination — is the
/// order rules are installed in, so identical matches at equal priority
/// resolve deterministically across runs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DesiredRule {
    pub policy_id: String,
    pub src: Ipv4Net,
    pub dst: Ipv4Net,
    pub priority: u16,
}

/// Translate declarative intent into the concrete rule set: for every
/// enabled DENY policy, the cross product of its resolved source and
/// destination networks. ALLOW policies are not materialized; each is
/// logged once so the gap is visible.
pub fn compute_desired_rules(
    policies: &[Policy],
    pods: &PodIndex,
    allow_logged: &mut HashSet<String>,
) -> BTreeSet<DesiredRule> {
    let mut desired = BTreeSet::new();

    for policy in policies {
        if !policy.is_enabled() {
            continue;
        }
        if policy.action == Action::Allow {
            if allow_logged.insert(policy.id.clone()) {
                warn!(policy = %policy.id, name = %policy.name, "allow_policy_not_materialized");
            }
            continue;
        }

        let sources = pods.resolve(&policy.source);
        let destinations = pods.resolve(&policy.destination);
        if sources.is_empty() || destinations.is_empty() {
            continue;
        }

        for src in &sources {
            for dst in &destinations {
                desired.insert(DesiredRule {
                    policy_id: policy.id.clone(),
                    src: *src,
                    dst: *dst,
                    priority: policy.priority,
                });
            }
        }
    }

    desired
}

/* ============================= RECONCILER ============================= */

pub struct Reconciler {
    inbox: mpsc::UnboundedReceiver<ReconcileInput>,
    switches: Arc<SwitchManager>,
    repository: Arc<dyn PolicyRepository>,
    leader_tx: watch::Sender<bool>,
    ready: Arc<AtomicBool>,
    pods: PodIndex,
    policies: Vec<Policy>,
    leader: bool,
    dirty: bool,
    shutting_down: bool,
    allow_logged: HashSet<String>,
}

impl Reconciler {
    pub fn new(
        inbox: mpsc::UnboundedReceiver<ReconcileInput>,
        switches: Arc<SwitchManager>,
        repository: Arc<dyn PolicyRepository>,
        leader_tx: watch::Sender<bool>,
        ready: Arc<AtomicBool>,
    ) -> Self {
        Self {
            inbox,
            switches,
            repository,
            leader_tx,
            ready,
            pods: PodIndex::new(),
            policies: Vec::new(),
            leader: false,
            dirty: false,
            shutting_down: false,
            allow_logged: HashSet::new(),
        }
    }

    /// Consume the inbox until shutdown. Each iteration takes one input,
    /// drains whatever queued up behind it, then converges.
    pub async fn run(mut self) {
        info!("reconciler_started");

        while !self.shutting_down {
            let Some(input) = self.inbox.recv().await else {
                break;
            };
            self.apply(input).await;
            while let Ok(input) = self.inbox.try_recv() {
                self.apply(input).await;
            }

            self.ready.store(true, Ordering::Relaxed);

            // Inputs absorbed during a pass re-mark the dirty bit, giving at
            // most one follow-up pass per burst.
            while self.dirty && self.leader && !self.shutting_down {
                self.dirty = false;
                self.pass().await;
            }
            if !self.leader {
                self.dirty = false;
            }
        }

        info!("reconciler_stopped");
    }

    async fn apply(&mut self, input: ReconcileInput) {
        match input {
            ReconcileInput::Leadership(LeadershipTransition::BecameLeader) => {
                if self.leader {
                    return;
                }
                self.leader = true;
                metrics::IS_LEADER.set(1);
                let _ = self.leader_tx.send(true);
                info!("became_leader");

                self.switches.advise_role_all(Role::Master).await;
                self.refresh_policies().await;
                self.dirty = true;
            }
            ReconcileInput::Leadership(LeadershipTransition::BecameFollower) => {
                if !self.leader {
                    return;
                }
                self.leader = false;
                metrics::IS_LEADER.set(0);
                let _ = self.leader_tx.send(false);
                info!("became_follower");

                // Installed rules stay in place; the new leader reconciles
                // them authoritatively.
                self.switches.advise_role_all(Role::Slave).await;
            }
            ReconcileInput::Pod(event) => {
                metrics::POD_EVENTS.inc();
                debug!(kind = %event.kind, ip = %event.ip, "pod_event");
                self.pods.apply(&event);
                self.dirty = true;
            }
            ReconcileInput::PodResync(records) => {
                self.pods.replace_all(records);
                self.dirty = true;
            }
            ReconcileInput::PoliciesRefreshed(policies) => {
                debug!(policies = policies.len(), "policy_snapshot_received");
                self.policies = policies;
                self.dirty = true;
            }
            ReconcileInput::Switch(SwitchEvent::Connected(datapath_id)) => {
                debug!(datapath = format_args!("{datapath_id:#018x}"), "switch_joined");
                self.dirty = true;
            }
            ReconcileInput::Switch(SwitchEvent::Disconnected(datapath_id)) => {
                // Its rules died with the session; the desired set for the
                // remaining switches is unchanged.
                debug!(datapath = format_args!("{datapath_id:#018x}"), "switch_left");
            }
            ReconcileInput::Shutdown => {
                self.shutting_down = true;
            }
        }
    }

    /// Replace the policy cache from the repository. On error the previous
    /// snapshot is retained.
    async fn refresh_policies(&mut self) {
        match self.repository.fetch_enabled().await {
            Ok(policies) => {
                metrics::POLICY_REFRESHES.inc();
                info!(policies = policies.len(), "policy_cache_refreshed");
                self.policies = policies;
            }
            Err(e) => {
                metrics::POLICY_REFRESH_ERRORS.inc();
                warn!(error = %e, "policy_cache_refresh_failed");
            }
        }
    }

    /// One convergence pass: per switch, sweep every sentinel-tagged rule,
    /// then reinstall the desired set in deterministic order. The sweep is a
    /// single cookie-scoped delete, so rebuilding from scratch stays cheap
    /// at the target rule cardinality.
    async fn pass(&mut self) {
        let _timer = metrics::RECONCILE_DURATION.start_timer();

        let desired = compute_desired_rules(&self.policies, &self.pods, &mut self.allow_logged);
        metrics::DESIRED_RULES.set(desired.len() as i64);

        let switches = self.switches.list_switches().await;
        debug!(
            rules = desired.len(),
            switches = switches.len(),
            pods = self.pods.len(),
            policies = self.policies.len(),
            "reconcile_pass_started"
        );

        for switch in &switches {
            if self.absorb_pending().await {
                metrics::RECONCILE_ABANDONED.inc();
                warn!("reconcile_pass_abandoned");
                return;
            }

            if let Err(e) = switch.delete_by_cookie(ZT_COOKIE) {
                metrics::RULE_WRITE_ERRORS.inc();
                warn!(
                    datapath = format_args!("{:#018x}", switch.datapath_id),
                    error = %e,
                    "rule_sweep_failed"
                );
                continue;
            }

            for rule in &desired {
                let result = switch.install_rule(
                    rule.priority,
                    FlowMatch::ipv4_pair(rule.src, rule.dst),
                    Vec::new(),
                    ZT_COOKIE,
                );
                match result {
                    Ok(()) => metrics::RULES_INSTALLED.inc(),
                    // The next pass retries; per-rule failures never
                    // propagate.
                    Err(e) => {
                        metrics::RULE_WRITE_ERRORS.inc();
                        warn!(
                            datapath = format_args!("{:#018x}", switch.datapath_id),
                            policy = %rule.policy_id,
                            error = %e,
                            "rule_install_failed"
                        );
                    }
                }
            }
        }

        metrics::RECONCILE_PASSES.inc();
        info!(
            rules = desired.len(),
            switches = switches.len(),
            "reconcile_pass_complete"
        );
    }

    /// Drain inputs that arrived mid-pass. Returns true when the pass must
    /// be abandoned: leadership was lost or shutdown was requested.
    async fn absorb_pending(&mut self) -> bool {
        while let Ok(input) = self.inbox.try_recv() {
            self.apply(input).await;
        }
        self.shutting_down || !self.leader
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{PolicyStatus, Selector};
    use std::collections::BTreeMap;
    use std::net::Ipv4Addr;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn pod_index(pods: &[(&str, &[(&str, &str)])]) -> PodIndex {
        let mut index = PodIndex::new();
        index.replace_all(
            pods.iter()
                .map(|(ip, pairs)| PodRecord {
                    ip: ip.parse().unwrap(),
                    labels: labels(pairs),
                    node: "node-1".to_string(),
                })
                .collect(),
        );
        index
    }

    fn deny_policy(id: &str, priority: u16, source: Selector, destination: Selector) -> Policy {
        Policy {
            id: id.to_string(),
            name: format!("policy-{id}"),
            priority,
            source,
            destination,
            service: None,
            action: Action::Deny,
            status: PolicyStatus::Enabled,
        }
    }

    fn label_selector(pairs: &[(&str, &str)]) -> Selector {
        Selector {
            label_selector: Some(labels(pairs)),
            ip_block: None,
        }
    }

    fn block_selector(block: &str) -> Selector {
        Selector {
            label_selector: None,
            ip_block: Some(block.parse().unwrap()),
        }
    }

    // ── compute_desired_rules ──

    #[test]
    fn test_no_policies_means_no_rules() {
        let pods = pod_index(&[("10.0.1.1", &[("app", "frontend")])]);
        let desired = compute_desired_rules(&[], &pods, &mut HashSet::new());
        assert!(desired.is_empty());
    }

    #[test]
    fn test_label_deny_produces_exact_pair() {
        let pods = pod_index(&[
            ("10.0.1.1", &[("app", "frontend")]),
            ("10.0.2.1", &[("app", "db"), ("env", "prod")]),
        ]);
        let policy = deny_policy(
            "P1",
            5000,
            label_selector(&[("app", "frontend")]),
            label_selector(&[("env", "prod"), ("app", "db")]),
        );

        let desired = compute_desired_rules(&[policy], &pods, &mut HashSet::new());
        assert_eq!(desired.len(), 1);
        let rule = desired.iter().next().unwrap();
        assert_eq!(rule.src, Ipv4Net::host(Ipv4Addr::new(10, 0, 1, 1)));
        assert_eq!(rule.dst, Ipv4Net::host(Ipv4Addr::new(10, 0, 2, 1)));
        assert_eq!(rule.priority, 5000);
    }

    #[test]
    fn test_mitigation_block_to_any() {
        let pods = pod_index(&[("10.0.1.1", &[("app", "frontend")])]);
        let policy = deny_policy(
            "P2",
            65000,
            block_selector("1.2.3.4/32"),
            block_selector("0.0.0.0/0"),
        );

        let desired = compute_desired_rules(&[policy], &pods, &mut HashSet::new());
        assert_eq!(desired.len(), 1);
        let rule = desired.iter().next().unwrap();
        assert!(rule.src.is_host());
        assert!(rule.dst.is_any());
        assert_eq!(rule.priority, 65000);
    }

    #[test]
    fn test_cross_product_of_matches() {
        let pods = pod_index(&[
            ("10.0.1.1", &[("app", "web")]),
            ("10.0.1.2", &[("app", "web")]),
            ("10.0.2.1", &[("app", "db")]),
            ("10.0.2.2", &[("app", "db")]),
        ]);
        let policy = deny_policy(
            "P1",
            2000,
            label_selector(&[("app", "web")]),
            label_selector(&[("app", "db")]),
        );

        let desired = compute_desired_rules(&[policy], &pods, &mut HashSet::new());
        assert_eq!(desired.len(), 4);
    }

    #[test]
    fn test_disabled_policy_is_skipped() {
        let pods = pod_index(&[("10.0.1.1", &[("app", "web")])]);
        let mut policy = deny_policy(
            "P1",
            2000,
            label_selector(&[("app", "web")]),
            block_selector("0.0.0.0/0"),
        );
        policy.status = PolicyStatus::Disabled;

        let desired = compute_desired_rules(&[policy], &pods, &mut HashSet::new());
        assert!(desired.is_empty());
    }

    #[test]
    fn test_allow_policy_is_skipped_and_logged_once() {
        let pods = pod_index(&[("10.0.1.1", &[("app", "web")])]);
        let mut policy = deny_policy(
            "P1",
            2000,
            label_selector(&[("app", "web")]),
            block_selector("0.0.0.0/0"),
        );
        policy.action = Action::Allow;

        let mut logged = HashSet::new();
        let desired = compute_desired_rules(&[policy.clone()], &pods, &mut logged);
        assert!(desired.is_empty());
        assert!(logged.contains("P1"));

        // Second computation with the same set does not re-log
        let before = logged.len();
        compute_desired_rules(&[policy], &pods, &mut logged);
        assert_eq!(logged.len(), before);
    }

    #[test]
    fn test_unmatched_side_produces_nothing() {
        let pods = pod_index(&[("10.0.1.1", &[("app", "web")])]);
        let policy = deny_policy(
            "P1",
            2000,
            label_selector(&[("app", "web")]),
            label_selector(&[("app", "db")]), // no db pods yet
        );

        let desired = compute_desired_rules(&[policy], &pods, &mut HashSet::new());
        assert!(desired.is_empty());
    }

    #[test]
    fn test_identical_rules_from_two_policies_keep_both_ids() {
        let pods = pod_index(&[
            ("10.0.1.1", &[("app", "web")]),
            ("10.0.2.1", &[("app", "db")]),
        ]);
        let a = deny_policy(
            "A",
            5000,
            label_selector(&[("app", "web")]),
            label_selector(&[("app", "db")]),
        );
        let b = deny_policy(
            "B",
            5000,
            label_selector(&[("app", "web")]),
            label_selector(&[("app", "db")]),
        );

        // Reverse insertion order must not affect the emitted order.
        let desired = compute_desired_rules(&[b, a], &pods, &mut HashSet::new());
        let ids: Vec<&str> = desired.iter().map(|r| r.policy_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B"]);
    }

    #[test]
    fn test_rules_ordered_by_policy_then_src_then_dst() {
        let pods = pod_index(&[
            ("10.0.1.2", &[("app", "web")]),
            ("10.0.1.1", &[("app", "web")]),
            ("10.0.2.1", &[("app", "db")]),
        ]);
        let policy = deny_policy(
            "P1",
            2000,
            label_selector(&[("app", "web")]),
            label_selector(&[("app", "db")]),
        );

        let desired = compute_desired_rules(&[policy], &pods, &mut HashSet::new());
        let sources: Vec<String> = desired.iter().map(|r| r.src.to_string()).collect();
        assert_eq!(sources, vec!["10.0.1.1/32", "10.0.1.2/32"]);
    }
}
