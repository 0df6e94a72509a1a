use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use async_trait::async_trait;

use sdn_zerotrust::pods::{PodEvent, PodEventType};
use sdn_zerotrust::policy::{Action, Policy, PolicyStatus, Selector};
use sdn_zerotrust::repository::PolicyRepository;

/* ============================= BUILDERS ============================= */

pub fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn label_selector(pairs: &[(&str, &str)]) -> Selector {
    Selector {
        label_selector: Some(labels(pairs)),
        ip_block: None,
    }
}

pub fn block_selector(block: &str) -> Selector {
    Selector {
        label_selector: None,
        ip_block: Some(block.parse().expect("valid test CIDR")),
    }
}

pub fn deny_policy(id: &str, priority: u16, source: Selector, destination: Selector) -> Policy {
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

pub fn pod_added(ip: &str, pairs: &[(&str, &str)]) -> PodEvent {
    PodEvent {
        kind: PodEventType::Added,
        ip: ip.parse().expect("valid test IP"),
        labels: labels(pairs),
        node: "node-1".to_string(),
    }
}

pub fn pod_deleted(ip: &str) -> PodEvent {
    PodEvent {
        kind: PodEventType::Deleted,
        ip: ip.parse().expect("valid test IP"),
        labels: BTreeMap::new(),
        node: String::new(),
    }
}

/* ============================= FAKE REPOSITORY ============================= */

/// In-memory policy repository with a failure switch, standing in for the
/// relational store.
pub struct FakeRepository {
    policies: Mutex<Vec<Policy>>,
    failing: AtomicBool,
}

impl FakeRepository {
    pub fn new(policies: Vec<Policy>) -> Self {
        Self {
            policies: Mutex::new(policies),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }
}

#[async_trait]
impl PolicyRepository for FakeRepository {
    async fn fetch_enabled(&self) -> Result<Vec<Policy>> {
        if self.failing.load(Ordering::Relaxed) {
            anyhow::bail!("repository unavailable");
        }
        let policies = self.policies.lock().unwrap_or_else(|e| e.into_inner());
        Ok(policies.iter().filter(|p| p.is_enabled()).cloned().collect())
    }
}
