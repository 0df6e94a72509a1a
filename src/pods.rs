use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::net::Ipv4Addr;

use tracing::{error, info};

use crate::policy::{Ipv4Net, Selector};

/* ============================= EVENTS ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodEventType {
    Added,
    Modified,
    Deleted,
}

impl fmt::Display for PodEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PodEventType::Added => write!(f, "ADDED"),
            PodEventType::Modified => write!(f, "MODIFIED"),
            PodEventType::Deleted => write!(f, "DELETED"),
        }
    }
}

/// A normalized pod lifecycle event from the orchestrator watch stream.
/// Events without an IPv4 address never reach this type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodEvent {
    pub kind: PodEventType,
    pub ip: Ipv4Addr,
    pub labels: BTreeMap<String, String>,
    pub node: String,
}

/// One tracked pod. At most one record exists per IP at any instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRecord {
    pub ip: Ipv4Addr,
    pub labels: BTreeMap<String, String>,
    pub node: String,
}

/* ============================= POD INDEX ============================= */

/// In-memory mapping from pod IP to its label set.
///
/// Single-writer: only the reconciler mutates it, so plain collections
/// suffice. Lookups happen inside the reconcile pass.
#[derive(Debug, Default)]
pub struct PodIndex {
    records: HashMap<Ipv4Addr, PodRecord>,
}

impl PodIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one normalized event. ADDED and MODIFIED insert/overwrite,
    /// DELETED removes. A second ADDED for a live IP with different labels
    /// is an invariant violation: logged, then last-writer-wins.
    pub fn apply(&mut self, event: &PodEvent) {
        match event.kind {
            PodEventType::Added | PodEventType::Modified => {
                if event.kind == PodEventType::Added
                    && let Some(existing) = self.records.get(&event.ip)
                    && existing.labels != event.labels
                {
                    error!(
                        ip = %event.ip,
                        "duplicate_pod_ip_with_different_labels"
                    );
                }
                self.records.insert(
                    event.ip,
                    PodRecord {
                        ip: event.ip,
                        labels: event.labels.clone(),
                        node: event.node.clone(),
                    },
                );
            }
            PodEventType::Deleted => {
                self.records.remove(&event.ip);
            }
        }
    }

    /// Replace the whole index after a watch stream re-establishment.
    pub fn replace_all(&mut self, records: Vec<PodRecord>) {
        self.records.clear();
        for record in records {
            self.records.insert(record.ip, record);
        }
        info!(pods = self.records.len(), "pod_index_resynced");
    }

    /// Resolve a selector to the set of matching networks: pod IPs whose
    /// labels satisfy the predicate (as host networks), unioned with the
    /// literal IP block. An empty label predicate matches no pods.
    pub fn resolve(&self, selector: &Selector) -> BTreeSet<Ipv4Net> {
        let mut out = BTreeSet::new();

        if let Some(block) = selector.ip_block {
            out.insert(block);
        }

        if let Some(predicate) = &selector.label_selector
            && !predicate.is_empty()
        {
            for record in self.records.values() {
                let matches = predicate
                    .iter()
                    .all(|(k, v)| record.labels.get(k) == Some(v));
                if matches {
                    out.insert(Ipv4Net::host(record.ip));
                }
            }
        }

        out
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn added(ip: &str, pairs: &[(&str, &str)]) -> PodEvent {
        PodEvent {
            kind: PodEventType::Added,
            ip: ip.parse().unwrap(),
            labels: labels(pairs),
            node: "node-1".to_string(),
        }
    }

    fn label_selector(pairs: &[(&str, &str)]) -> Selector {
        Selector {
            label_selector: Some(labels(pairs)),
            ip_block: None,
        }
    }

    // ── apply ──

    #[test]
    fn test_added_then_deleted_restores_prior_state() {
        let mut index = PodIndex::new();
        index.apply(&added("10.0.1.1", &[("app", "frontend")]));
        assert_eq!(index.len(), 1);

        index.apply(&PodEvent {
            kind: PodEventType::Deleted,
            ip: "10.0.1.1".parse().unwrap(),
            labels: BTreeMap::new(),
            node: String::new(),
        });
        assert!(index.is_empty());
    }

    #[test]
    fn test_modified_overwrites_labels() {
        let mut index = PodIndex::new();
        index.apply(&added("10.0.1.1", &[("app", "frontend")]));
        index.apply(&PodEvent {
            kind: PodEventType::Modified,
            ip: "10.0.1.1".parse().unwrap(),
            labels: labels(&[("app", "backend")]),
            node: "node-2".to_string(),
        });

        let resolved = index.resolve(&label_selector(&[("app", "backend")]));
        assert_eq!(resolved.len(), 1);
        assert!(index.resolve(&label_selector(&[("app", "frontend")])).is_empty());
    }

    #[test]
    fn test_duplicate_ip_last_writer_wins() {
        let mut index = PodIndex::new();
        index.apply(&added("10.0.1.1", &[("app", "frontend")]));
        index.apply(&added("10.0.1.1", &[("app", "db")]));

        assert_eq!(index.len(), 1);
        assert_eq!(index.resolve(&label_selector(&[("app", "db")])).len(), 1);
    }

    // ── resolve ──

    #[test]
    fn test_resolve_all_pairs_must_match() {
        let mut index = PodIndex::new();
        index.apply(&added("10.0.2.1", &[("app", "db"), ("env", "prod")]));
        index.apply(&added("10.0.2.2", &[("app", "db"), ("env", "staging")]));

        let resolved = index.resolve(&label_selector(&[("app", "db"), ("env", "prod")]));
        assert_eq!(
            resolved.into_iter().collect::<Vec<_>>(),
            vec![Ipv4Net::host("10.0.2.1".parse().unwrap())]
        );
    }

    #[test]
    fn test_resolve_empty_predicate_matches_no_pods() {
        let mut index = PodIndex::new();
        index.apply(&added("10.0.1.1", &[("app", "frontend")]));

        assert!(index.resolve(&label_selector(&[])).is_empty());
    }

    #[test]
    fn test_resolve_unions_ip_block_with_labels() {
        let mut index = PodIndex::new();
        index.apply(&added("10.0.1.1", &[("app", "frontend")]));

        let selector = Selector {
            label_selector: Some(labels(&[("app", "frontend")])),
            ip_block: Some("192.168.0.0/16".parse().unwrap()),
        };
        let resolved = index.resolve(&selector);
        assert_eq!(resolved.len(), 2);
    }

    #[test]
    fn test_resolve_ip_block_only() {
        let index = PodIndex::new();
        let selector = Selector {
            label_selector: None,
            ip_block: Some("1.2.3.4/32".parse().unwrap()),
        };
        assert_eq!(index.resolve(&selector).len(), 1);
    }

    #[test]
    fn test_resolve_empty_selector_is_empty() {
        let mut index = PodIndex::new();
        index.apply(&added("10.0.1.1", &[("app", "frontend")]));
        assert!(index.resolve(&Selector::default()).is_empty());
    }
}
