//! Orchestrator watcher: a long-lived subscription to the cluster's pod
//! event stream, normalized into the reconciler's event shape. Pods without
//! an IPv4 address are dropped. Stream re-establishment turns into a full
//! resync so the pod index never drifts from ground truth.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use kube_runtime::watcher::{Config, Event, watcher};
use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::election::{BACKOFF_INITIAL, next_backoff};
use crate::pods::{PodEvent, PodEventType, PodRecord};
use crate::reconcile::ReconcileInput;

/* ============================= NORMALIZATION ============================= */

/// Normalize an orchestrator pod object into the reconciler's event shape.
/// Returns `None` when the pod has no usable IPv4 address.
pub fn normalize(kind: PodEventType, pod: &Pod) -> Option<PodEvent> {
    let ip: Ipv4Addr = pod.status.as_ref()?.pod_ip.as_deref()?.parse().ok()?;
    let labels = pod.metadata.labels.clone().unwrap_or_default();
    let node = pod
        .spec
        .as_ref()
        .and_then(|s| s.node_name.clone())
        .unwrap_or_default();
    Some(PodEvent { kind, ip, labels, node })
}

/* ============================= WATCH LOOP ============================= */

pub async fn run(
    client: Client,
    inbox: mpsc::UnboundedSender<ReconcileInput>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let pods: Api<Pod> = Api::all(client);
    let mut stream = watcher(pods, Config::default()).boxed();

    // Distinguishes ADDED from MODIFIED, which the watch stream folds
    // together.
    let mut seen: HashSet<Ipv4Addr> = HashSet::new();
    let mut backoff = BACKOFF_INITIAL;

    info!("pod_watcher_started");

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("pod_watcher_stopped");
                return;
            }
            event = stream.next() => match event {
                Some(Ok(event)) => {
                    backoff = BACKOFF_INITIAL;
                    match event {
                        Event::Applied(pod) => {
                            if let Some(mut normalized) = normalize(PodEventType::Added, &pod) {
                                if !seen.insert(normalized.ip) {
                                    normalized.kind = PodEventType::Modified;
                                }
                                if inbox.send(ReconcileInput::Pod(normalized)).is_err() {
                                    return;
                                }
                            }
                        }
                        Event::Deleted(pod) => {
                            if let Some(normalized) = normalize(PodEventType::Deleted, &pod) {
                                seen.remove(&normalized.ip);
                                if inbox.send(ReconcileInput::Pod(normalized)).is_err() {
                                    return;
                                }
                            }
                        }
                        Event::Restarted(pod_list) => {
                            seen.clear();
                            let records: Vec<PodRecord> = pod_list
                                .iter()
                                .filter_map(|pod| normalize(PodEventType::Added, pod))
                                .map(|event| {
                                    seen.insert(event.ip);
                                    PodRecord {
                                        ip: event.ip,
                                        labels: event.labels,
                                        node: event.node,
                                    }
                                })
                                .collect();
                            info!(pods = records.len(), "pod_stream_resynced");
                            if inbox.send(ReconcileInput::PodResync(records)).is_err() {
                                return;
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, retry_in = ?backoff, "pod_stream_error");
                    tokio::select! {
                        _ = shutdown.recv() => return,
                        _ = sleep(backoff) => {}
                    }
                    backoff = next_backoff(backoff);
                }
                None => {
                    warn!("pod_stream_ended");
                    return;
                }
            }
        }
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn make_pod(ip: Option<&str>, labels: &[(&str, &str)], node: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("pod".to_string()),
                namespace: Some("default".to_string()),
                labels: if labels.is_empty() {
                    None
                } else {
                    Some(
                        labels
                            .iter()
                            .map(|(k, v)| (k.to_string(), v.to_string()))
                            .collect::<BTreeMap<_, _>>(),
                    )
                },
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: node.map(str::to_string),
                ..Default::default()
            }),
            status: Some(PodStatus {
                pod_ip: ip.map(str::to_string),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_normalize_full_pod() {
        let pod = make_pod(Some("10.0.1.1"), &[("app", "frontend")], Some("node-a"));
        let event = normalize(PodEventType::Added, &pod).unwrap();
        assert_eq!(event.ip, "10.0.1.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(event.labels.get("app").map(String::as_str), Some("frontend"));
        assert_eq!(event.node, "node-a");
    }

    #[test]
    fn test_normalize_drops_pod_without_ip() {
        let pod = make_pod(None, &[("app", "frontend")], Some("node-a"));
        assert!(normalize(PodEventType::Added, &pod).is_none());
    }

    #[test]
    fn test_normalize_drops_non_ipv4() {
        let pod = make_pod(Some("fd00::1"), &[], None);
        assert!(normalize(PodEventType::Added, &pod).is_none());
    }

    #[test]
    fn test_normalize_unlabeled_pod_kept() {
        let pod = make_pod(Some("10.0.1.2"), &[], None);
        let event = normalize(PodEventType::Added, &pod).unwrap();
        assert!(event.labels.is_empty());
        assert!(event.node.is_empty());
    }
}
