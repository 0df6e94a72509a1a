use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use kube::Client;
use prometheus::{Encoder, TextEncoder};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::info;

use sdn_zerotrust::config::Config;
use sdn_zerotrust::election::Elector;
use sdn_zerotrust::metrics;
use sdn_zerotrust::poller;
use sdn_zerotrust::reconcile::{ReconcileInput, Reconciler};
use sdn_zerotrust::repository::PostgresRepository;
use sdn_zerotrust::switch::SwitchManager;
use sdn_zerotrust::watcher;

/* ============================= CONFIG ============================= */

const METRICS_PORT: u16 = 9090;

/* ============================= ENTRY ============================= */

pub async fn run() -> Result<()> {
    println!("Starting policy reconciliation controller...\n");

    // Fatal on missing DATABASE_URL; the process exits nonzero.
    let config = Config::from_env()?;

    // Force-init Prometheus metrics so they appear on /metrics
    metrics::force_all();

    print!("  Orchestrator connection ..... ");
    let client = match Client::try_default().await {
        Ok(client) => client,
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot load orchestrator config: {e}");
        }
    };
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach orchestrator: {}. Is the cluster running?", e);
        }
    }

    print!("  Switch listener ............. ");
    let switch_addr = SocketAddr::from(([0, 0, 0, 0], config.switch_listen_port));
    let switch_listener = TcpListener::bind(switch_addr)
        .await
        .with_context(|| format!("Failed to bind switch listener on {switch_addr}"))?;
    println!("{switch_addr}");

    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], METRICS_PORT));

    println!("  Coordination endpoints ...... {}", config.zk_hosts.join(","));
    println!("  Election lease .............. {}", config.lease_name());
    println!("  Policy poll interval ........ {}s", config.poll_interval.as_secs());
    println!("  Metrics server .............. http://{metrics_addr}");
    println!();
    println!("  Available endpoints:");
    println!("    GET /healthz .............. Liveness probe (always 200 OK)");
    println!("    GET /readyz ............... Readiness probe (503 until first reconcile input, then 200)");
    println!("    GET /metrics .............. Prometheus metrics scrape endpoint");
    println!();
    println!("Controller running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    info!("controller_starting");

    /* ── wiring ── */

    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel::<ReconcileInput>();
    let (leader_tx, leader_rx) = watch::channel(false);
    let (switch_events_tx, mut switch_events_rx) = mpsc::unbounded_channel();
    let (transitions_tx, mut transitions_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let ready = Arc::new(AtomicBool::new(false));

    let repository = Arc::new(PostgresRepository::new(config.database_url.clone()));
    let manager = SwitchManager::new(leader_rx.clone(), switch_events_tx);

    let reconciler = Reconciler::new(
        inbox_rx,
        manager.clone(),
        repository.clone(),
        leader_tx,
        ready.clone(),
    );
    let reconciler_handle = tokio::spawn(reconciler.run());

    // Leadership transitions and switch session events share one forwarder
    // into the reconciler inbox.
    let forward_inbox = inbox_tx.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                transition = transitions_rx.recv() => {
                    let Some(transition) = transition else { return };
                    if forward_inbox.send(ReconcileInput::Leadership(transition)).is_err() {
                        return;
                    }
                }
                event = switch_events_rx.recv() => {
                    let Some(event) = event else { return };
                    if forward_inbox.send(ReconcileInput::Switch(event)).is_err() {
                        return;
                    }
                }
            }
        }
    });

    let listener_handle =
        tokio::spawn(manager.clone().serve(switch_listener, shutdown_tx.subscribe()));

    let elector = Elector::new(client.clone(), config.lease_name(), transitions_tx);
    info!(identity = elector.identity(), "controller_identity");
    let elector_handle = tokio::spawn(elector.run(shutdown_tx.subscribe()));

    let watcher_handle = tokio::spawn(watcher::run(
        client.clone(),
        inbox_tx.clone(),
        shutdown_tx.subscribe(),
    ));

    let poller_handle = tokio::spawn(poller::run(
        repository.clone(),
        config.poll_interval,
        leader_rx.clone(),
        inbox_tx.clone(),
        shutdown_tx.subscribe(),
    ));

    let http_handle = tokio::spawn(start_metrics_server(
        ready.clone(),
        shutdown_tx.subscribe(),
        metrics_addr,
    ));

    /* ── shutdown ── */

    signal::ctrl_c().await?;
    info!("shutdown_signal_received");
    println!("\n{}", "=".repeat(70));
    println!("Shutdown signal received. Stopping controller...");
    println!("{}", "=".repeat(70));

    let _ = shutdown_tx.send(());

    // Release leadership first, then drain the reconciler inbox, then close
    // the southbound sessions.
    let _ = elector_handle.await;
    let _ = inbox_tx.send(ReconcileInput::Shutdown);
    let _ = reconciler_handle.await;
    manager.close_all().await;
    let _ = listener_handle.await;
    let _ = watcher_handle.await;
    let _ = poller_handle.await;
    let _ = http_handle.await?;

    info!("controller_stopped");
    println!("Controller stopped.");
    Ok(())
}

/* ============================= HTTP SERVER ============================= */

pub(crate) fn build_router(ready: Arc<AtomicBool>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route(
            "/readyz",
            get({
                let ready = ready.clone();
                move || ready_handler(ready.clone())
            }),
        )
}

async fn start_metrics_server(
    ready: Arc<AtomicBool>,
    mut shutdown: broadcast::Receiver<()>,
    addr: SocketAddr,
) -> Result<()> {
    let app = build_router(ready);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind HTTP server on {addr}"))?;

    info!(addr = %addr, "http_server_started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}

async fn ready_handler(ready: Arc<AtomicBool>) -> impl IntoResponse {
    if ready.load(Ordering::Relaxed) {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = metrics::REGISTRY.gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body),
            Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
        },
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_ready(ready: bool) -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(ready))
    }

    #[tokio::test]
    async fn test_healthz_returns_ok() {
        let app = build_router(test_ready(false));
        let req = Request::builder()
            .uri("/healthz")
            .body(Body::empty())
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"OK");
    }

    #[tokio::test]
    async fn test_readyz_when_ready() {
        let app = build_router(test_ready(true));
        let req = Request::builder()
            .uri("/readyz")
            .body(Body::empty())
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readyz_when_not_ready() {
        let app = build_router(test_ready(false));
        let req = Request::builder()
            .uri("/readyz")
            .body(Body::empty())
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_metrics_returns_ok() {
        metrics::force_all();
        let app = build_router(test_ready(false));
        let req = Request::builder()
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_route_returns_404() {
        let app = build_router(test_ready(false));
        let req = Request::builder()
            .uri("/nonexistent")
            .body(Body::empty())
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
