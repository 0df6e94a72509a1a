//! Switch Session Manager: accepts southbound datapath connections, runs the
//! OpenFlow handshake, installs the cookie-0 baseline rule, advises the
//! current leadership role, and exposes rule/role operations on live
//! sessions. Connect/disconnect notifications flow to the reconciler.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::openflow::{
    CodecError, FlowMatch, FlowMod, OFPP_NORMAL, OfAction, OfMessage, OpenFlowCodec, Role,
};

/* ============================= CONFIG ============================= */

/// Priority of the baseline forward-to-default-path rule.
pub const BASELINE_PRIORITY: u16 = 1;

/// Cookie of the baseline rule. Cookie-scoped cleanup must never match it.
pub const BASELINE_COOKIE: u64 = 0;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/* ============================= ERRORS ============================= */

#[derive(Debug, Error)]
pub enum SwitchError {
    #[error("datapath {0:#018x} session closed")]
    SessionClosed(u64),
    #[error("handshake failed: {0}")]
    Handshake(&'static str),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/* ============================= EVENTS ============================= */

/// Session lifecycle notifications delivered to the reconciler inbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchEvent {
    Connected(u64),
    Disconnected(u64),
}

/* ============================= HANDLE ============================= */

/// Handle to one live datapath session. Cloneable; writes are queued on the
/// session outbox and flushed by the session's writer task in order.
#[derive(Debug, Clone)]
pub struct SwitchHandle {
    pub datapath_id: u64,
    pub capabilities: u32,
    session_id: u64,
    outbox: mpsc::UnboundedSender<OfMessage>,
    xid: Arc<AtomicU32>,
    connected_at: Instant,
    last_seen: Arc<StdMutex<Instant>>,
    advised_role: Arc<StdMutex<Role>>,
}

impl SwitchHandle {
    pub fn new(
        datapath_id: u64,
        capabilities: u32,
        outbox: mpsc::UnboundedSender<OfMessage>,
    ) -> Self {
        let now = Instant::now();
        Self {
            datapath_id,
            capabilities,
            session_id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            outbox,
            xid: Arc::new(AtomicU32::new(1)),
            connected_at: now,
            last_seen: Arc::new(StdMutex::new(now)),
            advised_role: Arc::new(StdMutex::new(Role::Slave)),
        }
    }

    fn next_xid(&self) -> u32 {
        self.xid.fetch_add(1, Ordering::Relaxed)
    }

    fn send(&self, msg: OfMessage) -> Result<(), SwitchError> {
        self.outbox
            .send(msg)
            .map_err(|_| SwitchError::SessionClosed(self.datapath_id))
    }

    /// Install one rule. Empty `actions` means drop.
    pub fn install_rule(
        &self,
        priority: u16,
        match_fields: FlowMatch,
        actions: Vec<OfAction>,
        cookie: u64,
    ) -> Result<(), SwitchError> {
        let body = FlowMod::add(priority, match_fields, actions, cookie);
        self.send(OfMessage::FlowMod { xid: self.next_xid(), body })
    }

    /// Remove every rule tagged with `cookie` (all-ones mask).
    pub fn delete_by_cookie(&self, cookie: u64) -> Result<(), SwitchError> {
        let body = FlowMod::delete_by_cookie(cookie);
        self.send(OfMessage::FlowMod { xid: self.next_xid(), body })
    }

    /// Advise the datapath of this controller's role.
    pub fn advise_role(&self, role: Role) -> Result<(), SwitchError> {
        self.send(OfMessage::RoleRequest { xid: self.next_xid(), role, generation_id: 0 })?;
        *self.advised_role.lock().unwrap_or_else(|e| e.into_inner()) = role;
        Ok(())
    }

    /// The role most recently advised to this datapath.
    pub fn advised_role(&self) -> Role {
        *self.advised_role.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Instant of the last frame observed from the datapath.
    pub fn last_seen(&self) -> Instant {
        *self.last_seen.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }
}

/* ============================= MANAGER ============================= */

/// Owner of the datapath session table.
pub struct SwitchManager {
    table: Mutex<HashMap<u64, SwitchHandle>>,
    leader: watch::Receiver<bool>,
    events: mpsc::UnboundedSender<SwitchEvent>,
}

impl SwitchManager {
    pub fn new(
        leader: watch::Receiver<bool>,
        events: mpsc::UnboundedSender<SwitchEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            table: Mutex::new(HashMap::new()),
            leader,
            events,
        })
    }

    /// Snapshot of the currently connected datapaths.
    pub async fn list_switches(&self) -> Vec<SwitchHandle> {
        let mut switches: Vec<SwitchHandle> = self.table.lock().await.values().cloned().collect();
        switches.sort_by_key(|s| s.datapath_id);
        switches
    }

    /// Advise every connected datapath of a role. Send failures only mean
    /// the session died; its disconnect notification is already on the way.
    pub async fn advise_role_all(&self, role: Role) {
        for handle in self.list_switches().await {
            if let Err(e) = handle.advise_role(role) {
                debug!(datapath = format_args!("{:#018x}", handle.datapath_id), error = %e, "role_advisory_skipped");
            }
        }
    }

    /// Register a completed session and notify the reconciler. A reconnect
    /// under the same datapath id replaces the stale entry.
    pub async fn register(&self, handle: SwitchHandle) {
        let datapath_id = handle.datapath_id;
        let replaced = {
            let mut table = self.table.lock().await;
            let replaced = table.insert(datapath_id, handle).is_some();
            metrics::SWITCHES_CONNECTED.set(table.len() as i64);
            replaced
        };
        if replaced {
            warn!(datapath = format_args!("{datapath_id:#018x}"), "stale_session_replaced");
        }
        info!(datapath = format_args!("{datapath_id:#018x}"), "switch_connected");
        let _ = self.events.send(SwitchEvent::Connected(datapath_id));
    }

    /// Drop a session from the table, but only if the stored entry still
    /// belongs to the same session (a reconnect may have replaced it).
    pub async fn deregister(&self, datapath_id: u64, session_id: u64) {
        let removed = {
            let mut table = self.table.lock().await;
            let matches = table
                .get(&datapath_id)
                .is_some_and(|h| h.session_id == session_id);
            if matches {
                table.remove(&datapath_id);
            }
            metrics::SWITCHES_CONNECTED.set(table.len() as i64);
            matches
        };
        if removed {
            info!(datapath = format_args!("{datapath_id:#018x}"), "switch_disconnected");
            let _ = self.events.send(SwitchEvent::Disconnected(datapath_id));
        }
    }

    /// Close every session by dropping its outbox; writer tasks flush and
    /// exit, which closes the transports.
    pub async fn close_all(&self) {
        let mut table = self.table.lock().await;
        table.clear();
        metrics::SWITCHES_CONNECTED.set(0);
    }

    /// Accept datapath connections until shutdown.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("switch_listener_stopped");
                    return;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let manager = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(manager, stream, peer).await {
                                    warn!(peer = %peer, error = %e, "switch_session_failed");
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "switch_accept_failed");
                        }
                    }
                }
            }
        }
    }
}

/* ============================= SESSION ============================= */

async fn handle_connection(
    manager: Arc<SwitchManager>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), SwitchError> {
    let mut framed = Framed::new(stream, OpenFlowCodec);

    let (datapath_id, capabilities) = timeout(HANDSHAKE_TIMEOUT, handshake(&mut framed))
        .await
        .map_err(|_| SwitchError::Handshake("timed out"))??;

    debug!(
        datapath = format_args!("{datapath_id:#018x}"),
        peer = %peer,
        "handshake_complete"
    );

    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
    let handle = SwitchHandle::new(datapath_id, capabilities, outbox_tx);

    // Baseline rule first: priority 1, match-all, forward to the default
    // path, cookie 0 so cleanup sweeps never remove it.
    handle.install_rule(
        BASELINE_PRIORITY,
        FlowMatch::any(),
        vec![OfAction::Output(OFPP_NORMAL)],
        BASELINE_COOKIE,
    )?;

    let role = if *manager.leader.borrow() { Role::Master } else { Role::Slave };
    handle.advise_role(role)?;

    let session_id = handle.session_id;
    let reply_tx = handle.outbox.clone();
    let liveness = handle.clone();

    manager.register(handle).await;

    let (sink, stream) = framed.split();
    let writer = tokio::spawn(write_loop(sink, outbox_rx));
    read_loop(stream, reply_tx, liveness).await;

    manager.deregister(datapath_id, session_id).await;
    writer.abort();
    Ok(())
}

/// HELLO exchange followed by FEATURES_REQUEST/REPLY to learn the datapath
/// identity. Interleaved echo requests are answered; everything else is
/// ignored until the features reply arrives.
async fn handshake(
    framed: &mut Framed<TcpStream, OpenFlowCodec>,
) -> Result<(u64, u32), SwitchError> {
    framed.send(OfMessage::Hello { xid: 0 }).await?;
    framed.send(OfMessage::FeaturesRequest { xid: 0 }).await?;

    while let Some(frame) = framed.next().await {
        match frame? {
            OfMessage::FeaturesReply { datapath_id, capabilities, .. } => {
                return Ok((datapath_id, capabilities));
            }
            OfMessage::EchoRequest { xid, payload } => {
                framed.send(OfMessage::EchoReply { xid, payload }).await?;
            }
            OfMessage::Error { err_type, code, .. } => {
                warn!(err_type, code, "switch_error_during_handshake");
            }
            _ => {}
        }
    }
    Err(SwitchError::Handshake("stream ended before features reply"))
}

async fn write_loop(
    mut sink: SplitSink<Framed<TcpStream, OpenFlowCodec>, OfMessage>,
    mut outbox: mpsc::UnboundedReceiver<OfMessage>,
) {
    while let Some(msg) = outbox.recv().await {
        if let Err(e) = sink.send(msg).await {
            debug!(error = %e, "switch_write_failed");
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    mut stream: SplitStream<Framed<TcpStream, OpenFlowCodec>>,
    reply_tx: mpsc::UnboundedSender<OfMessage>,
    handle: SwitchHandle,
) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(msg) => {
                handle.touch();
                match msg {
                    OfMessage::EchoRequest { xid, payload } => {
                        if reply_tx.send(OfMessage::EchoReply { xid, payload }).is_err() {
                            break;
                        }
                    }
                    OfMessage::Error { xid, err_type, code } => {
                        warn!(
                            datapath = format_args!("{:#018x}", handle.datapath_id),
                            xid, err_type, code,
                            "switch_reported_error"
                        );
                    }
                    _ => {}
                }
            }
            Err(e) => {
                debug!(
                    datapath = format_args!("{:#018x}", handle.datapath_id),
                    error = %e,
                    "switch_read_failed"
                );
                break;
            }
        }
    }
}

/* ============================= TESTS ============================= */
