//! Top-level owner of all P2P operations.
//!
//! One `Manager` instance holds the session registry, the pending-request
//! table and the broadcast dedup map, runs the accept loop, and dispatches
//! every inbound frame. Role-specific behavior (Normal vs Discovery) is a
//! match on [`NodeRole`] at dispatch time — Discovery nodes are a read-only
//! peer index and answer `Ping`/`RequestNodes` only.
//!
//! Obtain an `Arc<Manager>` from [`Manager::new`], then `start_server()` /
//! `start_discovery()`; `stop()` tears everything down.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use lru::LruCache;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use ember_chain::{ChainCodec, State, Storage, TxValidator};

use crate::config::P2pConfig;
use crate::discovery;
use crate::error::P2pError;
use crate::registry::SessionRegistry;
use crate::requests::RequestTable;
use crate::session::{self, FrameHandler, LocalIdentity, Session, SessionRole};
use crate::types::{NodeId, NodeInfo, NodeType, PeerEntry};
use crate::wire::codec;
use crate::wire::frame::{CommandKind, Frame, FrameKind, RequestId};

/// Client-facing wait for a correlated answer.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
/// Bound on the broadcast dedup map.
const SEEN_BROADCASTS_CAPACITY: usize = 4096;
/// Cadence of the pending-request sweeper.
const SWEEP_INTERVAL: Duration = Duration::from_secs(15);
/// Age past which an unclaimed request record is reaped.
const REQUEST_MAX_AGE: Duration = Duration::from_secs(60);
/// Grace for outstanding writes to flush during `stop()`.
const STOP_FLUSH: Duration = Duration::from_millis(100);

/// Role variant consulted on every inbound frame.
///
/// Normal nodes carry the chain collaborators; Discovery nodes have nothing
/// to decode and nowhere to submit, so they carry none.
pub enum NodeRole {
    Normal {
        chain: Arc<dyn ChainCodec>,
        storage: Arc<dyn Storage>,
        state: Arc<dyn State>,
    },
    Discovery,
}

impl NodeRole {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeRole::Normal { .. } => NodeType::Normal,
            NodeRole::Discovery => NodeType::Discovery,
        }
    }
}

pub struct Manager {
    node_id: NodeId,
    config: P2pConfig,
    role: NodeRole,
    registry: SessionRegistry,
    requests: RequestTable,
    /// Broadcast payload hash → times seen. Entry presence suppresses both
    /// reforwarding and re-submission to `State`.
    seen_broadcasts: Mutex<LruCache<u64, u32>>,
    /// Shared stopping signal; every long-running task selects on it.
    stop: CancellationToken,
    /// The port peers should dial, learned from the actual bind (the
    /// configured port may be 0 for an OS-assigned one).
    advertised_port: AtomicU16,
    local_addr: Mutex<Option<SocketAddr>>,
    server_task: Mutex<Option<JoinHandle<()>>>,
    discovery_task: Mutex<Option<JoinHandle<()>>>,
    sweeper_task: Mutex<Option<JoinHandle<()>>>,
    weak_self: Weak<Manager>,
}

impl Manager {
    pub fn new(config: P2pConfig, role: NodeRole) -> Arc<Self> {
        let node_id = NodeId::random();
        let max_connections = config.effective_max_connections();
        info!(
            %node_id,
            node_type = %role.node_type(),
            max_connections,
            "p2p manager created"
        );
        Arc::new_cyclic(|weak_self| Self {
            node_id,
            advertised_port: AtomicU16::new(config.host_port),
            config,
            role,
            registry: SessionRegistry::new(max_connections),
            requests: RequestTable::new(),
            seen_broadcasts: Mutex::new(LruCache::new(
                NonZeroUsize::new(SEEN_BROADCASTS_CAPACITY).unwrap(),
            )),
            stop: CancellationToken::new(),
            local_addr: Mutex::new(None),
            server_task: Mutex::new(None),
            discovery_task: Mutex::new(None),
            sweeper_task: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    // ── Introspection ────────────────────────────────────────────────────────

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn node_type(&self) -> NodeType {
        self.role.node_type()
    }

    pub fn peer_count(&self) -> usize {
        self.registry.len()
    }

    pub fn session_ids(&self) -> Vec<NodeId> {
        self.registry.ids()
    }

    /// Outstanding correlated requests (answers not yet seen or reaped).
    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    /// Actual bound address of the server, once `start_server` succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    pub fn server_port(&self) -> u16 {
        self.advertised_port.load(Ordering::Relaxed)
    }

    pub(crate) fn min_connections(&self) -> usize {
        self.config.min_connections
    }

    pub(crate) fn max_connections(&self) -> usize {
        self.registry.max_connections()
    }

    pub(crate) fn sessions_snapshot(&self) -> Vec<Arc<Session>> {
        self.registry.snapshot()
    }

    pub(crate) fn has_session(&self, node_id: &NodeId) -> bool {
        self.registry.contains(node_id)
    }

    pub(crate) fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    fn local_identity(&self) -> LocalIdentity {
        LocalIdentity {
            node_id: self.node_id,
            node_type: self.role.node_type(),
            server_port: self.server_port(),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Bind the listener and spawn the accept loop. Returns once the socket
    /// is accepting; a bind failure is the one fatal startup error.
    pub async fn start_server(self: &Arc<Self>) -> Result<(), P2pError> {
        let bind = SocketAddr::new(self.config.host_ip, self.config.host_port);
        let listener = TcpListener::bind(bind).await?;
        let local = listener.local_addr()?;
        self.advertised_port.store(local.port(), Ordering::Relaxed);
        *self.local_addr.lock().unwrap() = Some(local);
        info!(addr = %local, "p2p server listening");

        let manager = Arc::clone(self);
        *self.server_task.lock().unwrap() = Some(tokio::spawn(accept_loop(manager, listener)));

        let sweeper = Arc::clone(self);
        *self.sweeper_task.lock().unwrap() = Some(tokio::spawn(async move {
            sweeper.sweep_requests().await;
        }));
        Ok(())
    }

    /// Spawn the discovery worker.
    pub fn start_discovery(self: &Arc<Self>) {
        let mut task = self.discovery_task.lock().unwrap();
        if task.is_some() {
            return;
        }
        let manager = Arc::clone(self);
        *task = Some(tokio::spawn(discovery::run(manager)));
    }

    /// Stop everything: discovery first, then all sessions, then the accept
    /// loop; outstanding writes get a short grace to flush.
    pub async fn stop(&self) {
        info!(node_id = %self.node_id, "stopping p2p manager");
        self.stop.cancel();

        let discovery = self.discovery_task.lock().unwrap().take();
        if let Some(task) = discovery {
            let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
        }
        let sweeper = self.sweeper_task.lock().unwrap().take();
        if let Some(task) = sweeper {
            task.abort();
        }

        self.registry.close_all();
        self.requests.clear();

        let server = self.server_task.lock().unwrap().take();
        if let Some(task) = server {
            let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
        }
        tokio::time::sleep(STOP_FLUSH).await;
    }

    async fn sweep_requests(&self) {
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = tokio::time::sleep(SWEEP_INTERVAL) => {
                    self.requests.expire_older_than(REQUEST_MAX_AGE);
                }
            }
        }
    }

    // ── Connections ──────────────────────────────────────────────────────────

    /// Dial a remote P2P server and register the resulting session.
    ///
    /// Connecting to our own endpoint is refused locally; a duplicate node
    /// id or full registry closes the fresh connection and keeps the old.
    pub async fn connect_to(self: &Arc<Self>, addr: SocketAddr) -> Result<(), P2pError> {
        if self.stop.is_cancelled() {
            return Err(P2pError::Shutdown);
        }
        if addr.ip() == self.config.host_ip && addr.port() == self.server_port() {
            debug!(%addr, "not connecting to self");
            return Ok(());
        }

        let (ws, remote) = session::connect(&self.local_identity(), addr).await?;
        if remote.node_id == self.node_id {
            debug!(%addr, "remote is ourselves, dropping connection");
            return Ok(());
        }
        self.admit(ws, remote, SessionRole::Client).await
    }

    /// Register a handshaken connection and start its I/O tasks; on
    /// rejection the socket is closed post-handshake, per admission policy.
    async fn admit(
        self: &Arc<Self>,
        mut ws: session::WsStream,
        remote: session::RemoteIdentity,
        role: SessionRole,
    ) -> Result<(), P2pError> {
        let (new_session, out_rx) = session::create(remote, role);
        match self.registry.register(Arc::clone(&new_session)) {
            Ok(()) => {
                let handler: Weak<dyn FrameHandler> = self.weak_self.clone();
                session::spawn_io(new_session, ws, out_rx, handler);
                Ok(())
            }
            Err(e) => {
                debug!(peer = %remote.node_id, "session rejected: {e}");
                new_session.mark_closed();
                let _ = ws.close(None).await;
                Err(e)
            }
        }
    }

    // ── Outbound requests ────────────────────────────────────────────────────

    /// Build, record and write one correlated request. Refuses commands a
    /// Discovery peer does not accept, and unknown targets.
    fn send_request(
        &self,
        node_id: &NodeId,
        build: impl Fn() -> Frame,
    ) -> Result<(RequestId, oneshot::Receiver<Frame>), P2pError> {
        let session = self
            .registry
            .get(node_id)
            .ok_or_else(|| P2pError::NoSuchSession(node_id.to_string()))?;

        let mut frame = build();
        if session.node_type() == NodeType::Discovery && !frame.command().allowed_for_discovery() {
            debug!(peer = %node_id, command = %frame.command(), "refusing command to discovery peer");
            return Err(P2pError::Forbidden);
        }

        // Regenerate on the (negligible) chance of an id collision.
        let rx = loop {
            match self.requests.begin(frame.id(), frame.command(), *node_id) {
                Some(rx) => break rx,
                None => frame = build(),
            }
        };
        let id = frame.id();
        trace!(peer = %node_id, command = %frame.command(), %id, "sending request");
        session.write(frame);
        Ok((id, rx))
    }

    /// Ping a node and wait for the answer.
    pub async fn ping(&self, node_id: &NodeId) -> Result<(), P2pError> {
        let (id, rx) = self.send_request(node_id, codec::ping_request)?;
        self.requests.wait_for(id, rx, REQUEST_TIMEOUT).await.map(|_| ())
    }

    /// Ask a node for its peer list. Empty on failure or timeout.
    pub async fn request_nodes(&self, node_id: &NodeId) -> HashMap<NodeId, PeerEntry> {
        self.request_nodes_within(node_id, REQUEST_TIMEOUT).await
    }

    pub(crate) async fn request_nodes_within(
        &self,
        node_id: &NodeId,
        timeout: Duration,
    ) -> HashMap<NodeId, PeerEntry> {
        let (id, rx) = match self.send_request(node_id, codec::nodes_request) {
            Ok(pending) => pending,
            Err(e) => {
                debug!(peer = %node_id, "request_nodes not sent: {e}");
                return HashMap::new();
            }
        };
        match self.requests.wait_for(id, rx, timeout).await {
            Ok(answer) => codec::decode_nodes_answer(&answer).unwrap_or_else(|e| {
                warn!(peer = %node_id, "bad RequestNodes answer: {e}");
                HashMap::new()
            }),
            Err(_) => {
                debug!(peer = %node_id, "request_nodes timed out");
                HashMap::new()
            }
        }
    }

    /// Ask a node for its info payload.
    pub async fn request_node_info(&self, node_id: &NodeId) -> Option<NodeInfo> {
        let local = self.local_node_info()?;
        let (id, rx) = match self.send_request(node_id, || codec::info_request(&local)) {
            Ok(pending) => pending,
            Err(e) => {
                debug!(peer = %node_id, "info request not sent: {e}");
                return None;
            }
        };
        let answer = self.requests.wait_for(id, rx, REQUEST_TIMEOUT).await.ok()?;
        match codec::decode_info(&answer) {
            Ok(info) => Some(info),
            Err(e) => {
                warn!(peer = %node_id, "bad Info answer: {e}");
                None
            }
        }
    }

    /// Ask a node for its validator mempool. Empty on failure, timeout, or
    /// when any record fails chain decoding.
    pub async fn request_validator_txs(&self, node_id: &NodeId) -> Vec<TxValidator> {
        let NodeRole::Normal { chain, .. } = &self.role else {
            warn!("discovery nodes do not request validator transactions");
            return Vec::new();
        };
        let (id, rx) = match self.send_request(node_id, codec::validator_txs_request) {
            Ok(pending) => pending,
            Err(e) => {
                debug!(peer = %node_id, "validator tx request not sent: {e}");
                return Vec::new();
            }
        };
        let answer = match self.requests.wait_for(id, rx, REQUEST_TIMEOUT).await {
            Ok(answer) => answer,
            Err(_) => return Vec::new(),
        };
        let records = match codec::decode_validator_txs_answer(&answer) {
            Ok(records) => records,
            Err(e) => {
                warn!(peer = %node_id, "bad validator tx answer: {e}");
                return Vec::new();
            }
        };
        let mut txs = Vec::with_capacity(records.len());
        for record in records {
            match chain.decode_tx_validator(&record, self.config.chain_id) {
                Ok(tx) => txs.push(tx),
                Err(e) => {
                    warn!(peer = %node_id, "validator tx failed to decode: {e}");
                    return Vec::new();
                }
            }
        }
        txs
    }

    // ── Broadcasts ───────────────────────────────────────────────────────────

    pub fn broadcast_validator_tx(&self, tx: &TxValidator) {
        self.broadcast_payload(CommandKind::BroadcastValidatorTx, tx.raw());
    }

    pub fn broadcast_tx(&self, tx: &ember_chain::TxBlock) {
        self.broadcast_payload(CommandKind::BroadcastTx, tx.raw());
    }

    pub fn broadcast_block(&self, block: &ember_chain::Block) {
        self.broadcast_payload(CommandKind::BroadcastBlock, block.raw());
    }

    /// Encode once, mark the payload as seen (so the echo coming back does
    /// nothing), write the same frame to every connected Normal peer.
    fn broadcast_payload(&self, command: CommandKind, payload: &[u8]) {
        if matches!(self.role, NodeRole::Discovery) {
            warn!("discovery nodes do not broadcast");
            return;
        }
        let frame = codec::broadcast(command, payload);
        let key = frame.id().to_u64();
        self.note_seen(key);
        let mut fanout = 0usize;
        for session in self.registry.snapshot() {
            if session.node_type() == NodeType::Normal {
                session.write(frame.clone());
                fanout += 1;
            }
        }
        debug!(%command, key, fanout, "broadcast sent");
    }

    /// Count a sighting of a broadcast key; returns the updated count.
    fn note_seen(&self, key: u64) -> u32 {
        let mut seen = self.seen_broadcasts.lock().unwrap();
        match seen.get_mut(&key) {
            Some(count) => {
                *count += 1;
                *count
            }
            None => {
                seen.put(key, 1);
                1
            }
        }
    }

    // ── Inbound dispatch ─────────────────────────────────────────────────────

    fn dispatch(&self, session: Arc<Session>, frame: Frame) {
        match frame.kind() {
            FrameKind::Answer => {
                self.requests.complete(frame.id(), &session.node_id(), frame);
            }
            FrameKind::Request => self.handle_request(&session, &frame),
            FrameKind::Broadcast => self.handle_broadcast(&session, &frame),
        }
    }

    /// Role-specific handler table. Absent or role-forbidden commands
    /// produce no answer.
    fn handle_request(&self, session: &Arc<Session>, frame: &Frame) {
        match (&self.role, frame.command()) {
            (_, CommandKind::Ping) => {
                if let Err(e) = codec::decode_ping(frame) {
                    debug!(peer = %session.node_id(), "bad ping: {e}");
                    return;
                }
                session.write(codec::ping_answer(frame.id()));
            }
            (_, CommandKind::RequestNodes) => {
                if let Err(e) = codec::decode_nodes_request(frame) {
                    debug!(peer = %session.node_id(), "bad nodes request: {e}");
                    return;
                }
                let peers = self.known_peers(&session.node_id());
                session.write(codec::nodes_answer(frame.id(), &peers));
            }
            (NodeRole::Normal { .. }, CommandKind::Info) => {
                match codec::decode_info(frame) {
                    Ok(info) => trace!(peer = %session.node_id(), height = info.height, "peer info"),
                    Err(e) => {
                        debug!(peer = %session.node_id(), "bad info request: {e}");
                        return;
                    }
                }
                if let Some(local) = self.local_node_info() {
                    session.write(codec::info_answer(frame.id(), &local));
                }
            }
            (NodeRole::Normal { state, .. }, CommandKind::RequestValidatorTxs) => {
                if let Err(e) = codec::decode_validator_txs_request(frame) {
                    debug!(peer = %session.node_id(), "bad validator tx request: {e}");
                    return;
                }
                let txs = state.validator_txs();
                session.write(codec::validator_txs_answer(
                    frame.id(),
                    txs.iter().map(|tx| tx.raw()),
                ));
            }
            (_, command) => {
                debug!(peer = %session.node_id(), %command, "request dropped (not handled by this role)");
            }
        }
    }

    /// Dedup, submit, forward. Only the first sighting of a payload does
    /// anything; repeats bump the counter and stop there, which is what
    /// breaks forwarding cycles.
    fn handle_broadcast(&self, session: &Arc<Session>, frame: &Frame) {
        let NodeRole::Normal { chain, state, .. } = &self.role else {
            debug!(peer = %session.node_id(), "broadcast rejected by discovery node");
            return;
        };

        let payload = match codec::decode_broadcast(frame) {
            Ok(payload) => payload,
            Err(e) => {
                debug!(peer = %session.node_id(), "bad broadcast: {e}");
                return;
            }
        };

        let key = frame.id().to_u64();
        let sightings = self.note_seen(key);
        if sightings > 1 {
            trace!(key, sightings, "duplicate broadcast suppressed");
            return;
        }

        let chain_id = self.config.chain_id;
        let accepted = match frame.command() {
            CommandKind::BroadcastValidatorTx => match chain.decode_tx_validator(payload, chain_id) {
                Ok(tx) => state.accept_validator_tx(tx).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            },
            CommandKind::BroadcastTx => match chain.decode_tx_block(payload, chain_id) {
                Ok(tx) => state.accept_tx(tx).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            },
            CommandKind::BroadcastBlock => match chain.decode_block(payload, chain_id) {
                Ok(block) => state.accept_block(block).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            },
            _ => unreachable!("decode_broadcast already checked the command"),
        };

        if let Err(reason) = accepted {
            // Do not forward what we could not accept.
            warn!(peer = %session.node_id(), command = %frame.command(), "broadcast not accepted: {reason}");
            return;
        }

        let mut forwarded = 0usize;
        for other in self.registry.snapshot() {
            if other.node_id() != session.node_id() && other.node_type() == NodeType::Normal {
                other.write(frame.clone());
                forwarded += 1;
            }
        }
        trace!(key, forwarded, "broadcast forwarded");
    }

    /// Peer records for a `RequestNodes` answer: everyone but the asker.
    fn known_peers(&self, asker: &NodeId) -> HashMap<NodeId, PeerEntry> {
        self.registry
            .snapshot()
            .into_iter()
            .filter(|s| s.node_id() != *asker)
            .map(|s| {
                (
                    s.node_id(),
                    PeerEntry { node_type: s.node_type(), endpoint: s.server_endpoint().into() },
                )
            })
            .collect()
    }

    fn local_node_info(&self) -> Option<NodeInfo> {
        let NodeRole::Normal { storage, .. } = &self.role else {
            return None;
        };
        let (height, latest_block_hash) = storage.latest();
        Some(NodeInfo {
            version: self.config.version,
            timestamp_us: now_micros(),
            height,
            latest_block_hash,
        })
    }

    pub fn disconnect(&self, node_id: &NodeId) -> bool {
        self.registry.disconnect(node_id)
    }
}

impl FrameHandler for Manager {
    fn on_frame(&self, session: &Arc<Session>, frame: Frame) {
        // Never run handlers on the read task; hand off to the worker pool.
        let Some(manager) = self.weak_self.upgrade() else {
            return;
        };
        let session = Arc::clone(session);
        tokio::spawn(async move {
            manager.dispatch(session, frame);
        });
    }

    fn on_session_closed(&self, session: &Arc<Session>) {
        self.registry.unregister(session);
    }
}

/// Accept connections until stopped. Each upgrade runs on its own task so a
/// slow handshake cannot stall the listener.
async fn accept_loop(manager: Arc<Manager>, listener: TcpListener) {
    loop {
        tokio::select! {
            _ = manager.stop.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((tcp, peer)) => {
                    let manager = Arc::clone(&manager);
                    tokio::spawn(async move {
                        handle_accept(manager, tcp, peer).await;
                    });
                }
                Err(e) => {
                    warn!("accept failed: {e}");
                }
            },
        }
    }
    debug!("accept loop stopped");
}

async fn handle_accept(manager: Arc<Manager>, tcp: TcpStream, peer: SocketAddr) {
    let (ws, remote) = match session::accept(&manager.local_identity(), tcp).await {
        Ok(upgraded) => upgraded,
        Err(e) => {
            debug!(%peer, "handshake failed: {e}");
            return;
        }
    };
    // Admission errors (duplicate, full registry) close the fresh socket and
    // are not otherwise reported to anyone.
    let _ = manager.admit(ws, remote, SessionRole::Server).await;
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn note_seen_counts_sightings() {
        let manager = Manager::new(P2pConfig::default(), NodeRole::Discovery);
        assert_eq!(manager.note_seen(42), 1);
        assert_eq!(manager.note_seen(42), 2);
        assert_eq!(manager.note_seen(42), 3);
        assert_eq!(manager.note_seen(7), 1);
    }

    #[test]
    fn seen_broadcasts_is_bounded() {
        let manager = Manager::new(P2pConfig::default(), NodeRole::Discovery);
        for key in 0..(SEEN_BROADCASTS_CAPACITY as u64 + 10) {
            manager.note_seen(key);
        }
        let seen = manager.seen_broadcasts.lock().unwrap();
        assert_eq!(seen.len(), SEEN_BROADCASTS_CAPACITY);
    }
}
