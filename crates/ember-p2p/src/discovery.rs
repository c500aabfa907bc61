//! Background peer-discovery worker.
//!
//! One long-running task that keeps the node connected: while the session
//! count sits below the floor it asks existing peers for their peer lists
//! and dials every new Normal node it learns about. The first productive
//! pass polls Discovery peers (the authoritative index, for a fast
//! bootstrap); later passes poll Normal peers to diversify. A peer that was
//! polled is left alone for sixty seconds before being asked again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::manager::Manager;
use crate::types::{NodeId, NodeType, PeerEntry};

/// Base interval between passes.
const PASS_INTERVAL: Duration = Duration::from_secs(1);
/// Backoff while the session count sits comfortably above the floor.
const COMFORT_BACKOFF: Duration = Duration::from_secs(5);
/// Backoff while the registry is full.
const FULL_BACKOFF: Duration = Duration::from_secs(60);
/// How long a polled peer is exempt from being polled again.
const REQUESTED_TTL: Duration = Duration::from_secs(60);
/// Per-peer wait for a `RequestNodes` answer during discovery.
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Run the discovery loop until the manager's stop signal fires. The task
/// reacts to a stop within one second — every sleep and every step checks.
pub(crate) async fn run(manager: Arc<Manager>) {
    let stop = manager.stop_token();
    // Peers recently asked for their peer list, and when.
    let mut requested: HashMap<NodeId, Instant> = HashMap::new();
    let mut bootstrapped = false;

    debug!("discovery worker started");
    'pass: loop {
        if !sleep_unless_stopped(&stop, PASS_INTERVAL).await {
            break;
        }

        // Stay inside the connection window before doing any work: nap while
        // comfortable, back off hard while full.
        loop {
            let size = manager.peer_count();
            if size >= manager.max_connections() {
                trace!(size, "registry full, discovery backing off");
                if !sleep_unless_stopped(&stop, FULL_BACKOFF).await {
                    break 'pass;
                }
                continue 'pass;
            }
            if size >= manager.min_connections() {
                if !sleep_unless_stopped(&stop, COMFORT_BACKOFF).await {
                    break 'pass;
                }
                continue;
            }
            break;
        }

        requested.retain(|_, polled_at| polled_at.elapsed() < REQUESTED_TTL);

        // Partition current peers, skipping any polled in the last minute.
        let mut discovery_peers = Vec::new();
        let mut normal_peers = Vec::new();
        for session in manager.sessions_snapshot() {
            if requested.contains_key(&session.node_id()) {
                continue;
            }
            match session.node_type() {
                NodeType::Discovery => discovery_peers.push(session.node_id()),
                NodeType::Normal => normal_peers.push(session.node_id()),
            }
        }

        let poll = if bootstrapped { normal_peers } else { discovery_peers };
        for peer in poll {
            if stop.is_cancelled() {
                break 'pass;
            }
            let learned = manager.request_nodes_within(&peer, POLL_TIMEOUT).await;
            trace!(peer = %peer, learned = learned.len(), "peer list received");
            for (node_id, entry) in learned {
                if stop.is_cancelled() {
                    break 'pass;
                }
                dial_candidate(&manager, node_id, entry);
            }
            requested.insert(peer, Instant::now());
        }
        bootstrapped = true;
    }
    debug!("discovery worker stopped");
}

/// Dial a freshly learned peer, unless it is a Discovery node (they do not
/// take arbitrary traffic), ourselves, or already connected.
fn dial_candidate(manager: &Arc<Manager>, node_id: NodeId, entry: PeerEntry) {
    if entry.node_type == NodeType::Discovery {
        return;
    }
    if node_id == manager.node_id() || manager.has_session(&node_id) {
        return;
    }
    let manager = Arc::clone(manager);
    // Dial on its own task; a slow or dead endpoint must not stall the pass.
    tokio::spawn(async move {
        let addr = entry.endpoint.to_socket_addr();
        if let Err(e) = manager.connect_to(addr).await {
            debug!(%addr, "discovery dial failed: {e}");
        }
    });
}

/// Sleep for `duration`, returning `false` if the stop signal fired first.
async fn sleep_unless_stopped(stop: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = stop.cancelled() => false,
        _ = sleep(duration) => true,
    }
}
