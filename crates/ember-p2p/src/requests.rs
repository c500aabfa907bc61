//! Correlation of outbound requests with the answers that come back for
//! them.
//!
//! `begin` parks a one-shot completion under a fresh random id; the session
//! that delivers the matching answer fires it through `complete`. The
//! awaiting side never polls — it sits on the receiver until the answer
//! arrives or its timeout reaps the record. A background sweep collects
//! records nobody is waiting on anymore.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::P2pError;
use crate::types::NodeId;
use crate::wire::frame::{CommandKind, Frame, RequestId};

struct PendingRequest {
    command: CommandKind,
    /// Only an answer delivered by this node completes the record; answers
    /// claiming someone else's request id are dropped.
    target: NodeId,
    created_at: Instant,
    tx: oneshot::Sender<Frame>,
}

/// Table of requests awaiting their answers.
#[derive(Default)]
pub struct RequestTable {
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
}

impl RequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an outbound request and hand back the completion to await.
    ///
    /// `id` is the id already baked into the outgoing frame. In the
    /// vanishingly unlikely event it collides with an outstanding record the
    /// caller regenerates the frame; the table never overwrites.
    pub fn begin(
        &self,
        id: RequestId,
        command: CommandKind,
        target: NodeId,
    ) -> Option<oneshot::Receiver<Frame>> {
        let mut pending = self.pending.lock().unwrap();
        if pending.contains_key(&id) {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(id, PendingRequest { command, target, created_at: Instant::now(), tx });
        Some(rx)
    }

    /// Fulfil the record for `id`, if it exists and `from` matches the node
    /// the request was sent to. At most one answer wins; later matches and
    /// spoofed senders are discarded. Never blocks.
    pub fn complete(&self, id: RequestId, from: &NodeId, answer: Frame) -> bool {
        let record = {
            let mut pending = self.pending.lock().unwrap();
            match pending.get(&id) {
                Some(record) if record.target == *from => pending.remove(&id),
                Some(_) => {
                    debug!(%id, peer = %from, "answer from wrong peer dropped");
                    return false;
                }
                None => {
                    trace!(%id, "answer for unknown request dropped");
                    return false;
                }
            }
        };
        // Receiver may already be gone (caller timed out); that's fine.
        record.map(|r| r.tx.send(answer).is_ok()).unwrap_or(false)
    }

    /// Await the completion for up to `timeout`. On timeout the record is
    /// removed and `Timeout` returned; a table cleared underneath the caller
    /// (shutdown) reads the same way.
    pub async fn wait_for(
        &self,
        id: RequestId,
        rx: oneshot::Receiver<Frame>,
        timeout: Duration,
    ) -> Result<Frame, P2pError> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) | Err(_) => {
                self.remove(id);
                Err(P2pError::Timeout)
            }
        }
    }

    /// Drop every record at least `age` old. Waiters see their channel close
    /// and surface `Timeout`.
    pub fn expire_older_than(&self, age: Duration) -> usize {
        let mut pending = self.pending.lock().unwrap();
        let before = pending.len();
        pending.retain(|id, record| {
            if record.created_at.elapsed() < age {
                true
            } else {
                trace!(%id, command = %record.command, "request expired");
                false
            }
        });
        let expired = before - pending.len();
        if expired > 0 {
            debug!(expired, "reaped expired requests");
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().unwrap().is_empty()
    }

    pub fn remove(&self, id: RequestId) {
        self.pending.lock().unwrap().remove(&id);
    }

    /// Drop everything; pending waiters observe `Timeout`.
    pub fn clear(&self) {
        self.pending.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::codec;

    #[test]
    fn begin_refuses_colliding_id() {
        let table = RequestTable::new();
        let id = RequestId::from_u64(7);
        let target = NodeId::random();
        assert!(table.begin(id, CommandKind::Ping, target).is_some());
        assert!(table.begin(id, CommandKind::Ping, target).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn complete_is_at_most_once() {
        let table = RequestTable::new();
        let id = RequestId::from_u64(1);
        let target = NodeId::random();
        let _rx = table.begin(id, CommandKind::Ping, target).unwrap();

        assert!(table.complete(id, &target, codec::ping_answer(id)));
        assert!(!table.complete(id, &target, codec::ping_answer(id)));
        assert!(table.is_empty());
    }

    #[test]
    fn complete_filters_wrong_sender() {
        let table = RequestTable::new();
        let id = RequestId::from_u64(2);
        let target = NodeId::random();
        let imposter = NodeId::random();
        let _rx = table.begin(id, CommandKind::Ping, target).unwrap();

        assert!(!table.complete(id, &imposter, codec::ping_answer(id)));
        assert_eq!(table.len(), 1, "record must survive a spoofed answer");
        assert!(table.complete(id, &target, codec::ping_answer(id)));
    }
}
