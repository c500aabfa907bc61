//! One logical P2P connection: WebSocket handshake, framed read loop and a
//! FIFO write queue drained by a single writer task.
//!
//! Identity travels in the upgrade exchange — `X-Node-Id`, `X-Node-Type` and
//! `X-Node-ServerPort` headers on the client request and mirrored back on the
//! server response — so both ends know who they are talking to before the
//! first frame. A session is created on accept or connect, registered by the
//! manager after a successful handshake, and torn down when its read loop
//! ends; unregistration happens exactly once, from the read task.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_hdr_async, client_async, WebSocketStream};
use tracing::{debug, warn};
use tungstenite::handshake::client::generate_key;
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http;
use tungstenite::Message;

use crate::error::P2pError;
use crate::types::{NodeId, NodeType};
use crate::wire::frame::{Frame, MIN_FRAME_LEN};

pub const HEADER_NODE_ID: &str = "X-Node-Id";
pub const HEADER_NODE_TYPE: &str = "X-Node-Type";
pub const HEADER_SERVER_PORT: &str = "X-Node-ServerPort";

/// Consecutive invalid frames tolerated before the session is closed.
const INVALID_FRAME_STRIKES: u32 = 3;

pub type WsStream = WebSocketStream<TcpStream>;

/// Receives inbound frames and lifecycle events from session tasks.
///
/// The manager implements this; sessions hold it weakly so a dropped manager
/// simply ends the read loops instead of keeping the whole node alive.
pub trait FrameHandler: Send + Sync + 'static {
    /// Called from the read task for every valid frame. Must not block;
    /// implementations dispatch to the worker pool.
    fn on_frame(&self, session: &Arc<Session>, frame: Frame);

    /// Called exactly once when the read loop of a registered session ends.
    fn on_session_closed(&self, session: &Arc<Session>);
}

/// The local node's half of the handshake headers.
#[derive(Debug, Clone, Copy)]
pub struct LocalIdentity {
    pub node_id: NodeId,
    pub node_type: NodeType,
    pub server_port: u16,
}

/// What the handshake told us about the remote node.
#[derive(Debug, Clone, Copy)]
pub struct RemoteIdentity {
    pub node_id: NodeId,
    pub node_type: NodeType,
    pub server_port: u16,
    pub address: IpAddr,
}

/// Who initiated the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Client,
    Server,
}

/// Connection lifecycle. `Closed` is terminal; there is no way back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    Open,
    Closing,
    Closed,
}

/// Handle to one live connection.
///
/// Shared between the registry, the read/write tasks and in-flight handler
/// invocations; the read task owns the close decision when the socket dies.
pub struct Session {
    remote: RemoteIdentity,
    role: SessionRole,
    state: Mutex<SessionState>,
    out_tx: mpsc::UnboundedSender<Message>,
    /// Guards the exactly-once `on_session_closed` callback.
    finished: AtomicBool,
}

impl Session {
    pub(crate) fn new(remote: RemoteIdentity, role: SessionRole, out_tx: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            remote,
            role,
            state: Mutex::new(SessionState::Handshaking),
            out_tx,
            finished: AtomicBool::new(false),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.remote.node_id
    }

    pub fn node_type(&self) -> NodeType {
        self.remote.node_type
    }

    pub fn server_port(&self) -> u16 {
        self.remote.server_port
    }

    pub fn address(&self) -> IpAddr {
        self.remote.address
    }

    /// The endpoint the remote's own server listens on (its address plus the
    /// advertised server port — not the ephemeral port of this connection).
    pub fn server_endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.remote.address, self.remote.server_port)
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    /// Enqueue a frame for transmission. Non-blocking; total order per
    /// session is the enqueue order. Writes against a closing or closed
    /// session are silently dropped.
    pub fn write(&self, frame: Frame) {
        if self.state() != SessionState::Open {
            debug!(peer = %self.remote.node_id, "dropping write to non-open session");
            return;
        }
        let _ = self.out_tx.send(Message::Binary(frame.into_raw()));
    }

    /// Begin an orderly shutdown: queued writes flush, then a close frame
    /// goes out and the writer task exits. Idempotent.
    pub fn close(&self) {
        if !self.begin_closing() {
            return;
        }
        let _ = self.out_tx.send(Message::Close(None));
    }

    /// Move to `Closing` if the session is not already past it.
    fn begin_closing(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        match *state {
            SessionState::Handshaking | SessionState::Open => {
                *state = SessionState::Closing;
                true
            }
            SessionState::Closing | SessionState::Closed => false,
        }
    }

    pub(crate) fn mark_open(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == SessionState::Handshaking {
            *state = SessionState::Open;
        }
    }

    pub(crate) fn mark_closed(&self) {
        *self.state.lock().unwrap() = SessionState::Closed;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("node_id", &self.remote.node_id)
            .field("node_type", &self.remote.node_type)
            .field("role", &self.role)
            .field("state", &self.state())
            .finish()
    }
}

// ── Handshake ─────────────────────────────────────────────────────────────────

/// Dial `addr` and perform the client side of the upgrade.
///
/// Returns the upgraded stream plus the remote identity read from the
/// response headers. Any missing or malformed header fails the handshake and
/// the connection is dropped without ever reaching the registry.
pub async fn connect(local: &LocalIdentity, addr: SocketAddr) -> Result<(WsStream, RemoteIdentity), P2pError> {
    let tcp = TcpStream::connect(addr).await?;

    let request = Request::builder()
        .uri(format!("ws://{addr}/"))
        .header("Host", addr.to_string())
        .header("Upgrade", "websocket")
        .header("Connection", "Upgrade")
        .header("Sec-WebSocket-Key", generate_key())
        .header("Sec-WebSocket-Version", "13")
        .header(HEADER_NODE_ID, local.node_id.to_hex())
        .header(HEADER_NODE_TYPE, local.node_type.as_u8().to_string())
        .header(HEADER_SERVER_PORT, local.server_port.to_string())
        .body(())
        .map_err(|e| P2pError::HandshakeInvalid(e.to_string()))?;

    let (ws, response) = client_async(request, tcp).await?;
    let remote = identity_from_headers(response.headers(), addr.ip())?;
    Ok((ws, remote))
}

/// Perform the server side of the upgrade on an accepted socket.
///
/// The remote's identity headers are validated inside the upgrade callback;
/// a bad handshake is refused at the HTTP layer (the dialer sees a failed
/// upgrade, not a WebSocket close).
pub async fn accept(local: &LocalIdentity, tcp: TcpStream) -> Result<(WsStream, RemoteIdentity), P2pError> {
    let peer_ip = tcp.peer_addr()?.ip();
    let mut remote: Option<RemoteIdentity> = None;

    let local = *local;
    let ws = accept_hdr_async(tcp, |req: &Request, mut resp: Response| {
        match identity_from_headers(req.headers(), peer_ip) {
            Ok(identity) => {
                remote = Some(identity);
                let headers = resp.headers_mut();
                headers.insert(HEADER_NODE_ID, header_value(local.node_id.to_hex()));
                headers.insert(HEADER_NODE_TYPE, header_value(local.node_type.as_u8().to_string()));
                headers.insert(HEADER_SERVER_PORT, header_value(local.server_port.to_string()));
                Ok(resp)
            }
            Err(e) => {
                let mut refuse = ErrorResponse::new(Some(e.to_string()));
                *refuse.status_mut() = http::StatusCode::BAD_REQUEST;
                Err(refuse)
            }
        }
    })
    .await?;

    let remote = remote.ok_or_else(|| P2pError::HandshakeInvalid("upgrade callback not run".into()))?;
    Ok((ws, remote))
}

fn header_value(s: String) -> http::HeaderValue {
    // node id hex, a single digit and a port are always valid header bytes
    http::HeaderValue::from_str(&s).unwrap()
}

fn identity_from_headers(headers: &http::HeaderMap, address: IpAddr) -> Result<RemoteIdentity, P2pError> {
    let node_id = header_str(headers, HEADER_NODE_ID)
        .and_then(NodeId::from_hex)
        .ok_or_else(|| P2pError::HandshakeInvalid(format!("missing or malformed {HEADER_NODE_ID}")))?;

    let node_type = header_str(headers, HEADER_NODE_TYPE)
        .filter(|s| s.len() == 1)
        .and_then(|s| s.parse::<u8>().ok())
        .and_then(NodeType::from_u8)
        .ok_or_else(|| P2pError::HandshakeInvalid(format!("missing or malformed {HEADER_NODE_TYPE}")))?;

    let server_port = header_str(headers, HEADER_SERVER_PORT)
        .and_then(|s| s.parse::<u16>().ok())
        .filter(|&p| p != 0)
        .ok_or_else(|| P2pError::HandshakeInvalid(format!("missing or malformed {HEADER_SERVER_PORT}")))?;

    Ok(RemoteIdentity { node_id, node_type, server_port, address })
}

fn header_str<'a>(headers: &'a http::HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name)?.to_str().ok()
}

// ── Task wiring ───────────────────────────────────────────────────────────────

/// Create the session handle for a completed handshake.
///
/// The handle exists before any I/O task runs so the manager can attempt
/// registration first; a rejected session is closed at the socket level
/// without ever having tasks to unwind.
pub fn create(remote: RemoteIdentity, role: SessionRole) -> (Arc<Session>, mpsc::UnboundedReceiver<Message>) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    (Arc::new(Session::new(remote, role, out_tx)), out_rx)
}

/// Start the read and write tasks for a registered session. From here on the
/// read task owns the teardown path.
pub fn spawn_io(
    session: Arc<Session>,
    ws: WsStream,
    out_rx: mpsc::UnboundedReceiver<Message>,
    handler: Weak<dyn FrameHandler>,
) {
    session.mark_open();
    let (sink, stream) = ws.split();
    tokio::spawn(write_loop(Arc::clone(&session), sink, out_rx));
    tokio::spawn(read_loop(session, stream, handler));
}

/// Drain the write queue into the socket, preserving FIFO order. A close
/// message flushes and ends the task.
async fn write_loop(
    session: Arc<Session>,
    mut sink: SplitSink<WsStream, Message>,
    mut out_rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = out_rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if let Err(e) = sink.send(msg).await {
            debug!(peer = %session.node_id(), "write failed: {e}");
            break;
        }
        if closing {
            break;
        }
    }
}

/// Pull binary messages off the socket until it closes, handing each valid
/// frame to the handler. Handling runs on the worker pool, never here.
async fn read_loop(
    session: Arc<Session>,
    mut stream: SplitStream<WsStream>,
    handler: Weak<dyn FrameHandler>,
) {
    let mut strikes = 0u32;

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Binary(data)) => {
                if data.len() < MIN_FRAME_LEN {
                    // Spurious traffic, not worth a disconnect.
                    debug!(peer = %session.node_id(), len = data.len(), "ignoring short message");
                    continue;
                }
                match Frame::parse(data) {
                    Ok(frame) => {
                        strikes = 0;
                        match handler.upgrade() {
                            Some(h) => h.on_frame(&session, frame),
                            None => break,
                        }
                    }
                    Err(e) => {
                        strikes += 1;
                        warn!(peer = %session.node_id(), strikes, "invalid frame: {e}");
                        if strikes >= INVALID_FRAME_STRIKES {
                            session.close();
                            break;
                        }
                    }
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {} // text/ping/pong — not part of the protocol
            Err(e) => {
                debug!(peer = %session.node_id(), "read error: {e}");
                break;
            }
        }
    }

    // Queue a close so the writer task flushes the backlog and exits; a
    // no-op when a close is already in flight.
    session.close();
    session.mark_closed();
    if !session.finished.swap(true, Ordering::SeqCst) {
        if let Some(h) = handler.upgrade() {
            h.on_session_closed(&session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(port: u16) -> RemoteIdentity {
        RemoteIdentity {
            node_id: NodeId::random(),
            node_type: NodeType::Normal,
            server_port: port,
            address: "127.0.0.1".parse().unwrap(),
        }
    }

    fn test_session() -> (Arc<Session>, mpsc::UnboundedReceiver<Message>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let session = Arc::new(Session::new(remote(9000), SessionRole::Client, out_tx));
        session.mark_open();
        (session, out_rx)
    }

    #[test]
    fn writes_are_fifo_in_the_queue() {
        let (session, mut out_rx) = test_session();
        let a = crate::wire::codec::ping_request();
        let b = crate::wire::codec::nodes_request();
        session.write(a.clone());
        session.write(b.clone());

        match out_rx.try_recv().unwrap() {
            Message::Binary(raw) => assert_eq!(raw, a.raw()),
            other => panic!("unexpected message: {other:?}"),
        }
        match out_rx.try_recv().unwrap() {
            Message::Binary(raw) => assert_eq!(raw, b.raw()),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn writes_after_close_are_dropped() {
        let (session, mut out_rx) = test_session();
        session.close();
        assert_eq!(session.state(), SessionState::Closing);

        session.write(crate::wire::codec::ping_request());
        // Only the close message made it into the queue.
        assert!(matches!(out_rx.try_recv().unwrap(), Message::Close(_)));
        assert!(out_rx.try_recv().is_err());
    }

    #[test]
    fn close_is_idempotent() {
        let (session, mut out_rx) = test_session();
        session.close();
        session.close();
        assert!(matches!(out_rx.try_recv().unwrap(), Message::Close(_)));
        assert!(out_rx.try_recv().is_err());
    }

    #[test]
    fn closed_is_terminal() {
        let (session, _out_rx) = test_session();
        session.mark_closed();
        session.mark_open();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.begin_closing());
    }

    #[test]
    fn identity_from_headers_rejects_bad_input() {
        let address: IpAddr = "127.0.0.1".parse().unwrap();
        let mut headers = http::HeaderMap::new();
        assert!(identity_from_headers(&headers, address).is_err());

        headers.insert(HEADER_NODE_ID, header_value(NodeId::random().to_hex()));
        headers.insert(HEADER_NODE_TYPE, header_value("7".into()));
        headers.insert(HEADER_SERVER_PORT, header_value("8086".into()));
        assert!(identity_from_headers(&headers, address).is_err());

        headers.insert(HEADER_NODE_TYPE, header_value("0".into()));
        headers.insert(HEADER_SERVER_PORT, header_value("0".into()));
        assert!(identity_from_headers(&headers, address).is_err());

        headers.insert(HEADER_SERVER_PORT, header_value("8086".into()));
        let identity = identity_from_headers(&headers, address).unwrap();
        assert_eq!(identity.node_type, NodeType::Normal);
        assert_eq!(identity.server_port, 8086);
    }

    #[test]
    fn server_endpoint_uses_advertised_port() {
        let (session, _out_rx) = test_session();
        assert_eq!(session.server_endpoint(), "127.0.0.1:9000".parse().unwrap());
    }
}
