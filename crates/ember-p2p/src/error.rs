use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum P2pError {
    #[error("invalid frame: {0}")]
    FrameInvalid(String),

    #[error("invalid handshake: {0}")]
    HandshakeInvalid(String),

    #[error("duplicate node id")]
    DuplicateNodeId,

    #[error("registry full")]
    RegistryFull,

    #[error("session closed")]
    SessionClosed,

    #[error("no session for node: {0}")]
    NoSuchSession(String),

    #[error("command not allowed for discovery peer")]
    Forbidden,

    #[error("request timed out")]
    Timeout,

    #[error("chain decode error: {0}")]
    Decode(#[from] ember_chain::ChainError),

    #[error("io error: {0}")]
    Io(String),

    #[error("websocket error: {0}")]
    Ws(String),

    #[error("node shutting down")]
    Shutdown,
}

impl From<std::io::Error> for P2pError {
    fn from(e: std::io::Error) -> Self {
        P2pError::Io(e.to_string())
    }
}

impl From<tungstenite::Error> for P2pError {
    fn from(e: tungstenite::Error) -> Self {
        P2pError::Ws(e.to_string())
    }
}
