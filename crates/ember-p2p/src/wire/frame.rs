//! Frame layout, shared by every command:
//!
//! ```text
//! byte    0        1..9          9..11        11..
//!         type     request id    command      payload
//! ```
//!
//! All multi-byte integers are big-endian. Minimum frame length is 11 bytes.

use std::fmt;

use rand::RngCore;

use crate::error::P2pError;

/// Shortest possible frame: type + request id + command, empty payload.
pub const MIN_FRAME_LEN: usize = 11;

/// Top-level frame category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Request,
    Answer,
    Broadcast,
}

impl FrameKind {
    pub fn as_u8(self) -> u8 {
        match self {
            FrameKind::Request => 0x00,
            FrameKind::Answer => 0x01,
            FrameKind::Broadcast => 0x02,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(FrameKind::Request),
            0x01 => Some(FrameKind::Answer),
            0x02 => Some(FrameKind::Broadcast),
            _ => None,
        }
    }
}

/// Protocol command, the 2-byte prefix after the request id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Ping,
    Info,
    RequestNodes,
    RequestValidatorTxs,
    BroadcastValidatorTx,
    BroadcastTx,
    BroadcastBlock,
}

impl CommandKind {
    pub fn as_u16(self) -> u16 {
        match self {
            CommandKind::Ping => 0x0000,
            CommandKind::Info => 0x0001,
            CommandKind::RequestNodes => 0x0002,
            CommandKind::RequestValidatorTxs => 0x0003,
            CommandKind::BroadcastValidatorTx => 0x0004,
            CommandKind::BroadcastTx => 0x0005,
            CommandKind::BroadcastBlock => 0x0006,
        }
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x0000 => Some(CommandKind::Ping),
            0x0001 => Some(CommandKind::Info),
            0x0002 => Some(CommandKind::RequestNodes),
            0x0003 => Some(CommandKind::RequestValidatorTxs),
            0x0004 => Some(CommandKind::BroadcastValidatorTx),
            0x0005 => Some(CommandKind::BroadcastTx),
            0x0006 => Some(CommandKind::BroadcastBlock),
            _ => None,
        }
    }

    pub fn is_broadcast(self) -> bool {
        matches!(
            self,
            CommandKind::BroadcastValidatorTx | CommandKind::BroadcastTx | CommandKind::BroadcastBlock
        )
    }

    /// Commands a Discovery peer accepts; everything else must not be sent
    /// to one.
    pub fn allowed_for_discovery(self) -> bool {
        matches!(self, CommandKind::Ping | CommandKind::Info | CommandKind::RequestNodes)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandKind::Ping => "Ping",
            CommandKind::Info => "Info",
            CommandKind::RequestNodes => "RequestNodes",
            CommandKind::RequestValidatorTxs => "RequestValidatorTxs",
            CommandKind::BroadcastValidatorTx => "BroadcastValidatorTx",
            CommandKind::BroadcastTx => "BroadcastTx",
            CommandKind::BroadcastBlock => "BroadcastBlock",
        };
        f.write_str(name)
    }
}

/// 8-byte request correlation id.
///
/// Random for correlated requests; for broadcasts it carries the FNV-1a hash
/// of the payload so every node derives the same dedup key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId([u8; 8]);

impl RequestId {
    pub fn random() -> Self {
        let mut out = [0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut out);
        Self(out)
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    pub fn from_u64(v: u64) -> Self {
        Self(v.to_be_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    pub fn to_u64(self) -> u64 {
        u64::from_be_bytes(self.0)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({})", hex::encode(self.0))
    }
}

/// FNV-1a over `data`, 64-bit.
///
/// Used for broadcast ids: unlike the std hasher it is not random-seeded, so
/// every node computes the same value for the same payload.
pub fn fnv1a64(data: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for &b in data {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// One parsed-and-validated wire frame.
///
/// Owns the raw bytes; accessors slice into them. Constructed either by
/// [`Frame::parse`] (inbound) or [`Frame::build`] (outbound) so a `Frame`
/// value is always structurally valid.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    raw: Vec<u8>,
}

impl Frame {
    /// Assemble an outbound frame.
    pub fn build(kind: FrameKind, id: RequestId, command: CommandKind, payload: &[u8]) -> Self {
        let mut raw = Vec::with_capacity(MIN_FRAME_LEN + payload.len());
        raw.push(kind.as_u8());
        raw.extend_from_slice(id.as_bytes());
        raw.extend_from_slice(&command.as_u16().to_be_bytes());
        raw.extend_from_slice(payload);
        Self { raw }
    }

    /// Validate an inbound message: length, type prefix, command prefix.
    pub fn parse(raw: Vec<u8>) -> Result<Self, P2pError> {
        if raw.len() < MIN_FRAME_LEN {
            return Err(P2pError::FrameInvalid(format!(
                "frame too short: {} bytes",
                raw.len()
            )));
        }
        if FrameKind::from_u8(raw[0]).is_none() {
            return Err(P2pError::FrameInvalid(format!("unknown type prefix {:#04x}", raw[0])));
        }
        let cmd = u16::from_be_bytes([raw[9], raw[10]]);
        if CommandKind::from_u16(cmd).is_none() {
            return Err(P2pError::FrameInvalid(format!("unknown command prefix {cmd:#06x}")));
        }
        Ok(Self { raw })
    }

    pub fn kind(&self) -> FrameKind {
        FrameKind::from_u8(self.raw[0]).unwrap()
    }

    pub fn id(&self) -> RequestId {
        RequestId::from_bytes(self.raw[1..9].try_into().unwrap())
    }

    pub fn command(&self) -> CommandKind {
        CommandKind::from_u16(u16::from_be_bytes([self.raw[9], self.raw[10]])).unwrap()
    }

    pub fn payload(&self) -> &[u8] {
        &self.raw[MIN_FRAME_LEN..]
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn into_raw(self) -> Vec<u8> {
        self.raw
    }

    /// Total frame length in bytes, never less than [`MIN_FRAME_LEN`].
    pub fn len(&self) -> usize {
        self.raw.len()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("kind", &self.kind())
            .field("id", &self.id())
            .field("command", &self.command())
            .field("payload_len", &self.payload().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_parse_roundtrip() {
        let id = RequestId::random();
        let frame = Frame::build(FrameKind::Request, id, CommandKind::Info, b"abc");
        let parsed = Frame::parse(frame.raw().to_vec()).unwrap();
        assert_eq!(parsed.kind(), FrameKind::Request);
        assert_eq!(parsed.id(), id);
        assert_eq!(parsed.command(), CommandKind::Info);
        assert_eq!(parsed.payload(), b"abc");
    }

    #[test]
    fn parse_rejects_short_frame() {
        assert!(matches!(
            Frame::parse(vec![0u8; MIN_FRAME_LEN - 1]),
            Err(P2pError::FrameInvalid(_))
        ));
    }

    #[test]
    fn parse_rejects_unknown_type() {
        let mut raw = Frame::build(
            FrameKind::Request,
            RequestId::from_u64(1),
            CommandKind::Ping,
            &[],
        )
        .into_raw();
        raw[0] = 0x03;
        assert!(matches!(Frame::parse(raw), Err(P2pError::FrameInvalid(_))));
    }

    #[test]
    fn parse_rejects_unknown_command() {
        let mut raw = Frame::build(
            FrameKind::Request,
            RequestId::from_u64(1),
            CommandKind::Ping,
            &[],
        )
        .into_raw();
        raw[10] = 0x07;
        assert!(matches!(Frame::parse(raw), Err(P2pError::FrameInvalid(_))));
    }

    #[test]
    fn fnv1a64_known_vectors() {
        // Reference values for the 64-bit FNV-1a parameters.
        assert_eq!(fnv1a64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a64(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv1a64(b"foobar"), 0x85944171f73967e8);
    }

    #[test]
    fn request_id_u64_roundtrip() {
        let id = RequestId::from_u64(0xdead_beef_0102_0304);
        assert_eq!(id.to_u64(), 0xdead_beef_0102_0304);
        assert_eq!(RequestId::from_bytes(*id.as_bytes()), id);
    }
}
