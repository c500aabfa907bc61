//! Per-command payload encoders and decoders.
//!
//! Encoders produce complete [`Frame`]s; decoders validate the payload
//! against the command's schema and hand back typed values. Chain payloads
//! (transactions, blocks) stay raw bytes here — decoding them is the chain
//! codec's job, not the wire layer's.

use std::collections::HashMap;
use std::net::IpAddr;

use ember_chain::Hash;

use crate::error::P2pError;
use crate::types::{Endpoint, NodeId, NodeInfo, NodeType, PeerEntry};
use crate::wire::frame::{fnv1a64, CommandKind, Frame, FrameKind, RequestId};

/// `Info` payload: three u64 fields plus the 32-byte tip hash.
const INFO_PAYLOAD_LEN: usize = 8 + 8 + 8 + Hash::LEN;

// ── Requests ──────────────────────────────────────────────────────────────────

pub fn ping_request() -> Frame {
    Frame::build(FrameKind::Request, RequestId::random(), CommandKind::Ping, &[])
}

pub fn info_request(info: &NodeInfo) -> Frame {
    Frame::build(
        FrameKind::Request,
        RequestId::random(),
        CommandKind::Info,
        &encode_node_info(info),
    )
}

pub fn nodes_request() -> Frame {
    Frame::build(FrameKind::Request, RequestId::random(), CommandKind::RequestNodes, &[])
}

pub fn validator_txs_request() -> Frame {
    Frame::build(
        FrameKind::Request,
        RequestId::random(),
        CommandKind::RequestValidatorTxs,
        &[],
    )
}

// ── Answers ───────────────────────────────────────────────────────────────────

pub fn ping_answer(id: RequestId) -> Frame {
    Frame::build(FrameKind::Answer, id, CommandKind::Ping, &[])
}

pub fn info_answer(id: RequestId, info: &NodeInfo) -> Frame {
    Frame::build(FrameKind::Answer, id, CommandKind::Info, &encode_node_info(info))
}

/// Answer to `RequestNodes`: a concatenation of peer records.
pub fn nodes_answer(id: RequestId, peers: &HashMap<NodeId, PeerEntry>) -> Frame {
    let mut payload = Vec::with_capacity(peers.len() * 40);
    for (node_id, entry) in peers {
        payload.push(entry.node_type.as_u8());
        payload.extend_from_slice(node_id.as_bytes());
        match entry.endpoint.ip {
            IpAddr::V4(ip) => {
                payload.push(0);
                payload.extend_from_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                payload.push(1);
                payload.extend_from_slice(&ip.octets());
            }
        }
        payload.extend_from_slice(&entry.endpoint.port.to_be_bytes());
    }
    Frame::build(FrameKind::Answer, id, CommandKind::RequestNodes, &payload)
}

/// Answer to `RequestValidatorTxs`: length-prefixed raw transaction records.
pub fn validator_txs_answer<'a, I>(id: RequestId, txs: I) -> Frame
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut payload = Vec::new();
    for tx in txs {
        payload.extend_from_slice(&(tx.len() as u32).to_be_bytes());
        payload.extend_from_slice(tx);
    }
    Frame::build(FrameKind::Answer, id, CommandKind::RequestValidatorTxs, &payload)
}

// ── Broadcasts ────────────────────────────────────────────────────────────────

/// Build a broadcast frame. The request-id slot carries the FNV-1a hash of
/// the payload, so the same payload yields the same dedup key on every node.
pub fn broadcast(command: CommandKind, payload: &[u8]) -> Frame {
    debug_assert!(command.is_broadcast());
    Frame::build(
        FrameKind::Broadcast,
        RequestId::from_u64(fnv1a64(payload)),
        command,
        payload,
    )
}

// ── Decoders ──────────────────────────────────────────────────────────────────

/// Validate a `Ping` request or answer (empty payload).
pub fn decode_ping(frame: &Frame) -> Result<(), P2pError> {
    expect_command(frame, CommandKind::Ping)?;
    expect_empty_payload(frame)
}

/// Validate a `RequestNodes` request (empty payload).
pub fn decode_nodes_request(frame: &Frame) -> Result<(), P2pError> {
    expect_command(frame, CommandKind::RequestNodes)?;
    expect_empty_payload(frame)
}

/// Validate a `RequestValidatorTxs` request (empty payload).
pub fn decode_validator_txs_request(frame: &Frame) -> Result<(), P2pError> {
    expect_command(frame, CommandKind::RequestValidatorTxs)?;
    expect_empty_payload(frame)
}

/// Decode an `Info` payload from either a request or an answer.
pub fn decode_info(frame: &Frame) -> Result<NodeInfo, P2pError> {
    expect_command(frame, CommandKind::Info)?;
    let payload = frame.payload();
    if payload.len() != INFO_PAYLOAD_LEN {
        return Err(P2pError::FrameInvalid(format!(
            "info payload must be {INFO_PAYLOAD_LEN} bytes, got {}",
            payload.len()
        )));
    }
    let version = u64::from_be_bytes(payload[0..8].try_into().unwrap());
    let timestamp_us = u64::from_be_bytes(payload[8..16].try_into().unwrap());
    let height = u64::from_be_bytes(payload[16..24].try_into().unwrap());
    let latest_block_hash = Hash::from_slice(&payload[24..56]).unwrap();
    Ok(NodeInfo { version, timestamp_us, height, latest_block_hash })
}

/// Decode a `RequestNodes` answer into a peer map.
///
/// A truncated trailing record or an unknown ip version invalidates the whole
/// answer — no partial map leaks out.
pub fn decode_nodes_answer(frame: &Frame) -> Result<HashMap<NodeId, PeerEntry>, P2pError> {
    expect_command(frame, CommandKind::RequestNodes)?;
    if frame.kind() != FrameKind::Answer {
        return Err(P2pError::FrameInvalid("expected answer frame".into()));
    }

    let data = frame.payload();
    let mut peers = HashMap::new();
    let mut index = 0;
    while index < data.len() {
        // Fixed part: type (1) + node id (32) + ip version (1).
        let fixed = take(data, &mut index, 1 + NodeId::LEN + 1)?;
        let node_type = NodeType::from_u8(fixed[0])
            .ok_or_else(|| P2pError::FrameInvalid(format!("unknown node type {}", fixed[0])))?;
        let node_id = NodeId::from_slice(&fixed[1..33]).unwrap();
        let ip = match fixed[33] {
            0 => {
                let octets: [u8; 4] = take(data, &mut index, 4)?.try_into().unwrap();
                IpAddr::from(octets)
            }
            1 => {
                let octets: [u8; 16] = take(data, &mut index, 16)?.try_into().unwrap();
                IpAddr::from(octets)
            }
            v => return Err(P2pError::FrameInvalid(format!("unknown ip version {v}"))),
        };
        let port = u16::from_be_bytes(take(data, &mut index, 2)?.try_into().unwrap());
        peers.insert(node_id, PeerEntry { node_type, endpoint: Endpoint::new(ip, port) });
    }
    Ok(peers)
}

/// Decode a `RequestValidatorTxs` answer into raw transaction records.
pub fn decode_validator_txs_answer(frame: &Frame) -> Result<Vec<Vec<u8>>, P2pError> {
    expect_command(frame, CommandKind::RequestValidatorTxs)?;
    if frame.kind() != FrameKind::Answer {
        return Err(P2pError::FrameInvalid("expected answer frame".into()));
    }

    let data = frame.payload();
    let mut txs = Vec::new();
    let mut index = 0;
    while index < data.len() {
        let size = u32::from_be_bytes(take(data, &mut index, 4)?.try_into().unwrap()) as usize;
        txs.push(take(data, &mut index, size)?.to_vec());
    }
    Ok(txs)
}

/// Validate a broadcast frame and return its payload.
///
/// The id slot must equal the FNV-1a hash of the payload; a mismatch means
/// the sender lied about the dedup key and the frame is discarded.
pub fn decode_broadcast(frame: &Frame) -> Result<&[u8], P2pError> {
    if frame.kind() != FrameKind::Broadcast {
        return Err(P2pError::FrameInvalid("expected broadcast frame".into()));
    }
    if !frame.command().is_broadcast() {
        return Err(P2pError::FrameInvalid(format!(
            "{} is not a broadcast command",
            frame.command()
        )));
    }
    let payload = frame.payload();
    if frame.id().to_u64() != fnv1a64(payload) {
        return Err(P2pError::FrameInvalid("broadcast id does not match payload hash".into()));
    }
    Ok(payload)
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn encode_node_info(info: &NodeInfo) -> Vec<u8> {
    let mut payload = Vec::with_capacity(INFO_PAYLOAD_LEN);
    payload.extend_from_slice(&info.version.to_be_bytes());
    payload.extend_from_slice(&info.timestamp_us.to_be_bytes());
    payload.extend_from_slice(&info.height.to_be_bytes());
    payload.extend_from_slice(info.latest_block_hash.as_bytes());
    payload
}

fn expect_command(frame: &Frame, command: CommandKind) -> Result<(), P2pError> {
    if frame.command() != command {
        return Err(P2pError::FrameInvalid(format!(
            "expected {command}, got {}",
            frame.command()
        )));
    }
    Ok(())
}

fn expect_empty_payload(frame: &Frame) -> Result<(), P2pError> {
    if !frame.payload().is_empty() {
        return Err(P2pError::FrameInvalid(format!(
            "unexpected {}-byte payload",
            frame.payload().len()
        )));
    }
    Ok(())
}

/// Advance `index` past `len` bytes of `data`, failing on truncation.
fn take<'a>(data: &'a [u8], index: &mut usize, len: usize) -> Result<&'a [u8], P2pError> {
    let end = index.checked_add(len).filter(|&e| e <= data.len()).ok_or_else(|| {
        P2pError::FrameInvalid(format!(
            "truncated record: need {len} bytes at offset {index}, have {}",
            data.len()
        ))
    })?;
    let slice = &data[*index..end];
    *index = end;
    Ok(slice)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    fn sample_info() -> NodeInfo {
        NodeInfo {
            version: 1,
            timestamp_us: 1_700_000_000_000_000,
            height: 917,
            latest_block_hash: Hash::digest(b"tip"),
        }
    }

    #[test]
    fn info_roundtrip_request_and_answer() {
        let info = sample_info();
        assert_eq!(decode_info(&info_request(&info)).unwrap(), info);
        let answer = info_answer(RequestId::random(), &info);
        assert_eq!(decode_info(&answer).unwrap(), info);
    }

    #[test]
    fn info_rejects_wrong_payload_len() {
        let frame = Frame::build(
            FrameKind::Answer,
            RequestId::random(),
            CommandKind::Info,
            &[0u8; 55],
        );
        assert!(decode_info(&frame).is_err());
    }

    #[test]
    fn nodes_answer_roundtrip_mixed_ip_versions() {
        let mut peers = HashMap::new();
        peers.insert(
            NodeId::random(),
            PeerEntry {
                node_type: NodeType::Normal,
                endpoint: Endpoint::new("10.0.0.7".parse().unwrap(), 8086),
            },
        );
        peers.insert(
            NodeId::random(),
            PeerEntry {
                node_type: NodeType::Discovery,
                endpoint: Endpoint::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 9000),
            },
        );
        let frame = nodes_answer(RequestId::random(), &peers);
        assert_eq!(decode_nodes_answer(&frame).unwrap(), peers);
    }

    #[test]
    fn nodes_answer_rejects_truncated_record() {
        let peers: HashMap<_, _> = [(
            NodeId::random(),
            PeerEntry {
                node_type: NodeType::Normal,
                endpoint: Endpoint::new("127.0.0.1".parse().unwrap(), 1),
            },
        )]
        .into();
        let mut raw = nodes_answer(RequestId::random(), &peers).into_raw();
        raw.truncate(raw.len() - 1); // drop one byte of the trailing port
        let frame = Frame::parse(raw).unwrap();
        assert!(matches!(decode_nodes_answer(&frame), Err(P2pError::FrameInvalid(_))));
    }

    #[test]
    fn nodes_answer_rejects_unknown_ip_version() {
        let mut payload = Vec::new();
        payload.push(0u8); // node type
        payload.extend_from_slice(NodeId::random().as_bytes());
        payload.push(9); // bogus ip version
        payload.extend_from_slice(&[0u8; 6]);
        let frame = Frame::build(
            FrameKind::Answer,
            RequestId::random(),
            CommandKind::RequestNodes,
            &payload,
        );
        assert!(matches!(decode_nodes_answer(&frame), Err(P2pError::FrameInvalid(_))));
    }

    #[test]
    fn validator_txs_roundtrip() {
        let txs: Vec<Vec<u8>> = vec![b"tx-one".to_vec(), b"tx-two-longer".to_vec(), Vec::new()];
        let frame = validator_txs_answer(RequestId::random(), txs.iter().map(Vec::as_slice));
        assert_eq!(decode_validator_txs_answer(&frame).unwrap(), txs);
    }

    #[test]
    fn validator_txs_rejects_truncated_chunk() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&10u32.to_be_bytes());
        payload.extend_from_slice(b"short"); // 5 bytes where 10 were declared
        let frame = Frame::build(
            FrameKind::Answer,
            RequestId::random(),
            CommandKind::RequestValidatorTxs,
            &payload,
        );
        assert!(decode_validator_txs_answer(&frame).is_err());
    }

    #[test]
    fn broadcast_id_is_payload_hash() {
        let frame = broadcast(CommandKind::BroadcastBlock, b"block bytes");
        assert_eq!(frame.id().to_u64(), fnv1a64(b"block bytes"));
        assert_eq!(decode_broadcast(&frame).unwrap(), b"block bytes");
    }

    #[test]
    fn broadcast_rejects_forged_id() {
        let raw = Frame::build(
            FrameKind::Broadcast,
            RequestId::from_u64(0x1234),
            CommandKind::BroadcastTx,
            b"payload",
        );
        assert!(matches!(decode_broadcast(&raw), Err(P2pError::FrameInvalid(_))));
    }

    #[test]
    fn empty_payload_commands_reject_extra_bytes() {
        let frame = Frame::build(
            FrameKind::Request,
            RequestId::random(),
            CommandKind::Ping,
            b"junk",
        );
        assert!(decode_ping(&frame).is_err());
    }
}
