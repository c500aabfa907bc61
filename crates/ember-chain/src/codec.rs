// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! `ChainCodec` — the decode seam between raw gossip bytes and typed chain
//! objects. The P2P core calls it with the exact payload it pulled off the
//! wire and the chain id it was configured with; everything downstream of a
//! successful decode can assume the container is structurally sound.

use crate::{Block, ChainError, Hash, TxBlock, TxValidator};

/// Decodes raw wire payloads into typed chain containers.
pub trait ChainCodec: Send + Sync {
    fn decode_block(&self, bytes: &[u8], chain_id: u64) -> Result<Block, ChainError>;

    fn decode_tx_block(&self, bytes: &[u8], chain_id: u64) -> Result<TxBlock, ChainError>;

    fn decode_tx_validator(&self, bytes: &[u8], chain_id: u64) -> Result<TxValidator, ChainError>;
}

/// Structural codec for the development chain format.
///
/// Payload layout: `u64 chain_id` (big-endian) followed by a non-empty body.
/// The consensus implementation replaces this with full RLP decoding behind
/// the same trait; the checks here are exactly what the P2P layer relies on
/// (chain-id match, non-empty body, stable hash).
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl RawCodec {
    pub fn new() -> Self {
        Self
    }

    /// Encode a body into the development format. Test fixtures and the
    /// node binary use this to produce payloads `decode_*` accepts.
    pub fn encode(body: &[u8], chain_id: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + body.len());
        out.extend_from_slice(&chain_id.to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    fn check(bytes: &[u8], chain_id: u64) -> Result<(), ChainError> {
        if bytes.is_empty() {
            return Err(ChainError::Empty);
        }
        if bytes.len() < 8 {
            return Err(ChainError::Truncated { need: 8, have: bytes.len() });
        }
        let got = u64::from_be_bytes(bytes[..8].try_into().unwrap());
        if got != chain_id {
            return Err(ChainError::ChainIdMismatch { expected: chain_id, got });
        }
        if bytes.len() == 8 {
            return Err(ChainError::Decode("empty body".into()));
        }
        Ok(())
    }
}

impl ChainCodec for RawCodec {
    fn decode_block(&self, bytes: &[u8], chain_id: u64) -> Result<Block, ChainError> {
        Self::check(bytes, chain_id)?;
        Ok(Block::new(bytes.to_vec(), Hash::digest(bytes), chain_id))
    }

    fn decode_tx_block(&self, bytes: &[u8], chain_id: u64) -> Result<TxBlock, ChainError> {
        Self::check(bytes, chain_id)?;
        Ok(TxBlock::new(bytes.to_vec(), Hash::digest(bytes), chain_id))
    }

    fn decode_tx_validator(&self, bytes: &[u8], chain_id: u64) -> Result<TxValidator, ChainError> {
        Self::check(bytes, chain_id)?;
        Ok(TxValidator::new(bytes.to_vec(), Hash::digest(bytes), chain_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_accepts_well_formed_payload() {
        let raw = RawCodec::encode(b"block body", 808);
        let block = RawCodec.decode_block(&raw, 808).unwrap();
        assert_eq!(block.raw(), &raw[..]);
        assert_eq!(block.chain_id(), 808);
        assert_eq!(*block.hash(), Hash::digest(&raw));
    }

    #[test]
    fn decode_rejects_empty() {
        assert_eq!(RawCodec.decode_block(&[], 808), Err(ChainError::Empty));
    }

    #[test]
    fn decode_rejects_short_prefix() {
        let err = RawCodec.decode_tx_block(&[1, 2, 3], 808).unwrap_err();
        assert!(matches!(err, ChainError::Truncated { .. }));
    }

    #[test]
    fn decode_rejects_wrong_chain_id() {
        let raw = RawCodec::encode(b"tx", 1);
        let err = RawCodec.decode_tx_validator(&raw, 808).unwrap_err();
        assert_eq!(err, ChainError::ChainIdMismatch { expected: 808, got: 1 });
    }

    #[test]
    fn decode_rejects_missing_body() {
        let raw = RawCodec::encode(b"", 808);
        assert!(matches!(RawCodec.decode_block(&raw, 808), Err(ChainError::Decode(_))));
    }
}
