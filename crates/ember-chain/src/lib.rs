// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Chain data-model seams for the ember node.
//!
//! The P2P core moves blocks and transactions around without understanding
//! them; everything it needs from the rest of the node fits behind three
//! traits: [`ChainCodec`] (bytes → typed containers), [`Storage`] (latest
//! block height/hash for `Info` answers) and [`State`] (where validated
//! gossip is submitted).
//!
//! The concrete implementations shipped here ([`RawCodec`], [`MemStorage`],
//! [`MemState`]) do structural validation only — consensus-grade decoding
//! and persistence plug in behind the same traits.

mod codec;
mod error;
mod hash;
mod state;
mod storage;

pub use codec::{ChainCodec, RawCodec};
pub use error::ChainError;
pub use hash::Hash;
pub use state::{MemState, RejectReason, State};
pub use storage::{MemStorage, Storage};

use std::sync::Arc;

/// A block that has passed structural decoding for a specific chain.
///
/// Opaque to the P2P layer: `raw()` hands back the exact bytes that were
/// decoded so a re-broadcast is bit-identical to what arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    raw: Arc<[u8]>,
    hash: Hash,
    chain_id: u64,
}

impl Block {
    pub(crate) fn new(raw: Vec<u8>, hash: Hash, chain_id: u64) -> Self {
        Self { raw: raw.into(), hash, chain_id }
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }
}

/// A block (user) transaction that has passed structural decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxBlock {
    raw: Arc<[u8]>,
    hash: Hash,
    chain_id: u64,
}

impl TxBlock {
    pub(crate) fn new(raw: Vec<u8>, hash: Hash, chain_id: u64) -> Self {
        Self { raw: raw.into(), hash, chain_id }
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }
}

/// A validator transaction that has passed structural decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxValidator {
    raw: Arc<[u8]>,
    hash: Hash,
    chain_id: u64,
}

impl TxValidator {
    pub(crate) fn new(raw: Vec<u8>, hash: Hash, chain_id: u64) -> Self {
        Self { raw: raw.into(), hash, chain_id }
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }
}
