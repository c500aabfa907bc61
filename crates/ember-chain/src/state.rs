// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Mutex;

use thiserror::Error;

use crate::{Block, Hash, TxBlock, TxValidator};

/// Why the state machine refused a submission.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RejectReason {
    #[error("already known")]
    Duplicate,

    #[error("rejected: {0}")]
    Invalid(String),
}

/// Consensus-side sink for validated gossip.
///
/// The P2P core submits here after decode; it never inspects the verdict
/// beyond logging it, so implementations are free to be strict.
pub trait State: Send + Sync {
    fn accept_tx(&self, tx: TxBlock) -> Result<(), RejectReason>;

    fn accept_validator_tx(&self, tx: TxValidator) -> Result<(), RejectReason>;

    fn accept_block(&self, block: Block) -> Result<(), RejectReason>;

    /// Current validator mempool, served to peers that ask for it.
    fn validator_txs(&self) -> Vec<TxValidator>;
}

#[derive(Debug, Default)]
struct Accepted {
    txs: Vec<Hash>,
    validator_txs: Vec<TxValidator>,
    blocks: Vec<Hash>,
}

/// In-memory `State` that accepts everything and remembers what it saw.
///
/// The recording is what the gossip tests observe: exactly-once submission
/// per broadcast is asserted against these lists.
#[derive(Debug, Default)]
pub struct MemState {
    accepted: Mutex<Accepted>,
}

impl MemState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accepted_txs(&self) -> Vec<Hash> {
        self.accepted.lock().unwrap().txs.clone()
    }

    pub fn accepted_validator_txs(&self) -> Vec<Hash> {
        self.accepted.lock().unwrap().validator_txs.iter().map(|tx| *tx.hash()).collect()
    }

    pub fn accepted_blocks(&self) -> Vec<Hash> {
        self.accepted.lock().unwrap().blocks.clone()
    }
}

impl State for MemState {
    fn accept_tx(&self, tx: TxBlock) -> Result<(), RejectReason> {
        self.accepted.lock().unwrap().txs.push(*tx.hash());
        Ok(())
    }

    fn accept_validator_tx(&self, tx: TxValidator) -> Result<(), RejectReason> {
        self.accepted.lock().unwrap().validator_txs.push(tx);
        Ok(())
    }

    fn accept_block(&self, block: Block) -> Result<(), RejectReason> {
        self.accepted.lock().unwrap().blocks.push(*block.hash());
        Ok(())
    }

    fn validator_txs(&self) -> Vec<TxValidator> {
        self.accepted.lock().unwrap().validator_txs.clone()
    }
}
