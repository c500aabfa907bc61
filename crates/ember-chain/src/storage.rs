// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Mutex;

use crate::Hash;

/// Read access to the chain tip, consumed by `Info` request/answer handling.
pub trait Storage: Send + Sync {
    /// Height and hash of the latest block this node knows.
    fn latest(&self) -> (u64, Hash);
}

/// In-memory tip tracker.
///
/// Multiple clones are not provided; wrap in an `Arc` and share the one
/// instance between the P2P core and whatever advances the tip.
#[derive(Debug, Default)]
pub struct MemStorage {
    latest: Mutex<(u64, Hash)>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latest(height: u64, hash: Hash) -> Self {
        Self { latest: Mutex::new((height, hash)) }
    }

    pub fn set_latest(&self, height: u64, hash: Hash) {
        *self.latest.lock().unwrap() = (height, hash);
    }
}

impl Storage for MemStorage {
    fn latest(&self) -> (u64, Hash) {
        *self.latest.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_tracks_updates() {
        let storage = MemStorage::new();
        assert_eq!(storage.latest().0, 0);

        let tip = Hash::random();
        storage.set_latest(42, tip);
        assert_eq!(storage.latest(), (42, tip));
    }
}
