// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::fmt;

use rand::RngCore;
use sha2::{Digest, Sha256};

/// 32-byte hash value used for block hashes and payload digests.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash([u8; 32]);

impl Hash {
    pub const LEN: usize = 32;

    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// SHA-256 digest of `data`.
    pub fn digest(data: &[u8]) -> Self {
        let mut out = [0u8; 32];
        out.copy_from_slice(&Sha256::digest(data));
        Self(out)
    }

    /// Cryptographically random hash (node identities, test fixtures).
    pub fn random() -> Self {
        let mut out = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut out);
        Self(out)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Full hex is unwieldy in logs; show the first 4 bytes.
        write!(f, "{}…", hex::encode(&self.0[..4]))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let h = Hash::random();
        assert_eq!(Hash::from_hex(&h.to_hex()), Some(h));
    }

    #[test]
    fn from_hex_rejects_wrong_length() {
        assert!(Hash::from_hex("abcd").is_none());
        assert!(Hash::from_hex("not hex at all").is_none());
    }

    #[test]
    fn digest_is_deterministic() {
        assert_eq!(Hash::digest(b"ember"), Hash::digest(b"ember"));
        assert_ne!(Hash::digest(b"ember"), Hash::digest(b"embers"));
    }

    #[test]
    fn random_is_unique() {
        assert_ne!(Hash::random(), Hash::random());
    }
}
