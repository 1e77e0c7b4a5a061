//! Core types for the key window

use crate::asn::{ENCODED_PUBLIC_KEY_LEN, SEC1_POINT_OFFSET};
use keyring_hardware_hal::UNCOMPRESSED_POINT_LEN;
use serde::Serialize;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Key index as carried on the wire (2 bytes, big-endian)
pub type KeyIndex = u16;

/// Index of the root identity
pub const ROOT_INDEX: KeyIndex = 0;

/// Smallest index the rotation window may start at
pub const MIN_WINDOW_INDEX: KeyIndex = 1;

/// ASN-encoded EC public key (SubjectPublicKeyInfo layout)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EncodedPublicKey(pub(crate) Vec<u8>);

impl EncodedPublicKey {
    /// Encoded bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Take ownership of the encoded bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Uncompressed SEC1 point `04 || x || y` embedded in the encoding
    pub fn sec1_point(&self) -> &[u8] {
        debug_assert_eq!(self.0.len(), ENCODED_PUBLIC_KEY_LEN);
        &self.0[SEC1_POINT_OFFSET..SEC1_POINT_OFFSET + UNCOMPRESSED_POINT_LEN]
    }
}

impl AsRef<[u8]> for EncodedPublicKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// ASN-encoded ECDSA signature (SEQUENCE of two INTEGERs)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EncodedSignature(pub(crate) Vec<u8>);

impl EncodedSignature {
    /// Encoded bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Take ownership of the encoded bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl AsRef<[u8]> for EncodedSignature {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// 32-byte node secret held in HSM NV storage (auto-zeroized on drop)
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct NodeSeed([u8; 32]);

impl NodeSeed {
    /// Wrap raw seed bytes
    pub fn new(bytes: [u8; 32]) -> Self {
        NodeSeed(bytes)
    }

    /// Seed bytes (use carefully)
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for NodeSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NodeSeed(..)")
    }
}

/// Observable lifecycle of the rotation window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WindowState {
    /// Nothing created yet
    Uninitialized,
    /// Root identity live, no window
    Rooted,
    /// Root, previous and next keys live
    Windowed {
        /// Index of the key currently used for signing
        previous: KeyIndex,
        /// Pre-generated successor
        next: KeyIndex,
    },
    /// A failed HSM call left the handle set unknown
    Faulted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_debug_is_redacted() {
        let seed = NodeSeed::new([0xAB; 32]);
        assert_eq!(format!("{:?}", seed), "NodeSeed(..)");
    }
}
