//! Hardware-rooted rotating key window
//!
//! Every key is derived inside the HSM from a fixed root identity (index 0)
//! and an integer index. The manager keeps at most three live handles (root,
//! previous, next) and hands out public keys and ECDSA signatures in a fixed
//! ASN.1 layout:
//! - Deterministic regeneration of any index from the root digest
//! - Single-use signing keys through window advancement
//! - ECDH point multiplication without exporting private material
//! - One-time node seed provisioning in NV storage

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod asn;
pub mod derivation;
pub mod seed;
pub mod shared;
pub mod types;
pub mod window;

pub use asn::{decode_signature, encode_public_key, encode_signature, TlvWriter};
pub use seed::{SeedProvisioner, NODE_SEED_LEN, NODE_SEED_NV_INDEX};
pub use shared::SharedKeyring;
pub use types::*;
pub use window::KeyWindowManager;

pub use keyring_hardware_hal::{HardwareError, HsmCapability};

use thiserror::Error;

/// Keyring errors
#[derive(Error, Debug)]
pub enum KeyringError {
    /// Malformed caller input; the HSM was not touched
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Byte string does not follow the expected ASN layout
    #[error("Malformed encoding: {0}")]
    Encoding(String),

    /// HSM capability failure
    #[error("HSM failure: {0}")]
    Hsm(#[from] HardwareError),

    /// Operation requires an initialized window
    #[error("Key window not initialized")]
    NotInitialized,

    /// Window cannot move past the last representable index
    #[error("Key index space exhausted at {0}")]
    IndexExhausted(KeyIndex),

    /// Node seed retrieval before provisioning
    #[error("Node seed has not been provisioned")]
    SeedNotProvisioned,

    /// An earlier HSM failure left the handle set in an unknown state
    #[error("Keyring faulted after an earlier HSM failure")]
    Faulted,
}

impl KeyringError {
    /// Whether the process should stop serving after this error
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KeyringError::Hsm(_) | KeyringError::SeedNotProvisioned | KeyringError::Faulted
        )
    }
}

/// Result type for keyring operations
pub type KeyringResult<T> = Result<T, KeyringError>;
