//! Hardware Abstraction Layer for the TPM keyring
//!
//! Provides a narrow, synchronous capability interface over a hardware
//! security module:
//! - Primary key creation from a fixed template plus seed material
//! - ECDSA signing of 32-byte digests and ECDH point multiplication
//! - Transient handle release
//! - Small non-volatile secret storage behind an authenticated session
//!
//! Backends:
//! - `SimulatedHsm`: deterministic software model (tests, development)
//! - `TpmHsm`: TPM 2.0 through `tss-esapi` (feature `tpm`)

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod traits;
pub mod memory;
pub mod simulator;
#[cfg(feature = "tpm")]
pub mod tpm;

pub use traits::*;
pub use simulator::SimulatedHsm;
#[cfg(feature = "tpm")]
pub use tpm::TpmHsm;

use thiserror::Error;

/// Hardware abstraction errors
#[derive(Error, Debug)]
pub enum HardwareError {
    /// Hardware communication error
    #[error("Hardware communication error: {0}")]
    CommunicationError(String),

    /// Authorization session could not be opened or closed
    #[error("Session error: {0}")]
    SessionError(String),

    /// Primary key creation failed
    #[error("Primary key creation failed: {0}")]
    KeyCreationError(String),

    /// Cryptographic operation failed
    #[error("Cryptographic operation failed: {0}")]
    CryptoError(String),

    /// Non-volatile storage error
    #[error("Secure storage error: {0}")]
    StorageError(String),

    /// No free transient object slot
    #[error("Out of transient object memory ({0} slots in use)")]
    ObjectMemory(usize),

    /// Handle does not refer to a live object
    #[error("Invalid handle: {0:#010x}")]
    InvalidHandle(u32),

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Result type for hardware operations
pub type HardwareResult<T> = Result<T, HardwareError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errors() {
        let err = HardwareError::InvalidHandle(0x8000_0001);
        assert_eq!(err.to_string(), "Invalid handle: 0x80000001");

        let err = HardwareError::ObjectMemory(3);
        assert_eq!(err.to_string(), "Out of transient object memory (3 slots in use)");
    }
}
