//! Secure memory for backend-held secrets
//!
//! NV contents and key material kept on the host side are wrapped here so they
//! are wiped when dropped.

use crate::{HardwareError, HardwareResult};
use zeroize::Zeroizing;

/// Fixed-size buffer with automatic zeroization
pub struct SecureMemory {
    buffer: Zeroizing<Vec<u8>>,
}

impl SecureMemory {
    /// Allocate `size` zeroed bytes
    pub fn new(size: usize) -> Self {
        SecureMemory {
            buffer: Zeroizing::new(vec![0u8; size]),
        }
    }

    /// Capacity in bytes
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the buffer has zero capacity
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Immutable view of the buffer
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    /// Copy data into the start of the buffer
    pub fn copy_from(&mut self, data: &[u8]) -> HardwareResult<()> {
        if data.len() > self.buffer.len() {
            return Err(HardwareError::InvalidParameter(format!(
                "{} bytes do not fit a {}-byte buffer",
                data.len(),
                self.buffer.len()
            )));
        }

        self.buffer[..data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Copy of the first `len` bytes
    pub fn read(&self, len: usize) -> HardwareResult<Vec<u8>> {
        if len > self.buffer.len() {
            return Err(HardwareError::InvalidParameter(format!(
                "read of {} bytes from a {}-byte buffer",
                len,
                self.buffer.len()
            )));
        }
        Ok(self.buffer[..len].to_vec())
    }
}
