//! Traits and wire-level types for hardware abstraction

use crate::{HardwareError, HardwareResult};
use serde::Serialize;

/// Size of a NIST P-256 field element / coordinate in bytes
pub const COORDINATE_LEN: usize = 32;

/// Size of an uncompressed SEC1 point: `04 || x || y`
pub const UNCOMPRESSED_POINT_LEN: usize = 1 + 2 * COORDINATE_LEN;

/// SEC1 tag for an uncompressed point
pub const UNCOMPRESSED_POINT_TAG: u8 = 0x04;

/// Policy digest bound to every primary key created by the keyring
pub const PRIMARY_AUTH_POLICY: [u8; 32] = [
    0x83, 0x71, 0x97, 0x67, 0x44, 0x84, 0xB3, 0xF8, 0x1A, 0x90, 0xCC, 0x8D, 0x46, 0xA5, 0xD7,
    0x24, 0xFD, 0x52, 0xD7, 0x6E, 0x06, 0x52, 0x0B, 0x64, 0xF2, 0xA1, 0xDA, 0x1B, 0x33, 0x14,
    0x69, 0xAA,
];

/// Device-side reference to a live transient key object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyHandle(pub u32);

/// Device-side reference to an open authorization session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub u32);

/// Non-volatile storage index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NvIndex(pub u32);

/// Affine point on P-256 with fixed-width big-endian coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EccPoint {
    /// X coordinate
    pub x: [u8; COORDINATE_LEN],
    /// Y coordinate
    pub y: [u8; COORDINATE_LEN],
}

impl EccPoint {
    /// Build from coordinates
    pub fn new(x: [u8; COORDINATE_LEN], y: [u8; COORDINATE_LEN]) -> Self {
        EccPoint { x, y }
    }

    /// Parse `04 || x || y`
    pub fn from_uncompressed(bytes: &[u8]) -> HardwareResult<Self> {
        if bytes.len() != UNCOMPRESSED_POINT_LEN || bytes[0] != UNCOMPRESSED_POINT_TAG {
            return Err(HardwareError::InvalidParameter(format!(
                "expected {}-byte uncompressed point",
                UNCOMPRESSED_POINT_LEN
            )));
        }

        let mut x = [0u8; COORDINATE_LEN];
        let mut y = [0u8; COORDINATE_LEN];
        x.copy_from_slice(&bytes[1..1 + COORDINATE_LEN]);
        y.copy_from_slice(&bytes[1 + COORDINATE_LEN..]);
        Ok(EccPoint { x, y })
    }

    /// Serialize as `04 || x || y`
    pub fn to_uncompressed(&self) -> [u8; UNCOMPRESSED_POINT_LEN] {
        let mut out = [0u8; UNCOMPRESSED_POINT_LEN];
        out[0] = UNCOMPRESSED_POINT_TAG;
        out[1..1 + COORDINATE_LEN].copy_from_slice(&self.x);
        out[1 + COORDINATE_LEN..].copy_from_slice(&self.y);
        out
    }
}

/// Raw ECDSA signature components, big-endian
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSignature {
    /// R component
    pub r: [u8; COORDINATE_LEN],
    /// S component
    pub s: [u8; COORDINATE_LEN],
}

/// Seed material placed in the `unique` field of the primary key template.
///
/// Every other field of the template is fixed: ECC NIST P-256, SHA-256 name
/// algorithm, sign + decrypt, fixed TPM/parent, sensitive data origin,
/// [`PRIMARY_AUTH_POLICY`], null scheme, null symmetric, null KDF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyTemplate {
    /// Template `unique` point
    pub unique: EccPoint,
}

impl KeyTemplate {
    /// All-zero `unique` field
    pub fn zeroed() -> Self {
        KeyTemplate {
            unique: EccPoint::new([0u8; COORDINATE_LEN], [0u8; COORDINATE_LEN]),
        }
    }

    /// Template with the given `unique` coordinates
    pub fn with_unique(x: [u8; COORDINATE_LEN], y: [u8; COORDINATE_LEN]) -> Self {
        KeyTemplate {
            unique: EccPoint::new(x, y),
        }
    }
}

/// Freshly created primary key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimaryKey {
    /// Live handle (occupies one transient slot until flushed)
    pub handle: KeyHandle,
    /// Public point
    pub public: EccPoint,
}

/// Backend description
#[derive(Debug, Clone, Serialize)]
pub struct BackendInfo {
    /// Backend name
    pub name: String,
    /// Number of concurrent transient objects the device supports
    pub transient_slots: usize,
}

/// Narrow capability interface over a hardware security module.
///
/// All calls are blocking round trips. Handles returned by
/// [`create_primary`](HsmCapability::create_primary) occupy a scarce
/// transient slot and must be released with [`flush`](HsmCapability::flush).
pub trait HsmCapability {
    /// Describe the backend
    fn info(&self) -> BackendInfo;

    /// Create a primary key under the endorsement hierarchy
    fn create_primary(&mut self, template: &KeyTemplate) -> HardwareResult<PrimaryKey>;

    /// ECDSA/SHA-256 signature over a 32-byte digest
    fn sign_digest(&mut self, handle: KeyHandle, digest: &[u8; 32]) -> HardwareResult<RawSignature>;

    /// Multiply the peer point by the private key behind `handle`
    fn ecdh_z_gen(&mut self, handle: KeyHandle, peer: &EccPoint) -> HardwareResult<EccPoint>;

    /// Release a transient object
    fn flush(&mut self, handle: KeyHandle) -> HardwareResult<()>;

    /// SHA-256 computed on the device
    fn hash_sha256(&mut self, data: &[u8]) -> HardwareResult<[u8; 32]>;

    /// Open an HMAC session with parameter encryption
    fn start_session(&mut self) -> HardwareResult<SessionHandle>;

    /// Close a session
    fn end_session(&mut self, session: SessionHandle) -> HardwareResult<()>;

    /// Whether an NV index has been defined
    fn nv_defined(&mut self, index: NvIndex) -> HardwareResult<bool>;

    /// Define an owner-authorized NV index of `size` bytes
    fn nv_define(&mut self, session: SessionHandle, index: NvIndex, size: usize) -> HardwareResult<()>;

    /// Random bytes from the device RNG
    fn get_random(&mut self, session: SessionHandle, len: usize) -> HardwareResult<Vec<u8>>;

    /// Write `data` at offset 0 of an NV index
    fn nv_write(&mut self, session: SessionHandle, index: NvIndex, data: &[u8]) -> HardwareResult<()>;

    /// Read `len` bytes from offset 0 of an NV index
    fn nv_read(&mut self, session: SessionHandle, index: NvIndex, len: usize) -> HardwareResult<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_round_trip() {
        let point = EccPoint::new([0x11; 32], [0x22; 32]);
        let bytes = point.to_uncompressed();

        assert_eq!(bytes[0], 0x04);
        assert_eq!(EccPoint::from_uncompressed(&bytes).unwrap(), point);
    }

    #[test]
    fn test_point_rejects_compressed() {
        let mut bytes = [0u8; UNCOMPRESSED_POINT_LEN];
        bytes[0] = 0x02;
        assert!(EccPoint::from_uncompressed(&bytes).is_err());
        assert!(EccPoint::from_uncompressed(&bytes[..33]).is_err());
    }
}
