//! Primary key templates for the root identity and indexed keys
//!
//! The HSM derives a primary key deterministically from its endorsement seed
//! and the template, so the `unique` field is all that distinguishes keys:
//! - root: `x = 0^32`, `y = 0^32`
//! - index `i`: `x = SHA-256(root.x || root.y)`, `y = le16(i) || 0^30`

use crate::types::KeyIndex;
use keyring_hardware_hal::{EccPoint, HardwareResult, HsmCapability, KeyTemplate, COORDINATE_LEN};

/// Template for the root identity (index 0)
pub fn root_template() -> KeyTemplate {
    KeyTemplate::zeroed()
}

/// Template for `index`, bound to the root through `root_digest`
pub fn indexed_template(root_digest: &[u8; 32], index: KeyIndex) -> KeyTemplate {
    let mut y = [0u8; COORDINATE_LEN];
    y[..2].copy_from_slice(&index.to_le_bytes());
    KeyTemplate::with_unique(*root_digest, y)
}

/// Digest of the root public coordinates, computed on the device
pub fn root_digest<H: HsmCapability>(hsm: &mut H, root_public: &EccPoint) -> HardwareResult<[u8; 32]> {
    let mut data = [0u8; 2 * COORDINATE_LEN];
    data[..COORDINATE_LEN].copy_from_slice(&root_public.x);
    data[COORDINATE_LEN..].copy_from_slice(&root_public.y);
    hsm.hash_sha256(&data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyring_hardware_hal::SimulatedHsm;
    use sha2::{Digest, Sha256};

    #[test]
    fn test_index_layout() {
        let digest = [0xAA; 32];
        let template = indexed_template(&digest, 0x0102);

        assert_eq!(template.unique.x, digest);
        assert_eq!(&template.unique.y[..2], &[0x02, 0x01]);
        assert!(template.unique.y[2..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_root_matches_unbound_index_zero() {
        assert_eq!(root_template(), indexed_template(&[0u8; 32], 0));
    }

    #[test]
    fn test_root_digest_hashes_coordinates() {
        let point = EccPoint::new([1u8; 32], [2u8; 32]);
        let mut hsm = SimulatedHsm::new([0u8; 32]);

        let mut hasher = Sha256::new();
        hasher.update([1u8; 32]);
        hasher.update([2u8; 32]);
        let expected: [u8; 32] = hasher.finalize().into();

        assert_eq!(root_digest(&mut hsm, &point).unwrap(), expected);
    }
}
