//! Node seed provisioning
//!
//! A 32-byte secret generated once by the HSM RNG and kept in an NV index.
//! It cannot be regenerated: losing it is a provisioning failure.

use crate::types::NodeSeed;
use crate::{KeyringError, KeyringResult};
use keyring_hardware_hal::{HardwareError, HardwareResult, HsmCapability, NvIndex, SessionHandle};
use zeroize::Zeroizing;

/// NV index holding the node seed
pub const NODE_SEED_NV_INDEX: NvIndex = NvIndex(0x0188_0001);

/// Node seed size in bytes
pub const NODE_SEED_LEN: usize = 32;

/// Run `op` inside an authorization session, always closing it.
/// The operation's own error takes precedence over a close failure.
fn with_session<H, T, F>(hsm: &mut H, op: F) -> HardwareResult<T>
where
    H: HsmCapability,
    F: FnOnce(&mut H, SessionHandle) -> HardwareResult<T>,
{
    let session = hsm.start_session()?;
    let result = op(hsm, session);
    let closed = hsm.end_session(session);

    let value = result?;
    closed?;
    Ok(value)
}

/// Creates and reads back the node seed
#[derive(Debug, Clone, Copy)]
pub struct SeedProvisioner {
    index: NvIndex,
}

impl Default for SeedProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

impl SeedProvisioner {
    /// Provisioner for the well-known seed location
    pub fn new() -> Self {
        SeedProvisioner {
            index: NODE_SEED_NV_INDEX,
        }
    }

    /// Provisioner for a custom NV index
    pub fn at(index: NvIndex) -> Self {
        SeedProvisioner { index }
    }

    /// NV index in use
    pub fn index(&self) -> NvIndex {
        self.index
    }

    /// Create the seed if absent. Returns `true` when a new seed was written.
    pub fn provision<H: HsmCapability>(&self, hsm: &mut H) -> KeyringResult<bool> {
        if hsm.nv_defined(self.index)? {
            log::debug!("node seed already provisioned at {:#010x}", self.index.0);
            return Ok(false);
        }

        let index = self.index;
        with_session(hsm, |hsm, session| {
            hsm.nv_define(session, index, NODE_SEED_LEN)?;

            let random = Zeroizing::new(hsm.get_random(session, NODE_SEED_LEN)?);
            if random.len() != NODE_SEED_LEN {
                return Err(HardwareError::CryptoError(format!(
                    "RNG returned {} of {} bytes",
                    random.len(),
                    NODE_SEED_LEN
                )));
            }

            hsm.nv_write(session, index, &random)
        })?;

        log::info!("node seed provisioned at {:#010x}", self.index.0);
        Ok(true)
    }

    /// Read the seed back
    pub fn retrieve<H: HsmCapability>(&self, hsm: &mut H) -> KeyringResult<NodeSeed> {
        if !hsm.nv_defined(self.index)? {
            return Err(KeyringError::SeedNotProvisioned);
        }

        let index = self.index;
        let bytes = Zeroizing::new(with_session(hsm, |hsm, session| {
            hsm.nv_read(session, index, NODE_SEED_LEN)
        })?);

        let seed: [u8; NODE_SEED_LEN] = bytes.as_slice().try_into().map_err(|_| {
            HardwareError::StorageError(format!(
                "NV read returned {} of {} bytes",
                bytes.len(),
                NODE_SEED_LEN
            ))
        })?;
        Ok(NodeSeed::new(seed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyring_hardware_hal::simulator::SimulatedOp;
    use keyring_hardware_hal::SimulatedHsm;

    #[test]
    fn test_provision_is_idempotent() {
        let mut hsm = SimulatedHsm::new([1u8; 32]);
        let provisioner = SeedProvisioner::new();

        assert!(provisioner.provision(&mut hsm).unwrap());
        let first = provisioner.retrieve(&mut hsm).unwrap();

        assert!(!provisioner.provision(&mut hsm).unwrap());
        let second = provisioner.retrieve(&mut hsm).unwrap();

        assert_eq!(first, second);
        assert_ne!(first.as_bytes(), &[0u8; 32]);
        assert_eq!(hsm.open_sessions(), 0);
    }

    #[test]
    fn test_retrieve_before_provision() {
        let mut hsm = SimulatedHsm::new([1u8; 32]);
        let result = SeedProvisioner::new().retrieve(&mut hsm);
        assert!(matches!(result, Err(KeyringError::SeedNotProvisioned)));
    }

    #[test]
    fn test_failed_write_closes_session() {
        let mut hsm = SimulatedHsm::new([1u8; 32]);
        hsm.inject_failure(SimulatedOp::NvWrite);

        let result = SeedProvisioner::new().provision(&mut hsm);
        assert!(matches!(result, Err(KeyringError::Hsm(_))));
        assert_eq!(hsm.open_sessions(), 0);
    }

    #[test]
    fn test_custom_index() {
        let mut hsm = SimulatedHsm::new([1u8; 32]);
        let custom = SeedProvisioner::at(NvIndex(0x0150_0000));

        custom.provision(&mut hsm).unwrap();
        assert!(matches!(
            SeedProvisioner::new().retrieve(&mut hsm),
            Err(KeyringError::SeedNotProvisioned)
        ));
        assert!(custom.retrieve(&mut hsm).is_ok());
    }
}
