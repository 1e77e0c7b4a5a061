//! Software HSM model
//!
//! Behaves like a TPM endorsement hierarchy for the operations the keyring
//! needs: primary keys are a deterministic function of the endorsement seed
//! and the template, transient slots are limited, and NV storage sits behind
//! an authorization session. Used for tests, benches and development hosts
//! without a TPM.

use crate::memory::SecureMemory;
use crate::traits::*;
use crate::{HardwareError, HardwareResult};
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::{Signature, SigningKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use zeroize::Zeroizing;

/// Transient slots exposed by default (matches common discrete TPMs)
pub const DEFAULT_TRANSIENT_SLOTS: usize = 3;

const TRANSIENT_HANDLE_BASE: u32 = 0x8000_0000;
const HMAC_SESSION_BASE: u32 = 0x0200_0000;
const PRIMARY_DERIVATION_LABEL: &[u8] = b"keyring-sim-primary";

/// Operations that can be made to fail once, for exercising error paths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimulatedOp {
    /// `create_primary`
    CreatePrimary,
    /// `sign_digest`
    Sign,
    /// `ecdh_z_gen`
    Ecdh,
    /// `flush`
    Flush,
    /// `hash_sha256`
    Hash,
    /// `start_session`
    StartSession,
    /// `nv_write`
    NvWrite,
    /// `nv_read`
    NvRead,
}

struct NvEntry {
    data: SecureMemory,
    written: bool,
}

/// Deterministic software HSM
pub struct SimulatedHsm {
    primary_seed: Zeroizing<[u8; 32]>,
    transient_slots: usize,
    objects: HashMap<u32, SecretKey>,
    next_handle: u32,
    sessions: HashSet<u32>,
    next_session: u32,
    nv: HashMap<u32, NvEntry>,
    armed_failures: HashSet<SimulatedOp>,
    operations: u64,
}

impl SimulatedHsm {
    /// Create a simulator whose primary keys derive from `primary_seed`
    pub fn new(primary_seed: [u8; 32]) -> Self {
        SimulatedHsm {
            primary_seed: Zeroizing::new(primary_seed),
            transient_slots: DEFAULT_TRANSIENT_SLOTS,
            objects: HashMap::new(),
            next_handle: TRANSIENT_HANDLE_BASE,
            sessions: HashSet::new(),
            next_session: HMAC_SESSION_BASE,
            nv: HashMap::new(),
            armed_failures: HashSet::new(),
            operations: 0,
        }
    }

    /// Create a simulator with a random endorsement seed
    pub fn from_entropy() -> Self {
        let mut seed = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut seed[..]);
        Self::new(*seed)
    }

    /// Override the number of transient slots
    pub fn with_transient_slots(mut self, slots: usize) -> Self {
        self.transient_slots = slots;
        self
    }

    /// Make the next call of `op` fail
    pub fn inject_failure(&mut self, op: SimulatedOp) {
        self.armed_failures.insert(op);
    }

    /// Number of live transient objects
    pub fn live_objects(&self) -> usize {
        self.objects.len()
    }

    /// Number of open sessions
    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Total capability calls served so far
    pub fn operation_count(&self) -> u64 {
        self.operations
    }

    fn begin(&mut self, op: Option<SimulatedOp>) -> HardwareResult<()> {
        self.operations += 1;
        match op {
            Some(op) if self.armed_failures.remove(&op) => Err(HardwareError::CommunicationError(
                format!("injected failure in {:?}", op),
            )),
            _ => Ok(()),
        }
    }

    fn derive_secret(&self, template: &KeyTemplate) -> SecretKey {
        let mut counter: u32 = 0;
        loop {
            let mut hasher = Sha256::new();
            hasher.update(PRIMARY_DERIVATION_LABEL);
            hasher.update(&self.primary_seed[..]);
            hasher.update(template.unique.x);
            hasher.update(template.unique.y);
            hasher.update(counter.to_le_bytes());
            let candidate: Zeroizing<[u8; 32]> = Zeroizing::new(hasher.finalize().into());

            // Rejects zero and values >= n; P-256 hits this with negligible odds.
            if let Ok(secret) = SecretKey::from_slice(&candidate[..]) {
                return secret;
            }
            counter += 1;
        }
    }

    fn object(&self, handle: KeyHandle) -> HardwareResult<&SecretKey> {
        self.objects
            .get(&handle.0)
            .ok_or(HardwareError::InvalidHandle(handle.0))
    }

    fn check_session(&self, session: SessionHandle) -> HardwareResult<()> {
        if self.sessions.contains(&session.0) {
            Ok(())
        } else {
            Err(HardwareError::SessionError(format!(
                "session {:#010x} is not open",
                session.0
            )))
        }
    }
}

fn affine_coordinates(public: &PublicKey) -> HardwareResult<EccPoint> {
    point_from_encoded(&public.to_encoded_point(false))
}

fn point_from_encoded(encoded: &p256::EncodedPoint) -> HardwareResult<EccPoint> {
    match (encoded.x(), encoded.y()) {
        (Some(x), Some(y)) => {
            let mut point = EccPoint::new([0u8; COORDINATE_LEN], [0u8; COORDINATE_LEN]);
            point.x.copy_from_slice(x);
            point.y.copy_from_slice(y);
            Ok(point)
        }
        _ => Err(HardwareError::CryptoError(
            "point at infinity has no affine coordinates".to_string(),
        )),
    }
}

impl HsmCapability for SimulatedHsm {
    fn info(&self) -> BackendInfo {
        BackendInfo {
            name: "simulator".to_string(),
            transient_slots: self.transient_slots,
        }
    }

    fn create_primary(&mut self, template: &KeyTemplate) -> HardwareResult<PrimaryKey> {
        self.begin(Some(SimulatedOp::CreatePrimary))?;

        if self.objects.len() >= self.transient_slots {
            return Err(HardwareError::ObjectMemory(self.objects.len()));
        }

        let secret = self.derive_secret(template);
        let public = affine_coordinates(&secret.public_key())?;

        let handle = KeyHandle(self.next_handle);
        self.next_handle += 1;
        self.objects.insert(handle.0, secret);

        log::trace!("simulator: created primary {:#010x}", handle.0);
        Ok(PrimaryKey { handle, public })
    }

    fn sign_digest(&mut self, handle: KeyHandle, digest: &[u8; 32]) -> HardwareResult<RawSignature> {
        self.begin(Some(SimulatedOp::Sign))?;

        let signing_key = SigningKey::from(self.object(handle)?);
        let signature: Signature = signing_key
            .sign_prehash(digest)
            .map_err(|e| HardwareError::CryptoError(e.to_string()))?;

        let bytes = signature.to_bytes();
        let mut raw = RawSignature {
            r: [0u8; COORDINATE_LEN],
            s: [0u8; COORDINATE_LEN],
        };
        raw.r.copy_from_slice(&bytes[..COORDINATE_LEN]);
        raw.s.copy_from_slice(&bytes[COORDINATE_LEN..]);
        Ok(raw)
    }

    fn ecdh_z_gen(&mut self, handle: KeyHandle, peer: &EccPoint) -> HardwareResult<EccPoint> {
        self.begin(Some(SimulatedOp::Ecdh))?;

        let secret = self.object(handle)?;
        let peer_key = PublicKey::from_sec1_bytes(&peer.to_uncompressed())
            .map_err(|_| HardwareError::InvalidParameter("peer point is not on P-256".to_string()))?;

        let shared = (peer_key.to_projective() * *secret.to_nonzero_scalar()).to_affine();
        point_from_encoded(&shared.to_encoded_point(false))
    }

    fn flush(&mut self, handle: KeyHandle) -> HardwareResult<()> {
        self.begin(Some(SimulatedOp::Flush))?;

        self.objects
            .remove(&handle.0)
            .map(|_| log::trace!("simulator: flushed {:#010x}", handle.0))
            .ok_or(HardwareError::InvalidHandle(handle.0))
    }

    fn hash_sha256(&mut self, data: &[u8]) -> HardwareResult<[u8; 32]> {
        self.begin(Some(SimulatedOp::Hash))?;
        Ok(Sha256::digest(data).into())
    }

    fn start_session(&mut self) -> HardwareResult<SessionHandle> {
        self.begin(Some(SimulatedOp::StartSession))?;

        let session = SessionHandle(self.next_session);
        self.next_session += 1;
        self.sessions.insert(session.0);
        Ok(session)
    }

    fn end_session(&mut self, session: SessionHandle) -> HardwareResult<()> {
        self.begin(None)?;

        if self.sessions.remove(&session.0) {
            Ok(())
        } else {
            Err(HardwareError::SessionError(format!(
                "session {:#010x} is not open",
                session.0
            )))
        }
    }

    fn nv_defined(&mut self, index: NvIndex) -> HardwareResult<bool> {
        self.begin(None)?;
        Ok(self.nv.contains_key(&index.0))
    }

    fn nv_define(&mut self, session: SessionHandle, index: NvIndex, size: usize) -> HardwareResult<()> {
        self.begin(None)?;
        self.check_session(session)?;

        if self.nv.contains_key(&index.0) {
            return Err(HardwareError::StorageError(format!(
                "NV index {:#010x} already defined",
                index.0
            )));
        }

        self.nv.insert(
            index.0,
            NvEntry {
                data: SecureMemory::new(size),
                written: false,
            },
        );
        Ok(())
    }

    fn get_random(&mut self, session: SessionHandle, len: usize) -> HardwareResult<Vec<u8>> {
        self.begin(None)?;
        self.check_session(session)?;

        let mut bytes = vec![0u8; len];
        OsRng.fill_bytes(&mut bytes);
        Ok(bytes)
    }

    fn nv_write(&mut self, session: SessionHandle, index: NvIndex, data: &[u8]) -> HardwareResult<()> {
        self.begin(Some(SimulatedOp::NvWrite))?;
        self.check_session(session)?;

        let entry = self.nv.get_mut(&index.0).ok_or_else(|| {
            HardwareError::StorageError(format!("NV index {:#010x} not defined", index.0))
        })?;

        // Index is defined write-all: partial writes are refused.
        if data.len() != entry.data.len() {
            return Err(HardwareError::StorageError(format!(
                "write of {} bytes to a {}-byte write-all index",
                data.len(),
                entry.data.len()
            )));
        }

        entry.data.copy_from(data)?;
        entry.written = true;
        Ok(())
    }

    fn nv_read(&mut self, session: SessionHandle, index: NvIndex, len: usize) -> HardwareResult<Vec<u8>> {
        self.begin(Some(SimulatedOp::NvRead))?;
        self.check_session(session)?;

        let entry = self.nv.get(&index.0).ok_or_else(|| {
            HardwareError::StorageError(format!("NV index {:#010x} not defined", index.0))
        })?;

        if !entry.written {
            return Err(HardwareError::StorageError(format!(
                "NV index {:#010x} not written",
                index.0
            )));
        }

        entry.data.read(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::signature::hazmat::PrehashVerifier;
    use p256::ecdsa::VerifyingKey;

    fn simulator() -> SimulatedHsm {
        SimulatedHsm::new([7u8; 32])
    }

    #[test]
    fn test_primary_keys_are_deterministic() {
        let template = KeyTemplate::with_unique([1u8; 32], [2u8; 32]);

        let mut a = simulator();
        let mut b = simulator();
        let key_a = a.create_primary(&template).unwrap();
        let key_b = b.create_primary(&template).unwrap();
        assert_eq!(key_a.public, key_b.public);

        let other = a.create_primary(&KeyTemplate::zeroed()).unwrap();
        assert_ne!(other.public, key_a.public);
    }

    #[test]
    fn test_different_seed_different_keys() {
        let template = KeyTemplate::zeroed();
        let key_a = simulator().create_primary(&template).unwrap();
        let key_b = SimulatedHsm::new([8u8; 32]).create_primary(&template).unwrap();
        assert_ne!(key_a.public, key_b.public);
    }

    #[test]
    fn test_transient_slot_limit() {
        let mut hsm = simulator().with_transient_slots(2);
        let template = KeyTemplate::zeroed();

        let first = hsm.create_primary(&template).unwrap();
        hsm.create_primary(&template).unwrap();
        assert!(matches!(
            hsm.create_primary(&template),
            Err(HardwareError::ObjectMemory(2))
        ));

        hsm.flush(first.handle).unwrap();
        assert!(hsm.create_primary(&template).is_ok());
        assert_eq!(hsm.live_objects(), 2);
    }

    #[test]
    fn test_flush_unknown_handle() {
        let mut hsm = simulator();
        assert!(matches!(
            hsm.flush(KeyHandle(0x8000_00ff)),
            Err(HardwareError::InvalidHandle(0x8000_00ff))
        ));
    }

    #[test]
    fn test_sign_verifies() {
        let mut hsm = simulator();
        let key = hsm.create_primary(&KeyTemplate::zeroed()).unwrap();
        let digest: [u8; 32] = Sha256::digest(b"payload").into();

        let raw = hsm.sign_digest(key.handle, &digest).unwrap();

        let verifying_key = VerifyingKey::from_sec1_bytes(&key.public.to_uncompressed()).unwrap();
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(&raw.r);
        bytes[32..].copy_from_slice(&raw.s);
        let signature = Signature::from_slice(&bytes).unwrap();
        assert!(verifying_key.verify_prehash(&digest, &signature).is_ok());
    }

    #[test]
    fn test_ecdh_agrees() {
        let mut hsm = simulator();
        let alice = hsm.create_primary(&KeyTemplate::with_unique([1u8; 32], [0u8; 32])).unwrap();
        let bob = hsm.create_primary(&KeyTemplate::with_unique([2u8; 32], [0u8; 32])).unwrap();

        let z_alice = hsm.ecdh_z_gen(alice.handle, &bob.public).unwrap();
        let z_bob = hsm.ecdh_z_gen(bob.handle, &alice.public).unwrap();
        assert_eq!(z_alice, z_bob);
    }

    #[test]
    fn test_nv_requires_session() {
        let mut hsm = simulator();
        let index = NvIndex(0x0188_0001);

        assert!(hsm.nv_define(SessionHandle(1), index, 32).is_err());

        let session = hsm.start_session().unwrap();
        hsm.nv_define(session, index, 32).unwrap();
        assert!(hsm.nv_defined(index).unwrap());
        assert!(hsm.nv_read(session, index, 32).is_err());

        hsm.nv_write(session, index, &[9u8; 32]).unwrap();
        assert_eq!(hsm.nv_read(session, index, 32).unwrap(), vec![9u8; 32]);
        assert!(hsm.nv_write(session, index, &[9u8; 8]).is_err());

        hsm.end_session(session).unwrap();
        assert_eq!(hsm.open_sessions(), 0);
        assert!(hsm.nv_read(session, index, 32).is_err());
    }

    #[test]
    fn test_injected_failure_fires_once() {
        let mut hsm = simulator();
        hsm.inject_failure(SimulatedOp::Hash);

        assert!(hsm.hash_sha256(b"abc").is_err());
        assert_eq!(
            hex::encode(hsm.hash_sha256(b"abc").unwrap()),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(hsm.operation_count(), 2);
    }
}
