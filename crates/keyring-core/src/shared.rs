//! Serialized access to a key window shared between callers
//!
//! Cold lookups flush the root transiently, so every operation holds one lock
//! for its whole duration.

use crate::types::*;
use crate::window::KeyWindowManager;
use crate::{KeyringError, KeyringResult};
use keyring_hardware_hal::{HsmCapability, UNCOMPRESSED_POINT_LEN};
use std::sync::{Mutex, MutexGuard};

/// Mutex-guarded [`KeyWindowManager`]
pub struct SharedKeyring<H: HsmCapability> {
    inner: Mutex<KeyWindowManager<H>>,
}

impl<H: HsmCapability> SharedKeyring<H> {
    /// Wrap an uninitialized manager over `hsm`
    pub fn new(hsm: H) -> Self {
        Self::from_manager(KeyWindowManager::new(hsm))
    }

    /// Wrap an existing manager
    pub fn from_manager(manager: KeyWindowManager<H>) -> Self {
        SharedKeyring {
            inner: Mutex::new(manager),
        }
    }

    fn lock(&self) -> KeyringResult<MutexGuard<'_, KeyWindowManager<H>>> {
        // A panic mid-operation may have left the handle set half rotated.
        self.inner.lock().map_err(|_| KeyringError::Faulted)
    }

    /// Run `f` with exclusive access to the manager
    pub fn with_manager<T, F>(&self, f: F) -> KeyringResult<T>
    where
        F: FnOnce(&mut KeyWindowManager<H>) -> KeyringResult<T>,
    {
        let mut guard = self.lock()?;
        f(&mut guard)
    }

    /// See [`KeyWindowManager::initialize`]
    pub fn initialize(&self, start_index: KeyIndex) -> KeyringResult<()> {
        self.lock()?.initialize(start_index)
    }

    /// See [`KeyWindowManager::get_public_key`]
    pub fn get_public_key(&self, index: KeyIndex) -> KeyringResult<EncodedPublicKey> {
        self.lock()?.get_public_key(index)
    }

    /// See [`KeyWindowManager::set_key_index`]
    pub fn set_key_index(&self, index: KeyIndex) -> KeyringResult<()> {
        self.lock()?.set_key_index(index)
    }

    /// See [`KeyWindowManager::key_index`]
    pub fn key_index(&self) -> KeyringResult<KeyIndex> {
        self.lock()?.key_index()
    }

    /// See [`KeyWindowManager::sign_ecdsa`]
    pub fn sign_ecdsa(
        &self,
        index: KeyIndex,
        digest: &[u8; 32],
        advance_after: bool,
    ) -> KeyringResult<EncodedSignature> {
        self.lock()?.sign_ecdsa(index, digest, advance_after)
    }

    /// See [`KeyWindowManager::get_ecdh_point`]
    pub fn get_ecdh_point(
        &self,
        index: KeyIndex,
        peer: &[u8],
    ) -> KeyringResult<[u8; UNCOMPRESSED_POINT_LEN]> {
        self.lock()?.get_ecdh_point(index, peer)
    }

    /// See [`KeyWindowManager::retrieve_node_seed`]
    pub fn retrieve_node_seed(&self) -> KeyringResult<NodeSeed> {
        self.lock()?.retrieve_node_seed()
    }

    /// Current lifecycle state
    pub fn state(&self) -> WindowState {
        self.lock()
            .map(|manager| manager.state())
            .unwrap_or(WindowState::Faulted)
    }
}
