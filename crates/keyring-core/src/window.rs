//! Rotating key window
//!
//! Holds the root identity plus a `previous`/`next` pair of derived keys.
//! Lookups of those three indices are served from cache; any other index is
//! regenerated cold by temporarily flushing the root so that no more than
//! three transient objects are ever live.
//!
//! Any HSM failure latches the manager into a faulted state: a rotation step
//! interrupted half way (root flushed, window half rebuilt) cannot be
//! repaired here, so nothing else is served until a new manager is built.

use crate::asn::{encode_public_key, encode_signature};
use crate::derivation::{indexed_template, root_digest, root_template};
use crate::seed::SeedProvisioner;
use crate::types::*;
use crate::{KeyringError, KeyringResult};
use keyring_hardware_hal::{EccPoint, HsmCapability, KeyHandle, KeyTemplate, UNCOMPRESSED_POINT_LEN};

/// Live key: handle plus its encoded public key
#[derive(Debug)]
struct LiveKey {
    handle: KeyHandle,
    encoded: EncodedPublicKey,
}

/// Live key at a window position
#[derive(Debug)]
struct WindowKey {
    index: KeyIndex,
    key: LiveKey,
}

/// Rotation window manager over one HSM connection
pub struct KeyWindowManager<H: HsmCapability> {
    hsm: H,
    seed: SeedProvisioner,
    root: Option<LiveKey>,
    root_digest: [u8; 32],
    previous: Option<WindowKey>,
    next: Option<WindowKey>,
    faulted: bool,
}

impl<H: HsmCapability> KeyWindowManager<H> {
    /// Wrap an HSM connection; nothing is created until [`initialize`](Self::initialize)
    pub fn new(hsm: H) -> Self {
        Self::with_seed_provisioner(hsm, SeedProvisioner::new())
    }

    /// Use a non-default node seed location
    pub fn with_seed_provisioner(hsm: H, seed: SeedProvisioner) -> Self {
        KeyWindowManager {
            hsm,
            seed,
            root: None,
            root_digest: [0u8; 32],
            previous: None,
            next: None,
            faulted: false,
        }
    }

    /// Underlying HSM
    pub fn hsm(&self) -> &H {
        &self.hsm
    }

    /// Mutable access to the underlying HSM (diagnostics only: handles owned
    /// by the window must not be touched)
    pub fn hsm_mut(&mut self) -> &mut H {
        &mut self.hsm
    }

    /// Current lifecycle state
    pub fn state(&self) -> WindowState {
        if self.faulted {
            return WindowState::Faulted;
        }
        match (&self.root, &self.previous, &self.next) {
            (Some(_), Some(previous), Some(next)) => WindowState::Windowed {
                previous: previous.index,
                next: next.index,
            },
            (Some(_), _, _) => WindowState::Rooted,
            _ => WindowState::Uninitialized,
        }
    }

    /// Index of the key currently used for signing
    pub fn key_index(&self) -> KeyringResult<KeyIndex> {
        self.ensure_usable()?;
        self.previous
            .as_ref()
            .map(|previous| previous.index)
            .ok_or(KeyringError::NotInitialized)
    }

    /// Create the root identity, open the window at `max(start_index, 1)` and
    /// make sure the node seed exists.
    ///
    /// Re-initializing releases every live handle first.
    pub fn initialize(&mut self, start_index: KeyIndex) -> KeyringResult<()> {
        self.ensure_not_faulted()?;
        let previous = start_index.max(MIN_WINDOW_INDEX);
        successor(previous)?;

        self.guarded(|this| {
            this.release_all()?;
            this.set_root()?;
            this.reset_window(previous)?;
            this.seed.provision(&mut this.hsm)?;
            Ok(())
        })?;

        log::info!(
            "key window initialized: root live, previous={}, next={}",
            previous,
            previous + 1
        );
        Ok(())
    }

    /// Encoded public key for `index`.
    ///
    /// Root, previous and next are served from cache; any other index is
    /// regenerated, which flushes and recreates the root.
    pub fn get_public_key(&mut self, index: KeyIndex) -> KeyringResult<EncodedPublicKey> {
        self.ensure_windowed()?;

        if let Some(encoded) = self.cached_encoding(index) {
            log::debug!("public key {} served from cache", index);
            return Ok(encoded.clone());
        }

        log::debug!("public key {} regenerated cold", index);
        self.guarded(|this| this.with_cold_key(index, |_, key| Ok(key.encoded.clone())))
    }

    /// Move the window to `previous = max(index, 1)`, `next = previous + 1`
    pub fn set_key_index(&mut self, index: KeyIndex) -> KeyringResult<()> {
        self.ensure_windowed()?;
        let previous = index.max(MIN_WINDOW_INDEX);
        successor(previous)?;

        self.guarded(|this| this.reset_window(previous))?;
        log::info!("key window reset: previous={}, next={}", previous, previous + 1);
        Ok(())
    }

    /// ECDSA-sign a 32-byte digest with the key at `index`.
    ///
    /// Index 0 signs with the root. Any other index that is not the current
    /// `previous` first moves the window there. With `advance_after`, a
    /// non-root signature retires the signing key and promotes `next`.
    pub fn sign_ecdsa(
        &mut self,
        index: KeyIndex,
        digest: &[u8; 32],
        advance_after: bool,
    ) -> KeyringResult<EncodedSignature> {
        self.ensure_windowed()?;

        let rotates = index != ROOT_INDEX && advance_after;
        if index != ROOT_INDEX {
            // Both the window move and the advance must stay in range.
            let next = successor(index)?;
            if rotates {
                successor(next)?;
            }
        }

        self.guarded(|this| {
            let handle = if index == ROOT_INDEX {
                this.root_handle()?
            } else {
                if this.previous_index()? != index {
                    this.reset_window(index)?;
                }
                this.previous_handle()?
            };

            let raw = this.hsm.sign_digest(handle, digest)?;
            if rotates {
                this.advance()?;
            }
            Ok(encode_signature(&raw))
        })
    }

    /// Shared point of the key at `index` with `peer` (`04 || x || y`)
    pub fn get_ecdh_point(
        &mut self,
        index: KeyIndex,
        peer: &[u8],
    ) -> KeyringResult<[u8; UNCOMPRESSED_POINT_LEN]> {
        self.ensure_windowed()?;
        let peer = parse_peer_point(peer)?;

        self.guarded(|this| {
            let z_point = match this.cached_handle(index) {
                Some(handle) => this.hsm.ecdh_z_gen(handle, &peer)?,
                None => {
                    log::debug!("ECDH with cold key {}", index);
                    this.with_cold_key(index, |hsm, key| Ok(hsm.ecdh_z_gen(key.handle, &peer)?))?
                }
            };
            Ok(z_point.to_uncompressed())
        })
    }

    /// Read the node seed back from NV storage
    pub fn retrieve_node_seed(&mut self) -> KeyringResult<NodeSeed> {
        self.ensure_not_faulted()?;
        let seed = self.seed;
        self.guarded(|this| seed.retrieve(&mut this.hsm))
    }

    fn ensure_not_faulted(&self) -> KeyringResult<()> {
        if self.faulted {
            Err(KeyringError::Faulted)
        } else {
            Ok(())
        }
    }

    fn ensure_usable(&self) -> KeyringResult<()> {
        self.ensure_not_faulted()?;
        if self.root.is_none() {
            return Err(KeyringError::NotInitialized);
        }
        Ok(())
    }

    fn ensure_windowed(&self) -> KeyringResult<()> {
        match self.state() {
            WindowState::Windowed { .. } => Ok(()),
            WindowState::Faulted => Err(KeyringError::Faulted),
            _ => Err(KeyringError::NotInitialized),
        }
    }

    /// Run a handle-mutating step; an HSM failure latches the fault.
    fn guarded<T, F>(&mut self, step: F) -> KeyringResult<T>
    where
        F: FnOnce(&mut Self) -> KeyringResult<T>,
    {
        let result = step(self);
        if let Err(KeyringError::Hsm(e)) = &result {
            log::error!("HSM failure, key window faulted: {}", e);
            self.faulted = true;
        }
        result
    }

    fn cached_encoding(&self, index: KeyIndex) -> Option<&EncodedPublicKey> {
        match (&self.previous, &self.next, &self.root) {
            (_, Some(next), _) if next.index == index => Some(&next.key.encoded),
            (Some(previous), _, _) if previous.index == index => Some(&previous.key.encoded),
            (_, _, Some(root)) if index == ROOT_INDEX => Some(&root.encoded),
            _ => None,
        }
    }

    fn cached_handle(&self, index: KeyIndex) -> Option<KeyHandle> {
        match (&self.previous, &self.next, &self.root) {
            (_, Some(next), _) if next.index == index => Some(next.key.handle),
            (Some(previous), _, _) if previous.index == index => Some(previous.key.handle),
            (_, _, Some(root)) if index == ROOT_INDEX => Some(root.handle),
            _ => None,
        }
    }

    fn root_handle(&self) -> KeyringResult<KeyHandle> {
        self.root
            .as_ref()
            .map(|root| root.handle)
            .ok_or(KeyringError::NotInitialized)
    }

    fn previous_index(&self) -> KeyringResult<KeyIndex> {
        self.previous
            .as_ref()
            .map(|previous| previous.index)
            .ok_or(KeyringError::NotInitialized)
    }

    fn previous_handle(&self) -> KeyringResult<KeyHandle> {
        self.previous
            .as_ref()
            .map(|previous| previous.key.handle)
            .ok_or(KeyringError::NotInitialized)
    }

    fn create(&mut self, template: &KeyTemplate) -> KeyringResult<(LiveKey, EccPoint)> {
        let primary = self.hsm.create_primary(template)?;
        let key = LiveKey {
            handle: primary.handle,
            encoded: encode_public_key(&primary.public),
        };
        Ok((key, primary.public))
    }

    fn create_indexed(&mut self, index: KeyIndex) -> KeyringResult<LiveKey> {
        let template = indexed_template(&self.root_digest, index);
        Ok(self.create(&template)?.0)
    }

    fn set_root(&mut self) -> KeyringResult<()> {
        let (key, public) = self.create(&root_template())?;
        self.root_digest = root_digest(&mut self.hsm, &public)?;
        self.root = Some(key);
        Ok(())
    }

    fn flush_root(&mut self) -> KeyringResult<()> {
        if let Some(root) = self.root.take() {
            self.hsm.flush(root.handle)?;
        }
        Ok(())
    }

    fn release_all(&mut self) -> KeyringResult<()> {
        if let Some(previous) = self.previous.take() {
            self.hsm.flush(previous.key.handle)?;
        }
        if let Some(next) = self.next.take() {
            self.hsm.flush(next.key.handle)?;
        }
        self.flush_root()
    }

    /// Each slot is flushed before its replacement is created, so the live
    /// count never exceeds root + previous + next.
    fn reset_window(&mut self, previous: KeyIndex) -> KeyringResult<()> {
        let next = successor(previous)?;

        if let Some(old) = self.previous.take() {
            self.hsm.flush(old.key.handle)?;
        }
        self.previous = Some(WindowKey {
            index: previous,
            key: self.create_indexed(previous)?,
        });

        if let Some(old) = self.next.take() {
            self.hsm.flush(old.key.handle)?;
        }
        self.next = Some(WindowKey {
            index: next,
            key: self.create_indexed(next)?,
        });
        Ok(())
    }

    /// Retire `previous`, promote `next`, pre-generate the new `next`
    fn advance(&mut self) -> KeyringResult<()> {
        let promoted = self.next.take().ok_or(KeyringError::NotInitialized)?;
        let next_index = successor(promoted.index)?;

        if let Some(retired) = self.previous.take() {
            self.hsm.flush(retired.key.handle)?;
        }
        self.previous = Some(promoted);

        self.next = Some(WindowKey {
            index: next_index,
            key: self.create_indexed(next_index)?,
        });

        log::info!(
            "key window advanced: previous={}, next={}",
            next_index - 1,
            next_index
        );
        Ok(())
    }

    /// Regenerate `index` in the root's slot, run `op` on it, then flush it
    /// and recreate the root. The root is absent only inside this call.
    ///
    /// The cold key is released and the root restored even when `op` fails;
    /// the first error is the one reported.
    fn with_cold_key<T, F>(&mut self, index: KeyIndex, op: F) -> KeyringResult<T>
    where
        F: FnOnce(&mut H, &LiveKey) -> KeyringResult<T>,
    {
        self.flush_root()?;

        let key = self.create_indexed(index)?;
        let result = op(&mut self.hsm, &key);

        // The root needs the slot the cold key holds.
        let restored = match self.hsm.flush(key.handle) {
            Ok(()) => self.set_root(),
            Err(e) => Err(e.into()),
        };

        let value = result?;
        restored?;
        Ok(value)
    }
}

impl<H: HsmCapability> Drop for KeyWindowManager<H> {
    fn drop(&mut self) {
        if self.faulted {
            return;
        }
        if let Err(e) = self.release_all() {
            log::warn!("failed to release key window handles: {}", e);
        }
    }
}

fn successor(index: KeyIndex) -> KeyringResult<KeyIndex> {
    index
        .checked_add(1)
        .ok_or(KeyringError::IndexExhausted(index))
}

fn parse_peer_point(peer: &[u8]) -> KeyringResult<EccPoint> {
    let point = EccPoint::from_uncompressed(peer)
        .map_err(|e| KeyringError::InvalidInput(format!("peer point: {}", e)))?;

    p256::PublicKey::from_sec1_bytes(peer)
        .map_err(|_| KeyringError::InvalidInput("peer point is not on P-256".to_string()))?;
    Ok(point)
}
